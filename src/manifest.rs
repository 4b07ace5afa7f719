//! Cityscapes image/label manifests.
//!
//! A manifest holds one tab-delimited row per sample:
//! `index\timage\tlabel`, or `index\timage\tlabel\tcrop_width\tcrop_offset` when images are
//! cut into horizontal strips. The index counts discovered images from 1, before sampling
//! and cropping, so all strips of an image share it.

use crate::error::ManifestError;
use burn::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Token shared by every Cityscapes image file name.
pub const IMAGE_TOKEN: &str = "leftImg8bit";
pub const FINE_LABEL_TOKEN: &str = "gtFine_labelIds";
pub const COARSE_LABEL_TOKEN: &str = "gtCoarse_labelIds";

/// Manifest generation settings.
#[derive(Config, Debug)]
pub struct ListConfig {
    /// Image directory, relative to the dataset root. E.g. `leftImg8bit/train`.
    pub image_subpath: String,
    /// Label directory mirroring `image_subpath`. E.g. `gtFine/train`.
    pub label_subpath: String,
    /// Fine (`gtFine_labelIds`) or coarse (`gtCoarse_labelIds`) label files.
    #[config(default = true)]
    pub is_fine: bool,
    /// Keeps the images whose 1-based index is a multiple of this rate.
    #[config(default = 1)]
    pub sample_rate: usize,
    #[config(default = true)]
    pub is_crop: bool,
    #[config(default = 512)]
    pub crop_width: usize,
    /// Distance between consecutive strip offsets. The first strip starts at one stride.
    #[config(default = 256)]
    pub crop_stride: usize,
    #[config(default = 7)]
    pub crop_count: usize,
}

impl ListConfig {
    /// Settings for one split of the standard Cityscapes layout.
    pub fn cityscapes(split: &str, is_fine: bool) -> Self {
        let labels = if is_fine { "gtFine" } else { "gtCoarse" };
        Self::new(format!("{IMAGE_TOKEN}/{split}"), format!("{labels}/{split}")).with_is_fine(is_fine)
    }

    pub fn label_token(&self) -> &'static str {
        if self.is_fine {
            FINE_LABEL_TOKEN
        } else {
            COARSE_LABEL_TOKEN
        }
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.sample_rate == 0 {
            return Err(ManifestError::ZeroSampleRate);
        }
        Ok(())
    }

    /// Crop rows emitted for every kept image, if cropping is enabled.
    pub fn crops(&self) -> Vec<Crop> {
        if !self.is_crop {
            return Vec::new();
        }
        (1..=self.crop_count)
            .map(|i| Crop {
                width: self.crop_width,
                offset: self.crop_stride * i,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crop {
    pub width: usize,
    /// Row offset of the strip.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub index: usize,
    pub image: PathBuf,
    pub label: PathBuf,
    pub crop: Option<Crop>,
}

impl std::fmt::Display for ManifestEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}\t{}\t{}",
            self.index,
            self.image.display(),
            self.label.display()
        )?;
        if let Some(crop) = self.crop {
            write!(f, "\t{}\t{}", crop.width, crop.offset)?;
        }
        Ok(())
    }
}

/// Counts reported after writing a manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListSummary {
    /// Whether the image directory exists. An empty manifest with a missing directory
    /// usually means a wrong dataset root.
    pub root_found: bool,
    pub discovered: usize,
    pub kept: usize,
    pub rows: usize,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.file_name().to_string_lossy().starts_with('.')
}

/// `*/*.png` files under `image_root`, sorted by their path string.
///
/// Symlinks are followed, and hidden directories or files are skipped at both levels.
/// A missing `image_root` yields no image.
pub fn discover_images(image_root: &Path) -> Result<Vec<PathBuf>, ManifestError> {
    if !image_root.is_dir() {
        return Ok(Vec::new());
    }
    let walker = WalkDir::new(image_root)
        .follow_links(true)
        .max_depth(2)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_hidden(e));
    let mut images = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|source| ManifestError::Walk {
            path: image_root.to_path_buf(),
            source,
        })?;
        if entry.depth() < 2 {
            continue;
        }
        let path = entry.path();
        let is_png = path.extension().is_some_and(|ext| ext == "png");
        if is_png && !entry.file_type().is_dir() {
            images.push(entry.into_path());
        } else {
            log::trace!("skipping {path:?}");
        }
    }
    images.sort_by(|a, b| a.as_os_str().cmp(b.as_os_str()));
    Ok(images)
}

/// Label file of `image`: `image_subpath` becomes `label_subpath`, then every
/// `leftImg8bit` becomes `label_token`.
pub fn derive_label_path(
    image: &Path,
    image_subpath: &str,
    label_subpath: &str,
    label_token: &str,
) -> PathBuf {
    let image = image.to_string_lossy();
    let label = image
        .replace(image_subpath, label_subpath)
        .replace(IMAGE_TOKEN, label_token);
    PathBuf::from(label)
}

/// Rows for the sorted `images`, after sampling and cropping.
pub fn manifest_entries(
    images: &[PathBuf],
    config: &ListConfig,
) -> Result<Vec<ManifestEntry>, ManifestError> {
    config.validate()?;
    let crops = config.crops();
    let mut entries = Vec::new();
    for (i, image) in images.iter().enumerate() {
        let index = i + 1;
        if index % config.sample_rate != 0 {
            continue;
        }
        let label = derive_label_path(
            image,
            &config.image_subpath,
            &config.label_subpath,
            config.label_token(),
        );
        let entry = |crop| ManifestEntry {
            index,
            image: image.clone(),
            label: label.clone(),
            crop,
        };
        if crops.is_empty() {
            entries.push(entry(None));
        } else {
            entries.extend(crops.iter().map(|&crop| entry(Some(crop))));
        }
    }
    Ok(entries)
}

pub fn write_manifest(mut writer: impl Write, entries: &[ManifestEntry]) -> std::io::Result<()> {
    for entry in entries {
        writeln!(writer, "{entry}")?;
    }
    writer.flush()
}

/// Parses 3 and 5 field rows. Blank lines are skipped.
pub fn read_manifest(reader: impl BufRead) -> Result<Vec<ManifestEntry>, ManifestError> {
    let mut entries = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(ManifestError::Read)?;
        if line.trim().is_empty() {
            continue;
        }
        let parse_error = |reason: String| ManifestError::Parse {
            line: i + 1,
            reason,
        };
        let number = |field: &str, what: &str| {
            field
                .parse::<usize>()
                .map_err(|e| parse_error(format!("invalid {what} {field:?}: {e}")))
        };

        let fields: Vec<&str> = line.split('\t').collect();
        let crop = match fields.len() {
            3 => None,
            5 => Some(Crop {
                width: number(fields[3], "crop width")?,
                offset: number(fields[4], "crop offset")?,
            }),
            n => return Err(parse_error(format!("expected 3 or 5 fields, got {n}"))),
        };
        entries.push(ManifestEntry {
            index: number(fields[0], "index")?,
            image: PathBuf::from(fields[1]),
            label: PathBuf::from(fields[2]),
            crop,
        });
    }
    Ok(entries)
}

/// Writes the manifest of `root/config.image_subpath` into `output`.
pub fn build_list(
    root: impl AsRef<Path>,
    output: impl AsRef<Path>,
    config: &ListConfig,
) -> Result<ListSummary, ManifestError> {
    let (root, output) = (root.as_ref(), output.as_ref());
    config.validate()?;

    let image_root = root.join(&config.image_subpath);
    let root_found = image_root.is_dir();
    let images = discover_images(&image_root)?;
    if images.is_empty() {
        if root_found {
            log::warn!("no */*.png image under {image_root:?}, the manifest will be empty");
        } else {
            log::warn!("image directory {image_root:?} does not exist, check the dataset root");
        }
    }

    let entries = manifest_entries(&images, config)?;
    let write_error = |source| ManifestError::Write {
        path: output.to_path_buf(),
        source,
    };
    let file = File::create(output).map_err(write_error)?;
    write_manifest(BufWriter::new(file), &entries).map_err(write_error)?;

    let kept = images.len() / config.sample_rate;
    let summary = ListSummary {
        root_found,
        discovered: images.len(),
        kept,
        rows: entries.len(),
    };
    log::info!(
        "wrote {output:?}: {} rows from {} of {} images",
        summary.rows,
        summary.kept,
        summary.discovered
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|n| PathBuf::from(format!("/data/leftImg8bit/train/{n}")))
            .collect()
    }

    #[test]
    fn fine_and_coarse_label_paths() {
        let image = Path::new("/data/leftImg8bit/train/aachen/x_leftImg8bit.png");
        assert_eq!(
            derive_label_path(image, "leftImg8bit/train", "gtFine/train", FINE_LABEL_TOKEN),
            PathBuf::from("/data/gtFine/train/aachen/x_gtFine_labelIds.png")
        );
        assert_eq!(
            derive_label_path(image, "leftImg8bit/train", "gtCoarse/train", COARSE_LABEL_TOKEN),
            PathBuf::from("/data/gtCoarse/train/aachen/x_gtCoarse_labelIds.png")
        );
    }

    #[test]
    fn cityscapes_layout() {
        let config = ListConfig::cityscapes("val", false);
        assert_eq!(config.image_subpath, "leftImg8bit/val");
        assert_eq!(config.label_subpath, "gtCoarse/val");
        assert_eq!(config.label_token(), COARSE_LABEL_TOKEN);
        assert!(config.is_crop);
        assert_eq!(config.sample_rate, 1);
    }

    #[test]
    fn crops_yield_seven_strips() {
        let config = ListConfig::cityscapes("train", true);
        let entries = manifest_entries(&images(&["a/1_leftImg8bit.png"]), &config).unwrap();
        assert_eq!(entries.len(), 7);
        let offsets: Vec<_> = entries.iter().map(|e| e.crop.unwrap().offset).collect();
        assert_eq!(offsets, [256, 512, 768, 1024, 1280, 1536, 1792]);
        assert!(entries.iter().all(|e| e.index == 1 && e.crop.unwrap().width == 512));
        assert_eq!(
            entries[0].to_string(),
            "1\t/data/leftImg8bit/train/a/1_leftImg8bit.png\t/data/gtFine/train/a/1_gtFine_labelIds.png\t512\t256"
        );
    }

    #[test]
    fn sampling_keeps_multiples_of_the_rate() {
        let all = images(&["a/1.png", "a/2.png", "a/3.png", "b/4.png", "b/5.png", "b/6.png", "c/7.png"]);
        let config = ListConfig::cityscapes("train", true)
            .with_is_crop(false)
            .with_sample_rate(3);
        let entries = manifest_entries(&all, &config).unwrap();
        let indices: Vec<_> = entries.iter().map(|e| e.index).collect();
        assert_eq!(indices, [3, 6]);
        assert!(entries.iter().all(|e| e.crop.is_none()));

        let every = manifest_entries(&all, &config.with_sample_rate(1)).unwrap();
        assert_eq!(every.len(), all.len());
        assert!(every.windows(2).all(|w| w[0].index < w[1].index));
    }

    #[test]
    fn zero_sample_rate_is_rejected() {
        let config = ListConfig::cityscapes("train", true).with_sample_rate(0);
        assert!(matches!(
            manifest_entries(&images(&["a/1.png"]), &config),
            Err(ManifestError::ZeroSampleRate)
        ));
    }

    #[test]
    fn reads_both_row_shapes() {
        let text = "1\t/i/a.png\t/l/a.png\n\n2\t/i/b.png\t/l/b.png\t512\t768\n";
        let entries = read_manifest(text.as_bytes()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].crop, None);
        assert_eq!(
            entries[1].crop,
            Some(Crop {
                width: 512,
                offset: 768
            })
        );

        let err = read_manifest("1\t/i/a.png\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { line: 1, .. }));
        let err = read_manifest("1\ta\tb\n2\ta\tb\tx\t1\n".as_bytes()).unwrap_err();
        assert!(matches!(err, ManifestError::Parse { line: 2, .. }));
    }

    #[test]
    fn written_rows_read_back() {
        let config = ListConfig::cityscapes("train", true).with_crop_count(2);
        let entries = manifest_entries(&images(&["a/1_leftImg8bit.png", "b/2_leftImg8bit.png"]), &config).unwrap();
        let mut buf = Vec::new();
        write_manifest(&mut buf, &entries).unwrap();
        assert_eq!(read_manifest(buf.as_slice()).unwrap(), entries);
    }
}
