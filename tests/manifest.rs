use std::fs;
use std::path::Path;

use tempfile::tempdir;

use burn::config::Config;
use duc_resnet::error::ManifestError;
use duc_resnet::manifest::{ListConfig, ListSummary, build_list, discover_images, read_manifest};

fn touch(path: &Path) {
    fs::create_dir_all(path.parent().expect("parent")).expect("create dirs");
    fs::write(path, b"").expect("write file");
}

#[test]
fn uncropped_manifest_lists_every_image() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    let images = root.join("leftImg8bit/train");
    touch(&images.join("b/img2_leftImg8bit.png"));
    touch(&images.join("a/img1_leftImg8bit.png"));
    // wrong depth or extension
    touch(&images.join("stray_leftImg8bit.png"));
    touch(&images.join("a/notes.txt"));
    touch(&images.join("a/deep/img3_leftImg8bit.png"));

    let output = root.join("val.lst");
    let config = ListConfig::cityscapes("train", true).with_is_crop(false);
    let summary = build_list(root, &output, &config).expect("build list");
    assert_eq!(
        summary,
        ListSummary {
            root_found: true,
            discovered: 2,
            kept: 2,
            rows: 2
        }
    );

    let text = fs::read_to_string(&output).expect("read manifest");
    let lines: Vec<&str> = text.lines().collect();
    let r = root.display();
    assert_eq!(
        lines,
        [
            format!(
                "1\t{r}/leftImg8bit/train/a/img1_leftImg8bit.png\t{r}/gtFine/train/a/img1_gtFine_labelIds.png"
            ),
            format!(
                "2\t{r}/leftImg8bit/train/b/img2_leftImg8bit.png\t{r}/gtFine/train/b/img2_gtFine_labelIds.png"
            ),
        ]
    );
}

#[test]
fn cropped_and_sampled_manifest() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    for (city, n) in [("aachen", 1), ("aachen", 2), ("bochum", 3), ("bochum", 4), ("bremen", 5)] {
        touch(&root.join(format!("leftImg8bit/val/{city}/{city}_{n}_leftImg8bit.png")));
    }

    let output = root.join("val.lst");
    let config = ListConfig::cityscapes("val", false).with_sample_rate(2);
    let summary = build_list(root, &output, &config).expect("build list");
    assert_eq!(summary.discovered, 5);
    assert_eq!(summary.kept, 2);
    assert_eq!(summary.rows, 14);

    let entries = read_manifest(fs::read(&output).expect("read").as_slice()).expect("parse");
    let indices: Vec<_> = entries.iter().map(|e| e.index).collect();
    let expected: Vec<usize> = [[2; 7], [4; 7]].concat();
    assert_eq!(indices, expected);
    for strip in entries.chunks(7) {
        let offsets: Vec<_> = strip.iter().map(|e| e.crop.expect("crop").offset).collect();
        assert_eq!(offsets, [256, 512, 768, 1024, 1280, 1536, 1792]);
    }
    assert!(entries[0].label.ends_with("gtCoarse/val/aachen/aachen_2_gtCoarse_labelIds.png"));
    assert!(entries[7].image.ends_with("leftImg8bit/val/bochum/bochum_4_leftImg8bit.png"));
}

#[test]
fn missing_image_root_writes_an_empty_manifest() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("train.lst");
    let config = ListConfig::cityscapes("train", true);
    assert!(discover_images(&dir.path().join("leftImg8bit/train")).expect("discover").is_empty());

    let summary = build_list(dir.path(), &output, &config).expect("build list");
    assert_eq!(summary, ListSummary::default());
    assert_eq!(fs::read_to_string(&output).expect("read"), "");
}

#[test]
fn empty_image_root_is_told_apart_from_a_missing_one() {
    let dir = tempdir().expect("tempdir");
    let config = ListConfig::cityscapes("train", true);

    let missing = build_list(dir.path(), dir.path().join("a.lst"), &config).expect("build list");
    assert!(!missing.root_found);

    fs::create_dir_all(dir.path().join("leftImg8bit/train/aachen")).expect("create dirs");
    let empty = build_list(dir.path(), dir.path().join("b.lst"), &config).expect("build list");
    assert!(empty.root_found);
    assert_eq!(empty.discovered, 0);
    assert_eq!(empty.rows, 0);
}

#[cfg(unix)]
#[test]
fn symlinked_cities_are_followed() {
    let dir = tempdir().expect("tempdir");
    let root = dir.path();
    touch(&root.join("elsewhere/aachen/x_leftImg8bit.png"));
    touch(&root.join("leftImg8bit/train/bochum/y_leftImg8bit.png"));
    std::os::unix::fs::symlink(
        root.join("elsewhere/aachen"),
        root.join("leftImg8bit/train/aachen"),
    )
    .expect("symlink");

    let images = discover_images(&root.join("leftImg8bit/train")).expect("discover");
    assert_eq!(
        images,
        [
            root.join("leftImg8bit/train/aachen/x_leftImg8bit.png"),
            root.join("leftImg8bit/train/bochum/y_leftImg8bit.png"),
        ]
    );
}

#[test]
fn hidden_cities_and_files_are_skipped() {
    let dir = tempdir().expect("tempdir");
    let images = dir.path().join("leftImg8bit/train");
    touch(&images.join(".cache/x_leftImg8bit.png"));
    touch(&images.join("aachen/.y_leftImg8bit.png"));
    touch(&images.join("aachen/z_leftImg8bit.png"));

    let found = discover_images(&images).expect("discover");
    assert_eq!(found, [images.join("aachen/z_leftImg8bit.png")]);
}

#[test]
fn zero_sample_rate_fails_before_writing() {
    let dir = tempdir().expect("tempdir");
    let output = dir.path().join("train.lst");
    let config = ListConfig::cityscapes("train", true).with_sample_rate(0);
    let err = build_list(dir.path(), &output, &config).unwrap_err();
    assert!(matches!(err, ManifestError::ZeroSampleRate));
    assert!(!output.exists());
}

#[test]
fn list_config_survives_a_json_file() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("list.json");
    let config = ListConfig::cityscapes("val", true)
        .with_is_crop(false)
        .with_sample_rate(4);
    config.save(&path).expect("save config");

    let loaded = ListConfig::load(&path).expect("load config");
    assert_eq!(loaded.image_subpath, "leftImg8bit/val");
    assert_eq!(loaded.sample_rate, 4);
    assert!(!loaded.is_crop);
    assert_eq!(loaded.crop_width, 512);
}
