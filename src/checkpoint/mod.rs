//! Pretrained checkpoints: a topology json plus a binary parameter file.
//!
//! A checkpoint `prefix` at `epoch` is made of `{prefix}-symbol.json` and
//! `{prefix}-{epoch:04}.params`.

mod bind;
mod params;

pub use bind::{BindReport, Matcher, match_params};
pub use params::ParamMap;

use crate::error::CheckpointError;
use crate::resnet::{ResNetConfig, depth_of};
use crate::symbol::SymbolJson;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub symbol: SymbolJson,
    pub params: ParamMap,
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut path = OsString::from(prefix.as_os_str());
    path.push(suffix);
    path.into()
}

pub fn symbol_path(prefix: impl AsRef<Path>) -> PathBuf {
    with_suffix(prefix.as_ref(), "-symbol.json")
}

pub fn params_path(prefix: impl AsRef<Path>, epoch: usize) -> PathBuf {
    with_suffix(prefix.as_ref(), &format!("-{epoch:04}.params"))
}

fn open(path: &Path) -> Result<BufReader<File>, CheckpointError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| CheckpointError::Open {
            path: path.to_path_buf(),
            source,
        })
}

fn malformed(path: &Path) -> impl FnOnce(CheckpointError) -> CheckpointError + '_ {
    move |source| CheckpointError::Malformed {
        path: path.to_path_buf(),
        source: Box::new(source),
    }
}

/// Reads both halves of a checkpoint. Either file missing or malformed is an error.
pub fn load_checkpoint(prefix: impl AsRef<Path>, epoch: usize) -> Result<Checkpoint, CheckpointError> {
    let symbol_path = symbol_path(&prefix);
    let symbol = SymbolJson::from_reader(open(&symbol_path)?).map_err(malformed(&symbol_path))?;

    let params_path = params_path(&prefix, epoch);
    let params = ParamMap::read_from(open(&params_path)?).map_err(malformed(&params_path))?;

    log::info!(
        "loaded checkpoint {:?}: {} nodes, {} arg and {} aux parameters",
        prefix.as_ref(),
        symbol.nodes.len(),
        params.args.len(),
        params.auxs.len()
    );
    Ok(Checkpoint { symbol, params })
}

pub fn save_checkpoint(
    prefix: impl AsRef<Path>,
    epoch: usize,
    symbol: &SymbolJson,
    params: &ParamMap,
) -> Result<(), CheckpointError> {
    let symbol_path = symbol_path(&prefix);
    let create = |path: &Path| {
        File::create(path)
            .map(BufWriter::new)
            .map_err(|source| CheckpointError::Write {
                path: path.to_path_buf(),
                source,
            })
    };
    let mut writer = create(&symbol_path)?;
    symbol.to_writer(&mut writer)?;
    writer.flush().map_err(|source| CheckpointError::Write {
        path: symbol_path.clone(),
        source,
    })?;

    let params_path = params_path(&prefix, epoch);
    let mut writer = create(&params_path)?;
    params
        .write_to(&mut writer)
        .and_then(|()| writer.flush())
        .map_err(|source| CheckpointError::Write {
            path: params_path.clone(),
            source,
        })?;
    log::info!("saved checkpoint {:?}", prefix.as_ref());
    Ok(())
}

/// Compares the depth implied by the checkpoint's parameter names with the requested network.
///
/// A disagreement is only logged: layers shared by both still bind, the rest stay initialized.
/// Returns whether both schedules agree.
pub fn check_depth(config: &ResNetConfig, params: &ParamMap) -> bool {
    let found = params.stage_units();
    if found.is_empty() {
        log::warn!("checkpoint has no residual unit parameters, cannot infer its depth");
        return false;
    }
    if found == config.units {
        return true;
    }
    log::warn!(
        "checkpoint depth {} (units {:?}) differs from the requested resnet-{} (units {:?})",
        depth_of(&found),
        found,
        config.depth(),
        config.units
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::ParamKind;
    use burn::tensor::TensorData;

    #[test]
    fn file_names_follow_prefix_and_epoch() {
        assert_eq!(
            symbol_path("models/resnet-101"),
            PathBuf::from("models/resnet-101-symbol.json")
        );
        assert_eq!(
            params_path("models/resnet-101", 0),
            PathBuf::from("models/resnet-101-0000.params")
        );
        assert_eq!(params_path("m", 12), PathBuf::from("m-0012.params"));
    }

    #[test]
    fn depth_check_compares_unit_schedules() {
        let mut params = ParamMap::new();
        for (stage, units) in [(1, 3), (2, 4), (3, 23), (4, 3)] {
            let name = format!("stage{stage}_unit{units}_conv1_weight");
            params.insert(ParamKind::Arg, name, TensorData::new(vec![0f32], [1]));
        }
        assert!(check_depth(&ResNetConfig::resnet101(), &params));
        assert!(!check_depth(&ResNetConfig::resnet152(), &params));
        assert!(!check_depth(&ResNetConfig::resnet101(), &ParamMap::new()));
    }
}
