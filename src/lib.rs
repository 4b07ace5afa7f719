//! Dilated ResNet backbone for dense prediction, and the Cityscapes manifests it trains on.

pub mod checkpoint;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod network;
pub mod resnet;
pub mod symbol;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::checkpoint::{BindReport, Checkpoint, ParamMap, load_checkpoint, save_checkpoint};
    pub use crate::manifest::{ListConfig, ListSummary, ManifestEntry, build_list};
    pub use crate::network::{DilatedResNet, NamedParams};
    pub use crate::resnet::{ResNetConfig, build_symbol};
    pub use crate::symbol::{Graph, Symbol, SymbolJson};
}
