//! Executable backbone built on burn modules, mirroring the symbolic graph layer by layer.

mod batch_norm;
mod bind;
mod resnet;
mod unit;

pub use batch_norm::{BatchNorm, BatchNormConfig};
pub use bind::{NamedParams, ParamBinder};
pub use resnet::{DilatedResNet, ResNetStage};
pub use unit::{ResidualUnit, ResidualUnitConfig};
