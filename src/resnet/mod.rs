//! Dilated ResNet backbone: stage schedule and symbolic construction.
//!
//! Only the first unit of stage 2 downsamples. Stages 3 and 4 keep the resolution
//! and grow their dilation, so the final feature map is 1/8 of the input.

mod config;
mod symbol;

pub use config::{
    Hyperparams, MAX_STAGES, ResNetConfig, STAGE_STRIDES, STAGE3_DILATIONS, STAGE4_DILATIONS,
    UnitPlan, depth_of, dilation, stride, unit_name,
};
pub use symbol::{UnitSpec, build_symbol, residual_unit, resnet, stem};
