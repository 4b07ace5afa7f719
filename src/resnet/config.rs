use crate::error::ConfigError;
use burn::prelude::*;

/// Dilation of stage 3 units, indexed by `unit % 4`.
pub const STAGE3_DILATIONS: [usize; 4] = [1, 2, 5, 9];
/// Dilation of stage 4 units, indexed by unit. Stage 4 therefore has exactly 3 units.
pub const STAGE4_DILATIONS: [usize; 3] = [5, 9, 17];
/// Stride of the first unit of each stage. Only stage 2 downsamples; the later stages
/// keep the resolution and grow their dilation instead.
pub const STAGE_STRIDES: [usize; 4] = [1, 2, 1, 1];
/// Maximum number of stages with a defined dilation policy.
pub const MAX_STAGES: usize = 4;

/// Dilation of unit `unit` (0-based) in stage `stage` (1-based).
///
/// Returns `None` outside of the tables, i.e. past stage 4 or past the third unit of stage 4.
pub fn dilation(stage: usize, unit: usize) -> Option<usize> {
    match stage {
        1 | 2 => Some(1),
        3 => Some(STAGE3_DILATIONS[unit % STAGE3_DILATIONS.len()]),
        4 => STAGE4_DILATIONS.get(unit).copied(),
        _ => None,
    }
}

/// Stride of unit `unit` (0-based) in stage `stage` (1-based).
pub fn stride(stage: usize, unit: usize) -> Option<usize> {
    if unit > 0 {
        return Some(1);
    }
    STAGE_STRIDES.get(stage.checked_sub(1)?).copied()
}

/// Base name of a residual unit, shared by the symbolic graph and the executable network.
pub fn unit_name(stage: usize, unit: usize) -> String {
    format!("stage{stage}_unit{}", unit + 1)
}

/// Dilated ResNet backbone specification.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Number of residual units in each stage.
    pub units: Vec<usize>,

    /// Stem width followed by the output width of each stage.
    ///
    /// Must hold exactly `units.len() + 1` entries.
    pub filter_list: Vec<usize>,

    /// Moving average momentum, in the `moving = moving * momentum + batch * (1 - momentum)` convention.
    #[config(default = 0.9)]
    pub bn_momentum: f64,

    #[config(default = 2e-5)]
    pub bn_epsilon: f64,

    /// Scratch memory hint (in MB) recorded on convolution nodes.
    #[config(default = 512)]
    pub workspace: usize,

    /// Marks every shortcut as a mirror stage, trading recomputation for memory.
    #[config(default = false)]
    pub memonger: bool,
}

/// Hyperparameters threaded through every unit construction call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hyperparams {
    pub bn_momentum: f64,
    pub bn_epsilon: f64,
    pub workspace: usize,
    pub memonger: bool,
}

/// Fully resolved parameters of one residual unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    /// 1-based stage index.
    pub stage: usize,
    /// 0-based unit index within the stage.
    pub unit: usize,
    pub name: String,
    pub in_channels: usize,
    pub num_filter: usize,
    pub stride: usize,
    pub dim_match: bool,
    pub dilation: usize,
}

impl UnitPlan {
    /// Width of the bottleneck 1x1 and 3x3 convolutions.
    pub fn bottleneck(&self) -> usize {
        self.num_filter / 4
    }
}

const PRESET_FILTERS: [usize; 5] = [64, 256, 512, 1024, 2048];

impl ResNetConfig {
    pub fn resnet50() -> Self {
        Self::new(vec![3, 4, 6, 3], PRESET_FILTERS.to_vec())
    }

    /// The schedule used by the DUC segmentation model.
    pub fn resnet101() -> Self {
        Self::new(vec![3, 4, 23, 3], PRESET_FILTERS.to_vec())
    }

    pub fn resnet152() -> Self {
        Self::new(vec![3, 8, 36, 3], PRESET_FILTERS.to_vec())
    }

    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "resnet50" | "resnet-50" | "50" => Ok(Self::resnet50()),
            "resnet101" | "resnet-101" | "101" => Ok(Self::resnet101()),
            "resnet152" | "resnet-152" | "152" => Ok(Self::resnet152()),
            _ => Err(ConfigError::UnknownPreset(name.to_string())),
        }
    }

    /// Number of weighted layers: three convolutions per unit, the stem and the (absent) head.
    pub fn depth(&self) -> usize {
        depth_of(&self.units)
    }

    pub fn hyperparams(&self) -> Hyperparams {
        Hyperparams {
            bn_momentum: self.bn_momentum,
            bn_epsilon: self.bn_epsilon,
            workspace: self.workspace,
            memonger: self.memonger,
        }
    }

    /// Output channels of the final stage.
    pub fn out_channels(&self) -> usize {
        self.filter_list.last().copied().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let stages = self.units.len();
        if stages == 0 || stages > MAX_STAGES {
            return Err(ConfigError::StageCount {
                max: MAX_STAGES,
                actual: stages,
            });
        }
        if self.filter_list.len() != stages + 1 {
            return Err(ConfigError::FilterListLength {
                expected: stages + 1,
                actual: self.filter_list.len(),
            });
        }
        if self.filter_list[0] == 0 {
            return Err(ConfigError::StemWidth);
        }
        for (i, (&units, &filters)) in self.units.iter().zip(&self.filter_list[1..]).enumerate() {
            let stage = i + 1;
            if units == 0 {
                return Err(ConfigError::EmptyStage { stage });
            }
            if filters == 0 || filters % 4 != 0 {
                return Err(ConfigError::BottleneckWidth { stage, filters });
            }
        }
        if let Some(&units) = self.units.get(3) {
            if units != STAGE4_DILATIONS.len() {
                return Err(ConfigError::Stage4Units { actual: units });
            }
        }
        if self.bn_epsilon.is_nan() || self.bn_epsilon <= 0.0 {
            return Err(ConfigError::Epsilon(self.bn_epsilon));
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(ConfigError::Momentum(self.bn_momentum));
        }
        Ok(())
    }

    /// Validates the config and resolves every residual unit in build order.
    pub fn unit_plans(&self) -> Result<Vec<UnitPlan>, ConfigError> {
        self.validate()?;
        let mut plans = Vec::with_capacity(self.units.iter().sum());
        let mut in_channels = self.filter_list[0];
        for (i, &units) in self.units.iter().enumerate() {
            let stage = i + 1;
            let num_filter = self.filter_list[stage];
            for unit in 0..units {
                // validated above, the lookups cannot miss
                let dilation = dilation(stage, unit).ok_or(ConfigError::Stage4Units { actual: units })?;
                let stride = stride(stage, unit).ok_or(ConfigError::StageCount {
                    max: MAX_STAGES,
                    actual: self.units.len(),
                })?;
                plans.push(UnitPlan {
                    stage,
                    unit,
                    name: unit_name(stage, unit),
                    in_channels,
                    num_filter,
                    stride,
                    dim_match: unit != 0,
                    dilation,
                });
                in_channels = num_filter;
            }
        }
        Ok(plans)
    }
}

/// Network depth implied by per-stage unit counts.
pub fn depth_of(units: &[usize]) -> usize {
    units.iter().sum::<usize>() * 3 + 2
}
