//! Executable dilated ResNet backbone.

use super::batch_norm::{BatchNorm, BatchNormConfig};
use super::unit::{ResidualUnit, ResidualUnitConfig};
use crate::error::ConfigError;
use crate::resnet::ResNetConfig;
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

#[derive(Module, Debug)]
pub struct ResNetStage<B: Backend> {
    pub units: Vec<ResidualUnit<B>>,
}

#[derive(Module, Debug)]
pub struct DilatedResNet<B: Backend> {
    /// Input normalization, gamma pinned to one.
    pub bn_data: BatchNorm<B>,
    /// 7x7/2 stem convolution.
    pub conv0: Conv2d<B>,
    pub bn0: BatchNorm<B>,
    pub pool0: MaxPool2d,
    pub stages: Vec<ResNetStage<B>>,
}

impl ResNetConfig {
    /// Returns the initialized network, or the reason the config is invalid.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<DilatedResNet<B>, ConfigError> {
        let plans = self.unit_plans()?;
        let hp = self.hyperparams();
        let stem_width = self.filter_list[0];
        let bn = |num_features| {
            BatchNormConfig::new(num_features)
                .with_epsilon(hp.bn_epsilon)
                .with_momentum(hp.bn_momentum)
        };

        let mut stages: Vec<ResNetStage<B>> = (0..self.units.len())
            .map(|_| ResNetStage { units: Vec::new() })
            .collect();
        for plan in &plans {
            let unit = ResidualUnitConfig::from_plan(plan, &hp).init(device);
            stages[plan.stage - 1].units.push(unit);
        }

        Ok(DilatedResNet {
            bn_data: bn(3).with_fix_gamma(true).init(device),
            conv0: Conv2dConfig::new([3, stem_width], [7, 7])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(3, 3))
                .with_bias(false)
                .init(device),
            bn0: bn(stem_width).init(device),
            pool0: MaxPool2dConfig::new([3, 3])
                .with_strides([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(),
            stages,
        })
    }
}

impl<B: Backend> DilatedResNet<B> {
    /// # Shapes
    ///   - Input [batch, 3, height, width]
    ///   - Output [batch, out_channels, height / 8, width / 8] (rounded up per strided layer)
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.bn_data.forward(x);
        let x = self.conv0.forward(x);
        let x = relu(self.bn0.forward(x));
        let mut x = self.pool0.forward(x);

        for stage in &self.stages {
            for unit in &stage.units {
                x = unit.forward(x);
            }
        }
        x
    }

    pub fn num_units(&self) -> usize {
        self.stages.iter().map(|s| s.units.len()).sum()
    }
}
