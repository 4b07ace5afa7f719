use super::batch_norm::{BatchNorm, BatchNormConfig};
use crate::resnet::{Hyperparams, UnitPlan};
use burn::nn::PaddingConfig2d;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;

/// Pre-activation bottleneck unit.
#[derive(Module, Debug)]
pub struct ResidualUnit<B: Backend> {
    pub bn1: BatchNorm<B>,
    /// Input channel: in_channels.
    /// Output channel: num_filter / 4.
    pub conv1: Conv2d<B>,
    pub bn2: BatchNorm<B>,
    /// Dilated 3x3, padded by its dilation.
    pub conv2: Conv2d<B>,
    pub bn3: BatchNorm<B>,
    /// Input channel: num_filter / 4.
    /// Output channel: num_filter.
    pub conv3: Conv2d<B>,
    /// Projection of the activated input. Missing for identity shortcuts.
    pub shortcut: Option<Conv2d<B>>,
}

#[derive(Config, Debug)]
pub struct ResidualUnitConfig {
    pub in_channels: usize,
    pub num_filter: usize,
    #[config(default = 1)]
    pub stride: usize,
    /// Whether the input already has `num_filter` channels.
    #[config(default = false)]
    pub dim_match: bool,
    #[config(default = 1)]
    pub dilation: usize,
    #[config(default = 0.9)]
    pub bn_momentum: f64,
    #[config(default = 2e-5)]
    pub bn_epsilon: f64,
}

impl ResidualUnitConfig {
    pub fn from_plan(plan: &UnitPlan, hp: &Hyperparams) -> Self {
        Self::new(plan.in_channels, plan.num_filter)
            .with_stride(plan.stride)
            .with_dim_match(plan.dim_match)
            .with_dilation(plan.dilation)
            .with_bn_momentum(hp.bn_momentum)
            .with_bn_epsilon(hp.bn_epsilon)
    }

    /// Identity shortcuts need matching widths and a unit stride.
    pub fn has_projection(&self) -> bool {
        !(self.dim_match && self.stride == 1)
    }

    fn bn(&self, num_features: usize) -> BatchNormConfig {
        BatchNormConfig::new(num_features)
            .with_epsilon(self.bn_epsilon)
            .with_momentum(self.bn_momentum)
    }

    /// Returns the initialized unit.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResidualUnit<B> {
        let bottleneck = self.num_filter / 4;
        let d = self.dilation;
        ResidualUnit {
            bn1: self.bn(self.in_channels).init(device),
            conv1: Conv2dConfig::new([self.in_channels, bottleneck], [1, 1])
                .with_bias(false)
                .init(device),
            bn2: self.bn(bottleneck).init(device),
            conv2: Conv2dConfig::new([bottleneck, bottleneck], [3, 3])
                .with_stride([self.stride, self.stride])
                .with_dilation([d, d])
                .with_padding(PaddingConfig2d::Explicit(d, d))
                .with_bias(false)
                .init(device),
            bn3: self.bn(bottleneck).init(device),
            conv3: Conv2dConfig::new([bottleneck, self.num_filter], [1, 1])
                .with_bias(false)
                .init(device),
            shortcut: self.has_projection().then(|| {
                Conv2dConfig::new([self.in_channels, self.num_filter], [1, 1])
                    .with_stride([self.stride, self.stride])
                    .with_bias(false)
                    .init(device)
            }),
        }
    }
}

impl<B: Backend> ResidualUnit<B> {
    /// # Shapes
    ///   - Input [batch, in_channels, height, width]
    ///   - Output [batch, num_filter, height / stride, width / stride]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let act1 = relu(self.bn1.forward(x.clone()));

        let out = self.conv1.forward(act1.clone());
        let out = self.conv2.forward(relu(self.bn2.forward(out)));
        let out = self.conv3.forward(relu(self.bn3.forward(out)));

        let shortcut = match &self.shortcut {
            Some(projection) => projection.forward(act1),
            None => x,
        };
        debug_assert_eq!(out.dims(), shortcut.dims());

        out + shortcut
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::module::Param;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    #[test]
    fn identity_shortcut_passes_input_through() {
        let device = Default::default();
        let mut unit = ResidualUnitConfig::new(16, 16)
            .with_dim_match(true)
            .init::<TestBackend>(&device);
        assert!(unit.shortcut.is_none());
        // silence the residual branch, leaving only the shortcut
        unit.conv3.weight = Param::from_tensor(Tensor::zeros([16, 4, 1, 1], &device));

        let x = Tensor::<TestBackend, 4>::random([2, 16, 5, 7], Distribution::Default, &device);
        let out = unit.forward(x.clone());
        assert_eq!(out.dims(), [2, 16, 5, 7]);
        let out = out.into_data().to_vec::<f32>().unwrap();
        let x = x.into_data().to_vec::<f32>().unwrap();
        assert!(out.iter().zip(&x).all(|(o, x)| (o - x).abs() < 1e-6));
    }

    #[test]
    fn projection_reaches_requested_width() {
        let device = Default::default();
        let unit = ResidualUnitConfig::new(8, 32)
            .with_stride(2)
            .init::<TestBackend>(&device);
        let projection = unit.shortcut.as_ref().unwrap();
        assert_eq!(projection.weight.dims(), [32, 8, 1, 1]);

        let x = Tensor::<TestBackend, 4>::random([1, 8, 9, 12], Distribution::Default, &device);
        assert_eq!(unit.forward(x).dims(), [1, 32, 5, 6]);
    }

    #[test]
    fn dilated_unit_keeps_resolution() {
        let device = Default::default();
        for dilation in [2, 5, 9, 17] {
            let unit = ResidualUnitConfig::new(32, 32)
                .with_dim_match(true)
                .with_dilation(dilation)
                .init::<TestBackend>(&device);
            let x = Tensor::<TestBackend, 4>::random([1, 32, 6, 6], Distribution::Default, &device);
            assert_eq!(unit.forward(x).dims(), [1, 32, 6, 6], "dilation {dilation}");
        }
    }
}
