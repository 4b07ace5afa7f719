use burn::module::{Content, DisplaySettings, ModuleDisplay, Param, RunningState};
use burn::nn::Initializer;
use burn::prelude::*;

/// Configuration to create a [BatchNorm](BatchNorm) layer.
#[derive(Config, Debug)]
pub struct BatchNormConfig {
    /// The number of channels.
    pub num_features: usize,

    #[config(default = 2e-5)]
    pub epsilon: f64,

    /// Weight of the previous moving statistics: `moving = moving * momentum + batch * (1 - momentum)`.
    #[config(default = 0.9)]
    pub momentum: f64,

    /// Pins gamma to one, as done for the input normalization.
    #[config(default = false)]
    pub fix_gamma: bool,
}

impl BatchNormConfig {
    /// Initialize a new [BatchNorm](BatchNorm) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> BatchNorm<B> {
        let gamma = Initializer::Ones.init([self.num_features], device);
        let beta = Initializer::Zeros.init([self.num_features], device);
        let moving_mean = Tensor::zeros([self.num_features], device);
        let moving_var = Tensor::ones([self.num_features], device);
        BatchNorm {
            gamma,
            beta,
            moving_mean: RunningState::new(moving_mean),
            moving_var: RunningState::new(moving_var),
            epsilon: self.epsilon,
            momentum: self.momentum,
            fix_gamma: self.fix_gamma,
        }
    }
}

/// Per-channel normalization of `[batch, channels, height, width]` inputs.
///
/// Uses the batch statistics (and updates the moving ones) when the backend tracks gradients,
/// and the moving statistics otherwise.
///
/// Should be created using the [BatchNormConfig](BatchNormConfig) configuration.
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct BatchNorm<B: Backend> {
    pub gamma: Param<Tensor<B, 1>>,
    pub beta: Param<Tensor<B, 1>>,
    pub moving_mean: RunningState<Tensor<B, 1>>,
    pub moving_var: RunningState<Tensor<B, 1>>,
    pub epsilon: f64,
    pub momentum: f64,
    pub fix_gamma: bool,
}

impl<B: Backend> BatchNorm<B> {
    /// # Shapes
    /// - input: `[batch, channels, height, width]`
    /// - output: `[batch, channels, height, width]`
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_batch, channels, _height, _width] = x.dims();
        let (mean, var) = if B::ad_enabled() {
            self.batch_statistics(x.clone())
        } else {
            (self.moving_mean.value(), self.moving_var.value())
        };

        let gamma = if self.fix_gamma {
            Tensor::ones([channels], &x.device())
        } else {
            self.gamma.val()
        };
        let scale = gamma / var.add_scalar(self.epsilon).sqrt();
        let shift = self.beta.val() - mean * scale.clone();

        x * scale.reshape([1, channels, 1, 1]) + shift.reshape([1, channels, 1, 1])
    }

    fn batch_statistics(&self, x: Tensor<B, 4>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let [batch, channels, height, width] = x.dims();
        let flat = x.swap_dims(0, 1).reshape([channels, batch * height * width]);
        let mean = flat.clone().mean_dim(1);
        let var = (flat - mean.clone()).powf_scalar(2.0).mean_dim(1);
        let mean: Tensor<B, 1> = mean.reshape([channels]);
        let var: Tensor<B, 1> = var.reshape([channels]);

        let keep = self.momentum;
        let moving_mean = self.moving_mean.value_sync().mul_scalar(keep)
            + mean.clone().detach().mul_scalar(1.0 - keep);
        let moving_var = self.moving_var.value_sync().mul_scalar(keep)
            + var.clone().detach().mul_scalar(1.0 - keep);
        self.moving_mean.update(moving_mean.detach());
        self.moving_var.update(moving_var.detach());

        (mean, var)
    }
}

impl<B: Backend> ModuleDisplay for BatchNorm<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        let [num_features] = self.gamma.dims();
        content
            .add("num_features", &num_features)
            .add("epsilon", &self.epsilon)
            .add("momentum", &self.momentum)
            .add("fix_gamma", &self.fix_gamma)
            .optional()
    }
}
