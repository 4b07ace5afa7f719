//! Name-based parameter exchange between the executable network and [`ParamMap`]s.
//!
//! Names follow the symbolic graph: `{node}_weight`, `{node}_gamma`, `{node}_moving_mean`, ...

use super::batch_norm::BatchNorm;
use super::resnet::DilatedResNet;
use super::unit::ResidualUnit;
use crate::checkpoint::{BindReport, Matcher, ParamMap};
use crate::error::BindError;
use crate::resnet::unit_name;
use crate::symbol::ParamKind;
use burn::module::{Param, RunningState};
use burn::nn::conv::Conv2d;
use burn::prelude::*;

/// Replaces tensors by their checkpoint counterpart, when there is one.
pub struct ParamBinder<'a, B: Backend> {
    matcher: Matcher<'a>,
    device: B::Device,
}

impl<'a, B: Backend> ParamBinder<'a, B> {
    pub fn new(params: &'a ParamMap, device: &B::Device) -> Self {
        Self {
            matcher: Matcher::new(params),
            device: device.clone(),
        }
    }

    /// The checkpoint tensor named `name`, or `current` when the checkpoint lacks it.
    pub fn tensor<const D: usize>(
        &mut self,
        kind: ParamKind,
        name: &str,
        current: Tensor<B, D>,
    ) -> Result<Tensor<B, D>, BindError> {
        let dims = current.dims();
        match self.matcher.lookup(kind, name, &dims)? {
            Some(data) => Ok(Tensor::from_data(
                data.clone().convert::<B::FloatElem>(),
                &self.device,
            )),
            None => Ok(current),
        }
    }

    pub fn finish(self) -> BindReport {
        self.matcher.finish()
    }
}

/// Modules whose parameters can be exchanged by name.
pub trait NamedParams<B: Backend>: Sized {
    /// Loads every parameter found in the binder, keeping the others untouched.
    fn load_params(self, name: &str, binder: &mut ParamBinder<'_, B>) -> Result<Self, BindError>;

    /// Writes every parameter into `params`.
    fn export_params(&self, name: &str, params: &mut ParamMap);
}

fn load_param<B: Backend, const D: usize>(
    param: Param<Tensor<B, D>>,
    kind: ParamKind,
    name: &str,
    binder: &mut ParamBinder<'_, B>,
) -> Result<Param<Tensor<B, D>>, BindError> {
    let tensor = binder.tensor(kind, name, param.val())?;
    Ok(Param::from_tensor(tensor))
}

impl<B: Backend> NamedParams<B> for Conv2d<B> {
    fn load_params(
        mut self,
        name: &str,
        binder: &mut ParamBinder<'_, B>,
    ) -> Result<Self, BindError> {
        self.weight = load_param(self.weight, ParamKind::Arg, &format!("{name}_weight"), binder)?;
        if let Some(bias) = self.bias.take() {
            self.bias = Some(load_param(bias, ParamKind::Arg, &format!("{name}_bias"), binder)?);
        }
        Ok(self)
    }

    fn export_params(&self, name: &str, params: &mut ParamMap) {
        params.insert(
            ParamKind::Arg,
            format!("{name}_weight"),
            self.weight.val().into_data(),
        );
        if let Some(bias) = &self.bias {
            params.insert(ParamKind::Arg, format!("{name}_bias"), bias.val().into_data());
        }
    }
}

impl<B: Backend> NamedParams<B> for BatchNorm<B> {
    fn load_params(
        mut self,
        name: &str,
        binder: &mut ParamBinder<'_, B>,
    ) -> Result<Self, BindError> {
        self.gamma = load_param(self.gamma, ParamKind::Arg, &format!("{name}_gamma"), binder)?;
        self.beta = load_param(self.beta, ParamKind::Arg, &format!("{name}_beta"), binder)?;
        let mean = binder.tensor(
            ParamKind::Aux,
            &format!("{name}_moving_mean"),
            self.moving_mean.value(),
        )?;
        let var = binder.tensor(
            ParamKind::Aux,
            &format!("{name}_moving_var"),
            self.moving_var.value(),
        )?;
        self.moving_mean = RunningState::new(mean);
        self.moving_var = RunningState::new(var);
        Ok(self)
    }

    fn export_params(&self, name: &str, params: &mut ParamMap) {
        params.insert(ParamKind::Arg, format!("{name}_gamma"), self.gamma.val().into_data());
        params.insert(ParamKind::Arg, format!("{name}_beta"), self.beta.val().into_data());
        params.insert(
            ParamKind::Aux,
            format!("{name}_moving_mean"),
            self.moving_mean.value().into_data(),
        );
        params.insert(
            ParamKind::Aux,
            format!("{name}_moving_var"),
            self.moving_var.value().into_data(),
        );
    }
}

impl<B: Backend> NamedParams<B> for ResidualUnit<B> {
    fn load_params(
        mut self,
        name: &str,
        binder: &mut ParamBinder<'_, B>,
    ) -> Result<Self, BindError> {
        self.bn1 = self.bn1.load_params(&format!("{name}_bn1"), binder)?;
        self.conv1 = self.conv1.load_params(&format!("{name}_conv1"), binder)?;
        self.bn2 = self.bn2.load_params(&format!("{name}_bn2"), binder)?;
        self.conv2 = self.conv2.load_params(&format!("{name}_conv2"), binder)?;
        self.bn3 = self.bn3.load_params(&format!("{name}_bn3"), binder)?;
        self.conv3 = self.conv3.load_params(&format!("{name}_conv3"), binder)?;
        if let Some(shortcut) = self.shortcut.take() {
            self.shortcut = Some(shortcut.load_params(&format!("{name}_sc"), binder)?);
        }
        Ok(self)
    }

    fn export_params(&self, name: &str, params: &mut ParamMap) {
        self.bn1.export_params(&format!("{name}_bn1"), params);
        self.conv1.export_params(&format!("{name}_conv1"), params);
        self.bn2.export_params(&format!("{name}_bn2"), params);
        self.conv2.export_params(&format!("{name}_conv2"), params);
        self.bn3.export_params(&format!("{name}_bn3"), params);
        self.conv3.export_params(&format!("{name}_conv3"), params);
        if let Some(shortcut) = &self.shortcut {
            shortcut.export_params(&format!("{name}_sc"), params);
        }
    }
}

impl<B: Backend> NamedParams<B> for DilatedResNet<B> {
    /// `name` is ignored: the backbone nodes live at the root of the graph.
    fn load_params(
        mut self,
        _name: &str,
        binder: &mut ParamBinder<'_, B>,
    ) -> Result<Self, BindError> {
        self.bn_data = self.bn_data.load_params("bn_data", binder)?;
        self.conv0 = self.conv0.load_params("conv0", binder)?;
        self.bn0 = self.bn0.load_params("bn0", binder)?;
        for (i, stage) in self.stages.iter_mut().enumerate() {
            let units = std::mem::take(&mut stage.units);
            stage.units = units
                .into_iter()
                .enumerate()
                .map(|(j, unit)| unit.load_params(&unit_name(i + 1, j), binder))
                .collect::<Result<_, _>>()?;
        }
        Ok(self)
    }

    fn export_params(&self, _name: &str, params: &mut ParamMap) {
        self.bn_data.export_params("bn_data", params);
        self.conv0.export_params("conv0", params);
        self.bn0.export_params("bn0", params);
        for (i, stage) in self.stages.iter().enumerate() {
            for (j, unit) in stage.units.iter().enumerate() {
                unit.export_params(&unit_name(i + 1, j), params);
            }
        }
    }
}

impl<B: Backend> DilatedResNet<B> {
    /// Binds every parameter present in `params`, by name.
    ///
    /// Entries unknown to the network are ignored and parameters absent from `params` keep
    /// their current value; both are listed in the returned report. A shape mismatch aborts.
    pub fn load_checkpoint_params(
        self,
        params: &ParamMap,
        device: &B::Device,
    ) -> Result<(Self, BindReport), BindError> {
        let mut binder = ParamBinder::new(params, device);
        let net = self.load_params("", &mut binder)?;
        Ok((net, binder.finish()))
    }

    /// Every parameter of the network, named as in the symbolic graph.
    pub fn to_params(&self) -> ParamMap {
        let mut params = ParamMap::new();
        self.export_params("", &mut params);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::match_params;
    use crate::resnet::{ResNetConfig, build_symbol};
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    fn tiny() -> ResNetConfig {
        ResNetConfig::new(vec![1, 2, 1, 3], vec![8, 16, 16, 32, 32])
    }

    #[test]
    fn exported_names_match_the_symbolic_graph() {
        let device = Default::default();
        let config = tiny();
        let net = config.init::<TestBackend>(&device).unwrap();
        let params = net.to_params();

        let (graph, _) = build_symbol(&config, [1, 3, 32, 32]).unwrap();
        let report = match_params(&graph.params(), &params).unwrap();
        assert!(report.is_complete(), "missing {:?}", report.missing);
        assert!(report.unused.is_empty(), "unused {:?}", report.unused);
        assert_eq!(report.bound.len(), params.len());
    }

    #[test]
    fn loaded_network_reproduces_outputs() {
        let device = Default::default();
        let config = tiny();
        let source = config.init::<TestBackend>(&device).unwrap();
        let params = source.to_params();

        let fresh = config.init::<TestBackend>(&device).unwrap();
        let (loaded, report) = fresh.load_checkpoint_params(&params, &device).unwrap();
        assert!(report.is_complete());

        let x = Tensor::<TestBackend, 4>::random([1, 3, 24, 24], Distribution::Default, &device);
        let expected = source.forward(x.clone()).into_data().to_vec::<f32>().unwrap();
        let actual = loaded.forward(x).into_data().to_vec::<f32>().unwrap();
        assert!(expected.iter().zip(&actual).all(|(e, a)| (e - a).abs() < 1e-4));
    }

    #[test]
    fn deeper_checkpoint_binds_the_shared_prefix() {
        let device = Default::default();
        let deeper = ResNetConfig::new(vec![1, 3, 1, 3], vec![8, 16, 16, 32, 32]);
        let params = deeper.init::<TestBackend>(&device).unwrap().to_params();

        let net = tiny().init::<TestBackend>(&device).unwrap();
        let (_, report) = net.load_checkpoint_params(&params, &device).unwrap();
        assert!(report.is_complete());
        assert!(report.unused.contains(&"arg:stage2_unit3_conv1_weight".to_string()));
        assert!(report.unused.contains(&"aux:stage2_unit3_bn1_moving_var".to_string()));
    }

    #[test]
    fn missing_parameters_keep_their_value() {
        let device = Default::default();
        let net = tiny().init::<TestBackend>(&device).unwrap();
        let before = net.conv0.weight.val().into_data();

        let mut params = ParamMap::new();
        params.insert(
            ParamKind::Aux,
            "bn0_moving_mean",
            TensorData::new(vec![0.25f32; 8], [8]),
        );
        let (net, report) = net.load_checkpoint_params(&params, &device).unwrap();
        assert_eq!(report.bound, ["bn0_moving_mean"]);
        assert!(report.missing.contains(&"conv0_weight".to_string()));
        assert_eq!(net.conv0.weight.val().into_data(), before);
        let mean = net.bn0.moving_mean.value().into_data().to_vec::<f32>().unwrap();
        assert_eq!(mean, vec![0.25; 8]);
    }

    #[test]
    fn shape_mismatch_is_fatal() {
        let device = Default::default();
        let mut params = ParamMap::new();
        params.insert(
            ParamKind::Arg,
            "conv0_weight",
            TensorData::new(vec![0f32; 64 * 3 * 7 * 7], [64, 3, 7, 7]),
        );
        let net = tiny().init::<TestBackend>(&device).unwrap();
        let err = net.load_checkpoint_params(&params, &device).unwrap_err();
        assert_eq!(
            err,
            BindError::Shape {
                name: "conv0_weight".into(),
                expected: vec![8, 3, 7, 7],
                found: vec![64, 3, 7, 7],
            }
        );
    }
}
