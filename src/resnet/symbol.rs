//! Builds the dilated ResNet into a symbolic [`Graph`].

use super::config::{Hyperparams, ResNetConfig, UnitPlan};
use crate::error::Result;
use crate::symbol::{ActType, BatchNormAttrs, ConvAttrs, Graph, PoolAttrs, PoolType, Symbol};

/// Inputs of one residual unit, mirroring [`UnitPlan`] minus the bookkeeping.
#[derive(Debug, Clone, Copy)]
pub struct UnitSpec<'a> {
    pub num_filter: usize,
    pub stride: [usize; 2],
    /// Input and output widths match, the shortcut is the raw input.
    pub dim_match: bool,
    pub dilate: [usize; 2],
    pub name: &'a str,
}

impl<'a> From<&'a UnitPlan> for UnitSpec<'a> {
    fn from(plan: &'a UnitPlan) -> Self {
        Self {
            num_filter: plan.num_filter,
            stride: [plan.stride; 2],
            dim_match: plan.dim_match,
            dilate: [plan.dilation; 2],
            name: &plan.name,
        }
    }
}

fn bn(hp: &Hyperparams, fix_gamma: bool) -> BatchNormAttrs {
    BatchNormAttrs {
        eps: hp.bn_epsilon,
        momentum: hp.bn_momentum,
        fix_gamma,
    }
}

/// Pre-activation bottleneck unit.
///
/// The projection shortcut branches off the activated input (`{name}_relu1`), not the raw
/// input; moving it changes the numerics of pretrained weights.
pub fn residual_unit(
    graph: &mut Graph,
    data: Symbol,
    spec: UnitSpec<'_>,
    hp: &Hyperparams,
) -> Result<Symbol> {
    let name = spec.name;
    let bottleneck = spec.num_filter / 4;

    let bn1 = graph.batch_norm(data, &format!("{name}_bn1"), bn(hp, false))?;
    let act1 = graph.activation(bn1, &format!("{name}_relu1"), ActType::Relu)?;
    let conv1 = graph.convolution(
        act1,
        &format!("{name}_conv1"),
        ConvAttrs::new(bottleneck, 1).with_workspace(hp.workspace),
    )?;

    let bn2 = graph.batch_norm(conv1, &format!("{name}_bn2"), bn(hp, false))?;
    let act2 = graph.activation(bn2, &format!("{name}_relu2"), ActType::Relu)?;
    let conv2 = graph.convolution(
        act2,
        &format!("{name}_conv2"),
        ConvAttrs {
            stride: spec.stride,
            pad: spec.dilate,
            dilate: spec.dilate,
            ..ConvAttrs::new(bottleneck, 3).with_workspace(hp.workspace)
        },
    )?;

    let bn3 = graph.batch_norm(conv2, &format!("{name}_bn3"), bn(hp, false))?;
    let act3 = graph.activation(bn3, &format!("{name}_relu3"), ActType::Relu)?;
    let conv3 = graph.convolution(
        act3,
        &format!("{name}_conv3"),
        ConvAttrs::new(spec.num_filter, 1).with_workspace(hp.workspace),
    )?;

    let shortcut = if spec.dim_match && spec.stride == [1, 1] {
        data
    } else {
        graph.convolution(
            act1,
            &format!("{name}_sc"),
            ConvAttrs {
                stride: spec.stride,
                ..ConvAttrs::new(spec.num_filter, 1).with_workspace(hp.workspace)
            },
        )?
    };
    if hp.memonger {
        graph.set_mirror_stage(shortcut)?;
    }

    Ok(graph.add(conv3, shortcut, &format!("{name}_plus"))?)
}

/// Input normalization, 7x7/2 convolution and 3x3/2 max pooling.
pub fn stem(graph: &mut Graph, data: Symbol, width: usize, hp: &Hyperparams) -> Result<Symbol> {
    let x = graph.batch_norm(data, "bn_data", bn(hp, true))?;
    let x = graph.convolution(
        x,
        "conv0",
        ConvAttrs::new(width, 7)
            .with_stride(2)
            .with_pad(3)
            .with_workspace(hp.workspace),
    )?;
    let x = graph.batch_norm(x, "bn0", bn(hp, false))?;
    let x = graph.activation(x, "relu0", ActType::Relu)?;
    let x = graph.pooling(
        x,
        "pool0",
        PoolAttrs {
            kernel: [3, 3],
            stride: [2, 2],
            pad: [1, 1],
            pool_type: PoolType::Max,
        },
    )?;
    Ok(x)
}

/// Builds the backbone on top of `data` and returns the final feature map.
pub fn resnet(graph: &mut Graph, data: Symbol, config: &ResNetConfig) -> Result<Symbol> {
    let plans = config.unit_plans()?;
    let hp = config.hyperparams();

    let mut body = stem(graph, data, config.filter_list[0], &hp)?;
    for plan in &plans {
        body = residual_unit(graph, body, plan.into(), &hp)?;
    }
    log::debug!(
        "built resnet-{} symbol: {} nodes, {} parameters",
        config.depth(),
        graph.len(),
        graph.params().len()
    );
    Ok(body)
}

/// A fresh graph holding the backbone, with a `data` input of `input_shape`.
pub fn build_symbol(config: &ResNetConfig, input_shape: [usize; 4]) -> Result<(Graph, Symbol)> {
    let mut graph = Graph::new();
    let data = graph.variable("data", input_shape)?;
    let head = resnet(&mut graph, data, config)?;
    Ok((graph, head))
}
