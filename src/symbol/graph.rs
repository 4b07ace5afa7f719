use crate::error::GraphError;
use std::collections::HashMap;

/// Handle to a node of a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub(crate) usize);

impl Symbol {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConvAttrs {
    pub num_filter: usize,
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub dilate: [usize; 2],
    pub no_bias: bool,
    pub workspace: usize,
}

impl ConvAttrs {
    /// Square `kernel`x`kernel` convolution, unit stride and dilation, no padding, no bias.
    pub fn new(num_filter: usize, kernel: usize) -> Self {
        Self {
            num_filter,
            kernel: [kernel, kernel],
            stride: [1, 1],
            pad: [0, 0],
            dilate: [1, 1],
            no_bias: true,
            workspace: 512,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = [stride, stride];
        self
    }

    pub fn with_pad(mut self, pad: usize) -> Self {
        self.pad = [pad, pad];
        self
    }

    pub fn with_dilate(mut self, dilate: usize) -> Self {
        self.dilate = [dilate, dilate];
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.no_bias = !bias;
        self
    }

    pub fn with_workspace(mut self, workspace: usize) -> Self {
        self.workspace = workspace;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormAttrs {
    pub eps: f64,
    pub momentum: f64,
    /// Gamma is pinned to one and never learned.
    pub fix_gamma: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActType {
    Relu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolType {
    Max,
    Avg,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolAttrs {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub pad: [usize; 2],
    pub pool_type: PoolType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Variable,
    Convolution(ConvAttrs),
    BatchNorm(BatchNormAttrs),
    Activation(ActType),
    Pooling(PoolAttrs),
    ElemwiseAdd,
}

impl Op {
    /// Operator name used in the topology json.
    pub fn type_name(&self) -> &'static str {
        match self {
            Op::Variable => "null",
            Op::Convolution(_) => "Convolution",
            Op::BatchNorm(_) => "BatchNorm",
            Op::Activation(_) => "Activation",
            Op::Pooling(_) => "Pooling",
            Op::ElemwiseAdd => "elemwise_add",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op: Op,
    pub inputs: Vec<Symbol>,
    /// Inferred output shape, `[batch, channels, height, width]`.
    pub shape: [usize; 4],
    /// Recomputation boundary hint for memory-saving executors.
    pub mirror_stage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamKind {
    /// Learned argument.
    Arg,
    /// Auxiliary state, such as batch norm running statistics.
    Aux,
}

impl ParamKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ParamKind::Arg => "arg",
            ParamKind::Aux => "aux",
        }
    }
}

/// A parameter registered by a node, addressed by name when loading checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub shape: Vec<usize>,
}

/// Append-only computation graph.
///
/// Nodes can only refer to nodes that already exist, so the graph is acyclic by construction.
/// Node names are unique and double as the prefix of the parameters each node registers.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    names: HashMap<String, Symbol>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, symbol: Symbol) -> Result<&Node, GraphError> {
        self.nodes
            .get(symbol.0)
            .ok_or(GraphError::UnknownNode(symbol.0))
    }

    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.names.get(name).copied()
    }

    pub fn shape(&self, symbol: Symbol) -> Result<[usize; 4], GraphError> {
        Ok(self.node(symbol)?.shape)
    }

    pub fn variable(&mut self, name: &str, shape: [usize; 4]) -> Result<Symbol, GraphError> {
        self.push(name, Op::Variable, vec![], shape)
    }

    pub fn convolution(
        &mut self,
        input: Symbol,
        name: &str,
        attrs: ConvAttrs,
    ) -> Result<Symbol, GraphError> {
        let [n, _c, h, w] = self.shape(input)?;
        let height = window_out(name, h, attrs.kernel[0], attrs.stride[0], attrs.pad[0], attrs.dilate[0])?;
        let width = window_out(name, w, attrs.kernel[1], attrs.stride[1], attrs.pad[1], attrs.dilate[1])?;
        let shape = [n, attrs.num_filter, height, width];
        self.push(name, Op::Convolution(attrs), vec![input], shape)
    }

    pub fn batch_norm(
        &mut self,
        input: Symbol,
        name: &str,
        attrs: BatchNormAttrs,
    ) -> Result<Symbol, GraphError> {
        let shape = self.shape(input)?;
        self.push(name, Op::BatchNorm(attrs), vec![input], shape)
    }

    pub fn activation(
        &mut self,
        input: Symbol,
        name: &str,
        act: ActType,
    ) -> Result<Symbol, GraphError> {
        let shape = self.shape(input)?;
        self.push(name, Op::Activation(act), vec![input], shape)
    }

    pub fn pooling(
        &mut self,
        input: Symbol,
        name: &str,
        attrs: PoolAttrs,
    ) -> Result<Symbol, GraphError> {
        let [n, c, h, w] = self.shape(input)?;
        let height = window_out(name, h, attrs.kernel[0], attrs.stride[0], attrs.pad[0], 1)?;
        let width = window_out(name, w, attrs.kernel[1], attrs.stride[1], attrs.pad[1], 1)?;
        self.push(name, Op::Pooling(attrs), vec![input], [n, c, height, width])
    }

    pub fn add(&mut self, lhs: Symbol, rhs: Symbol, name: &str) -> Result<Symbol, GraphError> {
        let lhs_shape = self.shape(lhs)?;
        let rhs_shape = self.shape(rhs)?;
        if lhs_shape != rhs_shape {
            return Err(GraphError::AddShape {
                node: name.to_string(),
                lhs: lhs_shape.to_vec(),
                rhs: rhs_shape.to_vec(),
            });
        }
        self.push(name, Op::ElemwiseAdd, vec![lhs, rhs], lhs_shape)
    }

    /// Parameters of a single node, in the order the node consumes them.
    pub fn node_params(&self, symbol: Symbol) -> Result<Vec<ParamSpec>, GraphError> {
        let node = self.node(symbol)?;
        let arg = |suffix: &str, shape: Vec<usize>| ParamSpec {
            name: format!("{}_{suffix}", node.name),
            kind: ParamKind::Arg,
            shape,
        };
        let aux = |suffix: &str, shape: Vec<usize>| ParamSpec {
            name: format!("{}_{suffix}", node.name),
            kind: ParamKind::Aux,
            shape,
        };
        let params = match &node.op {
            Op::Convolution(attrs) => {
                let in_channels = match node.inputs.first() {
                    Some(input) => self.shape(*input)?[1],
                    None => 0,
                };
                let mut params = vec![arg(
                    "weight",
                    vec![attrs.num_filter, in_channels, attrs.kernel[0], attrs.kernel[1]],
                )];
                if !attrs.no_bias {
                    params.push(arg("bias", vec![attrs.num_filter]));
                }
                params
            }
            Op::BatchNorm(_) => {
                let channels = vec![node.shape[1]];
                vec![
                    arg("gamma", channels.clone()),
                    arg("beta", channels.clone()),
                    aux("moving_mean", channels.clone()),
                    aux("moving_var", channels),
                ]
            }
            Op::Variable | Op::Activation(_) | Op::Pooling(_) | Op::ElemwiseAdd => vec![],
        };
        Ok(params)
    }

    /// Every parameter registered in the graph, in node order.
    pub fn params(&self) -> Vec<ParamSpec> {
        (0..self.nodes.len())
            .flat_map(|i| self.node_params(Symbol(i)).unwrap_or_default())
            .collect()
    }

    /// Marks `symbol` as a mirror stage boundary, exported as `mirror_stage="True"`.
    pub fn set_mirror_stage(&mut self, symbol: Symbol) -> Result<(), GraphError> {
        let node = self
            .nodes
            .get_mut(symbol.0)
            .ok_or(GraphError::UnknownNode(symbol.0))?;
        node.mirror_stage = true;
        Ok(())
    }

    fn push(
        &mut self,
        name: &str,
        op: Op,
        inputs: Vec<Symbol>,
        shape: [usize; 4],
    ) -> Result<Symbol, GraphError> {
        if self.names.contains_key(name) {
            return Err(GraphError::DuplicateName(name.to_string()));
        }
        if let Some(input) = inputs.iter().find(|s| s.0 >= self.nodes.len()) {
            return Err(GraphError::UnknownNode(input.0));
        }
        let symbol = Symbol(self.nodes.len());
        log::trace!("{name}: {} {shape:?}", op.type_name());
        self.nodes.push(Node {
            name: name.to_string(),
            op,
            inputs,
            shape,
            mirror_stage: false,
        });
        self.names.insert(name.to_string(), symbol);
        Ok(symbol)
    }
}

/// Output length of a sliding window, flooring partial windows.
fn window_out(
    node: &str,
    len: usize,
    kernel: usize,
    stride: usize,
    pad: usize,
    dilate: usize,
) -> Result<usize, GraphError> {
    if stride == 0 {
        return Err(GraphError::ZeroStride {
            node: node.to_string(),
        });
    }
    let span = dilate * (kernel.saturating_sub(1)) + 1;
    let padded = len + 2 * pad;
    if padded < span {
        return Err(GraphError::KernelTooLarge {
            node: node.to_string(),
            shape: vec![len],
        });
    }
    Ok((padded - span) / stride + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut graph = Graph::new();
        let data = graph.variable("data", [1, 3, 8, 8]).unwrap();
        graph
            .activation(data, "relu", ActType::Relu)
            .unwrap();
        assert_eq!(
            graph.activation(data, "relu", ActType::Relu),
            Err(GraphError::DuplicateName("relu".into()))
        );
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let mut graph = Graph::new();
        assert_eq!(
            graph.activation(Symbol(3), "relu", ActType::Relu),
            Err(GraphError::UnknownNode(3))
        );
    }

    #[test]
    fn dilated_conv_with_matching_padding_keeps_resolution() {
        let mut graph = Graph::new();
        let data = graph.variable("data", [2, 16, 25, 31]).unwrap();
        for dilate in [1, 2, 5, 9, 17] {
            let conv = graph
                .convolution(
                    data,
                    &format!("conv_d{dilate}"),
                    ConvAttrs::new(8, 3).with_pad(dilate).with_dilate(dilate),
                )
                .unwrap();
            assert_eq!(graph.shape(conv).unwrap(), [2, 8, 25, 31]);
        }
    }

    #[test]
    fn strided_windows_floor() {
        let mut graph = Graph::new();
        let data = graph.variable("data", [1, 3, 800, 799]).unwrap();
        let conv = graph
            .convolution(data, "conv0", ConvAttrs::new(64, 7).with_stride(2).with_pad(3))
            .unwrap();
        assert_eq!(graph.shape(conv).unwrap(), [1, 64, 400, 400]);
        let pool = graph
            .pooling(
                conv,
                "pool0",
                PoolAttrs {
                    kernel: [3, 3],
                    stride: [2, 2],
                    pad: [1, 1],
                    pool_type: PoolType::Max,
                },
            )
            .unwrap();
        assert_eq!(graph.shape(pool).unwrap(), [1, 64, 200, 200]);
    }

    #[test]
    fn kernel_larger_than_input_is_an_error() {
        let mut graph = Graph::new();
        let data = graph.variable("data", [1, 3, 2, 2]).unwrap();
        assert!(matches!(
            graph.convolution(data, "big", ConvAttrs::new(4, 7)),
            Err(GraphError::KernelTooLarge { .. })
        ));
    }

    #[test]
    fn add_requires_equal_shapes() {
        let mut graph = Graph::new();
        let data = graph.variable("data", [1, 4, 8, 8]).unwrap();
        let conv = graph
            .convolution(data, "conv", ConvAttrs::new(8, 1))
            .unwrap();
        assert!(matches!(
            graph.add(conv, data, "plus"),
            Err(GraphError::AddShape { .. })
        ));
    }

    #[test]
    fn params_follow_node_names() {
        let mut graph = Graph::new();
        let data = graph.variable("data", [1, 4, 8, 8]).unwrap();
        let bn = graph
            .batch_norm(
                data,
                "bn",
                BatchNormAttrs {
                    eps: 2e-5,
                    momentum: 0.9,
                    fix_gamma: false,
                },
            )
            .unwrap();
        graph
            .convolution(bn, "conv", ConvAttrs::new(8, 3).with_bias(true))
            .unwrap();
        let params = graph.params();
        let names: Vec<_> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "bn_gamma",
                "bn_beta",
                "bn_moving_mean",
                "bn_moving_var",
                "conv_weight",
                "conv_bias"
            ]
        );
        assert_eq!(params[2].kind, ParamKind::Aux);
        assert_eq!(params[4].shape, vec![8, 4, 3, 3]);
    }
}
