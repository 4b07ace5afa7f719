//! Topology json, the graph half of a checkpoint.
//!
//! Every operator node lists its inputs as `[node, output, version]` triples, and every
//! parameter appears as a `"null"` node right before the operator that consumes it.

use super::graph::{Graph, Node, Op, ParamKind, PoolType, Symbol};
use crate::error::{CheckpointError, GraphError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonNode {
    pub op: String,
    pub name: String,
    #[serde(default, alias = "param", alias = "attr", skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<Vec<usize>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolJson {
    pub nodes: Vec<JsonNode>,
    #[serde(default)]
    pub arg_nodes: Vec<usize>,
    #[serde(default)]
    pub heads: Vec<Vec<usize>>,
}

impl SymbolJson {
    pub fn from_reader(reader: impl Read) -> Result<Self, CheckpointError> {
        serde_json::from_reader(reader).map_err(CheckpointError::Json)
    }

    pub fn to_writer(&self, writer: impl Write) -> Result<(), CheckpointError> {
        serde_json::to_writer_pretty(writer, self).map_err(CheckpointError::Json)
    }

    /// Names of the operator (non-variable) nodes.
    pub fn op_names(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.op != "null")
            .map(|n| n.name.as_str())
    }

    /// Names of the variable nodes, inputs and parameters alike.
    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.op == "null")
            .map(|n| n.name.as_str())
    }
}

fn pair(v: [usize; 2]) -> String {
    format!("({}, {})", v[0], v[1])
}

fn flag(v: bool) -> String {
    let text = if v { "True" } else { "False" };
    text.to_string()
}

fn attrs_of(node: &Node) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    if node.mirror_stage {
        attrs.insert("mirror_stage".into(), flag(true));
    }
    match &node.op {
        Op::Variable | Op::ElemwiseAdd => {}
        Op::Convolution(conv) => {
            attrs.insert("num_filter".into(), conv.num_filter.to_string());
            attrs.insert("kernel".into(), pair(conv.kernel));
            attrs.insert("stride".into(), pair(conv.stride));
            attrs.insert("pad".into(), pair(conv.pad));
            attrs.insert("dilate".into(), pair(conv.dilate));
            attrs.insert("no_bias".into(), flag(conv.no_bias));
            attrs.insert("workspace".into(), conv.workspace.to_string());
        }
        Op::BatchNorm(bn) => {
            attrs.insert("eps".into(), bn.eps.to_string());
            attrs.insert("momentum".into(), bn.momentum.to_string());
            attrs.insert("fix_gamma".into(), flag(bn.fix_gamma));
        }
        Op::Activation(_) => {
            attrs.insert("act_type".into(), "relu".into());
        }
        Op::Pooling(pool) => {
            attrs.insert("kernel".into(), pair(pool.kernel));
            attrs.insert("stride".into(), pair(pool.stride));
            attrs.insert("pad".into(), pair(pool.pad));
            let pool_type = match pool.pool_type {
                PoolType::Max => "max",
                PoolType::Avg => "avg",
            };
            attrs.insert("pool_type".into(), pool_type.into());
        }
    }
    attrs
}

impl Graph {
    /// Exports the topology with `heads` as outputs.
    pub fn to_symbol_json(&self, heads: &[Symbol]) -> Result<SymbolJson, GraphError> {
        let mut nodes = Vec::new();
        let mut arg_nodes = Vec::new();
        let mut index = Vec::with_capacity(self.len());

        for (i, node) in self.nodes().iter().enumerate() {
            let mut inputs: Vec<Vec<usize>> = node
                .inputs
                .iter()
                .map(|s| vec![index[s.index()], 0, 0])
                .collect();
            for param in self.node_params(Symbol(i))? {
                let version = match param.kind {
                    ParamKind::Arg => 0,
                    ParamKind::Aux => 1,
                };
                inputs.push(vec![nodes.len(), 0, version]);
                arg_nodes.push(nodes.len());
                nodes.push(JsonNode {
                    op: "null".into(),
                    name: param.name,
                    attrs: BTreeMap::new(),
                    inputs: vec![],
                });
            }
            if node.op == Op::Variable {
                arg_nodes.push(nodes.len());
                inputs.clear();
            }
            index.push(nodes.len());
            nodes.push(JsonNode {
                op: node.op.type_name().into(),
                name: node.name.clone(),
                attrs: attrs_of(node),
                inputs,
            });
        }

        let heads = heads
            .iter()
            .map(|s| {
                index
                    .get(s.index())
                    .map(|&i| vec![i, 0, 0])
                    .ok_or(GraphError::UnknownNode(s.index()))
            })
            .collect::<Result<_, _>>()?;
        Ok(SymbolJson {
            nodes,
            arg_nodes,
            heads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::{BatchNormAttrs, ConvAttrs};

    fn tiny() -> (Graph, Symbol) {
        let mut graph = Graph::new();
        let data = graph.variable("data", [1, 3, 16, 16]).unwrap();
        let bn = graph
            .batch_norm(
                data,
                "bn_data",
                BatchNormAttrs {
                    eps: 2e-5,
                    momentum: 0.9,
                    fix_gamma: true,
                },
            )
            .unwrap();
        let conv = graph
            .convolution(bn, "conv0", ConvAttrs::new(8, 7).with_stride(2).with_pad(3))
            .unwrap();
        (graph, conv)
    }

    #[test]
    fn parameters_become_variable_nodes() {
        let (graph, head) = tiny();
        let json = graph.to_symbol_json(&[head]).unwrap();
        let variables: Vec<_> = json.variable_names().collect();
        assert_eq!(
            variables,
            [
                "data",
                "bn_data_gamma",
                "bn_data_beta",
                "bn_data_moving_mean",
                "bn_data_moving_var",
                "conv0_weight"
            ]
        );
        assert_eq!(json.op_names().collect::<Vec<_>>(), ["bn_data", "conv0"]);
        let bn = &json.nodes[5];
        assert_eq!(bn.inputs, vec![vec![0, 0, 0], vec![1, 0, 0], vec![2, 0, 0], vec![3, 0, 1], vec![4, 0, 1]]);
        assert_eq!(bn.attrs["fix_gamma"], "True");
        let conv = json.nodes.last().unwrap();
        assert_eq!(conv.attrs["kernel"], "(7, 7)");
        assert_eq!(conv.attrs["no_bias"], "True");
        assert_eq!(json.heads, vec![vec![7, 0, 0]]);
    }

    #[test]
    fn reads_legacy_param_key() {
        let text = r#"{
            "nodes": [
                {"op": "null", "name": "data", "inputs": []},
                {"op": "Activation", "name": "relu0", "param": {"act_type": "relu"}, "inputs": [[0, 0]]}
            ],
            "arg_nodes": [0],
            "heads": [[1, 0]]
        }"#;
        let json = SymbolJson::from_reader(text.as_bytes()).unwrap();
        assert_eq!(json.nodes[1].attrs["act_type"], "relu");
        assert_eq!(json.op_names().collect::<Vec<_>>(), ["relu0"]);
    }

    #[test]
    fn written_json_reads_back() {
        let (graph, head) = tiny();
        let json = graph.to_symbol_json(&[head]).unwrap();
        let mut buf = Vec::new();
        json.to_writer(&mut buf).unwrap();
        assert_eq!(SymbolJson::from_reader(buf.as_slice()).unwrap(), json);
    }
}
