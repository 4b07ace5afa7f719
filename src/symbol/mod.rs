//! Named, append-only computation graph with shape inference.

mod graph;
mod json;

pub use graph::{
    ActType, BatchNormAttrs, ConvAttrs, Graph, Node, Op, ParamKind, ParamSpec, PoolAttrs,
    PoolType, Symbol,
};
pub use json::{JsonNode, SymbolJson};
