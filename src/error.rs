use std::path::PathBuf;
use thiserror::Error;

/// Crate-level error, wrapping the error of each component.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Bind(#[from] BindError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("sample rate must be at least 1")]
    ZeroSampleRate,
    #[error("failed to walk {path:?}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("failed to write manifest {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read manifest")]
    Read(#[source] std::io::Error),
    #[error("manifest line {line}: {reason}")]
    Parse { line: usize, reason: String },
}

/// Rejected network specifications.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("expected {expected} filter sizes (stem + one per stage), got {actual}")]
    FilterListLength { expected: usize, actual: usize },
    #[error("a network needs between 1 and {max} stages, got {actual}")]
    StageCount { max: usize, actual: usize },
    #[error("stage {stage} has no units")]
    EmptyStage { stage: usize },
    #[error("stage 4 dilation is only defined for exactly 3 units, got {actual}")]
    Stage4Units { actual: usize },
    #[error("stage {stage} width {filters} is not divisible by 4 for the bottleneck")]
    BottleneckWidth { stage: usize, filters: usize },
    #[error("stem width must be non-zero")]
    StemWidth,
    #[error("batch norm epsilon must be positive, got {0}")]
    Epsilon(f64),
    #[error("batch norm momentum must lie in [0, 1], got {0}")]
    Momentum(f64),
    #[error("unknown preset {0:?} (expected resnet50, resnet101 or resnet152)")]
    UnknownPreset(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node name {0:?} is already used in the graph")]
    DuplicateName(String),
    #[error("node {0} does not belong to this graph")]
    UnknownNode(usize),
    #[error("node {node:?}: kernel does not fit the padded input {shape:?}")]
    KernelTooLarge { node: String, shape: Vec<usize> },
    #[error("node {node:?}: cannot add shapes {lhs:?} and {rhs:?}")]
    AddShape {
        node: String,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("node {node:?}: zero stride")]
    ZeroStride { node: String },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to open checkpoint file {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("checkpoint file {path:?} is malformed")]
    Malformed {
        path: PathBuf,
        #[source]
        source: Box<CheckpointError>,
    },
    #[error("truncated parameter data")]
    Truncated(#[source] std::io::Error),
    #[error("bad list magic {0:#x}")]
    ListMagic(u64),
    #[error("unsupported storage type {0} (only dense arrays are supported)")]
    StorageType(i32),
    #[error("unsupported element type flag {0}")]
    TypeFlag(i32),
    #[error("dimension {0} does not fit in memory")]
    Dimension(i64),
    #[error("{arrays} arrays but {names} names")]
    NameCount { arrays: usize, names: usize },
    #[error("parameter name {0:?} has no arg:/aux: prefix")]
    NamePrefix(String),
    #[error("parameter name is not utf-8")]
    NameEncoding(#[source] std::string::FromUtf8Error),
    #[error("invalid topology json")]
    Json(#[source] serde_json::Error),
    #[error("failed to write checkpoint file {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Parameter binding failures. Each variant names the offending parameter(s).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindError {
    #[error("parameter {name:?}: checkpoint shape {found:?} does not match graph shape {expected:?}")]
    Shape {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("parameters missing from the checkpoint: {}", .0.join(", "))]
    Missing(Vec<String>),
}
