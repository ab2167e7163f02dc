//! Error taxonomy for the traffic forecasting pipeline.
//!
//! Every fatal failure is funnelled into [`TrainError`], whose `Display`
//! names the stage that failed. [`LoggingError`] is the only recoverable
//! kind: metric sinks return it and callers downgrade it to a warning.

use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("preprocessing failed: {0}")]
    Numerical(#[from] NumericalError),

    #[error("data loading failed: {0}")]
    Data(#[from] DataError),

    #[error("device failure: {0}")]
    Device(#[from] DeviceError),

    #[error("checkpoint failed: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("cannot load config `{path}`: {message}")]
    Load { path: PathBuf, message: String },

    #[error("unknown model `{0}`, expected MSTGCN or ASTGCN")]
    UnknownModel(String),

    #[error("unknown optimizer `{0}`, expected adam or sgd")]
    UnknownOptimizer(String),

    #[error("malformed device list `{0}`")]
    DeviceList(String),

    #[error("params directory `{0}` already exists, pass --force to replace it")]
    ParamsDirExists(PathBuf),

    #[error("cannot prepare params directory `{path}`: {source}")]
    ParamsDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn invalid_value<S: Into<String>>(field: &'static str, reason: S) -> Self {
        ConfigError::InvalidValue { field, reason: reason.into() }
    }
}

#[derive(Debug, Error)]
pub enum NumericalError {
    #[error("largest Laplacian eigenvalue is {0:e}; the graph has no edges")]
    DegenerateEigenvalue(f64),

    #[error("non-finite value in Chebyshev term {order} at ({row}, {col})")]
    NonFiniteKernel { order: usize, row: usize, col: usize },
}

#[derive(Debug, Error)]
pub enum DataError {
    #[error("cannot read `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed `{path}`: {message}")]
    Format { path: PathBuf, message: String },

    #[error("invalid adjacency matrix: {0}")]
    InvalidAdjacency(String),

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("split `{0}` is empty")]
    EmptySplit(&'static str),
}

impl DataError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        DataError::Io { path: path.into(), source }
    }

    pub fn format<S: Into<String>>(path: impl Into<PathBuf>, message: S) -> Self {
        DataError::Format { path: path.into(), message: message.into() }
    }
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("cannot shard a batch of {batch} samples across {devices} devices")]
    Sharding { batch: usize, devices: usize },

    #[error("shard {shard}: expected output {expected:?}, got {actual:?}")]
    OutputShape {
        shard: usize,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("cannot read tensor back to the host: {0}")]
    ReadBack(String),
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("no gradient recorded for `{0}`")]
    MissingGradient(String),

    #[error("cannot write event `{tag}`: {message}")]
    Write { tag: String, message: String },
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("refusing to overwrite `{0}`")]
    Exists(PathBuf),

    #[error("cannot write `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot encode `{path}`: {message}")]
    Encode { path: PathBuf, message: String },
}
