//! Crate-level error type.
//!
//! Every lower layer (graph IR, shape inference, autograd, backend) has its
//! own error enum; they all convert into [`DagnnError`] with `?`.

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::asg::AsgError;
use crate::autograd::AutogradError;
use crate::runtime::backend::RuntimeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DagnnError {
    /// Invalid or irreconcilable layer configuration, non-positive step count.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Dimension mismatch detected before any arithmetic ran.
    #[error("shape error: {0}")]
    Shape(String),

    /// Node index outside `[0, node_count)`.
    #[error("index {index} out of range for a graph with {node_count} nodes")]
    Index { index: usize, node_count: usize },

    #[error("graph error: {0}")]
    Graph(#[from] AsgError),

    #[error("autograd error: {0}")]
    Autograd(#[from] AutogradError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model is not built, call build() first")]
    NotBuilt,
}

impl From<ShapeInferenceError> for DagnnError {
    fn from(err: ShapeInferenceError) -> Self {
        match err {
            ShapeInferenceError::AsgError(e) => DagnnError::Graph(e),
            other => DagnnError::Shape(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, DagnnError>;
