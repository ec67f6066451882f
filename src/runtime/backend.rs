//! Abstract interface (trait) for execution backends.

use crate::asg::{Asg, AsgId, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing (interpreting) a graph.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node {0} not found in graph {1}. Make sure the graph was built correctly.")]
    NodeNotFound(NodeId, AsgId),

    #[error("Type mismatch: operation expected {expected}, got {actual}.")]
    TypeError { expected: String, actual: String },

    #[error("Tensor shape error: {0}.")]
    ShapeError(String),

    #[error("Index {index} out of range for {len} rows.")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("No value for input '{0}' (node {1}). Bind it in the initial memo before backend.run().")]
    MissingInput(String, NodeId),

    #[error("No value for parameter '{0}' (node {1}). Initialize the parameter before running the graph.")]
    MissingParameter(String, NodeId),

    #[error("Graph has no node named '{0}'.")]
    UnknownBinding(String),
}

/// Cache of already computed node values, keyed by (AsgId, NodeId).
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Whether stochastic nodes (dropout masks) are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    Train,
    #[default]
    Eval,
}

/// Common interface of an execution environment.
///
/// A backend takes an ASG plus bound data and computes the graph outputs.
pub trait Backend {
    /// Device-side representation of a value.
    type DeviceData: std::fmt::Debug;

    /// Moves host values to the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes `main_asg`, reusing and extending `initial_memo`.
    ///
    /// Returns the graph outputs and the final memo with every intermediate
    /// value, so that a gradient graph can read the forward values through
    /// its `External` nodes.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies results back to host `Value`s.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}

/// Places named device data into a memo for `asg`, resolving each name to its
/// `Input` or `Parameter` node.
pub fn bind<T>(asg: &Asg, data: HashMap<String, T>) -> Result<Memo<T>, RuntimeError> {
    let mut memo = Memo::with_capacity(data.len());
    for (name, value) in data {
        let node_id = asg
            .find_named(&name)
            .ok_or_else(|| RuntimeError::UnknownBinding(name.clone()))?;
        memo.insert((asg.id, node_id), value);
    }
    Ok(memo)
}
