//! Module defining the core `Module` trait for all neural network layers.

use crate::asg::Shape;
use crate::nn::init::Initializer;
use crate::tensor::Tensor;

/// A trainable parameter: its graph node plus everything needed to
/// create and regularize its value.
#[derive(Debug, Clone)]
pub struct Parameter {
    /// Symbolic `Parameter` node in the graph.
    pub tensor: Tensor,
    /// Unique name, also the key of the value in the parameter store.
    pub name: String,
    pub shape: Shape,
    pub init: Initializer,
    /// L2 strength `λ`, adds `λ·Σw²` to the loss. Zero disables it.
    pub l2: f32,
}

impl Parameter {
    pub fn new(tensor: Tensor, name: String, shape: Shape, init: Initializer, l2: f32) -> Self {
        Self {
            tensor,
            name,
            shape,
            init,
            l2,
        }
    }
}

/// Trait defining the common interface for all layers/modules.
///
/// In the graph-based architecture, `Module` is any component that can
/// add a specific pattern of operations and parameters to the graph.
pub trait Module {
    /// Performs a "symbolic" forward pass, building the corresponding part of the graph.
    fn forward(&self, inputs: &Tensor) -> Tensor;

    /// Trainable parameters that belong to this module.
    fn parameters(&self) -> Vec<Parameter>;
}
