//! `Tensor` and `GraphContext`.
//!
//! A `Tensor` is not a data container. It is a lightweight handle to a node
//! in the abstract semantic graph (ASG): every operation on it appends a node
//! to the graph owned by its `GraphContext` instead of computing anything.

use crate::asg::{Asg, NodeId, NodeType, Shape, Value};
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Mul, Sub};
use std::rc::Rc;

/// Owns the graph being built. Shared by every `Tensor` handle through
/// `Rc<RefCell<_>>`.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
}

impl GraphContext {
    pub fn new() -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
        }
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the graph held by `context`.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    /// Creates an `Input` node: a slot fed with real data at execution time.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let node_id = {
            let mut ctx = context.borrow_mut();
            let graph = ctx.main_graph_mut();
            let id = graph.add_node(
                Some(name.to_string()),
                NodeType::Input {
                    name: name.to_string(),
                },
            );
            graph.inputs.push(id);
            id
        };
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Creates a trainable `Parameter` node.
    pub fn new_parameter(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        Self::push(
            context,
            Some(name.to_string()),
            NodeType::Parameter {
                name: name.to_string(),
            },
        )
    }

    /// Embeds constant data directly into the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        Self::push(
            context,
            Some(name.to_string()),
            NodeType::Literal(Value::Tensor(data)),
        )
    }

    /// Embeds any constant value (a sparse operator, an index vector...).
    pub fn new_constant(context: &Rc<RefCell<GraphContext>>, value: Value, name: &str) -> Self {
        Self::push(context, Some(name.to_string()), NodeType::Literal(value))
    }

    /// Rank-0 literal.
    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        Self::push(
            context,
            None,
            NodeType::Literal(Value::Tensor(ndarray::arr0(value).into_dyn())),
        )
    }

    fn push(context: &Rc<RefCell<GraphContext>>, name: Option<String>, node_type: NodeType) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(name, node_type);
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    fn op(&self, node_type: NodeType) -> Self {
        Self::push(&self.context, None, node_type)
    }

    // --- Math ---

    pub fn dot(&self, other: &Tensor) -> Self {
        self.op(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    /// `adj · self`, where `adj` evaluates to a sparse operator.
    pub fn propagate(&self, adj: &Tensor) -> Self {
        self.op(NodeType::SparseMatMul {
            adj: adj.node_id,
            rhs: self.node_id,
            transpose: false,
        })
    }

    pub fn neg(&self) -> Self {
        self.op(NodeType::Negate(self.node_id))
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.op(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.op(NodeType::Sigmoid(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.op(NodeType::Tanh(self.node_id))
    }

    pub fn elu(&self, alpha: f32) -> Self {
        self.op(NodeType::Elu(self.node_id, alpha))
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.op(NodeType::Sum(self.node_id))
    }

    pub fn sum_axis(&self, axis: usize) -> Self {
        self.op(NodeType::SumAxis(self.node_id, axis))
    }

    // --- Layout ---

    pub fn reshape(&self, shape: Shape) -> Self {
        self.op(NodeType::Reshape(self.node_id, shape))
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.op(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// Stacks `tensors` along a new `axis`. All must share one graph and one shape.
    pub fn stack(tensors: &[Tensor], axis: usize) -> Self {
        let first = &tensors[0];
        first.op(NodeType::Stack {
            inputs: tensors.iter().map(|t| t.node_id).collect(),
            axis,
        })
    }

    pub fn select(&self, axis: usize, index: usize) -> Self {
        self.op(NodeType::Select {
            input: self.node_id,
            axis,
            index,
        })
    }

    // --- Indexing / stochastic ---

    /// Rows of `self` selected by `index` (an input fed with `Value::Indices`).
    pub fn gather(&self, index: &Tensor) -> Self {
        self.op(NodeType::Gather {
            input: self.node_id,
            index: index.node_id,
        })
    }

    /// Inverted dropout with drop probability `rate`.
    pub fn dropout(&self, rate: f32) -> Self {
        let mask = self.op(NodeType::DropoutMask {
            like: self.node_id,
            rate,
        });
        self * &mask
    }

    /// Mean softmax cross-entropy between raw logits `self` and class ids `labels`.
    pub fn softmax_cross_entropy(&self, labels: &Tensor) -> Self {
        self.op(NodeType::SoftmaxCrossEntropy {
            logits: self.node_id,
            labels: labels.node_id,
        })
    }
}

impl Add<&Tensor> for &Tensor {
    type Output = Tensor;
    fn add(self, rhs: &Tensor) -> Self::Output {
        self.op(NodeType::Add(self.node_id, rhs.node_id))
    }
}

impl Sub<&Tensor> for &Tensor {
    type Output = Tensor;
    fn sub(self, rhs: &Tensor) -> Self::Output {
        self.op(NodeType::Subtract(self.node_id, rhs.node_id))
    }
}

impl Mul<&Tensor> for &Tensor {
    type Output = Tensor;
    fn mul(self, rhs: &Tensor) -> Self::Output {
        self.op(NodeType::Multiply(self.node_id, rhs.node_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ops_append_nodes_in_order() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let w = Tensor::new_parameter(&ctx, "w");
        let y = x.dot(&w).relu();
        let graph = ctx.borrow();
        let graph = graph.main_graph();
        assert_eq!(graph.inputs, vec![x.node_id]);
        assert_eq!(graph.nodes.len(), 4);
        assert!(matches!(
            graph.get_node(y.node_id).unwrap().node_type,
            NodeType::ReLU(_)
        ));
    }

    #[test]
    fn dropout_multiplies_by_mask() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = x.dropout(0.5);
        let graph = ctx.borrow();
        match &graph.main_graph().get_node(y.node_id).unwrap().node_type {
            NodeType::Multiply(a, m) => {
                assert_eq!(*a, x.node_id);
                assert!(matches!(
                    graph.main_graph().get_node(*m).unwrap().node_type,
                    NodeType::DropoutMask { .. }
                ));
            }
            other => panic!("unexpected node {:?}", other),
        }
    }
}
