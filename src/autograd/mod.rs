//! Autograd: builds the gradient graph d(loss)/d(parameter).
//!
//! Algorithm:
//!  - mark every forward node that depends on a requested parameter;
//!  - walk the forward graph in reverse topological order, and for each marked
//!    node holding dL/dY emit the contributions to its operands into a separate
//!    `grad` ASG, summing contributions that reach the same operand;
//!  - forward values needed by a rule (the other operand of a product, the
//!    output of a sigmoid...) are read through `External` nodes, so the grad
//!    graph must be executed with the forward graph's memo.
//!
//! The forward graph must have gone through shape inference: broadcast
//! reductions and scatter sizes are taken from the forward shapes.

use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::asg::{Asg, AsgError, NodeId, NodeType, Shape, Value};
use ndarray::{ArrayD, IxDyn};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Id given to every gradient graph.
pub const GRAD_ASG_ID: usize = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("Shape: {0}")]
    Shape(#[from] ShapeInferenceError),
    #[error("node {0} has no inferred shape; run shape inference on the forward graph first")]
    MissingShape(NodeId),
    #[error("no gradient rule for {0}")]
    Unsupported(String),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Reverse-mode gradient graph builder.
///
/// ```ignore
/// let grad_graph = Gradients::new(&forward_graph).build(loss.node_id, &param_ids)?;
/// // grad_graph.outputs[i] is dL/d(param_ids[i])
/// ```
pub struct Gradients<'a> {
    /// Forward graph.
    src: &'a Asg,
    /// Gradient graph under construction.
    grad: Asg,
    /// Forward node -> accumulated gradient node in `grad`.
    gmap: HashMap<NodeId, NodeId>,
    /// Forward node -> `External` image in `grad`.
    images: HashMap<NodeId, NodeId>,
    /// Forward nodes on a path from a parameter.
    requires_grad: HashSet<NodeId>,
}

impl<'a> Gradients<'a> {
    pub fn new(src: &'a Asg) -> Self {
        Self {
            src,
            grad: Asg::new(GRAD_ASG_ID, Some("grad".to_string())),
            gmap: HashMap::new(),
            images: HashMap::new(),
            requires_grad: HashSet::new(),
        }
    }

    /// Builds the gradient graph of `loss_id` with respect to `param_ids`.
    ///
    /// The returned graph has one output per parameter, in the same order.
    /// A parameter the loss does not depend on gets a zero gradient.
    pub fn build(mut self, loss_id: NodeId, param_ids: &[NodeId]) -> AutogradResult<Asg> {
        let order = ShapeInference::topological_sort_from(self.src, &[loss_id])?;
        self.mark_requires_grad(&order, param_ids)?;

        if self.requires_grad.contains(&loss_id) {
            let seed = self.lit_scalar(1.0);
            self.gmap.insert(loss_id, seed);

            for &id in order.iter().rev() {
                if !self.requires_grad.contains(&id) {
                    continue;
                }
                if let Some(g_out) = self.gmap.get(&id).copied() {
                    self.backward_node(id, g_out)?;
                }
            }
        }

        let mut outputs = Vec::with_capacity(param_ids.len());
        for &param in param_ids {
            let g = match self.gmap.get(&param).copied() {
                Some(g) => g,
                None => {
                    let shape = self.shape_of(param)?;
                    self.grad.add_node(
                        None,
                        NodeType::Literal(Value::Tensor(ArrayD::zeros(IxDyn(&shape)))),
                    )
                }
            };
            if let NodeType::Parameter { name } = &self.src.get_node(param)?.node_type {
                self.grad.get_node_mut(g)?.name = Some(format!("grad.{}", name));
            }
            outputs.push(g);
        }
        self.grad.set_outputs(outputs);

        log::trace!(
            "gradient graph built: {} forward nodes -> {} gradient nodes",
            self.src.nodes.len(),
            self.grad.nodes.len()
        );
        Ok(self.grad)
    }

    fn mark_requires_grad(&mut self, order: &[NodeId], param_ids: &[NodeId]) -> AutogradResult<()> {
        let params: HashSet<NodeId> = param_ids.iter().copied().collect();
        for &id in order {
            let node = self.src.get_node(id)?;
            let marked = match &node.node_type {
                NodeType::Parameter { .. } => params.contains(&id),
                // Piecewise-constant or non-differentiable outputs stop the flow.
                NodeType::GreaterThan(_, _) | NodeType::DropoutMask { .. } => false,
                other => other
                    .operands()
                    .iter()
                    .any(|op| self.requires_grad.contains(op)),
            };
            if marked {
                self.requires_grad.insert(id);
            }
        }
        Ok(())
    }

    /// Emits dL/d(operand) contributions for one forward node.
    fn backward_node(&mut self, id: NodeId, g_out: NodeId) -> AutogradResult<()> {
        let node_type = self.src.get_node(id)?.node_type.clone();
        match node_type {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => {}

            // -------- binary --------
            NodeType::Add(a, b) => {
                let ra = self.reduce_to(g_out, id, a)?;
                self.acc(a, ra);
                let rb = self.reduce_to(g_out, id, b)?;
                self.acc(b, rb);
            }
            NodeType::Subtract(a, b) => {
                let ra = self.reduce_to(g_out, id, a)?;
                self.acc(a, ra);
                if self.requires_grad.contains(&b) {
                    let neg = self.add_node(NodeType::Negate(g_out));
                    let rb = self.reduce_to(neg, id, b)?;
                    self.acc(b, rb);
                }
            }
            NodeType::Multiply(a, b) => {
                if self.requires_grad.contains(&a) {
                    let b_im = self.image(b)?;
                    let g_a = self.add_node(NodeType::Multiply(g_out, b_im));
                    let ra = self.reduce_to(g_a, id, a)?;
                    self.acc(a, ra);
                }
                if self.requires_grad.contains(&b) {
                    let a_im = self.image(a)?;
                    let g_b = self.add_node(NodeType::Multiply(g_out, a_im));
                    let rb = self.reduce_to(g_b, id, b)?;
                    self.acc(b, rb);
                }
            }
            NodeType::MatrixMultiply(a, b) => {
                // g_a = g_out @ b^T
                if self.requires_grad.contains(&a) {
                    let b_im = self.image(b)?;
                    let bt = self.add_node(NodeType::Transpose(b_im, 0, 1));
                    let g_a = self.add_node(NodeType::MatrixMultiply(g_out, bt));
                    self.acc(a, g_a);
                }
                // g_b = a^T @ g_out, with the leading axes of a rank-3 `a` folded into rows
                if self.requires_grad.contains(&b) {
                    let a_shape = self.shape_of(a)?;
                    let out_shape = self.shape_of(id)?;
                    let a_im = self.image(a)?;
                    let (a2, g2) = if a_shape.len() == 3 {
                        let rows = a_shape[0] * a_shape[1];
                        let a2 = self.add_node(NodeType::Reshape(a_im, vec![rows, a_shape[2]]));
                        let g2 = self.add_node(NodeType::Reshape(g_out, vec![rows, out_shape[2]]));
                        (a2, g2)
                    } else {
                        (a_im, g_out)
                    };
                    let at = self.add_node(NodeType::Transpose(a2, 0, 1));
                    let g_b = self.add_node(NodeType::MatrixMultiply(at, g2));
                    self.acc(b, g_b);
                }
            }
            NodeType::SparseMatMul { adj, rhs, transpose } => {
                if self.requires_grad.contains(&adj) {
                    return Err(AutogradError::Unsupported(
                        "gradient with respect to a sparse operator".to_string(),
                    ));
                }
                let adj_im = self.image(adj)?;
                let g_rhs = self.add_node(NodeType::SparseMatMul {
                    adj: adj_im,
                    rhs: g_out,
                    transpose: !transpose,
                });
                self.acc(rhs, g_rhs);
            }

            // -------- unary --------
            NodeType::Negate(x) => {
                let g_x = self.add_node(NodeType::Negate(g_out));
                self.acc(x, g_x);
            }
            NodeType::ReLU(x) => {
                let zero = self.lit_scalar(0.0);
                let x_im = self.image(x)?;
                let mask = self.add_node(NodeType::GreaterThan(x_im, zero));
                let g_x = self.add_node(NodeType::Multiply(g_out, mask));
                self.acc(x, g_x);
            }
            NodeType::Sigmoid(x) => {
                // s * (1 - s), with s the forward output itself
                let s = self.image(id)?;
                let one = self.lit_scalar(1.0);
                let one_minus_s = self.add_node(NodeType::Subtract(one, s));
                let ds = self.add_node(NodeType::Multiply(s, one_minus_s));
                let g_x = self.add_node(NodeType::Multiply(g_out, ds));
                self.acc(x, g_x);
            }
            NodeType::Tanh(x) => {
                let t = self.image(id)?;
                let one = self.lit_scalar(1.0);
                let t2 = self.add_node(NodeType::Multiply(t, t));
                let dt = self.add_node(NodeType::Subtract(one, t2));
                let g_x = self.add_node(NodeType::Multiply(g_out, dt));
                self.acc(x, g_x);
            }
            NodeType::Elu(x, alpha) => {
                let x_im = self.image(x)?;
                let de = self.add_node(NodeType::EluDerivative(x_im, alpha));
                let g_x = self.add_node(NodeType::Multiply(g_out, de));
                self.acc(x, g_x);
            }

            // -------- reductions --------
            NodeType::Sum(x) => {
                let shape = self.shape_of(x)?;
                let g_x = self.add_node(NodeType::Broadcast(g_out, shape));
                self.acc(x, g_x);
            }
            NodeType::SumAxis(x, axis) => {
                let times = self.shape_of(x)?[axis];
                let g_x = self.add_node(NodeType::Repeat {
                    input: g_out,
                    axis,
                    times,
                });
                self.acc(x, g_x);
            }

            // -------- layout --------
            NodeType::Repeat { input, axis, .. } => {
                let g_x = self.add_node(NodeType::SumAxis(g_out, axis));
                self.acc(input, g_x);
            }
            NodeType::Reshape(x, _) => {
                let shape = self.shape_of(x)?;
                let g_x = self.add_node(NodeType::Reshape(g_out, shape));
                self.acc(x, g_x);
            }
            NodeType::Transpose(x, a1, a2) => {
                let g_x = self.add_node(NodeType::Transpose(g_out, a1, a2));
                self.acc(x, g_x);
            }
            NodeType::Broadcast(x, _) => {
                let shape = self.shape_of(x)?;
                let g_x = self.add_node(NodeType::ReduceSumTo(g_out, shape));
                self.acc(x, g_x);
            }
            NodeType::ReduceSumTo(x, _) => {
                let shape = self.shape_of(x)?;
                let g_x = self.add_node(NodeType::Broadcast(g_out, shape));
                self.acc(x, g_x);
            }
            NodeType::Stack { inputs, axis } => {
                for (index, input) in inputs.into_iter().enumerate() {
                    if !self.requires_grad.contains(&input) {
                        continue;
                    }
                    let g_x = self.add_node(NodeType::Select {
                        input: g_out,
                        axis,
                        index,
                    });
                    self.acc(input, g_x);
                }
            }

            // -------- indexing --------
            NodeType::Gather { input, index } => {
                let rows = self.shape_of(input)?[0];
                let index_im = self.image(index)?;
                let g_x = self.add_node(NodeType::ScatterAdd {
                    input: g_out,
                    index: index_im,
                    rows,
                });
                self.acc(input, g_x);
            }

            // -------- loss --------
            NodeType::SoftmaxCrossEntropy { logits, labels } => {
                let logits_im = self.image(logits)?;
                let labels_im = self.image(labels)?;
                let dl = self.add_node(NodeType::SoftmaxCrossEntropyGrad {
                    logits: logits_im,
                    labels: labels_im,
                });
                let g_x = self.add_node(NodeType::Multiply(dl, g_out));
                self.acc(logits, g_x);
            }

            NodeType::GreaterThan(_, _) | NodeType::DropoutMask { .. } => {}

            other @ (NodeType::EluDerivative(..)
            | NodeType::Select { .. }
            | NodeType::ScatterAdd { .. }
            | NodeType::SoftmaxCrossEntropyGrad { .. }) => {
                return Err(AutogradError::Unsupported(format!("{:?}", other)));
            }
        }
        Ok(())
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }

    fn lit_scalar(&mut self, v: f32) -> NodeId {
        self.grad.add_node(
            None,
            NodeType::Literal(Value::Tensor(ndarray::arr0(v).into_dyn())),
        )
    }

    /// `External` node in the grad graph reading the forward value of `src_id`.
    fn image(&mut self, src_id: NodeId) -> AutogradResult<NodeId> {
        if let Some(&existing) = self.images.get(&src_id) {
            return Ok(existing);
        }
        let src = self.src.get_node(src_id)?;
        let name = format!("external_{}_{}", self.src.id, src_id);
        let (shape, dtype) = (src.shape.clone(), src.dtype);
        let id = self.grad.add_node(
            Some(name.clone()),
            NodeType::External {
                name,
                source_asg_id: self.src.id,
                source_node_id: src_id,
            },
        );
        let node = self.grad.get_node_mut(id)?;
        node.shape = shape;
        node.dtype = dtype;
        self.images.insert(src_id, id);
        Ok(id)
    }

    /// dL/d(target) += contrib
    fn acc(&mut self, target: NodeId, contrib: NodeId) {
        if !self.requires_grad.contains(&target) {
            return;
        }
        let total = match self.gmap.get(&target).copied() {
            Some(prev) => self.add_node(NodeType::Add(prev, contrib)),
            None => contrib,
        };
        self.gmap.insert(target, total);
    }

    /// Sums `g` (shaped like forward node `out`) down to the shape of `operand`
    /// when `operand` was broadcast into `out`.
    fn reduce_to(&mut self, g: NodeId, out: NodeId, operand: NodeId) -> AutogradResult<NodeId> {
        let target = self.shape_of(operand)?;
        if self.shape_of(out)? == target {
            Ok(g)
        } else {
            Ok(self.add_node(NodeType::ReduceSumTo(g, target)))
        }
    }

    fn shape_of(&self, src_id: NodeId) -> AutogradResult<Shape> {
        self.src
            .get_node(src_id)?
            .shape
            .clone()
            .ok_or(AutogradError::MissingShape(src_id))
    }
}
