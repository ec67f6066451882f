//! Module for shape and data type inference (Shape Inference).
//!
//! Traverses the computation graph and determines the shape and data type of
//! every node from its operands' shapes and its operation type. Running this
//! pass before execution is what lets dimension mismatches surface before any
//! arithmetic is attempted.

use crate::asg::{Asg, AsgError, DType, Node, NodeId, NodeType, Shape};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': left operand {shape1:?}, right operand {shape2:?}.")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}.")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. \
             Add the shape to the initial_shapes map when calling ShapeInference::run().")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D.")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Node {node_id}: axis {axis} out of range for shape {shape:?}.")]
    AxisOutOfRange {
        node_id: NodeId,
        axis: usize,
        shape: Shape,
    },

    #[error("Node {node_id}: sparse operator must be square, got {rows}x{cols}.")]
    NonSquareOperator {
        node_id: NodeId,
        rows: usize,
        cols: usize,
    },

    #[error("Node {node_id}: expected dtype {expected:?}, got {actual:?}.")]
    DTypeMismatch {
        node_id: NodeId,
        expected: DType,
        actual: DType,
    },

    #[error("Broadcast error: cannot broadcast shapes {0:?} and {1:?} to a common shape.")]
    BroadcastError(Shape, Shape),

    #[error("Cycle detected at node {0}.")]
    CyclicGraph(NodeId),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Performs shape inference for an ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Fills in `shape` and `dtype` of every node reachable from the outputs.
    ///
    /// `initial_shapes` provides shapes and types for all `Input`,
    /// `Parameter` and `External` nodes, keyed by node name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, (Shape, DType)>) -> Result<()> {
        let sorted_nodes = Self::topological_sort(asg)?;

        for node_id in sorted_nodes {
            let (shape, dtype) = {
                let node = asg.get_node(node_id)?;
                Self::infer_node_shape(asg, node, initial_shapes)?
            };
            let node = asg.get_node_mut(node_id)?;
            node.shape = Some(shape);
            node.dtype = Some(dtype);
        }

        Ok(())
    }

    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, (Shape, DType)>,
    ) -> Result<(Shape, DType)> {
        match &node.node_type {
            NodeType::Input { name }
            | NodeType::Parameter { name }
            | NodeType::External { name, .. } => initial_shapes
                .get(name)
                .cloned()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::Literal(value) => Ok((value.shape(), value.dtype())),

            NodeType::Add(l, r) | NodeType::Subtract(l, r) | NodeType::Multiply(l, r) => {
                let (ls, ld) = Self::get_f32(asg, node.id, *l)?;
                let (rs, _) = Self::get_f32(asg, node.id, *r)?;
                Ok((broadcast_shapes(&ls, &rs)?, ld))
            }

            NodeType::GreaterThan(l, r) => {
                let (ls, _) = Self::get_f32(asg, node.id, *l)?;
                let (rs, _) = Self::get_f32(asg, node.id, *r)?;
                Ok((broadcast_shapes(&ls, &rs)?, DType::F32))
            }

            NodeType::MatrixMultiply(l, r) => {
                let (ls, ld) = Self::get_f32(asg, node.id, *l)?;
                let (rs, _) = Self::get_f32(asg, node.id, *r)?;

                if !(2..=3).contains(&ls.len()) {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: ls.len(),
                    });
                }
                if rs.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: rs.len(),
                    });
                }
                if ls[ls.len() - 1] != rs[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls,
                        shape2: rs,
                    });
                }

                let mut out_shape = ls[..ls.len() - 1].to_vec();
                out_shape.push(rs[1]);
                Ok((out_shape, ld))
            }

            NodeType::SparseMatMul { adj, rhs, .. } => {
                let (adj_shape, _) = Self::get_f32(asg, node.id, *adj)?;
                let (rs, rd) = Self::get_f32(asg, node.id, *rhs)?;

                if adj_shape.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: adj_shape.len(),
                    });
                }
                if adj_shape[0] != adj_shape[1] {
                    return Err(ShapeInferenceError::NonSquareOperator {
                        node_id: node.id,
                        rows: adj_shape[0],
                        cols: adj_shape[1],
                    });
                }
                if rs.len() != 2 || rs[0] != adj_shape[1] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "SparseMatMul".to_string(),
                        shape1: adj_shape,
                        shape2: rs,
                    });
                }
                Ok((rs, rd))
            }

            // Element-wise, shape unchanged
            NodeType::Negate(id)
            | NodeType::ReLU(id)
            | NodeType::Sigmoid(id)
            | NodeType::Tanh(id)
            | NodeType::Elu(id, _)
            | NodeType::EluDerivative(id, _) => Self::get_f32(asg, node.id, *id),

            NodeType::DropoutMask { like, .. } => Self::get_f32(asg, node.id, *like),

            NodeType::Sum(id) => {
                Self::get_f32(asg, node.id, *id)?;
                Ok((vec![], DType::F32))
            }

            NodeType::SumAxis(id, axis) => {
                let (mut shape, dtype) = Self::get_f32(asg, node.id, *id)?;
                Self::check_axis(node.id, *axis, &shape, shape.len())?;
                shape.remove(*axis);
                Ok((shape, dtype))
            }

            NodeType::Repeat { input, axis, times } => {
                let (mut shape, dtype) = Self::get_f32(asg, node.id, *input)?;
                Self::check_axis(node.id, *axis, &shape, shape.len() + 1)?;
                shape.insert(*axis, *times);
                Ok((shape, dtype))
            }

            NodeType::Reshape(id, new_shape) => {
                let (shape, dtype) = Self::get_f32(asg, node.id, *id)?;
                if shape.iter().product::<usize>() != new_shape.iter().product::<usize>() {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "Reshape".to_string(),
                        shape1: shape,
                        shape2: new_shape.clone(),
                    });
                }
                Ok((new_shape.clone(), dtype))
            }

            NodeType::Transpose(id, axis1, axis2) => {
                let (mut shape, dtype) = Self::get_f32(asg, node.id, *id)?;
                let axis = *axis1.max(axis2);
                Self::check_axis(node.id, axis, &shape, shape.len())?;
                shape.swap(*axis1, *axis2);
                Ok((shape, dtype))
            }

            NodeType::Broadcast(id, target) => {
                let (shape, dtype) = Self::get_f32(asg, node.id, *id)?;
                if broadcast_shapes(&shape, target)? != *target {
                    return Err(ShapeInferenceError::BroadcastError(shape, target.clone()));
                }
                Ok((target.clone(), dtype))
            }

            NodeType::ReduceSumTo(id, target) => {
                let (shape, dtype) = Self::get_f32(asg, node.id, *id)?;
                if broadcast_shapes(target, &shape)? != shape {
                    return Err(ShapeInferenceError::BroadcastError(target.clone(), shape));
                }
                Ok((target.clone(), dtype))
            }

            NodeType::Stack { inputs, axis } => {
                let first = inputs.first().ok_or(ShapeInferenceError::MissingShapeInfo(node.id))?;
                let (mut shape, dtype) = Self::get_f32(asg, node.id, *first)?;
                for id in &inputs[1..] {
                    let (other, _) = Self::get_f32(asg, node.id, *id)?;
                    if other != shape {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Stack".to_string(),
                            shape1: shape,
                            shape2: other,
                        });
                    }
                }
                Self::check_axis(node.id, *axis, &shape, shape.len() + 1)?;
                shape.insert(*axis, inputs.len());
                Ok((shape, dtype))
            }

            NodeType::Select { input, axis, index } => {
                let (mut shape, dtype) = Self::get_f32(asg, node.id, *input)?;
                Self::check_axis(node.id, *axis, &shape, shape.len())?;
                if *index >= shape[*axis] {
                    return Err(ShapeInferenceError::AxisOutOfRange {
                        node_id: node.id,
                        axis: *index,
                        shape,
                    });
                }
                shape.remove(*axis);
                Ok((shape, dtype))
            }

            NodeType::Gather { input, index } => {
                let (mut shape, dtype) = Self::get_f32(asg, node.id, *input)?;
                let (index_shape, _) = Self::get_index(asg, node.id, *index)?;
                if shape.is_empty() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: 0,
                    });
                }
                shape[0] = index_shape[0];
                Ok((shape, dtype))
            }

            NodeType::ScatterAdd { input, index, rows } => {
                let (mut shape, dtype) = Self::get_f32(asg, node.id, *input)?;
                let (index_shape, _) = Self::get_index(asg, node.id, *index)?;
                if shape.is_empty() || shape[0] != index_shape[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "ScatterAdd".to_string(),
                        shape1: shape,
                        shape2: index_shape,
                    });
                }
                shape[0] = *rows;
                Ok((shape, dtype))
            }

            NodeType::SoftmaxCrossEntropy { logits, labels }
            | NodeType::SoftmaxCrossEntropyGrad { logits, labels } => {
                let (ls, ld) = Self::get_f32(asg, node.id, *logits)?;
                let (lab, _) = Self::get_index(asg, node.id, *labels)?;
                if ls.len() != 2 {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: node.id,
                        expected: 2,
                        actual: ls.len(),
                    });
                }
                if ls[0] != lab[0] {
                    return Err(ShapeInferenceError::IncompatibleShapes {
                        op: "SoftmaxCrossEntropy".to_string(),
                        shape1: ls,
                        shape2: lab,
                    });
                }
                match node.node_type {
                    NodeType::SoftmaxCrossEntropy { .. } => Ok((vec![], ld)),
                    _ => Ok((ls, ld)),
                }
            }
        }
    }

    fn check_axis(node_id: NodeId, axis: usize, shape: &Shape, rank: usize) -> Result<()> {
        if axis >= rank {
            return Err(ShapeInferenceError::AxisOutOfRange {
                node_id,
                axis,
                shape: shape.clone(),
            });
        }
        Ok(())
    }

    /// Already inferred shape/dtype of `operand`, required to be floating point.
    fn get_f32(asg: &Asg, node_id: NodeId, operand: NodeId) -> Result<(Shape, DType)> {
        let (shape, dtype) = Self::get_shape_dtype(asg, operand)?;
        if dtype != DType::F32 {
            return Err(ShapeInferenceError::DTypeMismatch {
                node_id,
                expected: DType::F32,
                actual: dtype,
            });
        }
        Ok((shape, dtype))
    }

    /// Already inferred shape/dtype of `operand`, required to be a 1-D index vector.
    fn get_index(asg: &Asg, node_id: NodeId, operand: NodeId) -> Result<(Shape, DType)> {
        let (shape, dtype) = Self::get_shape_dtype(asg, operand)?;
        if dtype != DType::Index {
            return Err(ShapeInferenceError::DTypeMismatch {
                node_id,
                expected: DType::Index,
                actual: dtype,
            });
        }
        if shape.len() != 1 {
            return Err(ShapeInferenceError::InvalidRank {
                node_id,
                expected: 1,
                actual: shape.len(),
            });
        }
        Ok((shape, dtype))
    }

    fn get_shape_dtype(asg: &Asg, node_id: NodeId) -> Result<(Shape, DType)> {
        let node = asg.get_node(node_id)?;
        match (&node.shape, &node.dtype) {
            (Some(s), Some(d)) => Ok((s.clone(), *d)),
            _ => Err(ShapeInferenceError::MissingShapeInfo(node_id)),
        }
    }

    /// Topological order of every node reachable from the graph outputs
    /// (of every node when no output is set).
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        if asg.outputs.is_empty() {
            let mut ids: Vec<NodeId> = asg.nodes.keys().copied().collect();
            ids.sort_unstable();
            Self::topological_sort_from(asg, &ids)
        } else {
            Self::topological_sort_from(asg, &asg.outputs)
        }
    }

    /// Topological order of every node reachable from `roots`.
    pub fn topological_sort_from(asg: &Asg, roots: &[NodeId]) -> Result<Vec<NodeId>> {
        let mut sorted = Vec::new();
        let mut visited = HashSet::new();
        let mut in_progress = HashSet::new();
        for &root in roots {
            Self::visit(root, asg, &mut visited, &mut in_progress, &mut sorted)?;
        }
        Ok(sorted)
    }

    fn visit(
        node_id: NodeId,
        asg: &Asg,
        visited: &mut HashSet<NodeId>,
        in_progress: &mut HashSet<NodeId>,
        sorted: &mut Vec<NodeId>,
    ) -> Result<()> {
        if visited.contains(&node_id) {
            return Ok(());
        }
        if !in_progress.insert(node_id) {
            return Err(ShapeInferenceError::CyclicGraph(node_id));
        }

        for operand in asg.get_node(node_id)?.node_type.operands() {
            Self::visit(operand, asg, visited, in_progress, sorted)?;
        }

        in_progress.remove(&node_id);
        visited.insert(node_id);
        sorted.push(node_id);
        Ok(())
    }
}

/// Numpy-style broadcast of two shapes.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Result<Shape> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
        let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(ShapeInferenceError::BroadcastError(a.to_vec(), b.to_vec())),
        };
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{GraphContext, Tensor};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn shapes(entries: &[(&str, Shape, DType)]) -> HashMap<String, (Shape, DType)> {
        entries
            .iter()
            .map(|(n, s, d)| (n.to_string(), (s.clone(), *d)))
            .collect()
    }

    #[test]
    fn broadcast_rules() {
        assert_eq!(broadcast_shapes(&[4, 3, 1], &[4, 3, 5]).unwrap(), vec![4, 3, 5]);
        assert_eq!(broadcast_shapes(&[], &[2, 2]).unwrap(), vec![2, 2]);
        assert_eq!(broadcast_shapes(&[1], &[7, 3]).unwrap(), vec![7, 3]);
        assert!(broadcast_shapes(&[2, 3], &[3, 2]).is_err());
    }

    #[test]
    fn stack_then_batched_matmul() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let h = Tensor::new_input(&ctx, "h");
        let w = Tensor::new_parameter(&ctx, "w");
        let stacked = Tensor::stack(&[h.clone(), h.clone(), h], 1);
        let score = stacked.dot(&w);
        let out = score.sum_axis(1);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let init = shapes(&[
            ("h", vec![5, 4], DType::F32),
            ("w", vec![4, 1], DType::F32),
        ]);
        ShapeInference::run(&mut graph, &init).unwrap();

        assert_eq!(graph.get_node(stacked.node_id).unwrap().shape, Some(vec![5, 3, 4]));
        assert_eq!(graph.get_node(score.node_id).unwrap().shape, Some(vec![5, 3, 1]));
        assert_eq!(graph.get_node(out.node_id).unwrap().shape, Some(vec![5, 1]));
    }

    #[test]
    fn sparse_matmul_rejects_row_mismatch() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let h = Tensor::new_input(&ctx, "h");
        let adj = Tensor::new_input(&ctx, "adj");
        let out = h.propagate(&adj);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let init = shapes(&[
            ("h", vec![4, 2], DType::F32),
            ("adj", vec![5, 5], DType::F32),
        ]);
        let err = ShapeInference::run(&mut graph, &init).unwrap_err();
        assert!(matches!(err, ShapeInferenceError::IncompatibleShapes { .. }));
    }

    #[test]
    fn gather_requires_index_dtype() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let h = Tensor::new_input(&ctx, "h");
        let idx = Tensor::new_input(&ctx, "idx");
        let out = h.gather(&idx);

        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(out.node_id);
        let bad = shapes(&[
            ("h", vec![6, 3], DType::F32),
            ("idx", vec![2], DType::F32),
        ]);
        assert!(matches!(
            ShapeInference::run(&mut graph, &bad),
            Err(ShapeInferenceError::DTypeMismatch { .. })
        ));

        let good = shapes(&[
            ("h", vec![6, 3], DType::F32),
            ("idx", vec![2], DType::Index),
        ]);
        ShapeInference::run(&mut graph, &good).unwrap();
        assert_eq!(graph.get_node(out.node_id).unwrap().shape, Some(vec![2, 3]));
    }

    #[test]
    fn topological_sort_visits_operands_first() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let a = Tensor::new_input(&ctx, "a");
        let b = a.relu();
        let c = &b + &a;
        let mut graph = ctx.borrow().main_graph().clone();
        graph.set_output(c.node_id);
        let order = ShapeInference::topological_sort(&graph).unwrap();
        assert_eq!(order, vec![a.node_id, b.node_id, c.node_id]);
    }
}
