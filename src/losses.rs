// --- File: src/losses.rs ---

//! Loss functions in graph paradigm.
//!
//! Loss functions here are regular Rust functions that take symbolic
//! `Tensor` descriptors and add the nodes computing the error value.

use crate::nn::Parameter;
use crate::tensor::Tensor;

/// Mean sparse softmax cross-entropy of raw (unnormalized) logits.
///
/// `logits` is `batch x classes`, `labels` an index input holding one class
/// id per row. An empty batch has zero loss.
pub fn sparse_cross_entropy_from_logits(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits.softmax_cross_entropy(labels)
}

/// `Σ λ·‖W‖²` over the parameters with a non-zero L2 strength.
///
/// Returns `None` when no parameter is regularized.
pub fn l2_penalty(params: &[Parameter]) -> Option<Tensor> {
    params
        .iter()
        .filter(|p| p.l2 > 0.0)
        .map(|p| {
            let w = &p.tensor;
            let strength = Tensor::scalar(&w.context, p.l2);
            &strength * &(w * w).sum()
        })
        .reduce(|acc, term| &acc + &term)
}

/// Classification loss plus weight decay, the objective DAGNN is trained on.
pub fn regularized_loss(logits: &Tensor, labels: &Tensor, params: &[Parameter]) -> Tensor {
    let data_loss = sparse_cross_entropy_from_logits(logits, labels);
    match l2_penalty(params) {
        Some(penalty) => &data_loss + &penalty,
        None => data_loss,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;
    use crate::nn::{Dense, Module};
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn unregularized_parameters_add_no_penalty() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let dense = Dense::new(&ctx, "d", 3, 2, true, 0.0);
        assert!(l2_penalty(&dense.parameters()).is_none());
    }

    #[test]
    fn penalty_is_added_to_the_data_loss() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let labels = Tensor::new_input(&ctx, "labels");
        let dense = Dense::new(&ctx, "d", 3, 2, false, 5e-3);
        let loss = regularized_loss(&dense.forward(&x), &labels, &dense.parameters());
        let ctx = ctx.borrow();
        match &ctx.main_graph().get_node(loss.node_id).unwrap().node_type {
            NodeType::Add(data, _) => assert!(matches!(
                ctx.main_graph().get_node(*data).unwrap().node_type,
                NodeType::SoftmaxCrossEntropy { .. }
            )),
            other => panic!("unexpected node {:?}", other),
        }
    }
}
