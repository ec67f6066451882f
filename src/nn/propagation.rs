//! Adaptive propagation layer of DAGNN, and the index gather readout.
//!
//! Given the encoder output `H_0` (`n x d`) and a normalized adjacency
//! operator `A` (`n x n`), the layer builds
//!
//! ```text
//! H_t     = A · H_{t-1}                      t = 1..K
//! S       = stack([H_0, .., H_K], axis 1)    n x (K+1) x d
//! G       = sigmoid(S · w (+ b))             n x (K+1) x 1
//! H_final = Σ_t G[:, t] * S[:, t]            n x d
//! ```
//!
//! `w` (`d x 1`) is shared across nodes and steps. The gate weights are not
//! normalized to sum to one.

use crate::error::{DagnnError, Result};
use crate::nn::init::Initializer;
use crate::nn::module::Parameter;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Intermediate tensors of one propagation, exposed for inspection.
#[derive(Debug, Clone)]
pub struct Propagation {
    /// `n x d` weighted combination.
    pub output: Tensor,
    /// `n x (K+1) x d` stacked representations.
    pub stacked: Tensor,
    /// `n x (K+1) x 1` retention gates.
    pub gates: Tensor,
}

/// K-step propagation with a learned per-node, per-step retention gate.
pub struct DagnnConv {
    pub kernel: Tensor,
    pub bias: Option<Tensor>,
    name: String,
    k: usize,
    units: usize,
    l2: f32,
}

impl DagnnConv {
    /// `units` is the representation width `d`; `k` must be at least 1.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        k: usize,
        units: usize,
        use_bias: bool,
        l2: f32,
    ) -> Result<Self> {
        if k == 0 {
            return Err(DagnnError::Configuration(
                "propagation steps K must be a positive integer, got 0".to_string(),
            ));
        }
        let kernel = Tensor::new_parameter(context, &format!("{}.kernel", name));
        let bias = use_bias.then(|| Tensor::new_parameter(context, &format!("{}.bias", name)));
        Ok(Self {
            kernel,
            bias,
            name: name.to_string(),
            k,
            units,
            l2,
        })
    }

    pub fn steps(&self) -> usize {
        self.k
    }

    /// Builds the propagation of `h` over `adj` and returns its intermediates.
    pub fn propagate(&self, h: &Tensor, adj: &Tensor) -> Propagation {
        let mut representations = Vec::with_capacity(self.k + 1);
        let mut current = h.clone();
        representations.push(current.clone());
        for _ in 0..self.k {
            current = current.propagate(adj);
            representations.push(current.clone());
        }

        let stacked = Tensor::stack(&representations, 1);
        let scores = stacked.dot(&self.kernel);
        let scores = match &self.bias {
            Some(bias) => &scores + bias,
            None => scores,
        };
        let gates = scores.sigmoid();
        let output = (&gates * &stacked).sum_axis(1);

        Propagation {
            output,
            stacked,
            gates,
        }
    }

    pub fn forward(&self, h: &Tensor, adj: &Tensor) -> Tensor {
        self.propagate(h, adj).output
    }

    pub fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![Parameter::new(
            self.kernel.clone(),
            format!("{}.kernel", self.name),
            vec![self.units, 1],
            Initializer::GlorotUniform,
            self.l2,
        )];
        if let Some(bias) = &self.bias {
            params.push(Parameter::new(
                bias.clone(),
                format!("{}.bias", self.name),
                vec![1],
                Initializer::Zeros,
                0.0,
            ));
        }
        params
    }
}

/// Selects the rows of a node-indexed tensor, in index order.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gather;

impl Gather {
    pub fn forward(&self, h: &Tensor, index: &Tensor) -> Tensor {
        h.gather(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;

    #[test]
    fn zero_steps_is_a_configuration_error() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        assert!(matches!(
            DagnnConv::new(&ctx, "prop", 0, 4, false, 0.0),
            Err(DagnnError::Configuration(_))
        ));
    }

    #[test]
    fn builds_k_sparse_products_and_one_stack() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let h = Tensor::new_input(&ctx, "h");
        let adj = Tensor::new_input(&ctx, "adj");
        let conv = DagnnConv::new(&ctx, "prop", 3, 4, true, 0.0).unwrap();
        let prop = conv.propagate(&h, &adj);

        let ctx = ctx.borrow();
        let graph = ctx.main_graph();
        let spmm = graph
            .nodes
            .values()
            .filter(|n| matches!(n.node_type, NodeType::SparseMatMul { .. }))
            .count();
        assert_eq!(spmm, 3);
        match &graph.get_node(prop.stacked.node_id).unwrap().node_type {
            NodeType::Stack { inputs, axis } => {
                assert_eq!(inputs.len(), 4);
                assert_eq!(inputs[0], h.node_id);
                assert_eq!(*axis, 1);
            }
            other => panic!("unexpected node {:?}", other),
        }
        assert_eq!(conv.parameters().len(), 2);
    }
}
