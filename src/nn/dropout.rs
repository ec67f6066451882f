//! Dropout layer for regularization.

use crate::error::{DagnnError, Result};
use crate::nn::module::{Module, Parameter};
use crate::tensor::Tensor;

/// Inverted dropout.
///
/// Adds a `DropoutMask` node: in training mode every element is zeroed with
/// probability `rate` and the survivors are scaled by `1 / (1 - rate)`; in
/// inference mode the mask is all ones. A fresh mask is drawn on every run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    rate: f32,
}

impl Dropout {
    /// Fails with a configuration error unless `rate` is in `[0, 1)`.
    pub fn new(rate: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&rate) {
            return Err(DagnnError::Configuration(format!(
                "dropout rate must be in [0, 1), got {}",
                rate
            )));
        }
        Ok(Self { rate })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }
}

impl Module for Dropout {
    fn forward(&self, x: &Tensor) -> Tensor {
        if self.rate == 0.0 {
            x.clone()
        } else {
            x.dropout(self.rate)
        }
    }

    fn parameters(&self) -> Vec<Parameter> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn rejects_rates_outside_unit_interval() {
        assert!(Dropout::new(0.5).is_ok());
        assert!(Dropout::new(0.0).is_ok());
        assert!(matches!(Dropout::new(1.0), Err(DagnnError::Configuration(_))));
        assert!(matches!(Dropout::new(-0.1), Err(DagnnError::Configuration(_))));
    }

    #[test]
    fn zero_rate_adds_no_nodes() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = Dropout::new(0.0).unwrap().forward(&x);
        assert_eq!(y.node_id, x.node_id);
        assert_eq!(ctx.borrow().main_graph().nodes.len(), 1);
    }
}
