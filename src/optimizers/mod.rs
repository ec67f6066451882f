//! Optimizers updating the model weights.
//!
//! Optimizers work on real numeric data (`Value`) on the host. They receive
//! the current weights and the computed gradients and apply the update rule.

use crate::asg::Value;
use ndarray::ArrayD;
use std::collections::HashMap;

/// Common interface of all optimizers.
pub trait Optimizer {
    /// Performs one optimization step.
    ///
    /// * `parameters` - current parameter values, keyed by parameter name.
    /// * `gradients` - gradients of the loss for (a subset of) these parameters.
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>);
}

/// Adam (Kingma & Ba), with the bias correction folded into the step size.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    t: i32,
    m: HashMap<String, ArrayD<f32>>,
    v: HashMap<String, ArrayD<f32>>,
}

impl Adam {
    pub fn new(lr: f32) -> Self {
        Self::with_betas(lr, 0.9, 0.999, 1e-7)
    }

    pub fn with_betas(lr: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            t: 0,
            m: HashMap::new(),
            v: HashMap::new(),
        }
    }

    pub fn learning_rate(&self) -> f32 {
        self.lr
    }

    /// Number of steps taken so far.
    pub fn iterations(&self) -> i32 {
        self.t
    }
}

impl Optimizer for Adam {
    fn step(&mut self, parameters: &mut HashMap<String, Value>, gradients: &HashMap<String, Value>) {
        self.t += 1;
        let lr_t = self.lr * (1.0 - self.beta2.powi(self.t)).sqrt() / (1.0 - self.beta1.powi(self.t));
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        for (name, grad_value) in gradients {
            let (Some(Value::Tensor(param)), Value::Tensor(grad)) =
                (parameters.get_mut(name), grad_value)
            else {
                continue;
            };
            if param.shape() != grad.shape() {
                log::warn!(
                    "skipping update of '{}': gradient shape {:?} does not match {:?}",
                    name,
                    grad.shape(),
                    param.shape()
                );
                continue;
            }
            let m = self
                .m
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));
            let v = self
                .v
                .entry(name.clone())
                .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

            ndarray::azip!((p in param, m in m, v in v, &g in grad) {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *p -= lr_t * *m / (v.sqrt() + epsilon);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn first_step_moves_by_learning_rate_against_the_gradient_sign() {
        let mut params = HashMap::from([(
            "w".to_string(),
            Value::Tensor(ArrayD::from_elem(IxDyn(&[2]), 1.0)),
        )]);
        let grads = HashMap::from([(
            "w".to_string(),
            Value::Tensor(ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.5, -2.0]).unwrap()),
        )]);
        let mut adam = Adam::new(0.01);
        adam.step(&mut params, &grads);
        assert_eq!(adam.iterations(), 1);
        match &params["w"] {
            Value::Tensor(w) => {
                assert!((w[[0]] - 0.99).abs() < 1e-5);
                assert!((w[[1]] - 1.01).abs() < 1e-5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn parameters_without_gradient_are_untouched() {
        let mut params = HashMap::from([(
            "frozen".to_string(),
            Value::Tensor(ArrayD::from_elem(IxDyn(&[3]), 2.0)),
        )]);
        Adam::new(0.1).step(&mut params, &HashMap::new());
        assert_eq!(
            params["frozen"],
            Value::Tensor(ArrayD::from_elem(IxDyn(&[3]), 2.0))
        );
    }
}
