//! Fully connected (dense) layer in the graph paradigm.

use crate::nn::init::Initializer;
use crate::nn::module::{Module, Parameter};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Fully connected layer `y = xW (+ b)`.
///
/// Holds no data: the kernel and the optional bias are `Parameter` nodes whose
/// values live in the model's parameter store.
pub struct Dense {
    pub kernel: Tensor,
    pub bias: Option<Tensor>,
    name: String,
    in_features: usize,
    out_features: usize,
    l2: f32,
}

impl Dense {
    /// Registers the layer's parameters in `context`.
    ///
    /// Parameter names are `"{name}.kernel"` and `"{name}.bias"`. `l2` is the
    /// kernel regularization strength, the bias is never regularized.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_features: usize,
        out_features: usize,
        use_bias: bool,
        l2: f32,
    ) -> Self {
        let kernel = Tensor::new_parameter(context, &format!("{}.kernel", name));
        let bias = use_bias.then(|| Tensor::new_parameter(context, &format!("{}.bias", name)));
        Self {
            kernel,
            bias,
            name: name.to_string(),
            in_features,
            out_features,
            l2,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

impl Module for Dense {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        let product = inputs.dot(&self.kernel);
        match &self.bias {
            Some(bias) => &product + bias,
            None => product,
        }
    }

    fn parameters(&self) -> Vec<Parameter> {
        let mut params = vec![Parameter::new(
            self.kernel.clone(),
            format!("{}.kernel", self.name),
            vec![self.in_features, self.out_features],
            Initializer::GlorotUniform,
            self.l2,
        )];
        if let Some(bias) = &self.bias {
            params.push(Parameter::new(
                bias.clone(),
                format!("{}.bias", self.name),
                vec![self.out_features],
                Initializer::Zeros,
                0.0,
            ));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;

    #[test]
    fn bias_is_optional() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");

        let plain = Dense::new(&ctx, "plain", 3, 2, false, 5e-3);
        let y = plain.forward(&x);
        assert!(matches!(
            ctx.borrow().main_graph().get_node(y.node_id).unwrap().node_type,
            NodeType::MatrixMultiply(_, _)
        ));
        let params = plain.parameters();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "plain.kernel");
        assert_eq!(params[0].shape, vec![3, 2]);

        let biased = Dense::new(&ctx, "biased", 3, 2, true, 5e-3);
        let params = biased.parameters();
        assert_eq!(params.len(), 2);
        assert_eq!(params[1].shape, vec![2]);
        assert_eq!(params[1].l2, 0.0);
    }
}
