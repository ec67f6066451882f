//! Deep Adaptive Graph Neural Network (DAGNN).
//!
//! `Towards Deeper Graph Neural Networks`, <https://arxiv.org/abs/2007.09296>.
//!
//! Network: `[Dense -> activation -> Dropout]*` encoder, a class-width
//! projection, K-step adaptive propagation over the normalized adjacency,
//! and a gather of the requested rows. Trained with sparse softmax
//! cross-entropy on logits plus L2 weight decay, optimized with Adam.

use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, DType, Shape, Value};
use crate::autograd::Gradients;
use crate::config::{BuildConfig, ModelConfig};
use crate::data::{FullBatchNodeSequence, NodeBatch};
use crate::error::{DagnnError, Result};
use crate::graph::{normalize_adj, normalize_x, Graph};
use crate::losses::regularized_loss;
use crate::metrics::{Accuracy, Metric};
use crate::models::base::{BaseModel, BatchLog, SemiSupervisedModel};
use crate::nn::{DagnnConv, Dense, Dropout, Gather, Module, Parameter};
use crate::optimizers::{Adam, Optimizer};
use crate::runtime::backend::{bind, Backend, ExecutionMode, Memo};
use crate::runtime::cpu_backend::CpuBackend;
use crate::tensor::{GraphContext, Tensor};
use ndarray::{Array2, ArrayD, Ix2};
use rand::Rng;
use sprs::CsMat;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const ATTR_MATRIX: &str = "attr_matrix";
const ADJ_MATRIX: &str = "adj_matrix";
const NODE_INDEX: &str = "node_index";
const LABELS: &str = "labels";

/// Which outputs a compiled plan computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Pass {
    /// Logits only.
    Inference,
    /// Loss and logits, without gradients.
    Evaluation,
    /// Loss and logits, plus the gradient graph.
    Training,
}

/// Forward graph validated for one batch length, and its gradient graph.
struct Plan {
    forward: Asg,
    gradients: Option<Asg>,
}

/// Symbolic network plus the numeric state trained on it.
struct Network {
    context: Rc<RefCell<GraphContext>>,
    logits: Tensor,
    loss: Tensor,
    params: Vec<Parameter>,
    values: HashMap<String, Value>,
    optimizer: Adam,
    plans: HashMap<(Pass, InputShapes), Rc<Plan>>,
}

impl Network {
    fn plan(&mut self, pass: Pass, input_shapes: &InputShapes) -> Result<Rc<Plan>> {
        let key = (pass, input_shapes.clone());
        if let Some(plan) = self.plans.get(&key) {
            return Ok(Rc::clone(plan));
        }
        let plan = Rc::new(self.compile(pass, input_shapes)?);
        self.plans.insert(key, Rc::clone(&plan));
        Ok(plan)
    }

    /// Validates the forward graph for the given input shapes and, for
    /// training, derives the gradient graph.
    fn compile(&self, pass: Pass, input_shapes: &InputShapes) -> Result<Plan> {
        let mut forward = self.context.borrow().main_graph().clone();
        match pass {
            Pass::Inference => forward.set_output(self.logits.node_id),
            Pass::Evaluation | Pass::Training => {
                forward.set_outputs(vec![self.loss.node_id, self.logits.node_id])
            }
        }

        let mut shapes: HashMap<String, (Shape, DType)> = HashMap::new();
        shapes.insert(ATTR_MATRIX.to_string(), (input_shapes.features.clone(), DType::F32));
        shapes.insert(ADJ_MATRIX.to_string(), (input_shapes.adjacency.clone(), DType::F32));
        shapes.insert(NODE_INDEX.to_string(), (vec![input_shapes.batch], DType::Index));
        shapes.insert(LABELS.to_string(), (vec![input_shapes.batch], DType::Index));
        for p in &self.params {
            shapes.insert(p.name.clone(), (p.shape.clone(), DType::F32));
        }
        ShapeInference::run(&mut forward, &shapes)?;

        let gradients = match pass {
            Pass::Inference | Pass::Evaluation => None,
            Pass::Training => {
                let param_ids: Vec<_> = self.params.iter().map(|p| p.tensor.node_id).collect();
                Some(Gradients::new(&forward).build(self.loss.node_id, &param_ids)?)
            }
        };
        log::debug!(
            "compiled {:?} plan for features {:?}, adjacency {:?}, batch {}: {} forward nodes, {} gradient nodes",
            pass,
            input_shapes.features,
            input_shapes.adjacency,
            input_shapes.batch,
            forward.nodes.len(),
            gradients.as_ref().map_or(0, |g| g.nodes.len())
        );
        Ok(Plan { forward, gradients })
    }
}

/// Plans are cached per input shapes, so a batch whose features or adjacency
/// differ in shape is validated again before anything runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InputShapes {
    features: Shape,
    adjacency: Shape,
    batch: usize,
}

/// DAGNN node classifier.
pub struct Dagnn {
    base: BaseModel,
    config: ModelConfig,
    features: Rc<Array2<f32>>,
    adjacency: Rc<CsMat<f32>>,
    backend: CpuBackend,
    network: Option<Network>,
}

impl Dagnn {
    /// Creates the model and preprocesses the graph.
    pub fn new(graph: Graph, config: ModelConfig) -> Result<Self> {
        config.validate()?;
        let mut base = BaseModel::new(
            graph,
            config.name.clone(),
            "DAGNN",
            &config.device,
            config.seed,
        );
        let backend = CpuBackend::with_seed(base.rng_mut().gen());
        let features = Rc::new(base.graph().features().clone());
        let adjacency = Rc::new(base.graph().adjacency().clone());
        let mut model = Self {
            base,
            config,
            features,
            adjacency,
            backend,
            network: None,
        };
        model.preprocess()?;
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Normalized attribute matrix fed to the network.
    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    /// Normalized adjacency operator fed to the network.
    pub fn adjacency(&self) -> &CsMat<f32> {
        &self.adjacency
    }

    pub fn is_built(&self) -> bool {
        self.network.is_some()
    }

    /// Current parameter values, keyed by parameter name.
    pub fn parameters(&self) -> Result<&HashMap<String, Value>> {
        self.network
            .as_ref()
            .map(|n| &n.values)
            .ok_or(DagnnError::NotBuilt)
    }

    /// Overwrites one parameter value. The shape must match.
    pub fn set_parameter(&mut self, name: &str, value: ArrayD<f32>) -> Result<()> {
        let network = self.network.as_mut().ok_or(DagnnError::NotBuilt)?;
        let param = network
            .params
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| DagnnError::Configuration(format!("no parameter named '{}'", name)))?;
        if value.shape() != param.shape.as_slice() {
            return Err(DagnnError::Shape(format!(
                "parameter '{}' has shape {:?}, got {:?}",
                name,
                param.shape,
                value.shape()
            )));
        }
        network.values.insert(name.to_string(), Value::Tensor(value));
        Ok(())
    }

    fn input_shapes(&self, features: &Array2<f32>, adjacency: &CsMat<f32>, batch: usize) -> InputShapes {
        InputShapes {
            features: features.shape().to_vec(),
            adjacency: vec![adjacency.rows(), adjacency.cols()],
            batch,
        }
    }

    /// Runs the forward graph of `plan` and returns its outputs and memo.
    fn run_forward(
        &self,
        plan: &Plan,
        features: &Array2<f32>,
        adjacency: &CsMat<f32>,
        index: &[usize],
        labels: Option<&[usize]>,
    ) -> Result<(Vec<Value>, Memo<Value>)> {
        let network = self.network.as_ref().ok_or(DagnnError::NotBuilt)?;
        let mut data = network.values.clone();
        data.insert(ATTR_MATRIX.to_string(), Value::Tensor(features.clone().into_dyn()));
        data.insert(ADJ_MATRIX.to_string(), Value::Sparse(adjacency.clone()));
        data.insert(NODE_INDEX.to_string(), Value::Indices(index.to_vec()));
        if let Some(labels) = labels {
            data.insert(LABELS.to_string(), Value::Indices(labels.to_vec()));
        }

        let device_data = self.backend.load_data(&data)?;
        let memo = bind(&plan.forward, device_data)?;
        let (outputs, memo) = self.backend.run(&plan.forward, memo)?;
        Ok((self.backend.retrieve_data(&outputs)?, memo))
    }

    fn evaluate(&mut self, index: &[usize], labels: &[usize]) -> Result<(f32, Array2<f32>)> {
        let shapes = self.input_shapes(&self.features, &self.adjacency, index.len());
        let plan = self
            .network
            .as_mut()
            .ok_or(DagnnError::NotBuilt)?
            .plan(Pass::Evaluation, &shapes)?;
        self.backend.set_mode(ExecutionMode::Eval);
        let (features, adjacency) = (Rc::clone(&self.features), Rc::clone(&self.adjacency));
        let (outputs, _) = self.run_forward(&plan, &features, &adjacency, index, Some(labels))?;
        Ok((scalar(&outputs, 0)?, matrix(&outputs, 1)?))
    }
}

impl SemiSupervisedModel for Dagnn {
    type Config = BuildConfig;

    fn base(&self) -> &BaseModel {
        &self.base
    }

    /// `norm_adj == 0` keeps the raw adjacency, `norm_x == None` the raw
    /// attributes. Always derived from the original graph, so repeated calls
    /// yield the same operator.
    fn preprocess(&mut self) -> Result<()> {
        let graph = self.base.graph();
        let adjacency = if self.config.norm_adj != 0.0 {
            normalize_adj(graph.adjacency(), self.config.norm_adj)
        } else {
            graph.adjacency().clone()
        };
        let features = match self.config.norm_x {
            Some(norm) => normalize_x(graph.features(), norm),
            None => graph.features().clone(),
        };
        self.adjacency = Rc::new(adjacency);
        self.features = Rc::new(features);
        log::info!(
            "{}: {} nodes, {} attributes, {} classes, K = {}",
            self.base.name(),
            self.base.num_nodes(),
            self.base.num_attrs(),
            self.base.num_classes(),
            self.config.k
        );
        Ok(())
    }

    fn build(&mut self, config: &BuildConfig) -> Result<()> {
        let layers = config.layers()?;
        let last = layers
            .last()
            .cloned()
            .ok_or_else(|| DagnnError::Configuration("at least one layer is required".to_string()))?;
        let n_classes = self.base.num_classes();
        if n_classes == 0 {
            return Err(DagnnError::Configuration(
                "graph has no labels to classify".to_string(),
            ));
        }

        let context = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&context, ATTR_MATRIX);
        let adj = Tensor::new_input(&context, ADJ_MATRIX);
        let index = Tensor::new_input(&context, NODE_INDEX);
        let labels = Tensor::new_input(&context, LABELS);

        let mut params = Vec::new();
        let mut h = x;
        let mut in_features = self.base.num_attrs();
        for (i, layer) in layers.iter().enumerate() {
            let dense = Dense::new(
                &context,
                &format!("dense_{}", i),
                in_features,
                layer.hidden,
                config.use_bias,
                layer.l2_norm,
            );
            h = layer.activation.forward(&dense.forward(&h));
            h = Dropout::new(layer.dropout)?.forward(&h);
            params.extend(dense.parameters());
            in_features = layer.hidden;
        }

        // The class-width projection reuses the last layer's settings.
        let projection = Dense::new(
            &context,
            "dense_out",
            in_features,
            n_classes,
            config.use_bias,
            last.l2_norm,
        );
        h = last.activation.forward(&projection.forward(&h));
        h = Dropout::new(last.dropout)?.forward(&h);
        params.extend(projection.parameters());

        let conv = DagnnConv::new(
            &context,
            "dagnn_conv",
            self.config.k,
            n_classes,
            config.use_bias,
            last.l2_norm,
        )?;
        let propagated = conv.forward(&h, &adj);
        params.extend(conv.parameters());

        let logits = Gather.forward(&propagated, &index);
        let loss = regularized_loss(&logits, &labels, &params);

        let rng = self.base.rng_mut();
        let values: HashMap<String, Value> = params
            .iter()
            .map(|p| (p.name.clone(), Value::Tensor(p.init.sample(&p.shape, rng))))
            .collect();
        let count: usize = params.iter().map(|p| p.shape.iter().product::<usize>()).sum();
        log::info!(
            "built {}: hiddens {:?}, {} parameters in {} tensors, lr {}",
            self.base.name(),
            layers.iter().map(|l| l.hidden).collect::<Vec<_>>(),
            count,
            params.len(),
            config.lr
        );

        self.network = Some(Network {
            context,
            logits,
            loss,
            params,
            values,
            optimizer: Adam::new(config.lr),
            plans: HashMap::new(),
        });
        Ok(())
    }

    fn train_sequence(&self, index: &[usize]) -> Result<FullBatchNodeSequence> {
        let labels = self.base.labels_of(index)?;
        Ok(FullBatchNodeSequence::new(NodeBatch::new(
            Rc::clone(&self.features),
            Rc::clone(&self.adjacency),
            index.to_vec(),
            labels,
        )))
    }

    fn train_on_batch(&mut self, batch: &NodeBatch) -> Result<BatchLog> {
        self.base.check_index(&batch.index)?;
        if batch.labels.len() != batch.index.len() {
            return Err(DagnnError::Shape(format!(
                "{} labels for {} indexed nodes",
                batch.labels.len(),
                batch.index.len()
            )));
        }
        let shapes = self.input_shapes(&batch.features, &batch.adjacency, batch.len());
        let plan = self
            .network
            .as_mut()
            .ok_or(DagnnError::NotBuilt)?
            .plan(Pass::Training, &shapes)?;
        let grad_graph = plan
            .gradients
            .as_ref()
            .ok_or_else(|| DagnnError::Configuration("training plan without gradients".to_string()))?;

        self.backend.set_mode(ExecutionMode::Train);
        let step = self
            .run_forward(&plan, &batch.features, &batch.adjacency, &batch.index, Some(&batch.labels))
            .and_then(|(outputs, memo)| {
                let (grads, _) = self.backend.run(grad_graph, memo)?;
                Ok((outputs, self.backend.retrieve_data(&grads)?))
            });
        self.backend.set_mode(ExecutionMode::Eval);
        let (outputs, grads) = step?;

        let network = self.network.as_mut().ok_or(DagnnError::NotBuilt)?;
        let gradients: HashMap<String, Value> = network
            .params
            .iter()
            .map(|p| p.name.clone())
            .zip(grads)
            .collect();
        network.optimizer.step(&mut network.values, &gradients);

        let loss = scalar(&outputs, 0)?;
        let logits = matrix(&outputs, 1)?;
        let mut accuracy = Accuracy::new();
        accuracy.update(&logits, &batch.labels);
        log::trace!("train step {}: loss {:.5}", network.optimizer.iterations(), loss);
        Ok(BatchLog {
            loss,
            accuracy: accuracy.compute(),
        })
    }

    fn predict(&mut self, index: &[usize]) -> Result<Array2<f32>> {
        self.base.check_index(index)?;
        let shapes = self.input_shapes(&self.features, &self.adjacency, index.len());
        let plan = self
            .network
            .as_mut()
            .ok_or(DagnnError::NotBuilt)?
            .plan(Pass::Inference, &shapes)?;
        self.backend.set_mode(ExecutionMode::Eval);
        let (features, adjacency) = (Rc::clone(&self.features), Rc::clone(&self.adjacency));
        let (outputs, _) = self.run_forward(&plan, &features, &adjacency, index, None)?;
        matrix(&outputs, 0)
    }

    fn test(&mut self, index: &[usize]) -> Result<BatchLog> {
        let labels = self.base.labels_of(index)?;
        let (loss, logits) = self.evaluate(index, &labels)?;
        let mut accuracy = Accuracy::new();
        accuracy.update(&logits, &labels);
        Ok(BatchLog {
            loss,
            accuracy: accuracy.compute(),
        })
    }
}

fn scalar(outputs: &[Value], i: usize) -> Result<f32> {
    match outputs.get(i) {
        Some(Value::Tensor(t)) if t.len() == 1 => Ok(t.iter().copied().sum()),
        other => Err(DagnnError::Shape(format!("expected a scalar output, got {:?}", other.map(Value::shape)))),
    }
}

fn matrix(outputs: &[Value], i: usize) -> Result<Array2<f32>> {
    match outputs.get(i) {
        Some(Value::Tensor(t)) => t
            .clone()
            .into_dimensionality::<Ix2>()
            .map_err(|e| DagnnError::Shape(e.to_string())),
        other => Err(DagnnError::Shape(format!(
            "expected a matrix output, got {:?}",
            other.map(Value::shape)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerOption;

    fn model() -> Dagnn {
        let edges = [(0, 1, 1.0), (1, 0, 1.0), (1, 2, 1.0), (2, 1, 1.0)];
        let features = Array2::from_shape_fn((3, 2), |(i, j)| (i + j) as f32);
        let graph = Graph::from_edges(3, &edges, features, vec![0, 1, 0]).unwrap();
        let config = ModelConfig {
            k: 2,
            seed: Some(0),
            ..ModelConfig::default()
        };
        let mut model = Dagnn::new(graph, config).unwrap();
        let build = BuildConfig {
            hiddens: LayerOption::One(4),
            dropouts: LayerOption::One(0.0),
            ..BuildConfig::default()
        };
        model.build(&build).unwrap();
        model
    }

    #[test]
    fn test_compiles_no_gradient_graph() {
        let mut model = model();
        model.test(&[0, 2]).unwrap();
        let plans = &model.network.as_ref().unwrap().plans;
        assert_eq!(plans.len(), 1);
        let ((pass, _), plan) = plans.iter().next().unwrap();
        assert_eq!(*pass, Pass::Evaluation);
        assert!(plan.gradients.is_none());
        assert_eq!(plan.forward.outputs.len(), 2);
    }

    #[test]
    fn plans_are_keyed_by_every_input_shape() {
        let mut model = model();
        let batch = model.train_sequence(&[0, 1]).unwrap().get(0).cloned().unwrap();
        model.train_on_batch(&batch).unwrap();

        let wider = NodeBatch::new(
            Rc::new(Array2::ones((3, 3))),
            Rc::clone(&batch.adjacency),
            batch.index.clone(),
            batch.labels.clone(),
        );
        assert!(matches!(model.train_on_batch(&wider), Err(DagnnError::Shape(_))));
        assert_eq!(model.network.as_ref().unwrap().plans.len(), 1);
    }
}
