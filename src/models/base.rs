//! State and lifecycle shared by every semi-supervised node classifier.

use crate::data::{FullBatchNodeSequence, NodeBatch};
use crate::error::{DagnnError, Result};
use crate::graph::Graph;
use crate::metrics::RunningMean;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Loss and accuracy of one training step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchLog {
    pub loss: f32,
    pub accuracy: f64,
}

/// Mean loss and accuracy over the batches of one epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochLog {
    pub epoch: usize,
    pub loss: f64,
    pub accuracy: f64,
}

/// Graph, identity and randomness owned by a model.
pub struct BaseModel {
    graph: Graph,
    name: String,
    device: String,
    seed: Option<u64>,
    rng: StdRng,
}

impl BaseModel {
    /// `name` defaults to `default_name`. Without a seed the generator is
    /// seeded from system entropy.
    pub fn new(
        graph: Graph,
        name: Option<String>,
        default_name: &str,
        device: &str,
        seed: Option<u64>,
    ) -> Self {
        if !device.to_ascii_lowercase().starts_with("cpu") {
            log::warn!("device '{}' is not available, running on the CPU", device);
        }
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            graph,
            name: name.unwrap_or_else(|| default_name.to_string()),
            device: device.to_string(),
            seed,
            rng,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn rng_mut(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.num_nodes()
    }

    pub fn num_attrs(&self) -> usize {
        self.graph.num_attrs()
    }

    pub fn num_classes(&self) -> usize {
        self.graph.num_classes()
    }

    /// Fails with an index error on the first index outside `[0, num_nodes)`.
    pub fn check_index(&self, index: &[usize]) -> Result<()> {
        let node_count = self.num_nodes();
        match index.iter().find(|&&i| i >= node_count) {
            Some(&bad) => Err(DagnnError::Index {
                index: bad,
                node_count,
            }),
            None => Ok(()),
        }
    }

    /// Labels of `index`, in order.
    pub fn labels_of(&self, index: &[usize]) -> Result<Vec<usize>> {
        self.check_index(index)?;
        let labels = self.graph.labels();
        Ok(index.iter().map(|&i| labels[i]).collect())
    }
}

/// Shared lifecycle of semi-supervised node classifiers:
/// construct, preprocess, build, train, predict.
pub trait SemiSupervisedModel {
    /// Options accepted by [`SemiSupervisedModel::build`].
    type Config;

    fn base(&self) -> &BaseModel;

    /// Derives the model inputs (normalized adjacency and attributes) from the graph.
    fn preprocess(&mut self) -> Result<()>;

    /// Creates the network and initializes its parameters.
    fn build(&mut self, config: &Self::Config) -> Result<()>;

    /// Training batches for the nodes in `index`.
    fn train_sequence(&self, index: &[usize]) -> Result<FullBatchNodeSequence>;

    /// One optimization step on `batch`.
    fn train_on_batch(&mut self, batch: &NodeBatch) -> Result<BatchLog>;

    /// Logits of the nodes in `index`, one row per index in input order.
    fn predict(&mut self, index: &[usize]) -> Result<Array2<f32>>;

    /// Loss and accuracy on the nodes in `index`, without dropout.
    fn test(&mut self, index: &[usize]) -> Result<BatchLog>;

    fn fit(&mut self, sequence: &FullBatchNodeSequence, epochs: usize) -> Result<Vec<EpochLog>> {
        let mut history = Vec::with_capacity(epochs);
        for epoch in 1..=epochs {
            let mut loss = RunningMean::new();
            let mut accuracy = RunningMean::new();
            for batch in sequence {
                let log = self.train_on_batch(batch)?;
                loss.update(f64::from(log.loss));
                accuracy.update(log.accuracy);
            }
            let entry = EpochLog {
                epoch,
                loss: loss.compute(),
                accuracy: accuracy.compute(),
            };
            log::debug!(
                "{} epoch {}/{}: loss {:.4}, accuracy {:.4}",
                self.base().name(),
                epoch,
                epochs,
                entry.loss,
                entry.accuracy
            );
            history.push(entry);
        }
        Ok(history)
    }
}
