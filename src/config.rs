//! Model and build configuration.
//!
//! Both configs are plain serde structs, so they can be read from JSON:
//!
//! ```json
//! { "hiddens": [64], "activations": "relu", "dropouts": 0.5,
//!   "l2_norms": 5e-3, "lr": 0.01, "use_bias": false }
//! ```
//!
//! Every per-layer option accepts a single value or a list, see [`LayerOption`].

use crate::asg::DType;
use crate::error::{DagnnError, Result};
use crate::graph::NormX;
use crate::nn::Activation;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A per-layer option given either once for every layer or once per layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LayerOption<T> {
    One(T),
    Many(Vec<T>),
}

impl<T: Clone> LayerOption<T> {
    fn len(&self) -> usize {
        match self {
            LayerOption::One(_) => 1,
            LayerOption::Many(values) => values.len(),
        }
    }

    /// Expands to `n` values. Single values are repeated, lists must already
    /// have length `n`.
    fn broadcast(&self, n: usize, option: &str) -> Result<Vec<T>> {
        match self {
            LayerOption::One(value) => Ok(vec![value.clone(); n]),
            LayerOption::Many(values) if values.len() == 1 => Ok(vec![values[0].clone(); n]),
            LayerOption::Many(values) if values.len() == n => Ok(values.clone()),
            LayerOption::Many(values) => Err(DagnnError::Configuration(format!(
                "'{}' has {} entries, expected 1 or {}",
                option,
                values.len(),
                n
            ))),
        }
    }
}

impl<T> From<T> for LayerOption<T> {
    fn from(value: T) -> Self {
        LayerOption::One(value)
    }
}

impl<T> From<Vec<T>> for LayerOption<T> {
    fn from(values: Vec<T>) -> Self {
        LayerOption::Many(values)
    }
}

/// Resolved configuration of one encoder layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerConfig {
    pub hidden: usize,
    pub activation: Activation,
    pub dropout: f32,
    pub l2_norm: f32,
}

/// Options of [`crate::models::Dagnn::build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub hiddens: LayerOption<usize>,
    pub activations: LayerOption<String>,
    pub dropouts: LayerOption<f32>,
    pub l2_norms: LayerOption<f32>,
    pub lr: f32,
    pub use_bias: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            hiddens: LayerOption::Many(vec![64]),
            activations: LayerOption::Many(vec!["relu".to_string()]),
            dropouts: LayerOption::Many(vec![0.5]),
            l2_norms: LayerOption::Many(vec![5e-3]),
            lr: 0.01,
            use_bias: false,
        }
    }
}

impl BuildConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Broadcasts the four per-layer options to the longest one and
    /// validates every resulting layer.
    pub fn layers(&self) -> Result<Vec<LayerConfig>> {
        let lengths = [
            self.hiddens.len(),
            self.activations.len(),
            self.dropouts.len(),
            self.l2_norms.len(),
        ];
        if lengths.contains(&0) {
            return Err(DagnnError::Configuration(
                "per-layer options must not be empty".to_string(),
            ));
        }
        let n = lengths.iter().copied().max().unwrap_or(1);

        let hiddens = self.hiddens.broadcast(n, "hiddens")?;
        let activations = self.activations.broadcast(n, "activations")?;
        let dropouts = self.dropouts.broadcast(n, "dropouts")?;
        let l2_norms = self.l2_norms.broadcast(n, "l2_norms")?;

        let mut layers = Vec::with_capacity(n);
        for (((hidden, activation), dropout), l2_norm) in
            hiddens.into_iter().zip(activations).zip(dropouts).zip(l2_norms)
        {
            if hidden == 0 {
                return Err(DagnnError::Configuration(
                    "hidden width must be positive".to_string(),
                ));
            }
            if !(0.0..1.0).contains(&dropout) {
                return Err(DagnnError::Configuration(format!(
                    "dropout rate must be in [0, 1), got {}",
                    dropout
                )));
            }
            if !(l2_norm >= 0.0 && l2_norm.is_finite()) {
                return Err(DagnnError::Configuration(format!(
                    "l2 strength must be a nonnegative number, got {}",
                    l2_norm
                )));
            }
            layers.push(LayerConfig {
                hidden,
                activation: activation.parse()?,
                dropout,
                l2_norm,
            });
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(DagnnError::Configuration(format!(
                "learning rate must be positive, got {}",
                self.lr
            )));
        }
        Ok(layers)
    }
}

/// Construction options of a DAGNN model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Exponent `r` of `D^r (A + I) D^r`; `0.0` keeps the adjacency as is.
    pub norm_adj: f32,
    pub norm_x: Option<NormX>,
    /// Propagation steps.
    pub k: usize,
    /// Advisory only, every computation runs on the host CPU.
    pub device: String,
    pub seed: Option<u64>,
    pub name: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            norm_adj: -0.5,
            norm_x: None,
            k: 10,
            device: "cpu:0".to_string(),
            seed: None,
            name: None,
        }
    }
}

impl ModelConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Floating point type of every tensor the model computes.
    pub const fn floatx(&self) -> DType {
        DType::F32
    }

    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            return Err(DagnnError::Configuration(
                "propagation steps K must be a positive integer, got 0".to_string(),
            ));
        }
        if !self.norm_adj.is_finite() {
            return Err(DagnnError::Configuration(format!(
                "adjacency normalization rate must be finite, got {}",
                self.norm_adj
            )));
        }
        Ok(())
    }
}
