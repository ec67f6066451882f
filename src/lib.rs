//! # RustyASG-DAGNN: Deep Adaptive Graph Neural Network on a graph-based engine
//!
//! Models are written against symbolic [`tensor::Tensor`] handles that append
//! nodes to an Abstract Semantic Graph (ASG). Before anything runs, the graph
//! goes through shape inference (dimension mismatches fail here), autograd
//! derives a separate gradient graph, and the CPU backend interprets both.
//!
//! ## Usage Example
//!
//! ```no_run
//! use rustyasg_dagnn::config::{BuildConfig, ModelConfig};
//! use rustyasg_dagnn::graph::GraphData;
//! use rustyasg_dagnn::models::{Dagnn, SemiSupervisedModel};
//!
//! # fn main() -> rustyasg_dagnn::error::Result<()> {
//! let data = GraphData::from_json_file("cora.json")?;
//! let mut model = Dagnn::new(data.to_graph()?, ModelConfig { k: 10, ..Default::default() })?;
//! model.build(&BuildConfig::default())?;
//!
//! let sequence = model.train_sequence(&data.train_index)?;
//! model.fit(&sequence, 100)?;
//! let logits = model.predict(&data.test_index)?;
//! # Ok(())
//! # }
//! ```

// Declare public modules that constitute the core library API.
pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod config;
pub mod data;
pub mod error;
pub mod graph;
pub mod losses;
pub mod metrics;
pub mod models;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod tensor;

pub use error::{DagnnError, Result};
