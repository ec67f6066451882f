//! # Data Module
//!
//! Batch sequences consumed by the training loop.
//!
//! - [`NodeBatch`]: features, adjacency and node index set with their labels
//! - [`FullBatchNodeSequence`]: one full-graph batch per epoch
//!
//! ## Example
//!
//! ```ignore
//! let sequence = model.train_sequence(&train_index)?;
//! for batch in &sequence {
//!     let (loss, accuracy) = model.train_on_batch(batch)?;
//! }
//! ```

pub mod sequence;

pub use sequence::{FullBatchNodeSequence, NodeBatch};
