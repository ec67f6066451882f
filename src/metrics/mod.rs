// --- File: src/metrics/mod.rs ---

//! Metrics reported while training and testing a node classifier.
//!
//! ```rust,ignore
//! use rustyasg_dagnn::metrics::{Accuracy, Metric};
//!
//! let mut accuracy = Accuracy::new();
//! accuracy.update(&logits, &labels);
//! println!("accuracy: {:.4}", accuracy.compute());
//! ```

pub mod classification;
pub mod running;

pub use classification::{argmax, Accuracy};
pub use running::RunningMean;

/// Base trait of all metrics.
pub trait Metric: Send + Sync {
    type Prediction;
    type Target;
    type Output;

    /// Accumulates a batch of predictions.
    fn update(&mut self, predictions: &Self::Prediction, targets: &Self::Target);

    fn compute(&self) -> Self::Output;

    fn reset(&mut self);

    fn name(&self) -> &str;
}
