//! Semi-supervised node classification models.
//!
//! [`SemiSupervisedModel`] is the lifecycle every architecture implements;
//! [`BaseModel`] holds the state they share.

pub mod base;
pub mod dagnn;

pub use base::{BaseModel, BatchLog, EpochLog, SemiSupervisedModel};
pub use dagnn::Dagnn;
