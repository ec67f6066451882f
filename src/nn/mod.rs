//! # Neural Network Layers Module
//!
//! Building blocks of the DAGNN classifier. In the graph-based architecture
//! each "layer" is a constructor that adds a specific pattern of nodes
//! (operations and parameters) to the ASG.
//!
//! - [`Dense`]: fully connected layer with optional bias and L2 strength
//! - [`Activation`]: named element-wise nonlinearity
//! - [`Dropout`]: inverted dropout, active only in training mode
//! - [`DagnnConv`]: K-step adaptive propagation with retention gates
//! - [`Gather`]: row selection by node index
//!
//! ## Example
//!
//! ```ignore
//! use rustyasg_dagnn::nn::{Dense, Module};
//! use rustyasg_dagnn::tensor::{GraphContext, Tensor};
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let dense = Dense::new(&ctx, "dense_0", 1433, 64, false, 5e-3);
//! let x = Tensor::new_input(&ctx, "attr_matrix");
//! let h = dense.forward(&x).relu();
//! ```

pub mod activations;
pub mod dropout;
pub mod init;
pub mod linear;
pub mod module;
pub mod propagation;

pub use activations::Activation;
pub use dropout::Dropout;
pub use init::Initializer;
pub use linear::Dense;
pub use module::{Module, Parameter};
pub use propagation::{DagnnConv, Gather, Propagation};
