//! ASG: the abstract semantic graph every model is lowered to.
//!
//! Nodes are appended in creation order, so an operand always has a smaller
//! id than the node that consumes it.

use ndarray::ArrayD;
use sprs::CsMat;
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("invalid shape on node {0}")]
    InvalidShape(NodeId),
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DType {
    F32,
    /// Node indices and class labels.
    Index,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(Value),
    /// Reads the memoized value of a node in another graph (the forward graph
    /// when executing a gradient graph).
    External { name: String, source_asg_id: AsgId, source_node_id: NodeId },

    // Binary, numpy-style broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    /// `[.., m, k] x [k, n]`; a rank-3 left operand is multiplied slice by slice.
    MatrixMultiply(NodeId, NodeId),
    /// Sparse operator times dense matrix, `A·X` or `Aᵀ·X`.
    SparseMatMul { adj: NodeId, rhs: NodeId, transpose: bool },
    /// 1.0 where `lhs > rhs`, 0.0 elsewhere.
    GreaterThan(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Tanh(NodeId),
    Elu(NodeId, f32),
    /// d/dx elu(x): 1 for x > 0, `alpha * exp(x)` otherwise.
    EluDerivative(NodeId, f32),

    // Reductions
    /// Sum of all elements, rank-0 result.
    Sum(NodeId),
    /// Sum over one axis, the axis is removed.
    SumAxis(NodeId, usize),

    // Layout
    /// Inserts `axis` and repeats the operand `times` along it. Adjoint of `SumAxis`.
    Repeat { input: NodeId, axis: usize, times: usize },
    Reshape(NodeId, Shape),
    Transpose(NodeId, usize, usize),
    Broadcast(NodeId, Shape),
    /// Sums a broadcast result back down to `Shape`. Adjoint of `Broadcast`.
    ReduceSumTo(NodeId, Shape),
    /// Stacks equally shaped operands along a new `axis`.
    Stack { inputs: Vec<NodeId>, axis: usize },
    /// Takes slice `index` of `axis`, the axis is removed.
    Select { input: NodeId, axis: usize, index: usize },

    // Indexing
    /// Rows of `input` at the positions held by `index` (a `Value::Indices`).
    Gather { input: NodeId, index: NodeId },
    /// Adjoint of `Gather`: adds row `i` of `input` into row `index[i]` of a
    /// zero matrix with `rows` rows.
    ScatterAdd { input: NodeId, index: NodeId, rows: usize },

    // Stochastic
    /// Inverted-dropout mask shaped like `like`: each element is 0 with
    /// probability `rate`, `1 / (1 - rate)` otherwise. All ones in eval mode.
    DropoutMask { like: NodeId, rate: f32 },

    // Loss
    /// Mean softmax cross-entropy of raw logits against class ids.
    SoftmaxCrossEntropy { logits: NodeId, labels: NodeId },
    /// `(softmax(logits) - onehot(labels)) / batch`.
    SoftmaxCrossEntropyGrad { logits: NodeId, labels: NodeId },
}

impl NodeType {
    /// Operands this node reads, in evaluation order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::GreaterThan(a, b) => vec![*a, *b],
            NodeType::SparseMatMul { adj, rhs, .. } => vec![*adj, *rhs],

            NodeType::Negate(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Tanh(a)
            | NodeType::Elu(a, _)
            | NodeType::EluDerivative(a, _)
            | NodeType::Sum(a)
            | NodeType::SumAxis(a, _)
            | NodeType::Reshape(a, _)
            | NodeType::Transpose(a, _, _)
            | NodeType::Broadcast(a, _)
            | NodeType::ReduceSumTo(a, _) => vec![*a],
            NodeType::Repeat { input, .. } | NodeType::Select { input, .. } => vec![*input],
            NodeType::Stack { inputs, .. } => inputs.clone(),

            NodeType::Gather { input, index } | NodeType::ScatterAdd { input, index, .. } => {
                vec![*input, *index]
            }
            NodeType::DropoutMask { like, .. } => vec![*like],
            NodeType::SoftmaxCrossEntropy { logits, labels }
            | NodeType::SoftmaxCrossEntropyGrad { logits, labels } => vec![*logits, *labels],
        }
    }
}

/// Runtime value of a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(ArrayD<f32>),
    /// CSR sparse matrix, used for the normalized adjacency operator.
    Sparse(CsMat<f32>),
    Indices(Vec<usize>),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "Tensor",
            Value::Sparse(_) => "Sparse",
            Value::Indices(_) => "Indices",
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::Sparse(mat) => vec![mat.rows(), mat.cols()],
            Value::Indices(idx) => vec![idx.len()],
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Value::Indices(_) => DType::Index,
            _ => DType::F32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            nodes: HashMap::new(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        let mut node = Node {
            id: new_id,
            name,
            node_type,
            shape: None,
            dtype: None,
        };

        // Literals know their shape up front.
        if let NodeType::Literal(value) = &node.node_type {
            node.shape = Some(value.shape());
            node.dtype = Some(value.dtype());
        }

        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Finds an `Input` or `Parameter` node by name.
    pub fn find_named(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find_map(|node| match &node.node_type {
            NodeType::Input { name: n } | NodeType::Parameter { name: n } if n == name => {
                Some(node.id)
            }
            _ => None,
        })
    }
}
