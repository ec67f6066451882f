//! CPU backend for executing an ASG.
//!
//! Walks the graph in topological order and evaluates every node with
//! `ndarray` (dense) and `sprs` (sparse adjacency) operations.

use super::backend::{Backend, ExecutionMode, Memo, RuntimeError};
use crate::analysis::shape_inference::{broadcast_shapes, ShapeInference};
use crate::asg::{Asg, AsgId, NodeId, NodeType, Value};
use ndarray::{Array2, Array3, ArrayD, Axis, Ix2, Ix3, IxDyn, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sprs::CsMat;
use std::cell::RefCell;
use std::collections::HashMap;

type OpResult = Result<Value, RuntimeError>;

/// Execution state for one `run` call.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    memo: Memo<Value>,
    mode: ExecutionMode,
    rng: &'a RefCell<StdRng>,
}

impl<'a> ExecutionContext<'a> {
    fn value(&self, node_id: NodeId) -> Result<&Value, RuntimeError> {
        self.memo
            .get(&(self.asg.id, node_id))
            .ok_or(RuntimeError::NodeNotFound(node_id, self.asg.id))
    }

    fn tensor(&self, node_id: NodeId) -> Result<&ArrayD<f32>, RuntimeError> {
        match self.value(node_id)? {
            Value::Tensor(t) => Ok(t),
            other => Err(type_error("Tensor", other)),
        }
    }

    fn indices(&self, node_id: NodeId) -> Result<&[usize], RuntimeError> {
        match self.value(node_id)? {
            Value::Indices(idx) => Ok(idx),
            other => Err(type_error("Indices", other)),
        }
    }

    /// Computes the value of one node whose operands are already memoized.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<(), RuntimeError> {
        let asg_id: AsgId = self.asg.id;
        if self.memo.contains_key(&(asg_id, node_id)) {
            return Ok(());
        }

        let asg = self.asg;
        let node = asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => {
                return Err(RuntimeError::MissingInput(name.clone(), node.id));
            }
            NodeType::Parameter { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id));
            }
            NodeType::Literal(value) => Ok(value.clone()),
            NodeType::External {
                source_asg_id,
                source_node_id,
                ..
            } => self
                .memo
                .get(&(*source_asg_id, *source_node_id))
                .cloned()
                .ok_or(RuntimeError::NodeNotFound(*source_node_id, *source_asg_id)),

            NodeType::Add(l, r) => op_zip(self.tensor(*l)?, self.tensor(*r)?, |a, b| a + b),
            NodeType::Subtract(l, r) => op_zip(self.tensor(*l)?, self.tensor(*r)?, |a, b| a - b),
            NodeType::Multiply(l, r) => op_zip(self.tensor(*l)?, self.tensor(*r)?, |a, b| a * b),
            NodeType::GreaterThan(l, r) => op_zip(self.tensor(*l)?, self.tensor(*r)?, |a, b| {
                if a > b {
                    1.0
                } else {
                    0.0
                }
            }),
            NodeType::MatrixMultiply(l, r) => op_matmul(self.tensor(*l)?, self.tensor(*r)?),
            NodeType::SparseMatMul {
                adj,
                rhs,
                transpose,
            } => match self.value(*adj)? {
                Value::Sparse(mat) => op_sparse_matmul(mat, self.tensor(*rhs)?, *transpose),
                other => Err(type_error("Sparse", other)),
            },

            NodeType::Negate(x) => Ok(map(self.tensor(*x)?, |v| -v)),
            NodeType::ReLU(x) => Ok(map(self.tensor(*x)?, |v| v.max(0.0))),
            NodeType::Sigmoid(x) => Ok(map(self.tensor(*x)?, sigmoid)),
            NodeType::Tanh(x) => Ok(map(self.tensor(*x)?, f32::tanh)),
            NodeType::Elu(x, alpha) => {
                let alpha = *alpha;
                Ok(map(self.tensor(*x)?, move |v| {
                    if v > 0.0 {
                        v
                    } else {
                        alpha * (v.exp() - 1.0)
                    }
                }))
            }
            NodeType::EluDerivative(x, alpha) => {
                let alpha = *alpha;
                Ok(map(self.tensor(*x)?, move |v| {
                    if v > 0.0 {
                        1.0
                    } else {
                        alpha * v.exp()
                    }
                }))
            }

            NodeType::Sum(x) => Ok(Value::Tensor(ndarray::arr0(self.tensor(*x)?.sum()).into_dyn())),
            NodeType::SumAxis(x, axis) => {
                let a = self.tensor(*x)?;
                check_axis(*axis, a.ndim())?;
                Ok(Value::Tensor(a.sum_axis(Axis(*axis))))
            }
            NodeType::Repeat { input, axis, times } => op_repeat(self.tensor(*input)?, *axis, *times),
            NodeType::Reshape(x, shape) => op_reshape(self.tensor(*x)?, shape),
            NodeType::Transpose(x, a1, a2) => {
                let a = self.tensor(*x)?;
                check_axis(*a1.max(a2), a.ndim())?;
                let mut t = a.clone();
                t.swap_axes(*a1, *a2);
                Ok(Value::Tensor(t))
            }
            NodeType::Broadcast(x, shape) => {
                let a = self.tensor(*x)?;
                a.broadcast(IxDyn(shape))
                    .map(|view| Value::Tensor(view.to_owned()))
                    .ok_or_else(|| {
                        RuntimeError::ShapeError(format!(
                            "cannot broadcast {:?} to {:?}",
                            a.shape(),
                            shape
                        ))
                    })
            }
            NodeType::ReduceSumTo(x, shape) => op_reduce_sum_to(self.tensor(*x)?, shape),
            NodeType::Stack { inputs, axis } => {
                let views = inputs
                    .iter()
                    .map(|id| self.tensor(*id).map(|t| t.view()))
                    .collect::<Result<Vec<_>, _>>()?;
                ndarray::stack(Axis(*axis), &views)
                    .map(Value::Tensor)
                    .map_err(|e| RuntimeError::ShapeError(e.to_string()))
            }
            NodeType::Select { input, axis, index } => {
                let a = self.tensor(*input)?;
                check_axis(*axis, a.ndim())?;
                if *index >= a.shape()[*axis] {
                    return Err(RuntimeError::IndexOutOfBounds {
                        index: *index,
                        len: a.shape()[*axis],
                    });
                }
                Ok(Value::Tensor(a.index_axis(Axis(*axis), *index).to_owned()))
            }

            NodeType::Gather { input, index } => op_gather(self.tensor(*input)?, self.indices(*index)?),
            NodeType::ScatterAdd { input, index, rows } => {
                op_scatter_add(self.tensor(*input)?, self.indices(*index)?, *rows)
            }

            NodeType::DropoutMask { like, rate } => {
                let shape = self.tensor(*like)?.raw_dim();
                if self.mode == ExecutionMode::Eval || *rate <= 0.0 {
                    Ok(Value::Tensor(ArrayD::ones(shape)))
                } else {
                    let keep = 1.0 - *rate;
                    let mut rng = self.rng.borrow_mut();
                    Ok(Value::Tensor(ArrayD::from_shape_fn(shape, |_| {
                        if rng.gen::<f32>() < *rate {
                            0.0
                        } else {
                            1.0 / keep
                        }
                    })))
                }
            }

            NodeType::SoftmaxCrossEntropy { logits, labels } => {
                op_softmax_cross_entropy(self.tensor(*logits)?, self.indices(*labels)?)
            }
            NodeType::SoftmaxCrossEntropyGrad { logits, labels } => {
                op_softmax_cross_entropy_grad(self.tensor(*logits)?, self.indices(*labels)?)
            }
        }?;

        self.memo.insert((asg_id, node_id), result);
        Ok(())
    }
}

/// Interpreter running on the host with `ndarray`.
///
/// Owns the random generator used for dropout masks, so a backend built
/// with [`CpuBackend::with_seed`] reproduces the same masks run after run.
pub struct CpuBackend {
    mode: ExecutionMode,
    rng: RefCell<StdRng>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            mode: ExecutionMode::Eval,
            rng: RefCell::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            mode: ExecutionMode::Eval,
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::ShapeError(format!("topological sort failed: {}", e)))?;

        let mut context = ExecutionContext {
            asg: main_asg,
            memo: initial_memo,
            mode: self.mode,
            rng: &self.rng,
        };

        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let mut results = Vec::with_capacity(main_asg.outputs.len());
        for output_node_id in &main_asg.outputs {
            let result = context.value(*output_node_id)?.clone();
            results.push(result);
        }
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

fn type_error(expected: &str, actual: &Value) -> RuntimeError {
    RuntimeError::TypeError {
        expected: expected.to_string(),
        actual: actual.kind().to_string(),
    }
}

fn check_axis(axis: usize, ndim: usize) -> Result<(), RuntimeError> {
    if axis >= ndim {
        return Err(RuntimeError::ShapeError(format!(
            "axis {} out of range for rank {}",
            axis, ndim
        )));
    }
    Ok(())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn map(a: &ArrayD<f32>, f: impl Fn(f32) -> f32) -> Value {
    Value::Tensor(a.mapv(f))
}

/// Element-wise binary op with numpy broadcasting.
fn op_zip(a: &ArrayD<f32>, b: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> OpResult {
    let shape = broadcast_shapes(a.shape(), b.shape())
        .map_err(|e| RuntimeError::ShapeError(e.to_string()))?;
    let dim = IxDyn(&shape);
    let (av, bv) = match (a.broadcast(dim.clone()), b.broadcast(dim)) {
        (Some(av), Some(bv)) => (av, bv),
        _ => {
            return Err(RuntimeError::ShapeError(format!(
                "cannot broadcast {:?} with {:?}",
                a.shape(),
                b.shape()
            )))
        }
    };
    Ok(Value::Tensor(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y))))
}

fn op_matmul(a: &ArrayD<f32>, b: &ArrayD<f32>) -> OpResult {
    let b = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("matmul rhs: {}", e)))?;
    let inner = *a.shape().last().unwrap_or(&0);
    if inner != b.nrows() {
        return Err(RuntimeError::ShapeError(format!(
            "incompatible matmul shapes: {:?} and {:?}",
            a.shape(),
            b.shape()
        )));
    }

    match a.ndim() {
        2 => {
            let a = a
                .view()
                .into_dimensionality::<Ix2>()
                .map_err(|e| RuntimeError::ShapeError(e.to_string()))?;
            Ok(Value::Tensor(a.dot(&b).into_dyn()))
        }
        3 => {
            let a = a
                .view()
                .into_dimensionality::<Ix3>()
                .map_err(|e| RuntimeError::ShapeError(e.to_string()))?;
            let (n, s, _) = a.dim();
            let mut out = Array3::<f32>::zeros((n, s, b.ncols()));
            for (i, slice) in a.outer_iter().enumerate() {
                out.index_axis_mut(Axis(0), i).assign(&slice.dot(&b));
            }
            Ok(Value::Tensor(out.into_dyn()))
        }
        d => Err(RuntimeError::ShapeError(format!("matmul of a rank-{} tensor", d))),
    }
}

/// `A·X` (or `Aᵀ·X`) with `A` sparse; accumulates stored entries in storage order.
fn op_sparse_matmul(adj: &CsMat<f32>, x: &ArrayD<f32>, transpose: bool) -> OpResult {
    let x = x
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("sparse matmul rhs: {}", e)))?;
    let (rows, cols) = adj.shape();
    let (out_rows, in_rows) = if transpose { (cols, rows) } else { (rows, cols) };
    if x.nrows() != in_rows {
        return Err(RuntimeError::ShapeError(format!(
            "sparse operator {}x{} cannot multiply {:?}",
            rows,
            cols,
            x.shape()
        )));
    }

    let mut out = Array2::<f32>::zeros((out_rows, x.ncols()));
    for (outer, vec) in adj.outer_iterator().enumerate() {
        for (inner, &v) in vec.iter() {
            let (i, j) = if adj.is_csr() { (outer, inner) } else { (inner, outer) };
            let (dst, src) = if transpose { (j, i) } else { (i, j) };
            out.row_mut(dst).scaled_add(v, &x.row(src));
        }
    }
    Ok(Value::Tensor(out.into_dyn()))
}

fn op_repeat(a: &ArrayD<f32>, axis: usize, times: usize) -> OpResult {
    check_axis(axis, a.ndim() + 1)?;
    let mut shape = a.shape().to_vec();
    shape.insert(axis, times);
    let expanded = a.view().insert_axis(Axis(axis));
    expanded
        .broadcast(IxDyn(&shape))
        .map(|view| Value::Tensor(view.to_owned()))
        .ok_or_else(|| RuntimeError::ShapeError(format!("cannot repeat {:?}", a.shape())))
}

fn op_reshape(a: &ArrayD<f32>, shape: &[usize]) -> OpResult {
    ArrayD::from_shape_vec(IxDyn(shape), a.iter().copied().collect())
        .map(Value::Tensor)
        .map_err(|e| RuntimeError::ShapeError(format!("reshape {:?} -> {:?}: {}", a.shape(), shape, e)))
}

fn op_reduce_sum_to(a: &ArrayD<f32>, target: &[usize]) -> OpResult {
    let mut out = a.clone();
    while out.ndim() > target.len() {
        out = out.sum_axis(Axis(0));
    }
    for (axis, &len) in target.iter().enumerate() {
        if len == 1 && out.shape()[axis] != 1 {
            out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    if out.shape() != target {
        return Err(RuntimeError::ShapeError(format!(
            "cannot reduce {:?} to {:?}",
            a.shape(),
            target
        )));
    }
    Ok(Value::Tensor(out))
}

fn op_gather(a: &ArrayD<f32>, index: &[usize]) -> OpResult {
    if a.ndim() == 0 {
        return Err(RuntimeError::ShapeError("gather from a scalar".to_string()));
    }
    let len = a.shape()[0];
    if let Some(&bad) = index.iter().find(|&&i| i >= len) {
        return Err(RuntimeError::IndexOutOfBounds { index: bad, len });
    }
    Ok(Value::Tensor(a.select(Axis(0), index)))
}

fn op_scatter_add(g: &ArrayD<f32>, index: &[usize], rows: usize) -> OpResult {
    if g.ndim() == 0 || g.shape()[0] != index.len() {
        return Err(RuntimeError::ShapeError(format!(
            "scatter of {:?} with {} indices",
            g.shape(),
            index.len()
        )));
    }
    let mut shape = g.shape().to_vec();
    shape[0] = rows;
    let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
    for (i, &dst) in index.iter().enumerate() {
        if dst >= rows {
            return Err(RuntimeError::IndexOutOfBounds { index: dst, len: rows });
        }
        let mut row = out.index_axis_mut(Axis(0), dst);
        row += &g.index_axis(Axis(0), i);
    }
    Ok(Value::Tensor(out))
}

fn logits_and_labels<'a>(
    logits: &'a ArrayD<f32>,
    labels: &[usize],
) -> Result<ndarray::ArrayView2<'a, f32>, RuntimeError> {
    let logits = logits
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("logits: {}", e)))?;
    if logits.nrows() != labels.len() {
        return Err(RuntimeError::ShapeError(format!(
            "{} logit rows for {} labels",
            logits.nrows(),
            labels.len()
        )));
    }
    let classes = logits.ncols();
    if let Some(&bad) = labels.iter().find(|&&c| c >= classes) {
        return Err(RuntimeError::IndexOutOfBounds {
            index: bad,
            len: classes,
        });
    }
    Ok(logits)
}

fn op_softmax_cross_entropy(logits: &ArrayD<f32>, labels: &[usize]) -> OpResult {
    let logits = logits_and_labels(logits, labels)?;
    let batch = labels.len();
    let mut total = 0.0f32;
    for (row, &label) in logits.outer_iter().zip(labels) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let log_sum_exp = row.fold(0.0f32, |s, &v| s + (v - max).exp()).ln() + max;
        total += log_sum_exp - row[label];
    }
    let mean = if batch == 0 { 0.0 } else { total / batch as f32 };
    Ok(Value::Tensor(ndarray::arr0(mean).into_dyn()))
}

fn op_softmax_cross_entropy_grad(logits: &ArrayD<f32>, labels: &[usize]) -> OpResult {
    let logits = logits_and_labels(logits, labels)?;
    let batch = labels.len().max(1) as f32;
    let mut out = logits.to_owned();
    for (mut row, &label) in out.outer_iter_mut().zip(labels) {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
        row[label] -= 1.0;
        row.mapv_inplace(|v| v / batch);
    }
    Ok(Value::Tensor(out.into_dyn()))
}
