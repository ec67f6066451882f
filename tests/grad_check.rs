//! Integration test checking automatic differentiation against finite differences.

use rustyasg_dagnn::analysis::shape_inference::ShapeInference;
use rustyasg_dagnn::asg::{Asg, DType, NodeId, Value};
use rustyasg_dagnn::autograd::Gradients;
use rustyasg_dagnn::runtime::backend::{bind, Backend};
use rustyasg_dagnn::runtime::cpu_backend::CpuBackend;
use rustyasg_dagnn::tensor::{GraphContext, Tensor};

use ndarray::{ArrayD, IxDyn};
use sprs::TriMat;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const EPSILON: f32 = 1e-3;
const RTOL: f32 = 2e-2;
const ATOL: f32 = 2e-3;

/// Compares two tensors element-wise and panics if they are not close.
fn assert_grads_are_close(analytic: &ArrayD<f32>, numeric: &ArrayD<f32>) {
    assert_eq!(analytic.shape(), numeric.shape(), "Gradient shapes do not match!");

    for (a, n) in analytic.iter().zip(numeric.iter()) {
        let diff = (a - n).abs();
        let larger = a.abs().max(n.abs());
        if diff > ATOL + RTOL * larger {
            panic!(
                "Gradients do not match! Analytic: {:.6}, Numeric: {:.6}\nanalytic = {:?}\nnumeric = {:?}",
                a, n, analytic, numeric
            );
        }
    }
}

/// Builds `builder(x)` with `x` a parameter of the given shape, shape-checked.
fn build_graph(builder: fn(&Tensor) -> Tensor, shape: &[usize]) -> (Asg, NodeId, NodeId) {
    let context = Rc::new(RefCell::new(GraphContext::new()));
    let x = Tensor::new_parameter(&context, "x");
    let y = builder(&x);
    let mut graph = context.borrow().main_graph().clone();
    graph.set_output(y.node_id);
    let shapes = HashMap::from([("x".to_string(), (shape.to_vec(), DType::F32))]);
    ShapeInference::run(&mut graph, &shapes).unwrap();
    (graph, x.node_id, y.node_id)
}

fn scalar_of(values: &[Value]) -> f32 {
    match values.first() {
        Some(Value::Tensor(t)) => {
            assert_eq!(t.len(), 1, "Output for grad check must be a scalar");
            t.iter().copied().sum()
        }
        other => panic!("Result is not a tensor: {:?}", other),
    }
}

fn run_forward(backend: &CpuBackend, graph: &Asg, x: &ArrayD<f32>) -> f32 {
    let memo = bind(graph, HashMap::from([("x".to_string(), Value::Tensor(x.clone()))])).unwrap();
    let (outputs, _) = backend.run(graph, memo).unwrap();
    scalar_of(&backend.retrieve_data(&outputs).unwrap())
}

/// Gradient computed by the framework.
fn get_analytic_grad(builder: fn(&Tensor) -> Tensor, initial_x: &ArrayD<f32>) -> ArrayD<f32> {
    let backend = CpuBackend::new();
    let (graph, x_id, y_id) = build_graph(builder, initial_x.shape());
    let grad_graph = Gradients::new(&graph).build(y_id, &[x_id]).unwrap();

    let memo = bind(&graph, HashMap::from([("x".to_string(), Value::Tensor(initial_x.clone()))]))
        .unwrap();
    let (_, forward_memo) = backend.run(&graph, memo).unwrap();
    let (grad_outputs, _) = backend.run(&grad_graph, forward_memo).unwrap();
    match backend.retrieve_data(&grad_outputs).unwrap().remove(0) {
        Value::Tensor(grad) => grad,
        other => panic!("Gradient is not a tensor: {:?}", other),
    }
}

/// Central finite differences.
fn get_numeric_grad(builder: fn(&Tensor) -> Tensor, initial_x: &ArrayD<f32>) -> ArrayD<f32> {
    let backend = CpuBackend::new();
    let (graph, _, _) = build_graph(builder, initial_x.shape());
    let mut grad = ArrayD::zeros(initial_x.shape());
    for i in 0..initial_x.len() {
        let mut x_plus = initial_x.clone();
        x_plus.as_slice_mut().unwrap()[i] += EPSILON;
        let mut x_minus = initial_x.clone();
        x_minus.as_slice_mut().unwrap()[i] -= EPSILON;
        let y_plus = run_forward(&backend, &graph, &x_plus);
        let y_minus = run_forward(&backend, &graph, &x_minus);
        grad.as_slice_mut().unwrap()[i] = (y_plus - y_minus) / (2.0 * EPSILON);
    }
    grad
}

fn check(builder: fn(&Tensor) -> Tensor, x: ArrayD<f32>) {
    let analytic = get_analytic_grad(builder, &x);
    let numeric = get_numeric_grad(builder, &x);
    assert_grads_are_close(&analytic, &numeric);
}

fn matrix(rows: usize, cols: usize, values: &[f32]) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(&[rows, cols]), values.to_vec()).unwrap()
}

/// Row-normalized 3-node path with self loops.
fn adjacency(x: &Tensor) -> Tensor {
    let mut tri = TriMat::new((3, 3));
    for (i, j, w) in [
        (0, 0, 0.5f32),
        (0, 1, 0.5),
        (1, 0, 0.3),
        (1, 1, 0.4),
        (1, 2, 0.3),
        (2, 1, 0.6),
        (2, 2, 0.4),
    ] {
        tri.add_triplet(i, j, w);
    }
    Tensor::new_constant(&x.context, Value::Sparse(tri.to_csr()), "adj")
}

fn indices(x: &Tensor, idx: &[usize]) -> Tensor {
    Tensor::new_constant(&x.context, Value::Indices(idx.to_vec()), "index")
}

const X3X2: [f32; 6] = [0.3, -0.7, 1.1, 0.4, -0.2, 0.9];

#[test]
fn test_grad_multiply() {
    check(|x| (x * x).sum(), matrix(1, 3, &[1.0, 2.0, 3.0]));
}

#[test]
fn test_grad_broadcast_add_subtract() {
    check(
        |x| {
            let row = Tensor::new_literal(&x.context, matrix(1, 2, &[0.5, -1.5]), "row");
            let shifted = x + &row;
            (&(&shifted * &shifted) - x).sum()
        },
        matrix(3, 2, &X3X2),
    );
}

#[test]
fn test_grad_activations() {
    check(|x| x.sigmoid().sum(), matrix(3, 2, &X3X2));
    check(|x| (&x.tanh() * x).sum(), matrix(3, 2, &X3X2));
    check(|x| x.elu(1.0).sum(), matrix(3, 2, &X3X2));
    check(|x| (&x.relu() * x).sum(), matrix(3, 2, &X3X2));
}

#[test]
fn test_grad_sparse_propagation() {
    check(
        |x| {
            let adj = adjacency(x);
            x.propagate(&adj).propagate(&adj).tanh().sum()
        },
        matrix(3, 2, &X3X2),
    );
}

#[test]
fn test_grad_gather_with_duplicates() {
    check(
        |x| {
            let idx = indices(x, &[2, 0, 2]);
            x.gather(&idx).sigmoid().sum()
        },
        matrix(3, 2, &X3X2),
    );
}

#[test]
fn test_grad_adaptive_gate_wrt_representation() {
    check(
        |x| {
            let adj = adjacency(x);
            let stacked = Tensor::stack(&[x.clone(), x.propagate(&adj)], 1);
            let w = Tensor::new_literal(&x.context, matrix(2, 1, &[0.8, -0.6]), "w");
            let gates = stacked.dot(&w).sigmoid();
            let out = (&gates * &stacked).sum_axis(1);
            (&out * &out).sum()
        },
        matrix(3, 2, &X3X2),
    );
}

#[test]
fn test_grad_adaptive_gate_wrt_kernel() {
    check(
        |w| {
            let h = Tensor::new_literal(&w.context, matrix(3, 2, &X3X2), "h");
            let adj = adjacency(w);
            let stacked = Tensor::stack(&[h.clone(), h.propagate(&adj), h.propagate(&adj).propagate(&adj)], 1);
            let gates = stacked.dot(w).sigmoid();
            let out = (&gates * &stacked).sum_axis(1);
            (&out * &out).sum()
        },
        matrix(2, 1, &[0.8, -0.6]),
    );
}

#[test]
fn test_grad_softmax_cross_entropy() {
    check(
        |x| {
            let labels = indices(x, &[1, 0, 3]);
            x.softmax_cross_entropy(&labels)
        },
        matrix(3, 4, &[0.2, -0.4, 1.0, 0.1, 0.7, 0.3, -0.9, 0.5, -0.2, 0.6, 0.0, 1.3]),
    );
}

#[test]
fn test_grad_dense_with_l2() {
    check(
        |w| {
            let x = Tensor::new_literal(&w.context, matrix(3, 2, &X3X2), "features");
            let labels = indices(w, &[0, 2, 1]);
            let logits = x.dot(w);
            let strength = Tensor::scalar(&w.context, 5e-3);
            let l2 = &strength * &(w * w).sum();
            &logits.softmax_cross_entropy(&labels) + &l2
        },
        matrix(2, 3, &[0.1, -0.3, 0.5, 0.7, 0.2, -0.4]),
    );
}
