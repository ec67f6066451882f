//! End-to-end tests of the DAGNN node classifier on a small two-community graph.

use ndarray::Array2;
use rustyasg_dagnn::config::{BuildConfig, LayerOption, ModelConfig};
use rustyasg_dagnn::data::NodeBatch;
use rustyasg_dagnn::graph::Graph;
use rustyasg_dagnn::models::{Dagnn, SemiSupervisedModel};
use rustyasg_dagnn::DagnnError;
use std::rc::Rc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Two 4-cliques joined by a single edge. Nodes 0..4 are class 0, 4..8 class 1.
fn toy_graph() -> Graph {
    let mut edges = Vec::new();
    for block in [0usize, 4] {
        for i in block..block + 4 {
            for j in block..block + 4 {
                if i != j {
                    edges.push((i, j, 1.0));
                }
            }
        }
    }
    edges.push((3, 4, 1.0));
    edges.push((4, 3, 1.0));

    let features = Array2::from_shape_fn((8, 4), |(i, j)| {
        let class = i / 4;
        let signal = if j % 2 == class { 1.0 } else { 0.0 };
        signal + 0.1 * ((i * 7 + j * 3) % 5) as f32
    });
    let labels = (0..8).map(|i| i / 4).collect();
    Graph::from_edges(8, &edges, features, labels).unwrap()
}

fn model_config(k: usize, seed: u64) -> ModelConfig {
    ModelConfig {
        k,
        seed: Some(seed),
        ..ModelConfig::default()
    }
}

fn build_config(dropout: f32) -> BuildConfig {
    BuildConfig {
        hiddens: LayerOption::One(16),
        activations: LayerOption::One("relu".to_string()),
        dropouts: LayerOption::One(dropout),
        l2_norms: LayerOption::One(5e-4),
        lr: 0.05,
        use_bias: false,
    }
}

fn built_model(dropout: f32, seed: u64) -> Dagnn {
    let mut model = Dagnn::new(toy_graph(), model_config(3, seed)).unwrap();
    model.build(&build_config(dropout)).unwrap();
    model
}

#[test]
fn predict_returns_one_row_per_index_in_order() {
    init_logging();
    let mut model = built_model(0.5, 1);
    let all = model.predict(&(0..8).collect::<Vec<_>>()).unwrap();
    assert_eq!(all.shape(), &[8, 2]);

    let picked = model.predict(&[5, 0, 5]).unwrap();
    assert_eq!(picked.shape(), &[3, 2]);
    for (row, &node) in [5usize, 0, 5].iter().enumerate() {
        for c in 0..2 {
            assert!((picked[[row, c]] - all[[node, c]]).abs() < 1e-6);
        }
    }
}

#[test]
fn prediction_ignores_dropout() {
    let mut model = built_model(0.5, 2);
    let first = model.predict(&[0, 1, 2]).unwrap();
    let second = model.predict(&[0, 1, 2]).unwrap();
    assert_eq!(first, second);
}

#[test]
fn out_of_range_index_is_rejected() {
    let mut model = built_model(0.0, 3);
    let err = model.predict(&[1, 8]).unwrap_err();
    assert!(matches!(
        err,
        DagnnError::Index {
            index: 8,
            node_count: 8
        }
    ));
    assert!(matches!(
        model.train_sequence(&[42]),
        Err(DagnnError::Index { index: 42, .. })
    ));
}

#[test]
fn predicting_before_build_fails() {
    let mut model = Dagnn::new(toy_graph(), model_config(2, 4)).unwrap();
    assert!(!model.is_built());
    assert!(matches!(model.predict(&[0]), Err(DagnnError::NotBuilt)));
    assert!(matches!(model.parameters(), Err(DagnnError::NotBuilt)));
}

#[test]
fn zero_propagation_steps_are_rejected() {
    let err = Dagnn::new(toy_graph(), model_config(0, 5)).err().unwrap();
    assert!(matches!(err, DagnnError::Configuration(_)));
}

#[test]
fn irreconcilable_layer_lists_are_rejected() {
    let mut model = Dagnn::new(toy_graph(), model_config(2, 6)).unwrap();
    let config = BuildConfig {
        hiddens: LayerOption::Many(vec![16, 8]),
        dropouts: LayerOption::Many(vec![0.1, 0.2, 0.3]),
        ..build_config(0.0)
    };
    assert!(matches!(
        model.build(&config),
        Err(DagnnError::Configuration(_))
    ));
    assert!(!model.is_built());
}

#[test]
fn build_creates_named_parameters() {
    let model = built_model(0.0, 7);
    let params = model.parameters().unwrap();
    let mut names: Vec<_> = params.keys().cloned().collect();
    names.sort();
    assert_eq!(
        names,
        vec!["dagnn_conv.kernel", "dense_0.kernel", "dense_out.kernel"]
    );
    assert_eq!(params["dense_0.kernel"].shape(), vec![4, 16]);
    assert_eq!(params["dense_out.kernel"].shape(), vec![16, 2]);
    assert_eq!(params["dagnn_conv.kernel"].shape(), vec![2, 1]);
}

#[test]
fn preprocessing_adds_self_loops() {
    let model = Dagnn::new(toy_graph(), model_config(2, 8)).unwrap();
    let adj = model.adjacency();
    for i in 0..8 {
        assert!(adj.get(i, i).copied().unwrap_or(0.0) > 0.0);
    }

    let raw = ModelConfig {
        norm_adj: 0.0,
        ..model_config(2, 8)
    };
    let model = Dagnn::new(toy_graph(), raw).unwrap();
    assert_eq!(model.adjacency().get(0, 0), None);
}

#[test]
fn training_reduces_the_loss() {
    init_logging();
    let mut model = built_model(0.0, 9);
    let sequence = model.train_sequence(&[0, 1, 6, 7]).unwrap();
    let history = model.fit(&sequence, 40).unwrap();
    assert_eq!(history.len(), 40);
    assert_eq!(history[0].epoch, 1);

    let first = history[0].loss;
    let last = history[history.len() - 1].loss;
    assert!(last < first, "loss went from {} to {}", first, last);

    let result = model.test(&[2, 3, 4, 5]).unwrap();
    assert!(result.loss.is_finite());
    assert!((0.0..=1.0).contains(&result.accuracy));
}

#[test]
fn same_seed_gives_same_model() {
    let train = [0usize, 1, 6, 7];
    let mut a = built_model(0.5, 11);
    let mut b = built_model(0.5, 11);
    for model in [&mut a, &mut b] {
        let sequence = model.train_sequence(&train).unwrap();
        model.fit(&sequence, 3).unwrap();
    }
    assert_eq!(a.predict(&[0, 4]).unwrap(), b.predict(&[0, 4]).unwrap());
}

#[test]
fn set_parameter_checks_the_shape() {
    let mut model = built_model(0.0, 12);
    let err = model
        .set_parameter("dagnn_conv.kernel", ndarray::ArrayD::zeros(vec![3, 1]))
        .unwrap_err();
    assert!(matches!(err, DagnnError::Shape(_)));
    model
        .set_parameter("dagnn_conv.kernel", ndarray::ArrayD::zeros(vec![2, 1]))
        .unwrap();
}

#[test]
fn reshaped_batch_fails_shape_check_even_after_training() {
    let mut model = built_model(0.0, 13);
    let adjacency = Rc::new(model.adjacency().clone());
    let wide = Rc::new(Array2::<f32>::ones((8, 5)));
    let bad = NodeBatch::new(wide, adjacency, vec![0, 7], vec![0, 1]);

    assert!(matches!(
        model.train_on_batch(&bad),
        Err(DagnnError::Shape(_))
    ));

    let good = model.train_sequence(&[0, 7]).unwrap();
    model.fit(&good, 1).unwrap();

    let err = model.train_on_batch(&bad).unwrap_err();
    assert!(matches!(err, DagnnError::Shape(_)), "got {:?}", err);
}
