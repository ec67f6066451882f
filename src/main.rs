//  src/main.rs
//! Trains a DAGNN node classifier on a graph given as JSON and reports
//! its accuracy on the test nodes.

use clap::Parser;
use rustyasg_dagnn::config::{BuildConfig, ModelConfig};
use rustyasg_dagnn::graph::{GraphData, NormX};
use rustyasg_dagnn::models::{Dagnn, SemiSupervisedModel};
use std::path::PathBuf;
use std::time::Instant;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "DAGNN: deep adaptive graph neural network", long_about = None)]
struct Args {
    /// Graph JSON: num_nodes, edges, features, labels, train_index, test_index
    #[arg(long)]
    graph: PathBuf,

    /// Build options JSON (hiddens, activations, dropouts, l2_norms, lr, use_bias)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Propagation steps
    #[arg(short, long, default_value_t = 10)]
    k: usize,

    #[arg(long, default_value_t = 100)]
    epochs: usize,

    #[arg(long)]
    seed: Option<u64>,

    /// Feature normalization: l1, l1_0, scale or robust_scale
    #[arg(long)]
    norm_x: Option<NormX>,

    /// Exponent of the adjacency normalization, 0 to disable
    #[arg(long, default_value_t = -0.5, allow_hyphen_values = true)]
    norm_adj: f32,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let data = GraphData::from_json_file(&args.graph)?;
    let build_config = match &args.config {
        Some(path) => BuildConfig::from_json_file(path)?,
        None => BuildConfig::default(),
    };
    let model_config = ModelConfig {
        norm_adj: args.norm_adj,
        norm_x: args.norm_x,
        k: args.k,
        seed: args.seed,
        ..ModelConfig::default()
    };

    let mut model = Dagnn::new(data.to_graph()?, model_config)?;
    model.build(&build_config)?;

    let sequence = model.train_sequence(&data.train_index)?;
    let start = Instant::now();
    let history = model.fit(&sequence, args.epochs)?;
    if let Some(last) = history.last() {
        log::info!(
            "trained {} epochs in {:.2?}: loss {:.4}, train accuracy {:.4}",
            args.epochs,
            start.elapsed(),
            last.loss,
            last.accuracy
        );
    }

    if data.test_index.is_empty() {
        log::warn!("no test nodes given, skipping evaluation");
    } else {
        let result = model.test(&data.test_index)?;
        println!(
            "test loss {:.4}, test accuracy {:.4} on {} nodes",
            result.loss,
            result.accuracy,
            data.test_index.len()
        );
    }
    Ok(())
}
