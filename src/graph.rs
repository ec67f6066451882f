//! Attributed, labeled graph and its preprocessing.
//!
//! [`normalize_adj`] produces the diffusion operator the propagation layer
//! multiplies by; [`normalize_x`] rescales the node attribute matrix.

use crate::error::{DagnnError, Result};
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMat};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Sparse adjacency, dense node attributes and one class label per node.
#[derive(Debug, Clone)]
pub struct Graph {
    adjacency: CsMat<f32>,
    features: Array2<f32>,
    labels: Vec<usize>,
}

impl Graph {
    /// Validates that the adjacency is square, has one row per feature row,
    /// carries no negative weight, and that there is one label per node.
    pub fn new(adjacency: CsMat<f32>, features: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        let (rows, cols) = adjacency.shape();
        if rows != cols {
            return Err(DagnnError::Shape(format!(
                "adjacency matrix must be square, got {}x{}",
                rows, cols
            )));
        }
        if features.nrows() != rows {
            return Err(DagnnError::Shape(format!(
                "feature matrix has {} rows but the adjacency has {} nodes",
                features.nrows(),
                rows
            )));
        }
        if labels.len() != rows {
            return Err(DagnnError::Shape(format!(
                "{} labels for {} nodes",
                labels.len(),
                rows
            )));
        }
        if adjacency.data().iter().any(|&w| w < 0.0 || !w.is_finite()) {
            return Err(DagnnError::Configuration(
                "adjacency weights must be finite and nonnegative".to_string(),
            ));
        }
        let adjacency = if adjacency.is_csr() {
            adjacency
        } else {
            adjacency.to_other_storage()
        };
        Ok(Self {
            adjacency,
            features,
            labels,
        })
    }

    /// Builds the adjacency from an edge list. Duplicate edges add up.
    pub fn from_edges(
        num_nodes: usize,
        edges: &[(usize, usize, f32)],
        features: Array2<f32>,
        labels: Vec<usize>,
    ) -> Result<Self> {
        let mut tri = TriMat::with_capacity((num_nodes, num_nodes), edges.len());
        for &(src, dst, weight) in edges {
            for node in [src, dst] {
                if node >= num_nodes {
                    return Err(DagnnError::Index {
                        index: node,
                        node_count: num_nodes,
                    });
                }
            }
            tri.add_triplet(src, dst, weight);
        }
        Self::new(tri.to_csr(), features, labels)
    }

    pub fn adjacency(&self) -> &CsMat<f32> {
        &self.adjacency
    }

    pub fn features(&self) -> &Array2<f32> {
        &self.features
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn num_nodes(&self) -> usize {
        self.features.nrows()
    }

    pub fn num_attrs(&self) -> usize {
        self.features.ncols()
    }

    /// `max(label) + 1`, zero for an empty graph.
    pub fn num_classes(&self) -> usize {
        self.labels.iter().max().map_or(0, |&c| c + 1)
    }
}

/// JSON form of a graph plus its train/test split, as read by the CLI.
///
/// ```json
/// { "num_nodes": 3, "edges": [[0, 1], [1, 2]], "undirected": true,
///   "features": [[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]], "labels": [0, 1, 1],
///   "train_index": [0, 1], "test_index": [2] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphData {
    pub num_nodes: usize,
    pub edges: Vec<(usize, usize)>,
    /// One weight per edge, 1.0 for all edges when absent.
    #[serde(default)]
    pub weights: Option<Vec<f32>>,
    /// Adds the reverse of every edge.
    #[serde(default)]
    pub undirected: bool,
    pub features: Vec<Vec<f32>>,
    pub labels: Vec<usize>,
    #[serde(default)]
    pub train_index: Vec<usize>,
    #[serde(default)]
    pub test_index: Vec<usize>,
}

impl GraphData {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_graph(&self) -> Result<Graph> {
        let weights = match &self.weights {
            Some(w) if w.len() != self.edges.len() => {
                return Err(DagnnError::Configuration(format!(
                    "{} weights for {} edges",
                    w.len(),
                    self.edges.len()
                )))
            }
            Some(w) => w.clone(),
            None => vec![1.0; self.edges.len()],
        };

        let mut edges = Vec::with_capacity(self.edges.len() * 2);
        for (&(src, dst), &w) in self.edges.iter().zip(&weights) {
            edges.push((src, dst, w));
            if self.undirected && src != dst {
                edges.push((dst, src, w));
            }
        }

        let num_attrs = self.features.first().map_or(0, Vec::len);
        if self.features.iter().any(|row| row.len() != num_attrs) {
            return Err(DagnnError::Shape(
                "feature rows have different lengths".to_string(),
            ));
        }
        let flat: Vec<f32> = self.features.iter().flatten().copied().collect();
        let features = Array2::from_shape_vec((self.features.len(), num_attrs), flat)
            .map_err(|e| DagnnError::Shape(e.to_string()))?;

        Graph::from_edges(self.num_nodes, &edges, features, self.labels.clone())
    }
}

/// `D^r (A + I) D^r`, with `D` the degree matrix of `A + I` and `r = rate`.
///
/// A self loop of weight 1.0 is added to every node before the degrees are
/// computed. Nodes with zero degree get a zero scale.
pub fn normalize_adj(adj: &CsMat<f32>, rate: f32) -> CsMat<f32> {
    let n = adj.rows();
    let mut tri = TriMat::with_capacity((n, adj.cols()), adj.nnz() + n);
    for (&w, (i, j)) in adj.iter() {
        tri.add_triplet(i, j, w);
    }
    for i in 0..n.min(adj.cols()) {
        tri.add_triplet(i, i, 1.0);
    }
    let with_loops: CsMat<f32> = tri.to_csr();

    let scale: Vec<f32> = with_loops
        .outer_iterator()
        .map(|row| {
            let degree: f32 = row.data().iter().sum();
            let d = degree.powf(rate);
            if d.is_finite() {
                d
            } else {
                0.0
            }
        })
        .collect();

    let mut out = TriMat::with_capacity(with_loops.shape(), with_loops.nnz());
    for (&w, (i, j)) in with_loops.iter() {
        let sj = scale.get(j).copied().unwrap_or(0.0);
        out.add_triplet(i, j, scale[i] * w * sj);
    }
    log::debug!(
        "normalized adjacency: {} nodes, {} stored entries, rate {}",
        n,
        with_loops.nnz(),
        rate
    );
    out.to_csr()
}

/// Node attribute normalization schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormX {
    /// Each row divided by its L1 norm.
    #[serde(rename = "l1")]
    L1,
    /// Each column divided by its L1 norm.
    #[serde(rename = "l1_0")]
    L1Axis0,
    /// Columns standardized to zero mean and unit variance.
    #[serde(rename = "scale")]
    Scale,
    /// Columns centered on the median and divided by the interquartile range.
    #[serde(rename = "robust_scale")]
    RobustScale,
}

impl FromStr for NormX {
    type Err = DagnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "l1" => Ok(NormX::L1),
            "l1_0" => Ok(NormX::L1Axis0),
            "scale" => Ok(NormX::Scale),
            "robust_scale" => Ok(NormX::RobustScale),
            other => Err(DagnnError::Configuration(format!(
                "'{}' is not a supported feature normalization",
                other
            ))),
        }
    }
}

impl fmt::Display for NormX {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NormX::L1 => "l1",
            NormX::L1Axis0 => "l1_0",
            NormX::Scale => "scale",
            NormX::RobustScale => "robust_scale",
        })
    }
}

/// Returns a normalized copy of `x`.
pub fn normalize_x(x: &Array2<f32>, norm: NormX) -> Array2<f32> {
    let mut out = x.clone();
    match norm {
        NormX::L1 => l1_normalize_lanes(&mut out, Axis(0)),
        NormX::L1Axis0 => l1_normalize_lanes(&mut out, Axis(1)),
        NormX::Scale => {
            for mut column in out.columns_mut() {
                let n = column.len().max(1) as f32;
                let mean = column.sum() / n;
                let var = column.fold(0.0, |acc, &v| acc + (v - mean) * (v - mean)) / n;
                let std = if var > 0.0 { var.sqrt() } else { 1.0 };
                column.mapv_inplace(|v| (v - mean) / std);
            }
        }
        NormX::RobustScale => {
            for mut column in out.columns_mut() {
                let (median, iqr) = median_and_iqr(column.view());
                let scale = if iqr > 0.0 { iqr } else { 1.0 };
                column.mapv_inplace(|v| (v - median) / scale);
            }
        }
    }
    log::debug!("normalized node attributes with '{}'", norm);
    out
}

/// Divides every lane (a row for `Axis(0)`, a column for `Axis(1)`) by its
/// L1 norm. Lanes summing to zero are left untouched.
fn l1_normalize_lanes(x: &mut Array2<f32>, outer: Axis) {
    for mut lane in x.axis_iter_mut(outer) {
        let norm = lane.fold(0.0f32, |acc, v| acc + v.abs());
        if norm > 0.0 {
            lane.mapv_inplace(|v| v / norm);
        }
    }
}

fn median_and_iqr(values: ArrayView1<f32>) -> (f32, f32) {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = percentile(&sorted, 0.5);
    (median, percentile(&sorted, 0.75) - percentile(&sorted, 0.25))
}

/// Linear-interpolated percentile of a sorted slice.
fn percentile(sorted: &[f32], p: f32) -> f32 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let pos = p * (n - 1) as f32;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            let frac = pos - lo as f32;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}
