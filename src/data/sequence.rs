// --- File: src/data/sequence.rs ---

//! Full-batch node sequence: every epoch is one batch holding the whole
//! feature matrix, the adjacency operator and the node index set.

use sprs::CsMat;
use ndarray::Array2;
use std::rc::Rc;

/// One batch of node classification data: `(features, adjacency, index) -> labels`.
#[derive(Debug, Clone)]
pub struct NodeBatch {
    /// Normalized node attributes, shared with the model.
    pub features: Rc<Array2<f32>>,
    /// Normalized adjacency operator, shared with the model.
    pub adjacency: Rc<CsMat<f32>>,
    /// Nodes the loss is computed on, in order, duplicates allowed.
    pub index: Vec<usize>,
    /// `labels[i]` is the class of `index[i]`.
    pub labels: Vec<usize>,
}

impl NodeBatch {
    pub fn new(
        features: Rc<Array2<f32>>,
        adjacency: Rc<CsMat<f32>>,
        index: Vec<usize>,
        labels: Vec<usize>,
    ) -> Self {
        Self {
            features,
            adjacency,
            index,
            labels,
        }
    }

    /// Number of indexed nodes.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

/// Sequence yielding a single full-graph [`NodeBatch`].
#[derive(Debug, Clone)]
pub struct FullBatchNodeSequence {
    batch: NodeBatch,
}

impl FullBatchNodeSequence {
    pub fn new(batch: NodeBatch) -> Self {
        Self { batch }
    }

    /// Number of batches per epoch, always 1.
    pub fn len(&self) -> usize {
        1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn get(&self, i: usize) -> Option<&NodeBatch> {
        (i == 0).then_some(&self.batch)
    }

    pub fn iter(&self) -> std::iter::Once<&NodeBatch> {
        std::iter::once(&self.batch)
    }
}

impl<'a> IntoIterator for &'a FullBatchNodeSequence {
    type Item = &'a NodeBatch;
    type IntoIter = std::iter::Once<&'a NodeBatch>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sprs::TriMat;

    #[test]
    fn yields_exactly_one_batch() {
        let mut tri = TriMat::new((2, 2));
        tri.add_triplet(0, 1, 1.0f32);
        let batch = NodeBatch::new(
            Rc::new(Array2::zeros((2, 3))),
            Rc::new(tri.to_csr()),
            vec![1, 1, 0],
            vec![2, 2, 0],
        );
        let seq = FullBatchNodeSequence::new(batch);
        assert_eq!(seq.len(), 1);
        assert!(seq.get(1).is_none());
        let batches: Vec<_> = seq.iter().collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
        assert_eq!(batches[0].labels, vec![2, 2, 0]);
    }
}
