// --- File: src/metrics/classification.rs ---

//! Classification metrics.

use super::Metric;
use ndarray::{Array2, ArrayView1};

/// Fraction of rows whose argmax logit equals the class label.
#[derive(Debug, Clone, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Index of the largest element; the first one wins ties, NaNs never win.
pub fn argmax(row: ArrayView1<f32>) -> usize {
    let mut best = 0;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in row.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best
}

impl Metric for Accuracy {
    type Prediction = Array2<f32>;
    type Target = Vec<usize>;
    type Output = f64;

    fn update(&mut self, predictions: &Self::Prediction, targets: &Self::Target) {
        for (row, &target) in predictions.outer_iter().zip(targets) {
            if argmax(row) == target {
                self.correct += 1;
            }
            self.total += 1;
        }
    }

    fn compute(&self) -> Self::Output {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }

    fn name(&self) -> &str {
        "accuracy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn counts_argmax_hits() {
        let logits = array![[0.1f32, 2.0, -1.0], [3.0, 0.0, 0.0], [0.0, 0.0, 5.0]];
        let mut acc = Accuracy::new();
        acc.update(&logits, &vec![1, 2, 2]);
        assert!((acc.compute() - 2.0 / 3.0).abs() < 1e-12);
        acc.reset();
        assert_eq!(acc.compute(), 0.0);
    }

    #[test]
    fn argmax_prefers_the_first_maximum() {
        assert_eq!(argmax(array![1.0f32, 3.0, 3.0].view()), 1);
        assert_eq!(argmax(array![f32::NAN, -1.0].view()), 1);
    }
}
