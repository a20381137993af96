use log::debug;
use ndarray::{s, ArrayView2};

use crate::dataset::batch_ranges;
use crate::error::{Error, Result};
use crate::network::{argmax_rows, normalize_rows, Network};
use crate::objective::cross_entropy;

/// Classification counts and cross-entropy of a network on a labeled set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub correct: usize,
    pub misclassified: usize,
    /// Sum of the per-batch cross-entropies divided by the number of batches
    /// (not by the number of examples), so it depends on the batch count.
    pub cross_entropy: f64,
}

impl Evaluation {
    pub fn error_rate(&self) -> f64 {
        let total = self.correct + self.misclassified;
        if total == 0 {
            0.0
        } else {
            self.misclassified as f64 / total as f64
        }
    }
}

/// Evaluates `network` on `images`/`targets` in `num_batches` contiguous
/// batches. Batching only bounds memory; the counts do not depend on it.
pub fn batch_count_errors(
    network: &Network,
    images: ArrayView2<f64>,
    targets: ArrayView2<f64>,
    num_batches: usize,
) -> Result<Evaluation> {
    let rows = images.nrows();
    if targets.nrows() != rows {
        return Err(Error::ShapeMismatch {
            context: "evaluation targets",
            expected: vec![(rows, network.num_classes())],
            found: vec![targets.dim()],
        });
    }
    if num_batches == 0 || rows % num_batches != 0 {
        return Err(Error::BatchPartition {
            rows,
            batch_size: rows.checked_div(num_batches).unwrap_or(0),
        });
    }

    let mut correct = 0;
    let mut cross_entropy_sum = 0.0;
    for (batch, range) in batch_ranges(rows, rows / num_batches)?.into_iter().enumerate() {
        let images = images.slice(s![range.clone(), ..]);
        let targets = targets.slice(s![range, ..]);

        let predicted = normalize_rows(network.recognize(images))?;
        correct += argmax_rows(predicted.view())
            .into_iter()
            .zip(argmax_rows(targets))
            .filter(|(guess, label)| guess == label)
            .count();
        cross_entropy_sum += cross_entropy(predicted.view(), targets);
        debug!("evaluated batch {batch} of {num_batches}");
    }

    Ok(Evaluation {
        correct,
        misclassified: rows - correct,
        cross_entropy: cross_entropy_sum / num_batches as f64,
    })
}
