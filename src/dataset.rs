use std::ops::Range;

use ndarray::{s, Array2, ArrayView2, Axis};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::error::{Error, Result};

/// Unit-scaled images with their one-hot targets, row-aligned.
#[derive(Clone, Debug, PartialEq)]
pub struct Dataset {
    pub images: Array2<f64>,  // (n, pixels)
    pub targets: Array2<f64>, // (n, classes)
}

impl Dataset {
    pub fn new(images: Array2<f64>, targets: Array2<f64>) -> Result<Self> {
        if images.nrows() != targets.nrows() {
            return Err(Error::ShapeMismatch {
                context: "dataset rows",
                expected: vec![images.dim()],
                found: vec![targets.dim()],
            });
        }
        Ok(Dataset { images, targets })
    }

    pub fn len(&self) -> usize {
        self.images.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch(&self, rows: Range<usize>) -> (ArrayView2<f64>, ArrayView2<f64>) {
        (
            self.images.slice(s![rows.clone(), ..]),
            self.targets.slice(s![rows, ..]),
        )
    }

    /// Applies one seeded row permutation to images and targets together.
    pub fn shuffled(self, seed: u64) -> Self {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(&mut StdRng::seed_from_u64(seed));
        Dataset {
            images: self.images.select(Axis(0), &order),
            targets: self.targets.select(Axis(0), &order),
        }
    }
}

/// Contiguous, non-overlapping row ranges covering `0..rows` exactly.
pub fn batch_ranges(rows: usize, batch_size: usize) -> Result<Vec<Range<usize>>> {
    if batch_size == 0 || rows % batch_size != 0 {
        return Err(Error::BatchPartition { rows, batch_size });
    }
    Ok((0..rows / batch_size)
        .map(|batch| batch * batch_size..(batch + 1) * batch_size)
        .collect())
}
