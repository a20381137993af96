//! Flattening of differently shaped parameter tensors into one vector.
//!
//! The optimizer only understands a single flat vector, so every tensor that
//! takes part in a minimization is laid end to end, each in column-major
//! order, in the order given. The shapes are remembered in a
//! [`ShapeManifest`] so the vector can be cut back into the same tensors.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ShapeBuilder};

use crate::error::{Error, Result};

/// Ordered `(rows, cols)` of every tensor in a flat parameter vector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeManifest {
    shapes: Vec<(usize, usize)>,
}

impl ShapeManifest {
    pub fn new(shapes: Vec<(usize, usize)>) -> Self {
        ShapeManifest { shapes }
    }

    pub fn of(tensors: &[ArrayView2<f64>]) -> Self {
        ShapeManifest {
            shapes: tensors.iter().map(ArrayView2::dim).collect(),
        }
    }

    pub fn shapes(&self) -> &[(usize, usize)] {
        &self.shapes
    }

    /// Total number of scalars across every tensor.
    pub fn num_elements(&self) -> usize {
        self.shapes.iter().map(|(rows, cols)| rows * cols).sum()
    }
}

/// Lossless flatten / unflatten against one immutable manifest.
#[derive(Clone, Debug)]
pub struct ParameterCodec {
    manifest: ShapeManifest,
}

impl ParameterCodec {
    pub fn new(manifest: ShapeManifest) -> Self {
        ParameterCodec { manifest }
    }

    /// Builds a codec whose manifest is taken from `tensors` and flattens them in one go.
    pub fn encode(tensors: &[ArrayView2<f64>]) -> (Self, Array1<f64>) {
        let codec = ParameterCodec::new(ShapeManifest::of(tensors));
        let flat = concat_column_major(tensors, codec.manifest.num_elements());
        (codec, flat)
    }

    pub fn manifest(&self) -> &ShapeManifest {
        &self.manifest
    }

    pub fn flatten(&self, tensors: &[ArrayView2<f64>]) -> Result<Array1<f64>> {
        let found = ShapeManifest::of(tensors);
        if found != self.manifest {
            return Err(Error::ShapeMismatch {
                context: "parameter flatten",
                expected: self.manifest.shapes.clone(),
                found: found.shapes,
            });
        }
        Ok(concat_column_major(tensors, self.manifest.num_elements()))
    }

    pub fn unflatten(&self, flat: ArrayView1<f64>) -> Result<Vec<Array2<f64>>> {
        let expected = self.manifest.num_elements();
        if flat.len() != expected {
            return Err(Error::LengthMismatch {
                expected,
                found: flat.len(),
            });
        }

        let mut start = 0;
        let mut tensors = Vec::with_capacity(self.manifest.shapes.len());
        for &(rows, cols) in &self.manifest.shapes {
            let stop = start + rows * cols;
            let data = flat.slice(ndarray::s![start..stop]).to_vec();
            let tensor = Array2::from_shape_vec((rows, cols).f(), data).map_err(|_| {
                Error::LengthMismatch {
                    expected: rows * cols,
                    found: stop - start,
                }
            })?;
            tensors.push(tensor.as_standard_layout().into_owned());
            start = stop;
        }
        Ok(tensors)
    }
}

fn concat_column_major(tensors: &[ArrayView2<f64>], capacity: usize) -> Array1<f64> {
    let mut flat = Vec::with_capacity(capacity);
    for tensor in tensors {
        // rows of the transpose are the columns of the tensor
        flat.extend(tensor.t().iter().copied());
    }
    Array1::from(flat)
}
