use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Error, Result};

/*  Sizing Notation:
   m - number of rows (examples) in a batch
   v - visible width of a layer (units below its weights)
   h - hidden width of a layer  (units above its weights)
   The hidden units of layer l are the visible units of layer l + 1.
*/

/// One weight matrix with the biases of the units on either side of it.
#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub weights: Array2<f64>,      // (v, h)
    pub hidden_bias: Array1<f64>,  // (h)
    pub visible_bias: Array1<f64>, // (v)
}

impl Layer {
    pub fn num_visible(&self) -> usize {
        self.weights.nrows()
    }

    pub fn num_hidden(&self) -> usize {
        self.weights.ncols()
    }

    fn check(&self) -> Result<()> {
        let (v, h) = self.weights.dim();
        if self.hidden_bias.len() != h || self.visible_bias.len() != v {
            return Err(Error::ShapeMismatch {
                context: "layer biases",
                expected: vec![(1, h), (1, v)],
                found: vec![(1, self.hidden_bias.len()), (1, self.visible_bias.len())],
            });
        }
        Ok(())
    }
}

/// A stack of layers used bottom-up as a classifier and layer-wise as RBMs.
///
/// Every layer below the top is a logistic layer; the top layer produces
/// unnormalized `exp` scores, one column per class.
#[derive(Clone, Debug, PartialEq)]
pub struct Network {
    layers: Vec<Layer>,
}

impl Network {
    /// Random network over `widths` (input width first, class count last).
    ///
    /// Weights are drawn from `0.1 * N(0, 1)`. RBM layers start with zero
    /// biases, the classification layer with `0.1 * N(0, 1)` biases.
    ///
    /// Panics if fewer than two widths are given.
    pub fn random<R: Rng + ?Sized>(widths: &[usize], rng: &mut R) -> Self {
        assert!(widths.len() >= 2, "a network needs an input and an output width");
        let num_layers = widths.len() - 1;
        let mut normal = || 0.1 * rng.sample::<f64, _>(StandardNormal);

        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(index, dims)| {
                let (v, h) = (dims[0], dims[1]);
                let weights = Array2::from_shape_simple_fn((v, h), &mut normal);
                let (hidden_bias, visible_bias) = if index + 1 == num_layers {
                    (
                        Array1::from_shape_simple_fn(h, &mut normal),
                        Array1::from_shape_simple_fn(v, &mut normal),
                    )
                } else {
                    (Array1::zeros(h), Array1::zeros(v))
                };
                Layer {
                    weights,
                    hidden_bias,
                    visible_bias,
                }
            })
            .collect();

        Network { layers }
    }

    pub fn from_layers(layers: Vec<Layer>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::ShapeMismatch {
                context: "network layers",
                expected: vec![],
                found: vec![],
            });
        }
        for layer in &layers {
            layer.check()?;
        }
        for (index, pair) in layers.windows(2).enumerate() {
            if pair[0].num_hidden() != pair[1].num_visible() {
                return Err(Error::LayerWidthMismatch {
                    layer: index,
                    hidden: pair[0].num_hidden(),
                    visible: pair[1].num_visible(),
                });
            }
        }
        Ok(Network { layers })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, index: usize) -> &Layer {
        &self.layers[index]
    }

    pub fn layer_mut(&mut self, index: usize) -> &mut Layer {
        &mut self.layers[index]
    }

    pub fn top_layer(&self) -> usize {
        self.layers.len() - 1
    }

    pub fn num_classes(&self) -> usize {
        self.layers[self.top_layer()].num_hidden()
    }

    /// Input width followed by each layer's hidden width.
    pub fn widths(&self) -> Vec<usize> {
        std::iter::once(self.layers[0].num_visible())
            .chain(self.layers.iter().map(Layer::num_hidden))
            .collect()
    }

    /// Bottom-up transform of one layer: `(m, v) -> (m, h)`.
    ///
    /// Logistic for every layer but the top, which returns `exp` scores that
    /// still need [`normalize_rows`] before they are probabilities.
    pub fn up(&self, layer: usize, visible: ArrayView2<f64>) -> Array2<f64> {
        let Layer {
            weights,
            hidden_bias,
            ..
        } = &self.layers[layer];
        let activation = visible.dot(weights) + hidden_bias;
        if layer == self.top_layer() {
            activation.mapv_into(f64::exp)
        } else {
            activation.mapv_into(sigmoid)
        }
    }

    /// Top-down transform of one layer: `(m, h) -> (m, v)`.
    pub fn down(&self, layer: usize, hidden: ArrayView2<f64>) -> Array2<f64> {
        let Layer {
            weights,
            visible_bias,
            ..
        } = &self.layers[layer];
        (hidden.dot(&weights.t()) + visible_bias).mapv_into(sigmoid)
    }

    /// Runs `up` through every layer; the result is unnormalized class scores.
    pub fn recognize(&self, input: ArrayView2<f64>) -> Array2<f64> {
        let features = self.hidden_features(input);
        self.up(self.top_layer(), features.view())
    }

    /// Runs `up` through every layer except the classification layer.
    pub fn hidden_features(&self, input: ArrayView2<f64>) -> Array2<f64> {
        let mut activation = input.to_owned();
        for layer in 0..self.top_layer() {
            activation = self.up(layer, activation.view());
        }
        activation
    }

    /// `W_l`, `hB_l`, `vB_l` for every layer, biases as `(1, n)` rows.
    pub fn to_named_tensors(&self) -> BTreeMap<String, Array2<f64>> {
        let mut tensors = BTreeMap::new();
        for (index, layer) in self.layers.iter().enumerate() {
            tensors.insert(format!("W_{index}"), layer.weights.clone());
            tensors.insert(format!("hB_{index}"), as_row(&layer.hidden_bias));
            tensors.insert(format!("vB_{index}"), as_row(&layer.visible_bias));
        }
        tensors
    }

    /// Inverse of [`Network::to_named_tensors`]; layers are read from `W_0` upward
    /// until no further weight matrix is present. Any tensor left over is an error.
    pub fn from_named_tensors(mut tensors: BTreeMap<String, Array2<f64>>) -> Result<Self> {
        let mut layers = Vec::new();
        while let Some(weights) = tensors.remove(&format!("W_{}", layers.len())) {
            let index = layers.len();
            let mut bias = |name: String| -> Result<Array1<f64>> {
                let row = tensors.remove(&name).ok_or(Error::MissingTensor(name))?;
                if row.nrows() != 1 {
                    return Err(Error::ShapeMismatch {
                        context: "bias row",
                        expected: vec![(1, row.ncols())],
                        found: vec![row.dim()],
                    });
                }
                Ok(row.index_axis_move(Axis(0), 0))
            };
            let hidden_bias = bias(format!("hB_{index}"))?;
            let visible_bias = bias(format!("vB_{index}"))?;
            layers.push(Layer {
                weights,
                hidden_bias,
                visible_bias,
            });
        }
        if layers.is_empty() {
            return Err(Error::MissingTensor("W_0".to_string()));
        }
        if !tensors.is_empty() {
            let names: Vec<&String> = tensors.keys().collect();
            return Err(Error::Checkpoint(format!(
                "tensors {names:?} do not belong to the {} layers read",
                layers.len()
            )));
        }
        Network::from_layers(layers)
    }
}

pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Divides every row by its sum, turning `exp` scores into class probabilities.
pub fn normalize_rows(mut scores: Array2<f64>) -> Result<Array2<f64>> {
    if scores.iter().any(|score| !score.is_finite()) {
        return Err(Error::NonFinite("output layer scores"));
    }
    for mut row in scores.rows_mut() {
        let total = row.sum();
        if !(total.is_finite() && total > 0.0) {
            return Err(Error::NonFinite("output layer row sum"));
        }
        row /= total;
    }
    Ok(scores)
}

/// Column index of the largest entry of every row.
pub fn argmax_rows(values: ArrayView2<f64>) -> Vec<usize> {
    values
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f64::NEG_INFINITY), |best, (index, &value)| {
                    if value > best.1 {
                        (index, value)
                    } else {
                        best
                    }
                })
                .0
        })
        .collect()
}

pub(crate) fn as_row(bias: &Array1<f64>) -> Array2<f64> {
    bias.clone().insert_axis(Axis(0))
}
