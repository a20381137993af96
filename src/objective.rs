//! Cross-entropy objectives over flat parameter vectors.
//!
//! Both objectives are pure: they unflatten the vector they are handed, run
//! the network forward, and return the summed cross-entropy together with its
//! gradient flattened against the very same manifest. The optimizer may call
//! them any number of times with different vectors.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};

use crate::codec::{ParameterCodec, ShapeManifest};
use crate::error::{Error, Result};
use crate::network::{normalize_rows, sigmoid};

/// A differentiable scalar function of a flat parameter vector.
pub trait Objective {
    fn loss_and_gradient(&self, params: ArrayView1<f64>) -> Result<(f64, Array1<f64>)>;
}

/// `-sum(target * ln(predicted))` over every example and class.
///
/// Entries with a zero target contribute nothing, even where the prediction
/// has underflowed to zero.
pub fn cross_entropy(predicted: ArrayView2<f64>, targets: ArrayView2<f64>) -> f64 {
    Zip::from(&targets)
        .and(&predicted)
        .fold(0.0, |acc, &target, &p| {
            if target == 0.0 {
                acc
            } else {
                acc - target * p.ln()
            }
        })
}

/// Classification layer only, on features already computed by the layers below.
///
/// Manifest: `[W (f, c), hB (1, c)]`.
pub struct LastLayerObjective<'a> {
    codec: ParameterCodec,
    features: ArrayView2<'a, f64>, // (m, f)
    targets: ArrayView2<'a, f64>,  // (m, c)
}

impl<'a> LastLayerObjective<'a> {
    pub fn new(
        codec: ParameterCodec,
        features: ArrayView2<'a, f64>,
        targets: ArrayView2<'a, f64>,
    ) -> Result<Self> {
        check_manifest(codec.manifest(), 1, features, targets)?;
        Ok(LastLayerObjective {
            codec,
            features,
            targets,
        })
    }
}

impl Objective for LastLayerObjective<'_> {
    fn loss_and_gradient(&self, params: ArrayView1<f64>) -> Result<(f64, Array1<f64>)> {
        let tensors = self.codec.unflatten(params)?;
        let (weights, hidden_bias) = (&tensors[0], &tensors[1]);

        let scores = (self.features.dot(weights) + hidden_bias).mapv_into(f64::exp);
        let predicted = normalize_rows(scores)?;
        let loss = finite_loss(predicted.view(), self.targets)?;

        let class_error = predicted - self.targets;
        let d_weights = self.features.t().dot(&class_error);
        let d_hidden_bias = class_error.sum_axis(Axis(0)).insert_axis(Axis(0));

        let gradient = self
            .codec
            .flatten(&[d_weights.view(), d_hidden_bias.view()])?;
        Ok((loss, gradient))
    }
}

/// Every layer at once, with the error backpropagated through the logistic layers.
///
/// Manifest: `[W_0, hB_0, W_1, hB_1, ...]` in forward order.
pub struct FullNetworkObjective<'a> {
    codec: ParameterCodec,
    inputs: ArrayView2<'a, f64>,  // (m, pixels)
    targets: ArrayView2<'a, f64>, // (m, c)
}

impl<'a> FullNetworkObjective<'a> {
    pub fn new(
        codec: ParameterCodec,
        inputs: ArrayView2<'a, f64>,
        targets: ArrayView2<'a, f64>,
    ) -> Result<Self> {
        let num_layers = codec.manifest().shapes().len() / 2;
        check_manifest(codec.manifest(), num_layers.max(1), inputs, targets)?;
        Ok(FullNetworkObjective {
            codec,
            inputs,
            targets,
        })
    }
}

impl Objective for FullNetworkObjective<'_> {
    fn loss_and_gradient(&self, params: ArrayView1<f64>) -> Result<(f64, Array1<f64>)> {
        let tensors = self.codec.unflatten(params)?;
        let layers: Vec<(&Array2<f64>, &Array2<f64>)> = tensors
            .chunks_exact(2)
            .map(|pair| (&pair[0], &pair[1]))
            .collect();
        let top = layers.len() - 1;

        // forward: outputs of the logistic layers, then the normalized class scores
        let mut hidden_outputs: Vec<Array2<f64>> = Vec::with_capacity(top);
        for &(weights, hidden_bias) in &layers[..top] {
            let below = hidden_outputs.last().map_or(self.inputs.view(), |out| out.view());
            let output = (below.dot(weights) + hidden_bias).mapv_into(sigmoid);
            hidden_outputs.push(output);
        }
        let below = hidden_outputs.last().map_or(self.inputs.view(), |out| out.view());
        let (top_weights, top_bias) = layers[top];
        let scores = (below.dot(top_weights) + top_bias).mapv_into(f64::exp);
        let predicted = normalize_rows(scores)?;
        let loss = finite_loss(predicted.view(), self.targets)?;

        // backward: exp + normalize + cross-entropy leave a linear error at the top
        let mut error = predicted - self.targets;
        let mut gradients = Vec::with_capacity(tensors.len());
        for layer in (0..=top).rev() {
            let below = match layer {
                0 => self.inputs.view(),
                _ => hidden_outputs[layer - 1].view(),
            };
            gradients.push(error.sum_axis(Axis(0)).insert_axis(Axis(0)));
            gradients.push(below.t().dot(&error));

            if layer > 0 {
                let out = &hidden_outputs[layer - 1];
                error = error.dot(&layers[layer].0.t()) * out * &out.mapv(|o| 1.0 - o);
            }
        }
        gradients.reverse();

        let views: Vec<ArrayView2<f64>> = gradients.iter().map(Array2::view).collect();
        let gradient = self.codec.flatten(&views)?;
        Ok((loss, gradient))
    }
}

fn finite_loss(predicted: ArrayView2<f64>, targets: ArrayView2<f64>) -> Result<f64> {
    let loss = cross_entropy(predicted, targets);
    if loss.is_finite() {
        Ok(loss)
    } else {
        Err(Error::NonFinite("cross-entropy loss"))
    }
}

/// The manifest must describe `num_layers` chained `(W, hB)` pairs running from
/// the input width to the class count.
fn check_manifest(
    manifest: &ShapeManifest,
    num_layers: usize,
    inputs: ArrayView2<f64>,
    targets: ArrayView2<f64>,
) -> Result<()> {
    let mut expected = Vec::with_capacity(2 * num_layers);
    let mut width = inputs.ncols();
    for (index, pair) in manifest.shapes().chunks(2).enumerate() {
        let hidden = pair[0].1;
        let hidden = if index + 1 == num_layers {
            targets.ncols()
        } else {
            hidden
        };
        expected.push((width, hidden));
        expected.push((1, hidden));
        width = hidden;
    }

    if inputs.nrows() != targets.nrows()
        || manifest.shapes().len() != 2 * num_layers
        || manifest.shapes() != expected.as_slice()
    {
        return Err(Error::ShapeMismatch {
            context: "objective parameters",
            expected,
            found: manifest.shapes().to_vec(),
        });
    }
    Ok(())
}
