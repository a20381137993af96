//! Greedy layer-by-layer pretraining of the stack with CD-1 and momentum.

use std::collections::HashMap;

use log::{debug, info};
use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::dataset::batch_ranges;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::rbm::{contrastive_divergence, uniform_draws, CdParams};

#[derive(Clone, Debug)]
pub struct PretrainConfig {
    /// Passes over the data per layer
    pub epochs: usize,
    /// Rows per minibatch, must divide the data exactly
    pub batch_size: usize,
    /// Momentum for epochs before `momentum_switch_epoch`
    pub initial_momentum: f64,
    /// Momentum from `momentum_switch_epoch` on
    pub final_momentum: f64,
    pub momentum_switch_epoch: usize,
    pub cd: CdParams,
}

impl Default for PretrainConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 100,
            initial_momentum: 0.5,
            final_momentum: 0.9,
            momentum_switch_epoch: 4,
            cd: CdParams::default(),
        }
    }
}

impl PretrainConfig {
    /// Hard cutover from the initial to the final momentum.
    pub fn momentum(&self, epoch: usize) -> f64 {
        if epoch < self.momentum_switch_epoch {
            self.initial_momentum
        } else {
            self.final_momentum
        }
    }
}

/// Supplies the uniform draws that binarize hidden probabilities.
pub trait CompareSource {
    /// Draws for minibatch `batch` of `epoch` while training `layer`, shaped `(rows, hidden)`.
    fn draws(
        &mut self,
        layer: usize,
        epoch: usize,
        batch: usize,
        shape: (usize, usize),
    ) -> Result<Array2<f64>>;
}

/// Fresh draws from a random number generator.
pub struct UniformDraws<R> {
    rng: R,
}

impl<R: Rng> UniformDraws<R> {
    pub fn new(rng: R) -> Self {
        UniformDraws { rng }
    }
}

impl UniformDraws<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        UniformDraws::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> CompareSource for UniformDraws<R> {
    fn draws(&mut self, _: usize, _: usize, _: usize, shape: (usize, usize)) -> Result<Array2<f64>> {
        Ok(uniform_draws(&mut self.rng, shape))
    }
}

/// Pre-recorded draws, one `(batches, batch_size, hidden)` tensor per layer and
/// epoch, so that repeated runs binarize identically.
///
/// Layers or epochs without a recorded tensor fall back to fresh draws.
pub struct SuppliedDraws<R> {
    tensors: HashMap<(usize, usize), Array3<f64>>,
    fallback: UniformDraws<R>,
}

impl<R: Rng> SuppliedDraws<R> {
    pub fn new(fallback: R) -> Self {
        SuppliedDraws {
            tensors: HashMap::new(),
            fallback: UniformDraws::new(fallback),
        }
    }

    pub fn insert(&mut self, layer: usize, epoch: usize, draws: Array3<f64>) {
        self.tensors.insert((layer, epoch), draws);
    }

    pub fn with(mut self, layer: usize, epoch: usize, draws: Array3<f64>) -> Self {
        self.insert(layer, epoch, draws);
        self
    }
}

impl<R: Rng> CompareSource for SuppliedDraws<R> {
    fn draws(
        &mut self,
        layer: usize,
        epoch: usize,
        batch: usize,
        shape: (usize, usize),
    ) -> Result<Array2<f64>> {
        let Some(recorded) = self.tensors.get(&(layer, epoch)) else {
            return self.fallback.draws(layer, epoch, batch, shape);
        };
        let (batches, rows, cols) = recorded.dim();
        if batch >= batches || (rows, cols) != shape {
            // compared as (batches needed, draws per batch)
            return Err(Error::ShapeMismatch {
                context: "supplied binarization draws",
                expected: vec![(batch + 1, shape.0 * shape.1)],
                found: vec![(batches, rows * cols)],
            });
        }
        Ok(recorded.index_axis(Axis(0), batch).to_owned())
    }
}

/// Result of pretraining one layer.
#[derive(Clone, Debug)]
pub struct LayerOutput {
    /// Hidden probabilities of every row from the final epoch.
    pub hidden_probs: Array2<f64>,
    /// Summed reconstruction error per epoch, for monitoring only.
    pub epoch_errors: Vec<f64>,
}

/// Trains `layer` of `network` as an RBM on `data`, updating it after every minibatch.
pub fn pretrain_layer(
    network: &mut Network,
    layer: usize,
    data: ArrayView2<f64>,
    config: &PretrainConfig,
    source: &mut dyn CompareSource,
) -> Result<LayerOutput> {
    let (num_visible, num_hidden) = network.layer(layer).weights.dim();
    if data.ncols() != num_visible {
        return Err(Error::ShapeMismatch {
            context: "pretraining data",
            expected: vec![(data.nrows(), num_visible)],
            found: vec![data.dim()],
        });
    }
    let ranges = batch_ranges(data.nrows(), config.batch_size)?;

    let mut delta_weights = Array2::<f64>::zeros((num_visible, num_hidden));
    let mut delta_visible_bias = Array1::<f64>::zeros(num_visible);
    let mut delta_hidden_bias = Array1::<f64>::zeros(num_hidden);
    let mut hidden_probs = Array2::<f64>::zeros((data.nrows(), num_hidden));
    let mut epoch_errors = Vec::with_capacity(config.epochs);

    info!(
        "Layer {layer}: {} epochs * {} batches of {}",
        config.epochs,
        ranges.len(),
        config.batch_size
    );
    for epoch in 0..config.epochs {
        let momentum = config.momentum(epoch);
        let mut error_sum = 0.0;

        for (batch, rows) in ranges.iter().enumerate() {
            let visible = data.slice(s![rows.clone(), ..]);
            let compare = source.draws(layer, epoch, batch, (rows.len(), num_hidden))?;
            let step = contrastive_divergence(network, layer, visible, compare.view(), &config.cd);

            hidden_probs
                .slice_mut(s![rows.clone(), ..])
                .assign(&step.hidden_probs);
            error_sum += step.reconstruction_error;

            delta_weights *= momentum;
            delta_weights += &step.delta_weights;
            delta_visible_bias *= momentum;
            delta_visible_bias += &step.delta_visible_bias;
            delta_hidden_bias *= momentum;
            delta_hidden_bias += &step.delta_hidden_bias;

            let params = network.layer_mut(layer);
            params.weights += &delta_weights;
            params.visible_bias += &delta_visible_bias;
            params.hidden_bias += &delta_hidden_bias;

            debug!(
                "layer {layer} epoch {epoch} batch {batch}: error {:.3}",
                step.reconstruction_error
            );
        }

        info!("Layer {layer} epoch {epoch}: reconstruction error {error_sum:.1}");
        epoch_errors.push(error_sum);
    }

    Ok(LayerOutput {
        hidden_probs,
        epoch_errors,
    })
}

/// Pretrains every layer below the classification layer, bottom-up, each on
/// the hidden probabilities of the layer beneath it.
///
/// Returns the per-epoch reconstruction errors of each trained layer.
pub fn pretrain_stack(
    network: &mut Network,
    images: ArrayView2<f64>,
    config: &PretrainConfig,
    source: &mut dyn CompareSource,
) -> Result<Vec<Vec<f64>>> {
    let mut errors = Vec::with_capacity(network.top_layer());
    let mut below: Option<Array2<f64>> = None;
    for layer in 0..network.top_layer() {
        let data = below.as_ref().map_or(images.view(), |hidden| hidden.view());
        let output = pretrain_layer(network, layer, data, config, source)?;
        errors.push(output.epoch_errors);
        below = Some(output.hidden_probs);
    }
    Ok(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Layer;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr2, Array3};

    fn stripes() -> Array2<f64> {
        arr2(&[
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 1.0],
            [1.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 1.0],
        ])
    }

    fn network() -> Network {
        Network::random(&[4, 3, 2], &mut StdRng::seed_from_u64(5))
    }

    #[test]
    fn momentum_switches_hard() {
        let config = PretrainConfig::default();
        let momenta: Vec<f64> = (0..6).map(|epoch| config.momentum(epoch)).collect();
        assert_eq!(momenta, vec![0.5, 0.5, 0.5, 0.5, 0.9, 0.9]);
    }

    #[test]
    fn accumulates_deltas_with_momentum() {
        let start = network();
        let data = stripes();
        let config = PretrainConfig {
            epochs: 1,
            batch_size: 2,
            ..PretrainConfig::default()
        };
        let draws = Array3::<f64>::zeros((2, 2, 3));

        let mut trained = start.clone();
        let mut source = SuppliedDraws::new(StdRng::seed_from_u64(0)).with(0, 0, draws);
        pretrain_layer(&mut trained, 0, data.view(), &config, &mut source).unwrap();

        // replay by hand: the second update carries half of the first
        let mut manual = start.clone();
        let zeros = Array2::<f64>::zeros((2, 3));
        let first = contrastive_divergence(
            &manual,
            0,
            data.slice(s![0..2, ..]),
            zeros.view(),
            &config.cd,
        );
        manual.layer_mut(0).weights += &first.delta_weights;
        manual.layer_mut(0).hidden_bias += &first.delta_hidden_bias;
        manual.layer_mut(0).visible_bias += &first.delta_visible_bias;
        let second = contrastive_divergence(
            &manual,
            0,
            data.slice(s![2..4, ..]),
            zeros.view(),
            &config.cd,
        );
        let expected_weights =
            &manual.layer(0).weights + &(&first.delta_weights * 0.5 + &second.delta_weights);

        assert_abs_diff_eq!(trained.layer(0).weights, expected_weights, epsilon = 1e-12);
        // classification layer is untouched
        assert_eq!(trained.layer(1), start.layer(1));
    }

    #[test]
    fn momentum_carries_across_epochs_and_switches() {
        let start = network();
        let data = stripes();
        let config = PretrainConfig {
            epochs: 2,
            batch_size: 4,
            momentum_switch_epoch: 1,
            ..PretrainConfig::default()
        };
        let mut source = SuppliedDraws::new(StdRng::seed_from_u64(0))
            .with(0, 0, Array3::zeros((1, 4, 3)))
            .with(0, 1, Array3::zeros((1, 4, 3)));

        let mut trained = start.clone();
        pretrain_layer(&mut trained, 0, data.view(), &config, &mut source).unwrap();

        // one batch per epoch: epoch 1 adds 0.9 of epoch 0's delta to its own
        let mut manual = start.clone();
        let zeros = Array2::<f64>::zeros((4, 3));
        let first = contrastive_divergence(&manual, 0, data.view(), zeros.view(), &config.cd);
        manual.layer_mut(0).weights += &first.delta_weights;
        manual.layer_mut(0).hidden_bias += &first.delta_hidden_bias;
        manual.layer_mut(0).visible_bias += &first.delta_visible_bias;
        let second = contrastive_divergence(&manual, 0, data.view(), zeros.view(), &config.cd);

        let expected_weights =
            &manual.layer(0).weights + &(&first.delta_weights * 0.9 + &second.delta_weights);
        let expected_hidden_bias = &manual.layer(0).hidden_bias
            + &(&first.delta_hidden_bias * 0.9 + &second.delta_hidden_bias);
        let expected_visible_bias = &manual.layer(0).visible_bias
            + &(&first.delta_visible_bias * 0.9 + &second.delta_visible_bias);

        assert_abs_diff_eq!(trained.layer(0).weights, expected_weights, epsilon = 1e-12);
        assert_abs_diff_eq!(trained.layer(0).hidden_bias, expected_hidden_bias, epsilon = 1e-12);
        assert_abs_diff_eq!(trained.layer(0).visible_bias, expected_visible_bias, epsilon = 1e-12);
    }

    #[test]
    fn returns_hidden_probabilities_of_last_epoch() {
        let mut network = network();
        let data = stripes();
        let config = PretrainConfig {
            epochs: 3,
            batch_size: 2,
            ..PretrainConfig::default()
        };
        let mut source = UniformDraws::seeded(1);
        let output = pretrain_layer(&mut network, 0, data.view(), &config, &mut source).unwrap();

        assert_eq!(output.hidden_probs.dim(), (4, 3));
        assert_eq!(output.epoch_errors.len(), 3);
        assert!(output.hidden_probs.iter().all(|&p| p > 0.0 && p < 1.0));
    }

    #[test]
    fn reconstruction_improves_on_repeated_patterns() {
        let mut network = network();
        let data = stripes();
        let config = PretrainConfig {
            epochs: 100,
            batch_size: 4,
            ..PretrainConfig::default()
        };
        let mut source = UniformDraws::seeded(2);
        let output = pretrain_layer(&mut network, 0, data.view(), &config, &mut source).unwrap();
        let first = output.epoch_errors[0];
        let last = output.epoch_errors[95..].iter().sum::<f64>() / 5.0;
        assert!(last < first, "error went from {first} to {last}");
    }

    #[test]
    fn rejects_misshapen_draws_and_partial_batches() {
        let data = stripes();
        let mut network = network();
        let config = PretrainConfig {
            epochs: 1,
            batch_size: 2,
            ..PretrainConfig::default()
        };

        let mut short =
            SuppliedDraws::new(StdRng::seed_from_u64(0)).with(0, 0, Array3::zeros((1, 2, 3)));
        let err = pretrain_layer(&mut network, 0, data.view(), &config, &mut short).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));

        let uneven = PretrainConfig {
            batch_size: 3,
            ..config
        };
        let err = pretrain_layer(&mut network, 0, data.view(), &uneven, &mut UniformDraws::seeded(0))
            .unwrap_err();
        assert!(matches!(err, Error::BatchPartition { .. }));
    }

    #[test]
    fn stack_trains_every_layer_below_the_top() {
        let layer = |v: usize, h: usize| Layer {
            weights: Array2::from_elem((v, h), 0.01),
            hidden_bias: Array1::zeros(h),
            visible_bias: Array1::zeros(v),
        };
        let mut network = Network::from_layers(vec![layer(4, 3), layer(3, 3), layer(3, 2)]).unwrap();
        let before = network.clone();
        let config = PretrainConfig {
            epochs: 2,
            batch_size: 2,
            ..PretrainConfig::default()
        };

        let errors = pretrain_stack(
            &mut network,
            stripes().view(),
            &config,
            &mut UniformDraws::seeded(9),
        )
        .unwrap();

        assert_eq!(errors.len(), 2);
        assert_ne!(network.layer(0), before.layer(0));
        assert_ne!(network.layer(1), before.layer(1));
        assert_eq!(network.layer(2), before.layer(2));
    }
}
