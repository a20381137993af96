//! Supervised fine-tuning of the stack by batch conjugate gradient.

use log::{debug, info, warn};
use ndarray::{Array2, ArrayView2, Axis};

use crate::codec::ParameterCodec;
use crate::dataset::{batch_ranges, Dataset};
use crate::error::Result;
use crate::evaluate::{batch_count_errors, Evaluation};
use crate::network::{as_row, Network};
use crate::objective::{FullNetworkObjective, LastLayerObjective};
use crate::optimize::{Minimization, Minimizer};

#[derive(Clone, Debug)]
pub struct FinetuneConfig {
    pub epochs: usize,
    /// Rows handed to each minimizer call, must divide the training set exactly
    pub batch_size: usize,
    /// Line searches per minimizer call
    pub line_searches: usize,
    /// Epochs below this only adjust the classification layer
    pub last_layer_epochs: usize,
    /// Evaluation batches for the training set (memory bound only)
    pub train_eval_batches: usize,
    /// Evaluation batches for the test set (memory bound only)
    pub test_eval_batches: usize,
}

impl Default for FinetuneConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            batch_size: 1000,
            line_searches: 3,
            last_layer_epochs: 5,
            train_eval_batches: 600,
            test_eval_batches: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct EpochReport {
    pub epoch: usize,
    pub train: Evaluation,
    pub test: Option<Evaluation>,
}

/// Minimizes the cross-entropy of the classification layer alone on one batch,
/// with the layers below frozen, and writes the result back into `network`.
pub fn minimize_last_layer(
    network: &mut Network,
    images: ArrayView2<f64>,
    targets: ArrayView2<f64>,
    minimizer: &dyn Minimizer,
    line_searches: usize,
) -> Result<Minimization> {
    let top = network.top_layer();
    let features = network.hidden_features(images);

    let tensors = trainable_tensors(network, top);
    let views: Vec<ArrayView2<f64>> = tensors.iter().map(Array2::view).collect();
    let (codec, start) = ParameterCodec::encode(&views);

    let objective = LastLayerObjective::new(codec.clone(), features.view(), targets.reborrow())?;
    let result = minimizer.minimize(&objective, start, line_searches)?;
    store_trainable(network, top, codec.unflatten(result.params.view())?);
    Ok(result)
}

/// Minimizes the cross-entropy of the whole network on one batch, backpropagating
/// through every layer, and writes the result back into `network`.
pub fn minimize_all_layers(
    network: &mut Network,
    images: ArrayView2<f64>,
    targets: ArrayView2<f64>,
    minimizer: &dyn Minimizer,
    line_searches: usize,
) -> Result<Minimization> {
    let tensors = trainable_tensors(network, 0);
    let views: Vec<ArrayView2<f64>> = tensors.iter().map(Array2::view).collect();
    let (codec, start) = ParameterCodec::encode(&views);

    let objective = FullNetworkObjective::new(codec.clone(), images.reborrow(), targets.reborrow())?;
    let result = minimizer.minimize(&objective, start, line_searches)?;
    store_trainable(network, 0, codec.unflatten(result.params.view())?);
    Ok(result)
}

/// Runs every fine-tuning epoch over contiguous minibatches of `train`,
/// evaluating after each epoch.
pub fn finetune(
    network: &mut Network,
    train: &Dataset,
    test: Option<&Dataset>,
    config: &FinetuneConfig,
    minimizer: &dyn Minimizer,
) -> Result<Vec<EpochReport>> {
    let ranges = batch_ranges(train.len(), config.batch_size)?;
    let mut reports = Vec::with_capacity(config.epochs);

    for epoch in 0..config.epochs {
        let last_layer_only = epoch < config.last_layer_epochs;
        info!(
            "Epoch {epoch}: {} batches of {} cases, {}",
            ranges.len(),
            config.batch_size,
            if last_layer_only {
                "classification layer only"
            } else {
                "all layers"
            }
        );

        for (batch, rows) in ranges.iter().enumerate() {
            let (images, targets) = train.batch(rows.clone());
            let result = if last_layer_only {
                minimize_last_layer(network, images, targets, minimizer, config.line_searches)?
            } else {
                minimize_all_layers(network, images, targets, minimizer, config.line_searches)?
            };
            if result.losses.len() == 1 {
                warn!("epoch {epoch} batch {batch}: no line search succeeded");
            }
            debug!(
                "epoch {epoch} batch {batch}: loss {:.4} -> {:.4} in {} evaluations",
                result.initial_loss(),
                result.final_loss(),
                result.evaluations
            );
        }

        let train_eval = evaluate(network, train, config.train_eval_batches)?;
        log_evaluation("train", &train_eval);
        let test_eval = match test {
            Some(test) => {
                let evaluation = evaluate(network, test, config.test_eval_batches)?;
                log_evaluation("test", &evaluation);
                Some(evaluation)
            }
            None => None,
        };
        reports.push(EpochReport {
            epoch,
            train: train_eval,
            test: test_eval,
        });
    }
    Ok(reports)
}

pub fn evaluate(network: &Network, data: &Dataset, num_batches: usize) -> Result<Evaluation> {
    batch_count_errors(network, data.images.view(), data.targets.view(), num_batches)
}

pub fn log_evaluation(name: &str, evaluation: &Evaluation) {
    info!(
        "  {name}: misclassified {} of {} ({:.2}% error), cross-entropy {:.4}",
        evaluation.misclassified,
        evaluation.correct + evaluation.misclassified,
        100.0 * evaluation.error_rate(),
        evaluation.cross_entropy
    );
}

/// `[W_l, hB_l]` for every layer from `first` to the top, biases as rows.
fn trainable_tensors(network: &Network, first: usize) -> Vec<Array2<f64>> {
    network.layers()[first..]
        .iter()
        .flat_map(|layer| [layer.weights.clone(), as_row(&layer.hidden_bias)])
        .collect()
}

fn store_trainable(network: &mut Network, first: usize, tensors: Vec<Array2<f64>>) {
    let mut tensors = tensors.into_iter();
    for index in first..network.num_layers() {
        let (Some(weights), Some(hidden_bias)) = (tensors.next(), tensors.next()) else {
            unreachable!("codec returns one weight and one bias per trainable layer");
        };
        let layer = network.layer_mut(index);
        layer.weights = weights;
        layer.hidden_bias = hidden_bias.index_axis_move(Axis(0), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimize::ConjugateGradient;
    use ndarray::arr2;
    use rand::{rngs::StdRng, SeedableRng};

    fn separable() -> Dataset {
        let images = arr2(&[
            [1.0, 0.0, 0.9, 0.1],
            [0.0, 1.0, 0.1, 0.8],
            [0.9, 0.2, 1.0, 0.0],
            [0.1, 0.9, 0.0, 1.0],
        ]);
        let targets = arr2(&[[1.0, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]]);
        Dataset::new(images, targets).unwrap()
    }

    #[test]
    fn last_layer_step_leaves_lower_layers_alone() {
        let data = separable();
        let mut network = Network::random(&[4, 3, 2], &mut StdRng::seed_from_u64(3));
        let before = network.clone();

        let result = minimize_last_layer(
            &mut network,
            data.images.view(),
            data.targets.view(),
            &ConjugateGradient::default(),
            3,
        )
        .unwrap();

        assert!(result.final_loss() < result.initial_loss());
        assert_eq!(network.layer(0), before.layer(0));
        assert_ne!(network.layer(1).weights, before.layer(1).weights);
        assert_eq!(network.layer(1).visible_bias, before.layer(1).visible_bias);
    }

    #[test]
    fn all_layer_step_moves_every_layer() {
        let data = separable();
        let mut network = Network::random(&[4, 3, 2], &mut StdRng::seed_from_u64(4));
        let before = network.clone();

        let result = minimize_all_layers(
            &mut network,
            data.images.view(),
            data.targets.view(),
            &ConjugateGradient::default(),
            3,
        )
        .unwrap();

        assert!(result.final_loss() < result.initial_loss());
        assert_ne!(network.layer(0).weights, before.layer(0).weights);
        assert_ne!(network.layer(1).weights, before.layer(1).weights);
        // visible biases only matter to pretraining
        assert_eq!(network.layer(0).visible_bias, before.layer(0).visible_bias);
    }

    #[test]
    fn schedule_switches_to_all_layers() {
        let data = separable();
        let mut network = Network::random(&[4, 3, 2], &mut StdRng::seed_from_u64(5));
        let before = network.clone();
        let config = FinetuneConfig {
            epochs: 1,
            batch_size: 2,
            last_layer_epochs: 1,
            train_eval_batches: 2,
            test_eval_batches: 1,
            ..FinetuneConfig::default()
        };

        let reports = finetune(
            &mut network,
            &data,
            Some(&data),
            &config,
            &ConjugateGradient::default(),
        )
        .unwrap();
        assert_eq!(network.layer(0), before.layer(0));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].train.correct + reports[0].train.misclassified, 4);

        let config = FinetuneConfig {
            last_layer_epochs: 0,
            ..config
        };
        let reports = finetune(
            &mut network,
            &data,
            Some(&data),
            &config,
            &ConjugateGradient::default(),
        )
        .unwrap();
        assert_ne!(network.layer(0), before.layer(0));
        assert_eq!(
            reports[0].test.map(|test| test.correct),
            Some(reports[0].train.correct)
        );
    }
}
