//! One-step contrastive divergence (CD-1) for a single layer of the stack.

use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};
use rand::Rng;

use crate::network::Network;

/// Learning rates and weight decay of a CD-1 update.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CdParams {
    pub lr_weights: f64,
    pub lr_visible_bias: f64,
    pub lr_hidden_bias: f64,
    pub weight_decay: f64,
}

impl Default for CdParams {
    fn default() -> Self {
        Self {
            lr_weights: 0.1,
            lr_visible_bias: 0.1,
            lr_hidden_bias: 0.1,
            weight_decay: 0.0002,
        }
    }
}

/// Raw parameter deltas of one CD-1 step, before momentum is applied.
#[derive(Clone, Debug)]
pub struct CdGradient {
    pub delta_weights: Array2<f64>,      // (v, h)
    pub delta_visible_bias: Array1<f64>, // (v)
    pub delta_hidden_bias: Array1<f64>,  // (h)
    /// Positive-phase hidden probabilities, the next layer's training data.
    pub hidden_probs: Array2<f64>, // (m, h)
    /// Summed squared difference between the batch and its reconstruction.
    pub reconstruction_error: f64,
}

/// Estimates the CD-1 gradient of `layer` on a minibatch of visible rows.
///
/// `compare` holds one uniform draw per hidden probability; a hidden unit is
/// switched on when its probability is strictly greater than its draw.
pub fn contrastive_divergence(
    network: &Network,
    layer: usize,
    visible: ArrayView2<f64>,
    compare: ArrayView2<f64>,
    params: &CdParams,
) -> CdGradient {
    let batch_size = visible.nrows() as f64;

    // positive phase
    let hidden_probs = network.up(layer, visible);
    let hidden_states = binarize(&hidden_probs, compare);
    let pos_corr = visible.t().dot(&hidden_probs);
    let pos_vis_act = visible.sum_axis(Axis(0));
    let pos_hid_act = hidden_probs.sum_axis(Axis(0));

    // negative phase: one Gibbs step from the sampled hidden states
    let reconstruction = network.down(layer, hidden_states.view());
    let neg_hidden_probs = network.up(layer, reconstruction.view());
    let neg_corr = reconstruction.t().dot(&neg_hidden_probs);
    let neg_vis_act = reconstruction.sum_axis(Axis(0));
    let neg_hid_act = neg_hidden_probs.sum_axis(Axis(0));

    let reconstruction_error = Zip::from(&visible)
        .and(&reconstruction)
        .fold(0.0, |acc, &v, &r| acc + (v - r) * (v - r));

    let weights = &network.layer(layer).weights;
    let delta_weights =
        ((pos_corr - neg_corr) / batch_size - weights * params.weight_decay) * params.lr_weights;
    let delta_visible_bias = (pos_vis_act - neg_vis_act) * (params.lr_visible_bias / batch_size);
    let delta_hidden_bias = (pos_hid_act - neg_hid_act) * (params.lr_hidden_bias / batch_size);

    CdGradient {
        delta_weights,
        delta_visible_bias,
        delta_hidden_bias,
        hidden_probs,
        reconstruction_error,
    }
}

/// Fresh uniform `[0, 1)` draws of the given shape.
pub fn uniform_draws<R: Rng + ?Sized>(rng: &mut R, shape: (usize, usize)) -> Array2<f64> {
    Array2::from_shape_simple_fn(shape, || rng.gen::<f64>())
}

fn binarize(probs: &Array2<f64>, compare: ArrayView2<f64>) -> Array2<f64> {
    assert_eq!(
        probs.dim(),
        compare.dim(),
        "one uniform draw is needed per hidden probability"
    );
    Zip::from(probs)
        .and(&compare)
        .map_collect(|&p, &r| if p > r { 1.0 } else { 0.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{sigmoid, Layer};
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array1};
    use rand::{rngs::StdRng, SeedableRng};

    fn two_by_two() -> Network {
        let rbm = Layer {
            weights: arr2(&[[1.0, -1.0], [0.0, 2.0]]),
            hidden_bias: Array1::zeros(2),
            visible_bias: Array1::zeros(2),
        };
        let top = Layer {
            weights: Array2::zeros((2, 2)),
            hidden_bias: Array1::zeros(2),
            visible_bias: Array1::zeros(2),
        };
        Network::from_layers(vec![rbm, top]).unwrap()
    }

    #[test]
    fn matches_hand_computed_update() {
        let network = two_by_two();
        let visible = arr2(&[[1.0, 0.0], [1.0, 1.0]]);
        let compare = Array2::<f64>::zeros((2, 2));
        let params = CdParams::default();

        let step = contrastive_divergence(&network, 0, visible.view(), compare.view(), &params);

        // v.W = [1, -1] and [1, 1]
        let (s1, sm1) = (sigmoid(1.0), sigmoid(-1.0));
        assert_abs_diff_eq!(step.hidden_probs, arr2(&[[s1, sm1], [s1, s1]]), epsilon = 1e-12);

        // every state is on, so each reconstruction row is sigmoid([1, 1].W^T) = sigmoid([0, 2])
        let s2 = sigmoid(2.0);
        let (n0, n1) = (sigmoid(0.5), sigmoid(2.0 * s2 - 0.5));

        let pos_corr = arr2(&[[2.0 * s1, sm1 + s1], [s1, s1]]);
        let neg_corr = arr2(&[[2.0 * 0.5 * n0, 2.0 * 0.5 * n1], [2.0 * s2 * n0, 2.0 * s2 * n1]]);
        let w = arr2(&[[1.0, -1.0], [0.0, 2.0]]);
        let expected_w = ((pos_corr - neg_corr) / 2.0 - &w * 0.0002) * 0.1;
        assert_abs_diff_eq!(step.delta_weights, expected_w, epsilon = 1e-12);

        let expected_vb = arr1(&[2.0 - 1.0, 1.0 - 2.0 * s2]) * (0.1 / 2.0);
        assert_abs_diff_eq!(step.delta_visible_bias, expected_vb, epsilon = 1e-12);

        let expected_hb = arr1(&[2.0 * s1 - 2.0 * n0, sm1 + s1 - 2.0 * n1]) * (0.1 / 2.0);
        assert_abs_diff_eq!(step.delta_hidden_bias, expected_hb, epsilon = 1e-12);

        let expected_err = 0.25 + s2 * s2 + 0.25 + (1.0 - s2) * (1.0 - s2);
        assert_abs_diff_eq!(step.reconstruction_error, expected_err, epsilon = 1e-12);
    }

    #[test]
    fn draws_decide_hidden_states() {
        let probs = arr2(&[[0.2, 0.7], [1e-9, 0.5]]);
        let on = binarize(&probs, Array2::<f64>::zeros((2, 2)).view());
        assert_eq!(on, Array2::<f64>::ones((2, 2)));

        let off = binarize(&probs, Array2::<f64>::ones((2, 2)).view());
        assert_eq!(off, Array2::<f64>::zeros((2, 2)));

        let ties = binarize(&probs, probs.view());
        assert_eq!(ties, Array2::<f64>::zeros((2, 2)));
    }

    #[test]
    fn uniform_draws_are_reproducible() {
        let a = uniform_draws(&mut StdRng::seed_from_u64(3), (4, 5));
        let b = uniform_draws(&mut StdRng::seed_from_u64(3), (4, 5));
        assert_eq!(a, b);
        assert!(a.iter().all(|&x| (0.0..1.0).contains(&x)));
    }
}
