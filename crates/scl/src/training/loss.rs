//! Modulated sigmoid pairwise contrastive loss.
//!
//! Every `(i, j)` pair of an `n`-row batch is an independent binary decision:
//! the diagonal pairs are positives, everything else is a negative. Logits are
//! scaled cosine similarities `cos(x_i, x'_j) * clamp(exp(tau), 0, max_tau) + b`
//! fed through a log-sigmoid, with an optional focal-style confidence penalty
//! and an optional hard-negative filter once training has warmed up.
//!
//! All sums are divided by `n` (one row of pairs per anchor), not `n * n`.

use burn::prelude::*;
use burn::tensor::activation::{log_sigmoid, log_softmax, sigmoid};
use burn::tensor::TensorData;

/// Hyperparameters of the sigmoid contrastive loss.
#[derive(Config, Debug)]
pub struct SigmoidLossConfig {
    /// Weight of the softmax-consistency (KL) term in the final loss.
    #[config(default = 0.0)]
    pub alpha: f64,
    /// Upper bound on the effective temperature scale `exp(tau)`.
    #[config(default = 5.0)]
    pub max_tau: f64,
    /// Focal exponent of the confidence penalty. 0 disables it.
    #[config(default = 0.0)]
    pub gamma: f64,
    /// Drop easy negatives from the loss once warm-up has finished.
    #[config(default = false)]
    pub penalty_filtering: bool,
    /// Number of steps that use the soft penalty before filtering kicks in.
    #[config(default = 5000)]
    pub filtering_warmup_steps: u64,
    /// Negatives are kept only if their confidence penalty exceeds this.
    #[config(default = 0.05)]
    pub filtering_threshold: f64,
}

impl SigmoidLossConfig {
    /// Whether hard-negative filtering applies at `global_step`.
    pub fn filtering_active(&self, global_step: u64) -> bool {
        self.penalty_filtering && global_step > self.filtering_warmup_steps
    }
}

/// Result of [`sigmoid_contrastive_loss`].
#[derive(Debug, Clone)]
pub struct SigmoidLossOutput<B: Backend> {
    /// Primary pairwise loss plus `alpha` × invariance, shape `(1,)`.
    pub loss: Tensor<B, 1>,
    /// Raw KL consistency term, shape `(1,)`. Returned for logging.
    pub invariance: Tensor<B, 1>,
    /// Pairwise logits, shape `(n, n)`.
    pub logits: Tensor<B, 2>,
}

impl<B: Backend> SigmoidLossOutput<B> {
    /// `(loss, invariance)` as host scalars.
    pub fn values(&self) -> (f64, f64) {
        let loss: f64 = self.loss.clone().into_scalar().elem();
        let invariance: f64 = self.invariance.clone().into_scalar().elem();
        (loss, invariance)
    }
}

/// `n × n` label pattern: `+1` on the diagonal, `-1` elsewhere.
pub fn label_values(n: usize) -> Vec<f32> {
    (0..n * n)
        .map(|k| if k / n == k % n { 1.0 } else { -1.0 })
        .collect()
}

/// [`label_values`] as a tensor of shape `(n, n)`.
pub fn label_matrix<B: Backend>(n: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::from_data(TensorData::new(label_values(n), [n, n]), device)
}

/// Row-wise L2 normalization, `x / max(||x||, 1e-12)`.
pub fn l2_normalize<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let norms = x.clone().powf_scalar(2.0).sum_dim(1).sqrt().clamp_min(1e-12);
    x / norms
}

/// Sigmoid contrastive loss between online projections `x` and target
/// projections `x_prime`.
///
/// # Arguments
/// - `x`, `x_prime`: shape `(n, dim)`; row `i` of each forms the positive pair
/// - `log_tau`: learnable log-temperature, shape `(1,)`
/// - `bias`: learnable logit bias, shape `(1,)`
/// - `config`: loss hyperparameters
/// - `global_step`: current optimization step, gates penalty filtering
///
/// # Returns
/// The combined loss, the raw invariance term and the logits.
pub fn sigmoid_contrastive_loss<B: Backend>(
    x: Tensor<B, 2>,
    x_prime: Tensor<B, 2>,
    log_tau: Tensor<B, 1>,
    bias: Tensor<B, 1>,
    config: &SigmoidLossConfig,
    global_step: u64,
) -> SigmoidLossOutput<B> {
    let device = x.device();
    let [n, _] = x.dims();

    let labels = label_matrix::<B>(n, &device);

    let x = l2_normalize(x);
    let x_prime = l2_normalize(x_prime);

    // (1, 1) scalars broadcast over the (n, n) similarity matrix
    let scale = log_tau.exp().clamp(0.0, config.max_tau).unsqueeze::<2>();
    let logits = x.matmul(x_prime.transpose()) * scale + bias.unsqueeze::<2>();

    let signed = labels.clone() * logits.clone();
    let log_probs = log_sigmoid(signed.clone());
    let conf_penalty = confidence_penalty(signed, config.gamma);

    let primary = if config.filtering_active(global_step) {
        // Positives always count; negatives only while still hard.
        let positives = labels.clone().add_scalar(1.0).div_scalar(2.0);
        let negatives = positives.clone().neg().add_scalar(1.0);
        let hard = conf_penalty.greater_elem(config.filtering_threshold).float();
        let selection = positives + negatives * hard;
        (log_probs * selection).sum().neg().div_scalar(n as f64)
    } else {
        (conf_penalty * log_probs).sum().neg().div_scalar(n as f64)
    };

    let invariance = invariance_loss(logits.clone());
    let loss = primary + invariance.clone().mul_scalar(config.alpha);

    SigmoidLossOutput {
        loss,
        invariance,
        logits,
    }
}

/// `(1 - sigmoid(label * logit)) ^ gamma`, exactly 1 when `gamma == 0`.
fn confidence_penalty<B: Backend>(signed_logits: Tensor<B, 2>, gamma: f64) -> Tensor<B, 2> {
    if gamma == 0.0 {
        return signed_logits.ones_like();
    }
    // 1 - sigmoid(z) == sigmoid(-z), without the cancellation
    sigmoid(signed_logits.neg()).powf_scalar(gamma)
}

/// KL divergence between the column-wise softmax of `logits` (transposed)
/// and the row-wise softmax, with batch-mean reduction.
///
/// `sum(p_col * (log p_col - log p_row)) / n`, where row `i` of `p_col` is
/// column `i` of `logits` normalized over its entries.
pub fn invariance_loss<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1> {
    let [n, _] = logits.dims();
    let log_p_rows = log_softmax(logits.clone(), 1);
    let log_p_cols = log_softmax(logits, 0).transpose();
    let p_cols = log_p_cols.clone().exp();
    (p_cols * (log_p_cols - log_p_rows))
        .sum()
        .div_scalar(n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn scalar<B: Backend>(value: f32, device: &B::Device) -> Tensor<B, 1> {
        Tensor::from_data(TensorData::from([value]), device)
    }

    fn matrix(rows: &[[f32; 3]]) -> Tensor<TestBackend, 2> {
        let flat: Vec<f32> = rows.iter().flatten().copied().collect();
        Tensor::from_data(TensorData::new(flat, [rows.len(), 3]), &Default::default())
    }

    fn log_sigmoid_f64(z: f64) -> f64 {
        -(1.0 + (-z).exp()).ln()
    }

    /// Plain f64 reference of the full loss, used as an oracle.
    fn reference_loss(
        x: &[[f32; 3]],
        x_prime: &[[f32; 3]],
        log_tau: f64,
        b: f64,
        config: &SigmoidLossConfig,
        step: u64,
    ) -> (f64, f64) {
        let n = x.len();
        let unit = |v: &[f32; 3]| {
            let norm = v.iter().map(|a| (*a as f64).powi(2)).sum::<f64>().sqrt().max(1e-12);
            v.map(|a| a as f64 / norm)
        };
        let xs: Vec<[f64; 3]> = x.iter().map(unit).collect();
        let ys: Vec<[f64; 3]> = x_prime.iter().map(unit).collect();
        let scale = log_tau.exp().clamp(0.0, config.max_tau);

        let logit = |i: usize, j: usize| {
            let dot: f64 = (0..3).map(|k| xs[i][k] * ys[j][k]).sum();
            dot * scale + b
        };

        let mut primary = 0.0;
        for i in 0..n {
            for j in 0..n {
                let label = if i == j { 1.0 } else { -1.0 };
                let z = label * logit(i, j);
                let penalty = if config.gamma == 0.0 {
                    1.0
                } else {
                    (1.0 / (1.0 + z.exp())).powf(config.gamma)
                };
                if config.filtering_active(step) {
                    if i == j || penalty > config.filtering_threshold {
                        primary -= log_sigmoid_f64(z);
                    }
                } else {
                    primary -= penalty * log_sigmoid_f64(z);
                }
            }
        }
        primary /= n as f64;

        let mut kl = 0.0;
        for i in 0..n {
            let row_lse = (0..n).map(|j| logit(i, j).exp()).sum::<f64>().ln();
            let col_lse = (0..n).map(|k| logit(k, i).exp()).sum::<f64>().ln();
            for j in 0..n {
                let log_p_row = logit(i, j) - row_lse;
                let log_p_col = logit(j, i) - col_lse;
                kl += log_p_col.exp() * (log_p_col - log_p_row);
            }
        }
        kl /= n as f64;

        (primary + config.alpha * kl, kl)
    }

    const X: [[f32; 3]; 4] = [
        [1.0, 0.2, -0.3],
        [0.1, 1.0, 0.4],
        [-0.5, 0.3, 1.0],
        [0.7, -0.8, 0.2],
    ];
    const X_PRIME: [[f32; 3]; 4] = [
        [0.9, 0.1, -0.2],
        [0.3, 0.8, 0.5],
        [-0.4, 0.5, 0.9],
        [0.6, -0.9, -0.1],
    ];

    fn run(config: &SigmoidLossConfig, log_tau: f32, b: f32, step: u64) -> (f64, f64) {
        let device = Default::default();
        sigmoid_contrastive_loss(
            matrix(&X),
            matrix(&X_PRIME),
            scalar::<TestBackend>(log_tau, &device),
            scalar::<TestBackend>(b, &device),
            config,
            step,
        )
        .values()
    }

    fn assert_close(actual: (f64, f64), expected: (f64, f64)) {
        assert!(
            (actual.0 - expected.0).abs() < 1e-4,
            "loss: expected {}, got {}",
            expected.0,
            actual.0
        );
        assert!(
            (actual.1 - expected.1).abs() < 1e-4,
            "invariance: expected {}, got {}",
            expected.1,
            actual.1
        );
    }

    #[test]
    fn test_label_pattern_counts() {
        for n in 1..=7 {
            let labels = label_values(n);
            assert_eq!(labels.len(), n * n);
            let positives = labels.iter().filter(|&&l| l == 1.0).count();
            let negatives = labels.iter().filter(|&&l| l == -1.0).count();
            assert_eq!(positives, n, "n={n}");
            assert_eq!(negatives, n * n - n, "n={n}");
            for i in 0..n {
                assert_eq!(labels[i * n + i], 1.0);
            }
        }
    }

    #[test]
    fn test_unpenalized_matches_reference() {
        let config = SigmoidLossConfig::new();
        assert_close(
            run(&config, 1.0_f32.ln(), 0.0, 0),
            reference_loss(&X, &X_PRIME, 0.0, 0.0, &config, 0),
        );
    }

    #[test]
    fn test_gamma_zero_is_plain_log_sigmoid_sum() {
        let config = SigmoidLossConfig::new().with_gamma(0.0);
        let device = Default::default();
        let output = sigmoid_contrastive_loss(
            matrix(&X),
            matrix(&X_PRIME),
            scalar::<TestBackend>(0.5, &device),
            scalar::<TestBackend>(-0.3, &device),
            &config,
            0,
        );

        let logits: Vec<f32> = output.logits.clone().into_data().to_vec().unwrap();
        let labels = label_values(4);
        let expected: f64 = logits
            .iter()
            .zip(&labels)
            .map(|(&z, &l)| -log_sigmoid_f64((l * z) as f64))
            .sum::<f64>()
            / 4.0;
        let (loss, _) = output.values();
        assert!((loss - expected).abs() < 1e-4, "expected {expected}, got {loss}");
    }

    #[test]
    fn test_focal_penalty_matches_reference() {
        let config = SigmoidLossConfig::new().with_gamma(2.0).with_alpha(0.5);
        assert_close(
            run(&config, 1.2, -0.4, 0),
            reference_loss(&X, &X_PRIME, 1.2, -0.4, &config, 0),
        );
    }

    #[test]
    fn test_filtered_matches_reference() {
        let config = SigmoidLossConfig::new()
            .with_gamma(1.0)
            .with_penalty_filtering(true)
            .with_filtering_warmup_steps(10)
            .with_filtering_threshold(0.3);
        let filtered = run(&config, 1.5, -2.0, 11);
        assert_close(filtered, reference_loss(&X, &X_PRIME, 1.5, -2.0, &config, 11));

        // With a bias this negative some negatives are easy, so dropping them
        // changes the result relative to the soft penalty.
        let soft = run(&config, 1.5, -2.0, 10);
        assert!(
            (filtered.0 - soft.0).abs() > 1e-4,
            "filtering should change the loss: filtered={}, soft={}",
            filtered.0,
            soft.0
        );
    }

    #[test]
    fn test_warmup_gate_keeps_unfiltered_path() {
        let unfiltered = SigmoidLossConfig::new().with_gamma(2.0);
        let gated = SigmoidLossConfig::new()
            .with_gamma(2.0)
            .with_penalty_filtering(true)
            .with_filtering_warmup_steps(100);

        for step in [0, 50, 100] {
            let a = run(&unfiltered, 1.0, -1.0, step);
            let b = run(&gated, 1.0, -1.0, step);
            assert_eq!(a, b, "step {step} is inside warm-up and must match exactly");
        }
        assert!(gated.filtering_active(101));
        assert!(!gated.filtering_active(100));
    }

    #[test]
    fn test_scale_invariance() {
        let device = Default::default();
        let config = SigmoidLossConfig::new().with_gamma(1.0).with_alpha(0.3);
        let x = Tensor::<TestBackend, 2>::random([6, 8], Distribution::Normal(0.0, 1.0), &device);
        let x_prime =
            Tensor::<TestBackend, 2>::random([6, 8], Distribution::Normal(0.0, 1.0), &device);

        let base = sigmoid_contrastive_loss(
            x.clone(),
            x_prime.clone(),
            scalar::<TestBackend>(0.7, &device),
            scalar::<TestBackend>(0.1, &device),
            &config,
            0,
        )
        .values();
        let scaled = sigmoid_contrastive_loss(
            x.mul_scalar(2.0),
            x_prime.mul_scalar(3.0),
            scalar::<TestBackend>(0.7, &device),
            scalar::<TestBackend>(0.1, &device),
            &config,
            0,
        )
        .values();
        assert_close(scaled, base);
    }

    #[test]
    fn test_temperature_is_capped() {
        let config = SigmoidLossConfig::new().with_max_tau(5.0);
        let capped = run(&config, 5.0_f32.ln(), 0.0, 0);
        let runaway = run(&config, 10.0, 0.0, 0);
        assert_close(runaway, capped);
    }

    #[test]
    fn test_single_pair_batch() {
        let device = Default::default();
        let config = SigmoidLossConfig::new()
            .with_penalty_filtering(true)
            .with_filtering_warmup_steps(0);
        let x = Tensor::<TestBackend, 2>::from_data(TensorData::from([[3.0_f32, 4.0]]), &device);
        let x_prime =
            Tensor::<TestBackend, 2>::from_data(TensorData::from([[4.0_f32, 3.0]]), &device);

        let (loss, invariance) = sigmoid_contrastive_loss(
            x,
            x_prime,
            scalar::<TestBackend>(0.0, &device),
            scalar::<TestBackend>(0.0, &device),
            &config,
            1,
        )
        .values();

        // cos = 24/25; the lone positive is the only selected pair.
        let expected = -log_sigmoid_f64(24.0 / 25.0);
        assert!((loss - expected).abs() < 1e-5, "expected {expected}, got {loss}");
        assert!(invariance.abs() < 1e-6, "single pair has no asymmetry, got {invariance}");
    }

    #[test]
    fn test_small_batch_is_finite_and_non_negative() {
        let device = Default::default();
        let config = SigmoidLossConfig::new();
        let x = Tensor::<TestBackend, 2>::random([4, 8], Distribution::Normal(0.0, 1.0), &device);
        let x_prime =
            Tensor::<TestBackend, 2>::random([4, 8], Distribution::Normal(0.0, 1.0), &device);

        let (loss, invariance) = sigmoid_contrastive_loss(
            x,
            x_prime,
            scalar::<TestBackend>(1.0_f32.ln(), &device),
            scalar::<TestBackend>(0.0, &device),
            &config,
            0,
        )
        .values();
        assert!(loss.is_finite() && loss >= 0.0, "loss={loss}");
        assert!(invariance.is_finite() && invariance >= -1e-6, "invariance={invariance}");
    }

    #[test]
    fn test_alpha_adds_invariance() {
        let plain = run(&SigmoidLossConfig::new(), 0.4, 0.2, 0);
        let weighted = run(&SigmoidLossConfig::new().with_alpha(2.0), 0.4, 0.2, 0);
        assert!((weighted.1 - plain.1).abs() < 1e-6);
        assert!(
            (weighted.0 - (plain.0 + 2.0 * plain.1)).abs() < 1e-4,
            "plain={plain:?}, weighted={weighted:?}"
        );
    }

    #[test]
    fn test_gradients_reach_temperature_and_bias() {
        let device = Default::default();
        let config = SigmoidLossConfig::new().with_gamma(1.0).with_alpha(0.5);
        let x = Tensor::<TestAutodiffBackend, 2>::random(
            [5, 6],
            Distribution::Normal(0.0, 1.0),
            &device,
        )
        .require_grad();
        let x_prime = Tensor::<TestAutodiffBackend, 2>::random(
            [5, 6],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let log_tau = scalar::<TestAutodiffBackend>(0.5, &device).require_grad();
        let bias = scalar::<TestAutodiffBackend>(0.0, &device).require_grad();

        let output = sigmoid_contrastive_loss(
            x.clone(),
            x_prime,
            log_tau.clone(),
            bias.clone(),
            &config,
            0,
        );
        let grads = output.loss.backward();

        let tau_grad: f32 = log_tau.grad(&grads).unwrap().into_scalar().elem();
        let bias_grad: f32 = bias.grad(&grads).unwrap().into_scalar().elem();
        let x_grad: f32 = x.grad(&grads).unwrap().abs().sum().into_scalar().elem();

        assert!(tau_grad.is_finite() && tau_grad != 0.0, "tau grad {tau_grad}");
        // At b = 0 there are n² - n negatives pulling the bias down.
        assert!(bias_grad > 0.0, "bias grad should push b down, got {bias_grad}");
        assert!(x_grad > 0.0, "embedding gradient is zero");
    }
}
