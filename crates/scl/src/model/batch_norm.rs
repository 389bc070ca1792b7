use burn::module::{Param, RunningState};
use burn::prelude::*;

/// Evaluation mode for layers whose behavior depends on training vs inference.
///
/// Passed explicitly into every forward call instead of being inferred from
/// the backend, so the same module can run batch statistics on one call and
/// running statistics on the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Normalize with batch statistics and update the running estimates.
    #[default]
    Train,
    /// Normalize with the running estimates; no state is mutated.
    Eval,
}

/// Configuration for [`BatchNorm1d`].
#[derive(Config, Debug)]
pub struct BatchNorm1dConfig {
    /// Number of features (the second dimension of the input).
    pub num_features: usize,
    /// Weight of the current batch in the running-statistic update.
    #[config(default = 0.1)]
    pub momentum: f64,
    /// Added to the variance before taking the square root.
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

/// Per-feature batch normalization over `(batch, features)` inputs.
///
/// ```text
/// Train: y = (x - mean_batch) / sqrt(var_batch + eps) * gamma + beta
///        running ← (1 - momentum) * running + momentum * batch_stat
/// Eval:  y = (x - running_mean) / sqrt(running_var + eps) * gamma + beta
/// ```
///
/// Normalization uses the biased batch variance; the running variance tracks
/// the unbiased estimate.
#[derive(Module, Debug)]
pub struct BatchNorm1d<B: Backend> {
    /// Scale, shape `(features,)`. Initialized to 1.
    pub(crate) gamma: Param<Tensor<B, 1>>,
    /// Shift, shape `(features,)`. Initialized to 0.
    pub(crate) beta: Param<Tensor<B, 1>>,
    pub(crate) running_mean: RunningState<Tensor<B, 1>>,
    pub(crate) running_var: RunningState<Tensor<B, 1>>,
    momentum: f64,
    epsilon: f64,
}

impl BatchNorm1dConfig {
    /// Initialize a BatchNorm1d layer with unit scale and zero shift.
    pub fn init<B: Backend>(&self, device: &B::Device) -> BatchNorm1d<B> {
        BatchNorm1d {
            gamma: Param::from_tensor(Tensor::ones([self.num_features], device)),
            beta: Param::from_tensor(Tensor::zeros([self.num_features], device)),
            running_mean: RunningState::new(Tensor::zeros([self.num_features], device)),
            running_var: RunningState::new(Tensor::ones([self.num_features], device)),
            momentum: self.momentum,
            epsilon: self.epsilon,
        }
    }
}

impl<B: Backend> BatchNorm1d<B> {
    /// Input and output shape: `(batch, features)`.
    pub fn forward(&self, input: Tensor<B, 2>, mode: Mode) -> Tensor<B, 2> {
        match mode {
            Mode::Train => self.forward_train(input),
            Mode::Eval => self.forward_eval(input),
        }
    }

    fn forward_train(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, _] = input.dims();

        let mean = input.clone().mean_dim(0); // (1, features)
        let centered = input - mean.clone();
        let var = centered.clone().powf_scalar(2.0).mean_dim(0); // biased, (1, features)

        self.update_running(mean, var.clone(), batch);
        self.normalize(centered, var)
    }

    fn forward_eval(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        let mean = self.running_mean.value().unsqueeze::<2>();
        let var = self.running_var.value().unsqueeze::<2>();
        self.normalize(input - mean, var)
    }

    fn update_running(&self, mean: Tensor<B, 2>, var: Tensor<B, 2>, batch: usize) {
        // Bessel correction; a single-row batch keeps the biased value.
        let correction = batch as f64 / (batch.max(2) - 1) as f64;

        let mean: Tensor<B, 1> = mean.detach().squeeze::<1>(0);
        let var: Tensor<B, 1> = var.detach().squeeze::<1>(0);

        let running_mean = self.running_mean.value_sync();
        let running_var = self.running_var.value_sync();

        self.running_mean.update(
            running_mean
                .mul_scalar(1.0 - self.momentum)
                .add(mean.mul_scalar(self.momentum)),
        );
        self.running_var.update(
            running_var
                .mul_scalar(1.0 - self.momentum)
                .add(var.mul_scalar(self.momentum * correction)),
        );

        // Fold the per-thread update into the shared value so module
        // traversals observe it.
        self.running_mean.value_sync();
        self.running_var.value_sync();
    }

    fn normalize(&self, centered: Tensor<B, 2>, var: Tensor<B, 2>) -> Tensor<B, 2> {
        let std = var.add_scalar(self.epsilon).sqrt();
        let gamma = self.gamma.val().unsqueeze::<2>();
        let beta = self.beta.val().unsqueeze::<2>();
        centered / std * gamma + beta
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::{Distribution, TensorData};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_train_mode_standardizes_features() {
        let device = Default::default();
        let bn = BatchNorm1dConfig::new(8).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 2>::random(
            [64, 8],
            Distribution::Normal(3.0, 2.0),
            &device,
        );

        let output = bn.forward(input, Mode::Train);
        let mean: Vec<f32> = output.clone().mean_dim(0).into_data().to_vec().unwrap();
        let var: Vec<f32> = output
            .powf_scalar(2.0)
            .mean_dim(0)
            .into_data()
            .to_vec()
            .unwrap();

        for (m, v) in mean.iter().zip(&var) {
            assert!(m.abs() < 1e-4, "feature mean should be ~0, got {m}");
            assert!((v - 1.0).abs() < 1e-3, "feature variance should be ~1, got {v}");
        }
    }

    #[test]
    fn test_train_mode_updates_running_stats() {
        let device = Default::default();
        let bn = BatchNorm1dConfig::new(2).init::<TestBackend>(&device);
        // Column 0: mean 2, unbiased var 8/3. Column 1: constant 5, var 0.
        let input = Tensor::<TestBackend, 2>::from_data(
            TensorData::from([[0.0_f32, 5.0], [2.0, 5.0], [4.0, 5.0], [2.0, 5.0]]),
            &device,
        );

        bn.forward(input, Mode::Train);

        let running_mean: Vec<f32> = bn.running_mean.value().into_data().to_vec().unwrap();
        let running_var: Vec<f32> = bn.running_var.value().into_data().to_vec().unwrap();

        assert!((running_mean[0] - 0.2).abs() < 1e-6, "got {}", running_mean[0]);
        assert!((running_mean[1] - 0.5).abs() < 1e-6, "got {}", running_mean[1]);
        let expected_var0 = 0.9 + 0.1 * 8.0 / 3.0;
        assert!(
            (running_var[0] - expected_var0).abs() < 1e-5,
            "expected {expected_var0}, got {}",
            running_var[0]
        );
        assert!((running_var[1] - 0.9).abs() < 1e-6, "got {}", running_var[1]);
    }

    #[test]
    fn test_eval_mode_uses_running_stats_without_mutation() {
        let device = Default::default();
        let bn = BatchNorm1dConfig::new(4).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 2>::random(
            [3, 4],
            Distribution::Normal(10.0, 1.0),
            &device,
        );

        // Fresh running stats are mean 0 / var 1, so eval is ~identity.
        let output = bn.forward(input.clone(), Mode::Eval);
        let max_diff: f32 = (output - input).abs().max().into_scalar().elem();
        assert!(max_diff < 1e-3, "eval with fresh stats should be ~identity, diff={max_diff}");

        let running_mean: Vec<f32> = bn.running_mean.value().into_data().to_vec().unwrap();
        assert!(running_mean.iter().all(|&m| m == 0.0), "eval must not update running mean");
    }

    #[test]
    fn test_single_row_eval_is_well_defined() {
        let device = Default::default();
        let bn = BatchNorm1dConfig::new(4).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 2>::random(
            [1, 4],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let output = bn.forward(input, Mode::Eval);
        let data: Vec<f32> = output.into_data().to_vec().unwrap();
        assert!(data.iter().all(|v| v.is_finite()));
    }
}
