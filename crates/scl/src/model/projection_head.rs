use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use crate::model::batch_norm::{BatchNorm1d, BatchNorm1dConfig, Mode};

/// Configuration for the ProjectionHead MLP.
///
/// ```text
/// (batch, d_input)
///   → Linear(d_input→d_hidden, no bias)
///   → BatchNorm1d(d_hidden) → ReLU
///   → Linear(d_hidden→d_output, no bias)
///   → embedding: (batch, d_output)
/// ```
#[derive(Config, Debug)]
pub struct ProjectionHeadConfig {
    /// Backbone feature dimension.
    pub d_input: usize,
    /// Hidden layer dimension.
    #[config(default = 512)]
    pub d_hidden: usize,
    /// Embedding dimension used for contrastive comparison.
    #[config(default = 64)]
    pub d_output: usize,
}

/// Projection head mapping backbone features to the contrastive embedding space.
#[derive(Module, Debug)]
pub struct ProjectionHead<B: Backend> {
    pub(crate) linear1: Linear<B>,
    pub(crate) norm: BatchNorm1d<B>,
    pub(crate) linear2: Linear<B>,
}

impl ProjectionHeadConfig {
    /// Initialize a ProjectionHead with the given configuration.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ProjectionHead<B> {
        ProjectionHead {
            linear1: LinearConfig::new(self.d_input, self.d_hidden)
                .with_bias(false)
                .init(device),
            norm: BatchNorm1dConfig::new(self.d_hidden).init(device),
            linear2: LinearConfig::new(self.d_hidden, self.d_output)
                .with_bias(false)
                .init(device),
        }
    }
}

impl<B: Backend> ProjectionHead<B> {
    /// Input shape: `(batch, d_input)`. Output shape: `(batch, d_output)`.
    ///
    /// In [`Mode::Train`] the normalization layer uses batch statistics and
    /// updates its running estimates; in [`Mode::Eval`] it uses the estimates.
    pub fn forward(&self, features: Tensor<B, 2>, mode: Mode) -> Tensor<B, 2> {
        let x = self.linear1.forward(features);
        let x = self.norm.forward(x, mode);
        let x = burn::tensor::activation::relu(x);
        self.linear2.forward(x)
    }
}
