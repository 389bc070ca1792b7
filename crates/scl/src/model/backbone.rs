//! Feature-extractor seam for the dual encoder.
//!
//! The backbone lives **outside** this crate's concern: any burn module that
//! maps a raw input batch to `(batch, features)` can be slotted under the
//! projection head by implementing [`Backbone`]. The dual encoder needs to
//! know the feature width to size the head; it asks [`Backbone::feature_dim`]
//! first and falls back to running [`Backbone::probe_input`] through the
//! network and reading the output shape.

use burn::module::ModuleDisplay;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;

use crate::model::batch_norm::Mode;

/// A feature extractor usable as the first stage of an encoder stack.
pub trait Backbone<B: Backend>: Module<B> + ModuleDisplay {
    /// Raw input batch accepted by the backbone (e.g. `Tensor<B, 4>` images).
    type Input: Clone;

    /// Map an input batch to features of shape `(batch, feature_dim)`.
    fn forward(&self, input: Self::Input, mode: Mode) -> Tensor<B, 2>;

    /// Output feature width, when it is known statically.
    fn feature_dim(&self) -> Option<usize> {
        None
    }

    /// A small input batch used to infer the feature width by a forward pass.
    fn probe_input(&self, _device: &B::Device) -> Option<Self::Input> {
        None
    }
}

/// Configuration for [`LinearBackbone`].
#[derive(Config, Debug)]
pub struct LinearBackboneConfig {
    /// Input vector dimension.
    pub d_input: usize,
    /// Output feature dimension.
    pub d_output: usize,
}

/// Single linear layer followed by ReLU over vector inputs.
#[derive(Module, Debug)]
pub struct LinearBackbone<B: Backend> {
    pub linear: Linear<B>,
    d_output: usize,
}

impl LinearBackboneConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LinearBackbone<B> {
        LinearBackbone {
            linear: LinearConfig::new(self.d_input, self.d_output).init(device),
            d_output: self.d_output,
        }
    }
}

impl<B: Backend> Backbone<B> for LinearBackbone<B> {
    type Input = Tensor<B, 2>;

    fn forward(&self, input: Tensor<B, 2>, _mode: Mode) -> Tensor<B, 2> {
        burn::tensor::activation::relu(self.linear.forward(input))
    }

    fn feature_dim(&self) -> Option<usize> {
        Some(self.d_output)
    }
}
