use burn::prelude::*;

use crate::model::backbone::Backbone;
use crate::model::batch_norm::Mode;
use crate::model::projection_head::ProjectionHead;

/// Backbone followed by a projection head.
///
/// Two of these exist per dual encoder: the trainable online stack and the
/// momentum-averaged target stack. Both are built from the same factory and
/// config, so their parameters line up slot for slot.
#[derive(Module, Debug)]
pub struct EncoderStack<B: Backend, M> {
    pub backbone: M,
    pub head: ProjectionHead<B>,
}

impl<B: Backend, M: Backbone<B>> EncoderStack<B, M> {
    /// Full stack: input → backbone features → embedding `(batch, d_output)`.
    pub fn forward(&self, input: M::Input, mode: Mode) -> Tensor<B, 2> {
        let features = self.backbone.forward(input, mode);
        self.head.forward(features, mode)
    }

    /// Backbone only: input → features `(batch, feature_dim)`.
    pub fn features(&self, input: M::Input, mode: Mode) -> Tensor<B, 2> {
        self.backbone.forward(input, mode)
    }
}
