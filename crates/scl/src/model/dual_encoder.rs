//! Online/target dual encoder.
//!
//! The online stack is trained by the optimizer together with the loss's
//! learnable temperature and bias ([`OnlineNetwork`]). The target stack is an
//! independently built copy of the same structure that only ever changes
//! through [`DualEncoder::update_target`] (momentum blend) or
//! [`DualEncoder::sync_target`] (hard copy). Its parameters carry no gradient
//! and are never part of the optimizer's module.
//!
//! ```text
//!          ┌──────────── online (grad) ────────────┐
//! view1 ─┬─▶ backbone ─▶ head ─▶ online1, online2  │ ─▶ loss ─▶ optimizer
//! view2 ─┤                                         │
//!        └─▶ backbone ─▶ head ─▶ target1, target2 (detached)
//!          └──── target ← target·m + online·(1-m) ─┘
//! ```

use std::path::Path;

use burn::module::{AutodiffModule, Param};
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};
use burn::tensor::backend::AutodiffBackend;
use burn::LearningRate;

use crate::error::{self, SclError};
use crate::model::backbone::Backbone;
use crate::model::batch_norm::Mode;
use crate::model::bridge::tensor_to_f64;
use crate::model::encoder::EncoderStack;
use crate::model::pairing::{
    max_abs_difference, snapshot, BlendPolicy, ParamPairing, TargetWriter, WriteRule,
};
use crate::model::projection_head::ProjectionHeadConfig;
use crate::training::loss::{sigmoid_contrastive_loss, SigmoidLossConfig, SigmoidLossOutput};

/// Configuration for the dual encoder.
#[derive(Config, Debug)]
pub struct DualEncoderConfig {
    /// Projection (embedding) dimension.
    #[config(default = 64)]
    pub mlp_out_dim: usize,
    /// Projection head hidden dimension.
    #[config(default = 512)]
    pub mlp_hidden: usize,
    /// Backbone feature dimension. Inferred from the backbone when unset.
    pub mlp_in_dim: Option<usize>,
    /// Initial log-temperature. `ln(1) = 0`.
    #[config(default = 0.0)]
    pub init_tau: f64,
    /// Initial logit bias.
    #[config(default = 0.0)]
    pub init_b: f64,
}

/// The trainable half of the model: online stack plus loss scalars.
///
/// This is the module handed to the optimizer.
#[derive(Module, Debug)]
pub struct OnlineNetwork<B: Backend, M> {
    pub encoder: EncoderStack<B, M>,
    /// Log-temperature, shape `(1,)`.
    pub log_tau: Param<Tensor<B, 1>>,
    /// Logit bias, shape `(1,)`.
    pub bias: Param<Tensor<B, 1>>,
}

/// Embeddings of two views through both branches.
#[derive(Debug, Clone)]
pub struct DualEmbeddings<B: Backend> {
    pub online1: Tensor<B, 2>,
    pub online2: Tensor<B, 2>,
    /// Detached from any graph.
    pub target1: Tensor<B, 2>,
    /// Detached from any graph.
    pub target2: Tensor<B, 2>,
}

/// Online/target encoder pair with momentum synchronization.
#[derive(Debug)]
pub struct DualEncoder<B: Backend, M> {
    online: OnlineNetwork<B, M>,
    target: EncoderStack<B, M>,
    pairing: ParamPairing,
    policy: BlendPolicy,
    mode: Mode,
    feature_dim: usize,
}

impl DualEncoderConfig {
    /// Build a dual encoder.
    ///
    /// `backbone` is called twice, once per stack, so the two stacks share no
    /// state. The target is then overwritten with the online values.
    ///
    /// Fails with [`SclError::Configuration`] when the backbone feature width
    /// cannot be determined, and with [`SclError::ShapeMismatch`] when the two
    /// built stacks do not line up.
    pub fn init<B: Backend, M: Backbone<B>>(
        &self,
        backbone: impl Fn(&B::Device) -> M,
        device: &B::Device,
    ) -> error::Result<DualEncoder<B, M>> {
        let online_backbone = backbone(device);
        let feature_dim = resolve_feature_dim(&online_backbone, self.mlp_in_dim, device)?;

        let head = ProjectionHeadConfig::new(feature_dim)
            .with_d_hidden(self.mlp_hidden)
            .with_d_output(self.mlp_out_dim);

        let online = EncoderStack {
            backbone: online_backbone,
            head: head.init(device),
        };
        let target = EncoderStack {
            backbone: backbone(device),
            head: head.init(device),
        }
        .no_grad();
        let pairing = ParamPairing::build::<B, _>(&online, &target)?;

        let mut model = DualEncoder {
            online: OnlineNetwork {
                encoder: online,
                log_tau: Param::from_tensor(Tensor::ones([1], device).mul_scalar(self.init_tau)),
                bias: Param::from_tensor(Tensor::ones([1], device).mul_scalar(self.init_b)),
            },
            target,
            pairing,
            policy: BlendPolicy::default(),
            mode: Mode::Train,
            feature_dim,
        };
        model.sync_target()?;

        tracing::info!(
            feature_dim,
            d_hidden = self.mlp_hidden,
            d_output = self.mlp_out_dim,
            paired_slots = model.pairing.len(),
            "Dual encoder initialized"
        );
        Ok(model)
    }
}

/// Explicit width, then the backbone's own report, then a probe forward pass.
fn resolve_feature_dim<B: Backend, M: Backbone<B>>(
    backbone: &M,
    explicit: Option<usize>,
    device: &B::Device,
) -> error::Result<usize> {
    let dim = match explicit.or_else(|| backbone.feature_dim()) {
        Some(dim) => dim,
        None => {
            let probe = backbone.probe_input(device).ok_or_else(|| {
                SclError::Configuration(
                    "cannot determine backbone feature dimension: set mlp_in_dim, \
                     or implement Backbone::feature_dim or Backbone::probe_input"
                        .to_string(),
                )
            })?;
            let [_, dim] = backbone.forward(probe, Mode::Eval).dims();
            tracing::debug!(dim, "Probed backbone feature dimension");
            dim
        }
    };
    if dim == 0 {
        return Err(SclError::Configuration(
            "backbone feature dimension must be > 0".to_string(),
        ));
    }
    Ok(dim)
}

impl<B: Backend, M: Backbone<B>> DualEncoder<B, M> {
    /// Replace the dtype allowlist used by momentum updates.
    pub fn with_blend_policy(mut self, policy: BlendPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn blend_policy(&self) -> &BlendPolicy {
        &self.policy
    }

    /// Mode used by [`forward`](Self::forward) and
    /// [`get_online_embedding`](Self::get_online_embedding).
    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Backbone feature width the projection heads were sized for.
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn online(&self) -> &OnlineNetwork<B, M> {
        &self.online
    }

    /// Mutable access to the trainable network.
    ///
    /// Replacing tensors is fine; changing the structure makes the next
    /// update or sync fail with [`SclError::ShapeMismatch`].
    pub fn online_mut(&mut self) -> &mut OnlineNetwork<B, M> {
        &mut self.online
    }

    pub fn target(&self) -> &EncoderStack<B, M> {
        &self.target
    }

    pub fn pairing(&self) -> &ParamPairing {
        &self.pairing
    }

    /// Run both views through both stacks.
    ///
    /// Online outputs stay on the autodiff graph; target outputs are detached.
    pub fn forward(&self, view1: M::Input, view2: M::Input) -> DualEmbeddings<B> {
        let online1 = self.online.encoder.forward(view1.clone(), self.mode);
        let online2 = self.online.encoder.forward(view2.clone(), self.mode);
        let target1 = self.target.forward(view1, self.mode).detach();
        let target2 = self.target.forward(view2, self.mode).detach();
        DualEmbeddings {
            online1,
            online2,
            target1,
            target2,
        }
    }

    /// Target embedding of one view, for inference. Always [`Mode::Eval`].
    pub fn get_target_embedding(&self, view: M::Input) -> Tensor<B, 2> {
        self.target.forward(view, Mode::Eval).detach()
    }

    /// Online embedding of one view, gradient tracked.
    pub fn get_online_embedding(&self, view: M::Input) -> Tensor<B, 2> {
        self.online.encoder.forward(view, self.mode)
    }

    /// Target backbone features of one view, for downstream use.
    pub fn target_features(&self, view: M::Input) -> Tensor<B, 2> {
        self.target.features(view, Mode::Eval).detach()
    }

    /// Sigmoid contrastive loss using this model's temperature and bias.
    pub fn loss(
        &self,
        x: Tensor<B, 2>,
        x_prime: Tensor<B, 2>,
        config: &SigmoidLossConfig,
        global_step: u64,
    ) -> SigmoidLossOutput<B> {
        sigmoid_contrastive_loss(
            x,
            x_prime,
            self.online.log_tau.val(),
            self.online.bias.val(),
            config,
            global_step,
        )
    }

    /// Effective temperature scale `clamp(exp(tau), 0, max_tau)`.
    pub fn temperature(&self, max_tau: f64) -> f64 {
        tensor_to_f64(self.online.log_tau.val())
            .exp()
            .clamp(0.0, max_tau)
    }

    pub fn bias(&self) -> f64 {
        tensor_to_f64(self.online.bias.val())
    }

    /// Blend the online values into the target:
    /// `target ← target * momentum + online * (1 - momentum)`.
    ///
    /// Only float pairs whose dtypes both pass the [`BlendPolicy`] are blended;
    /// integer and boolean buffers are left as they are. `momentum == 1` leaves
    /// the target untouched and `momentum == 0` copies eligible slots exactly.
    pub fn update_target(&mut self, momentum: f64) -> error::Result<()> {
        if momentum == 1.0 {
            return Ok(());
        }
        let (blended, skipped) = self.write_target(WriteRule::Momentum(momentum))?;
        tracing::debug!(momentum, blended, skipped, "Momentum update of target");
        Ok(())
    }

    /// Copy every online slot into the target, whatever its element type.
    pub fn sync_target(&mut self) -> error::Result<()> {
        let (copied, _) = self.write_target(WriteRule::Copy)?;
        tracing::info!(copied, "Target synchronized with online network");
        Ok(())
    }

    fn write_target(&mut self, rule: WriteRule) -> error::Result<(usize, usize)> {
        self.pairing
            .validate::<B, _>(&self.online.encoder, &self.target)?;

        let source = snapshot::<B, _>(&self.online.encoder);
        let mut writer = TargetWriter::new(source, &self.policy, rule);
        self.target = self.target.clone().map(&mut writer).no_grad();
        Ok((writer.written, writer.skipped))
    }

    /// Largest absolute difference between any paired online/target float.
    ///
    /// 0 right after [`sync_target`](Self::sync_target).
    pub fn divergence(&self) -> f64 {
        let online = snapshot::<B, _>(&self.online.encoder);
        let target = snapshot::<B, _>(&self.target);
        max_abs_difference(&online, &target)
    }

    /// Save the target backbone (without the projection head) for reuse as a
    /// pretrained feature extractor. Load it with
    /// [`FeatureExtractor::load`](crate::inference::FeatureExtractor::load).
    pub fn export_target_backbone(&self, path: &Path) -> error::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.target
            .backbone
            .clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|e| {
                SclError::Record(format!(
                    "Failed to save target backbone to {}: {e}",
                    path.display()
                ))
            })?;
        tracing::info!(path = %path.display(), "Exported target backbone");
        Ok(())
    }
}

impl<B: AutodiffBackend, M: Backbone<B>> DualEncoder<B, M>
where
    OnlineNetwork<B, M>: AutodiffModule<B>,
{
    /// Gradients of `loss` with respect to the online network only.
    pub fn backward(&self, loss: Tensor<B, 1>) -> GradientsParams {
        GradientsParams::from_grads(loss.backward(), &self.online)
    }

    /// Apply one optimizer step to the online network.
    pub fn step<O: Optimizer<OnlineNetwork<B, M>, B>>(
        mut self,
        optimizer: &mut O,
        lr: LearningRate,
        grads: GradientsParams,
    ) -> Self {
        self.online = optimizer.step(lr, self.online, grads);
        self
    }
}
