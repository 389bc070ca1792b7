//! Pretrained feature extraction from an exported target backbone.
//!
//! After pretraining, [`DualEncoder::export_target_backbone`] writes the
//! target backbone alone. [`FeatureExtractor`] loads it back into a freshly
//! built backbone of the same architecture and runs it in [`Mode::Eval`] for
//! downstream tasks. The projection head is not needed here.
//!
//! [`DualEncoder::export_target_backbone`]: crate::model::dual_encoder::DualEncoder::export_target_backbone

use std::path::Path;

use burn::prelude::*;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder};

use crate::model::backbone::Backbone;
use crate::model::batch_norm::Mode;
use crate::model::bridge::{rows_to_tensor, tensor_to_rows};

/// Frozen backbone producing `(batch, feature_dim)` features.
pub struct FeatureExtractor<B: Backend, M> {
    backbone: M,
    device: B::Device,
}

impl<B: Backend, M: Backbone<B>> FeatureExtractor<B, M> {
    /// Wrap an in-memory backbone.
    pub fn from_backbone(backbone: M, device: B::Device) -> Self {
        Self {
            backbone: backbone.no_grad(),
            device,
        }
    }

    /// Load exported weights into `template`.
    ///
    /// `template` must have the architecture of the exported backbone; its
    /// own parameter values are discarded.
    pub fn load(path: &Path, template: M, device: B::Device) -> anyhow::Result<Self> {
        let backbone = template
            .load_file(
                path.to_path_buf(),
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                &device,
            )
            .map_err(|e| anyhow::anyhow!("Failed to load backbone from {}: {e}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded pretrained backbone");
        Ok(Self::from_backbone(backbone, device))
    }

    pub fn backbone(&self) -> &M {
        &self.backbone
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    /// Features of one input batch.
    pub fn extract(&self, input: M::Input) -> Tensor<B, 2> {
        self.backbone.forward(input, Mode::Eval).detach()
    }
}

impl<B: Backend, M: Backbone<B, Input = Tensor<B, 2>>> FeatureExtractor<B, M> {
    /// Features of host-side vector rows, returned as host rows.
    pub fn extract_rows(&self, rows: &[Vec<f32>]) -> anyhow::Result<Vec<Vec<f32>>> {
        if rows.is_empty() {
            return Ok(vec![]);
        }
        let input = rows_to_tensor::<B>(rows, &self.device)?;
        Ok(tensor_to_rows(self.extract(input))?)
    }
}
