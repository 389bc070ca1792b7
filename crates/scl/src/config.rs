//! TOML config loading for pretraining runs.
//!
//! Deserializes `configs/pretrain.toml`, which has `[model]`, `[loss]`,
//! `[target]` and `[train]` sections. Every field is optional; missing
//! fields take the same defaults as the corresponding burn configs.

use std::path::Path;

use burn::tensor::DType;
use serde::Deserialize;

use crate::error::{Result, SclError};
use crate::model::dual_encoder::DualEncoderConfig;
use crate::model::pairing::BlendPolicy;
use crate::training::loss::SigmoidLossConfig;

/// Top-level structure matching `configs/pretrain.toml`.
#[derive(Debug, Default, Deserialize)]
pub struct PretrainToml {
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub loss: LossSection,
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub train: TrainSection,
}

/// `[model]`: dual encoder shape and initial loss scalars.
#[derive(Debug, Deserialize)]
pub struct ModelSection {
    #[serde(default = "default_mlp_out_dim")]
    pub mlp_out_dim: usize,
    #[serde(default = "default_mlp_hidden")]
    pub mlp_hidden: usize,
    /// Backbone feature width; inferred from the backbone when absent.
    #[serde(default)]
    pub mlp_in_dim: Option<usize>,
    #[serde(default)]
    pub init_tau: f64,
    #[serde(default)]
    pub init_b: f64,
}

/// `[loss]`: sigmoid contrastive loss settings.
#[derive(Debug, Deserialize)]
pub struct LossSection {
    #[serde(default)]
    pub alpha: f64,
    #[serde(default = "default_max_tau")]
    pub max_tau: f64,
    #[serde(default)]
    pub gamma: f64,
    #[serde(default)]
    pub penalty_filtering: bool,
    #[serde(default = "default_filtering_warmup_steps")]
    pub filtering_warmup_steps: u64,
    #[serde(default = "default_filtering_threshold")]
    pub filtering_threshold: f64,
}

/// `[target]`: momentum synchronization of the target stack.
#[derive(Debug, Deserialize)]
pub struct TargetSection {
    /// Momentum passed to `update_target` after each step.
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    /// Float dtypes eligible for blending: `"f64"`, `"f32"`, `"f16"`, `"bf16"`.
    #[serde(default = "default_blend_dtypes")]
    pub blend_dtypes: Vec<String>,
}

/// `[train]`: optimizer loop settings used by the pretraining driver.
#[derive(Debug, Deserialize)]
pub struct TrainSection {
    #[serde(default = "default_steps")]
    pub steps: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f32,
    /// Steps between metric log lines.
    #[serde(default = "default_log_interval")]
    pub log_interval: u64,
}

fn default_mlp_out_dim() -> usize {
    64
}
fn default_mlp_hidden() -> usize {
    512
}
fn default_max_tau() -> f64 {
    5.0
}
fn default_filtering_warmup_steps() -> u64 {
    5000
}
fn default_filtering_threshold() -> f64 {
    0.05
}
fn default_momentum() -> f64 {
    0.99
}
fn default_blend_dtypes() -> Vec<String> {
    ["f64", "f32", "f16", "bf16"].map(String::from).to_vec()
}
fn default_steps() -> u64 {
    200
}
fn default_batch_size() -> usize {
    32
}
fn default_learning_rate() -> f64 {
    1e-3
}
fn default_weight_decay() -> f32 {
    1e-4
}
fn default_log_interval() -> u64 {
    20
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            mlp_out_dim: default_mlp_out_dim(),
            mlp_hidden: default_mlp_hidden(),
            mlp_in_dim: None,
            init_tau: 0.0,
            init_b: 0.0,
        }
    }
}

impl Default for LossSection {
    fn default() -> Self {
        Self {
            alpha: 0.0,
            max_tau: default_max_tau(),
            gamma: 0.0,
            penalty_filtering: false,
            filtering_warmup_steps: default_filtering_warmup_steps(),
            filtering_threshold: default_filtering_threshold(),
        }
    }
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            momentum: default_momentum(),
            blend_dtypes: default_blend_dtypes(),
        }
    }
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            batch_size: default_batch_size(),
            learning_rate: default_learning_rate(),
            weight_decay: default_weight_decay(),
            log_interval: default_log_interval(),
        }
    }
}

impl ModelSection {
    pub fn to_config(&self) -> DualEncoderConfig {
        DualEncoderConfig::new()
            .with_mlp_out_dim(self.mlp_out_dim)
            .with_mlp_hidden(self.mlp_hidden)
            .with_mlp_in_dim(self.mlp_in_dim)
            .with_init_tau(self.init_tau)
            .with_init_b(self.init_b)
    }
}

impl LossSection {
    pub fn to_config(&self) -> SigmoidLossConfig {
        SigmoidLossConfig::new()
            .with_alpha(self.alpha)
            .with_max_tau(self.max_tau)
            .with_gamma(self.gamma)
            .with_penalty_filtering(self.penalty_filtering)
            .with_filtering_warmup_steps(self.filtering_warmup_steps)
            .with_filtering_threshold(self.filtering_threshold)
    }
}

impl TargetSection {
    /// Parse `blend_dtypes` into a [`BlendPolicy`].
    pub fn blend_policy(&self) -> Result<BlendPolicy> {
        let dtypes = self
            .blend_dtypes
            .iter()
            .map(|name| parse_float_dtype(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(BlendPolicy::new(dtypes))
    }
}

fn parse_float_dtype(name: &str) -> Result<DType> {
    match name.to_ascii_lowercase().as_str() {
        "f64" => Ok(DType::F64),
        "f32" => Ok(DType::F32),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        other => Err(SclError::Configuration(format!(
            "unknown blend dtype '{other}' (expected one of f64, f32, f16, bf16)"
        ))),
    }
}

/// Load and deserialize a [`PretrainToml`] from a TOML file.
pub fn load_pretrain_toml(path: &Path) -> Result<PretrainToml> {
    let contents = std::fs::read_to_string(path)?;
    let config: PretrainToml = toml::from_str(&contents)?;
    tracing::info!(path = %path.display(), "Loaded pretrain config");
    Ok(config)
}
