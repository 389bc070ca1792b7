//! Contrastive training metrics and health checks.
//!
//! Summaries are computed from the logits of a [`SigmoidLossOutput`] and
//! tracked across logging steps in a [`MetricsHistory`].

use burn::prelude::*;

use crate::error::{Result, SclError};
use crate::training::loss::SigmoidLossOutput;

/// Per-step contrastive training metrics with health checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastiveMetrics {
    pub loss: f64,
    pub invariance: f64,
    /// Mean diagonal (positive-pair) logit.
    pub pos_logit_mean: f64,
    /// Mean off-diagonal (negative-pair) logit. 0 for single-row batches.
    pub neg_logit_mean: f64,
    /// `pos_logit_mean - neg_logit_mean`.
    pub logit_gap: f64,
    /// Fraction of rows whose positive logit beats every negative in the row.
    pub top1_accuracy: f64,
    /// Effective temperature scale `clamp(exp(tau), 0, max_tau)`.
    pub temperature: f64,
    pub bias: f64,
    pub batch_size: usize,
}

impl ContrastiveMetrics {
    /// Summarize a loss evaluation. Reads the logits back to the host.
    pub fn compute<B: Backend>(
        output: &SigmoidLossOutput<B>,
        temperature: f64,
        bias: f64,
    ) -> Result<Self> {
        let (loss, invariance) = output.values();
        let [n, _] = output.logits.dims();
        let logits: Vec<f32> = output
            .logits
            .clone()
            .into_data()
            .convert::<f32>()
            .to_vec()
            .map_err(|e| SclError::Data(format!("failed to read logits: {e:?}")))?;

        let mut pos_sum = 0.0;
        let mut neg_sum = 0.0;
        let mut correct = 0usize;
        for i in 0..n {
            let row = &logits[i * n..(i + 1) * n];
            let positive = row[i];
            pos_sum += positive as f64;
            let mut beats_all = true;
            for (j, &z) in row.iter().enumerate() {
                if j != i {
                    neg_sum += z as f64;
                    beats_all &= positive > z;
                }
            }
            correct += beats_all as usize;
        }

        let pos_logit_mean = if n > 0 { pos_sum / n as f64 } else { 0.0 };
        let negatives = n * n - n;
        let neg_logit_mean = if negatives > 0 {
            neg_sum / negatives as f64
        } else {
            0.0
        };

        Ok(Self {
            loss,
            invariance,
            pos_logit_mean,
            neg_logit_mean,
            logit_gap: pos_logit_mean - neg_logit_mean,
            top1_accuracy: if n > 0 { correct as f64 / n as f64 } else { 0.0 },
            temperature,
            bias,
            batch_size: n,
        })
    }

    /// Warnings for signs of divergence or representation collapse.
    pub fn health_check(&self, max_tau: f64) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.loss.is_finite() || !self.invariance.is_finite() {
            warnings.push(format!(
                "non-finite loss (loss={}, invariance={})",
                self.loss, self.invariance
            ));
        }
        if self.batch_size > 1 && self.logit_gap < 0.0 {
            warnings.push(format!(
                "negatives outscore positives (gap={:.4})",
                self.logit_gap
            ));
        }
        if self.temperature >= max_tau - 1e-6 {
            warnings.push(format!(
                "temperature saturated at max_tau={max_tau}"
            ));
        }
        if self.batch_size > 1 && self.top1_accuracy <= 1.0 / self.batch_size as f64 {
            warnings.push(format!(
                "top-1 retrieval at chance level ({:.3})",
                self.top1_accuracy
            ));
        }
        warnings
    }
}

/// Metrics recorded at logging steps.
#[derive(Debug, Default)]
pub struct MetricsHistory {
    entries: Vec<(u64, ContrastiveMetrics)>,
}

impl MetricsHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: u64, metrics: ContrastiveMetrics) {
        self.entries.push((step, metrics));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&(u64, ContrastiveMetrics)> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[(u64, ContrastiveMetrics)] {
        &self.entries
    }

    /// Whether the mean loss of the last `window` entries is below the mean of
    /// the `window` entries before them.
    pub fn loss_improving(&self, window: usize) -> Option<bool> {
        if window == 0 || self.entries.len() < 2 * window {
            return None;
        }
        let mean = |slice: &[(u64, ContrastiveMetrics)]| {
            slice.iter().map(|(_, m)| m.loss).sum::<f64>() / slice.len() as f64
        };
        let len = self.entries.len();
        let recent = mean(&self.entries[len - window..]);
        let earlier = mean(&self.entries[len - 2 * window..len - window]);
        Some(recent < earlier)
    }
}
