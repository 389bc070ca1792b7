//! Pretrain a dual encoder on synthetic two-view data and export the target backbone.
//!
//! Each batch draws random anchor vectors and builds two views of them by
//! adding independent Gaussian noise. The model learns to match the views of
//! the same anchor against every other anchor in the batch.
//!
//! Usage:
//!   cargo run --release -p scl --example synthetic_pretrain -- \
//!     --config configs/pretrain.toml \
//!     --output checkpoints/scl/target_backbone

use std::path::PathBuf;

use burn::backend::{Autodiff, NdArray};
use burn::optim::AdamWConfig;
use burn::prelude::*;
use burn::tensor::Distribution;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use scl::config::{load_pretrain_toml, PretrainToml};
use scl::inference::FeatureExtractor;
use scl::model::backbone::LinearBackboneConfig;
use scl::training::metrics::{ContrastiveMetrics, MetricsHistory};

type TrainBackend = Autodiff<NdArray<f32>>;

#[derive(Parser)]
struct Args {
    /// Path to the pretraining TOML config. Defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Where to write the exported target backbone.
    #[arg(long, default_value = "checkpoints/scl/target_backbone")]
    output: PathBuf,
    /// Dimension of the synthetic input vectors.
    #[arg(long, default_value_t = 32)]
    input_dim: usize,
    /// Backbone output width.
    #[arg(long, default_value_t = 128)]
    feature_dim: usize,
    /// Standard deviation of the per-view noise.
    #[arg(long, default_value_t = 0.1)]
    view_noise: f64,
    /// Override `[train] steps`.
    #[arg(long)]
    steps: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_pretrain_toml(path)?,
        None => PretrainToml::default(),
    };
    let steps = args.steps.unwrap_or(config.train.steps);
    let batch_size = config.train.batch_size;
    let loss_config = config.loss.to_config();
    let momentum = config.target.momentum;

    let device = Default::default();
    let (input_dim, feature_dim) = (args.input_dim, args.feature_dim);
    let backbone = move |device: &<TrainBackend as Backend>::Device| {
        LinearBackboneConfig::new(input_dim, feature_dim).init::<TrainBackend>(device)
    };
    let mut model = config
        .model
        .to_config()
        .init(backbone, &device)?
        .with_blend_policy(config.target.blend_policy()?);

    let mut optim = AdamWConfig::new()
        .with_weight_decay(config.train.weight_decay)
        .init();
    let mut history = MetricsHistory::new();

    tracing::info!(steps, batch_size, momentum, "Starting synthetic pretraining");

    for step in 0..steps {
        let anchors = Tensor::<TrainBackend, 2>::random(
            [batch_size, input_dim],
            Distribution::Normal(0.0, 1.0),
            &device,
        );
        let noise = Distribution::Normal(0.0, args.view_noise);
        let view1 = anchors.clone() + Tensor::random([batch_size, input_dim], noise, &device);
        let view2 = anchors + Tensor::random([batch_size, input_dim], noise, &device);

        let out = model.forward(view1, view2);
        let forward = model.loss(out.online1, out.target2, &loss_config, step);
        let backward = model.loss(out.online2, out.target1, &loss_config, step);

        if step % config.train.log_interval.max(1) == 0 || step + 1 == steps {
            let metrics = ContrastiveMetrics::compute(
                &forward,
                model.temperature(loss_config.max_tau),
                model.bias(),
            )?;
            tracing::info!(
                step,
                loss = metrics.loss,
                invariance = metrics.invariance,
                logit_gap = metrics.logit_gap,
                top1 = metrics.top1_accuracy,
                temperature = metrics.temperature,
                bias = metrics.bias,
                divergence = model.divergence(),
                "train"
            );
            for warning in metrics.health_check(loss_config.max_tau) {
                tracing::warn!(step, "{warning}");
            }
            history.push(step, metrics);
        }

        let grads = model.backward(forward.loss + backward.loss);
        model = model.step(&mut optim, config.train.learning_rate, grads);
        model.update_target(momentum)?;
    }

    if let Some(improving) = history.loss_improving(2) {
        tracing::info!(improving, "Loss trend over the last logging windows");
    }

    model.export_target_backbone(&args.output)?;

    let template = backbone(&device);
    let extractor = FeatureExtractor::load(&args.output, template, device)?;
    let sample = vec![vec![0.5_f32; input_dim]];
    let features = extractor.extract_rows(&sample)?;
    tracing::info!(
        feature_dim = features.first().map_or(0, Vec::len),
        "Reloaded exported backbone"
    );

    Ok(())
}
