//! Training-side pieces: the sigmoid contrastive loss and metrics with
//! health checks.

pub mod loss;
pub mod metrics;
