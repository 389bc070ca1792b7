//! Sigmoid Contrastive Learning (SCL).
//!
//! A momentum dual-encoder: an online backbone + projection head trained by
//! gradient descent, and a target copy that trails it as an exponential moving
//! average. Paired projections from the two branches are scored with a
//! modulated sigmoid pairwise loss plus a softmax-consistency (KL) term.

pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod training;

pub use error::{Result, SclError};
