//! Model components: backbone seam, projection head, batch normalization,
//! encoder stacks, parameter pairing, and the online/target dual encoder.

pub mod backbone;
pub mod batch_norm;
pub mod bridge;
pub mod dual_encoder;
pub mod encoder;
pub mod pairing;
pub mod projection_head;

pub use batch_norm::Mode;
