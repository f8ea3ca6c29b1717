//! Synthetic diffusion signals for tests and the `simulate` command.

pub mod multi_tensor;

pub use multi_tensor::*;
