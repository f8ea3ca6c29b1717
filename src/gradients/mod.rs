//! Diffusion acquisition descriptions.
//!
//! - validated `(b-value, b-vector)` tables (`table`)
//! - random unit b-vectors for simulations (`bvecs`)

pub mod bvecs;
pub mod table;

pub use bvecs::*;
pub use table::*;
