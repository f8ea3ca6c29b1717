//! IVIM fitting.
//!
//! Responsibilities:
//!
//! - estimate a starting point per voxel (segmented fit, grid fallback)
//! - refine `(S0, f, D*, D)` with bounded Levenberg–Marquardt
//! - fit whole voxel arrays in parallel and expose parameter maps

pub mod estimate;
pub mod fitter;
pub mod ivim;

pub use estimate::*;
pub use fitter::*;
pub use ivim::*;
