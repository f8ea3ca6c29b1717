//! `ivim-fit` library crate.
//!
//! Fits the IVIM biexponential model
//! `S(b) = S0 * (f * exp(-b D*) + (1 - f) * exp(-b D))`
//! to diffusion MRI voxel signals.
//!
//! The binary (`ivim`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the model and fit result can be used directly on `ndarray` volumes

pub mod app;
pub mod cli;
pub mod domain;
pub mod error;
pub mod fit;
pub mod gradients;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
pub mod sims;

pub use domain::{Bounds, IvimParams};
pub use error::{IvimError, Result};
pub use fit::{IvimFit, IvimModel, IvimOptions};
pub use gradients::GradientTable;
