//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - model parameters and box constraints (`IvimParams`, `Bounds`)
//! - per-voxel fit outcomes (`VoxelFit`, `X0Source`)
//! - run configuration (`FitConfig`, `SimulationConfig`)
//! - export records (`ParamsFile`, `VoxelRecord`)

pub mod types;

pub use types::*;
