//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - exported to JSON/CSV
//! - reloaded later for comparisons

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IvimError, Result};

/// Number of IVIM model parameters `(S0, f, D*, D)`.
pub const PARAM_COUNT: usize = 4;

/// Column labels in parameter order.
pub const PARAM_NAMES: [&str; PARAM_COUNT] = ["s0", "f", "d_star", "d"];

/// The four IVIM parameters.
///
/// - `s0`: signal at `b = 0`
/// - `f`: perfusion fraction
/// - `d_star`: pseudo-diffusion coefficient (fast compartment)
/// - `d`: diffusion coefficient (slow compartment)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IvimParams {
    pub s0: f64,
    pub f: f64,
    pub d_star: f64,
    pub d: f64,
}

impl IvimParams {
    pub const fn new(s0: f64, f: f64, d_star: f64, d: f64) -> Self {
        Self { s0, f, d_star, d }
    }

    pub fn to_array(self) -> [f64; PARAM_COUNT] {
        [self.s0, self.f, self.d_star, self.d]
    }

    /// Build from a slice in `(S0, f, D*, D)` order.
    pub fn from_slice(values: &[f64]) -> Option<Self> {
        match values {
            [s0, f, d_star, d] => Some(Self::new(*s0, *f, *d_star, *d)),
            _ => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }

    /// `0 <= f <= 1`, `D* >= 0`, `D >= 0` and a non-negative baseline.
    pub fn is_physical(&self) -> bool {
        self.is_finite()
            && self.s0 >= 0.0
            && (0.0..=1.0).contains(&self.f)
            && self.d_star >= 0.0
            && self.d >= 0.0
    }
}

impl From<[f64; PARAM_COUNT]> for IvimParams {
    fn from(v: [f64; PARAM_COUNT]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<IvimParams> for [f64; PARAM_COUNT] {
    fn from(p: IvimParams) -> Self {
        p.to_array()
    }
}

/// Box constraints on `(S0, f, D*, D)`.
///
/// Infinite limits are allowed; NaN is not.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub lower: [f64; PARAM_COUNT],
    pub upper: [f64; PARAM_COUNT],
}

impl Bounds {
    pub fn new(lower: [f64; PARAM_COUNT], upper: [f64; PARAM_COUNT]) -> Result<Self> {
        for k in 0..PARAM_COUNT {
            let (lo, hi) = (lower[k], upper[k]);
            if lo.is_nan() || hi.is_nan() {
                return Err(IvimError::invalid(format!(
                    "bounds for {} contain NaN",
                    PARAM_NAMES[k]
                )));
            }
            if lo > hi {
                return Err(IvimError::invalid(format!(
                    "lower bound {lo} exceeds upper bound {hi} for {}",
                    PARAM_NAMES[k]
                )));
            }
        }
        Ok(Self { lower, upper })
    }

    /// `S0 >= 0`, `0 <= f <= 1`, `0 <= D*, D <= 1`.
    pub fn physical() -> Self {
        Self {
            lower: [0.0, 0.0, 0.0, 0.0],
            upper: [f64::INFINITY, 1.0, 1.0, 1.0],
        }
    }

    pub fn contains(&self, x: &[f64; PARAM_COUNT]) -> bool {
        (0..PARAM_COUNT).all(|k| x[k] >= self.lower[k] && x[k] <= self.upper[k])
    }

    /// Clamp every coordinate into its interval.
    pub fn project(&self, x: &mut [f64; PARAM_COUNT]) {
        for k in 0..PARAM_COUNT {
            x[k] = x[k].clamp(self.lower[k], self.upper[k]);
        }
    }
}

/// Where the stage-2 starting point came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum X0Source {
    /// Supplied by the caller.
    User,
    /// Segmented log-linear estimate.
    Segmented,
    /// Fallback `(D*, D)` grid search with OLS amplitudes.
    Grid,
    /// Monoexponential guess for a voxel the grid cannot explain; the fit is
    /// never reported as converged.
    Fallback,
}

/// Outcome of fitting one voxel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelFit {
    pub params: IvimParams,
    pub x0: IvimParams,
    pub x0_source: X0Source,
    /// `0.5 * Σ r_i^2` at `params`.
    pub cost: f64,
    /// Residual evaluations spent by the solver.
    pub evaluations: usize,
    pub converged: bool,
}

/// Configuration for `ivim fit`, derived from CLI flags (plus defaults).
#[derive(Debug, Clone)]
pub struct FitConfig {
    pub bvals_path: PathBuf,
    pub bvecs_path: Option<PathBuf>,
    pub signals_path: PathBuf,

    pub x0: Option<IvimParams>,
    pub split_b_d: f64,
    pub split_b_s0: f64,
    pub min_signal: f64,
    pub b0_threshold: f64,
    /// Constrain the fit to `Bounds::physical()`.
    pub bounded: bool,
    pub max_iter: usize,

    pub export_csv: Option<PathBuf>,
    pub export_json: Option<PathBuf>,
}

/// Configuration for `ivim simulate`.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub truth: IvimParams,
    pub voxels: usize,
    /// `None` simulates noise-free signals.
    pub snr: Option<f64>,
    pub seed: u64,
    pub split_b_d: f64,
    pub split_b_s0: f64,
    pub min_signal: f64,
    pub bounded: bool,
    pub max_iter: usize,
    pub export_csv: Option<PathBuf>,
}

/// One voxel in an exported parameter file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoxelRecord {
    pub index: Vec<usize>,
    pub s0: f64,
    pub f: f64,
    pub d_star: f64,
    pub d: f64,
    pub converged: bool,
}

/// A saved parameter map (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsFile {
    pub tool: String,
    pub generated: DateTime<Utc>,
    pub bvals: Vec<f64>,
    pub voxel_shape: Vec<usize>,
    pub voxels: Vec<VoxelRecord>,
}
