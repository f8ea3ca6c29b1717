//! Command-line parsing for the IVIM fitter.
//!
//! Argument parsing and command dispatch stay separate from the fitting code;
//! `app` turns these structs into `FitConfig` / `SimulationConfig`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "ivim", version, about = "IVIM biexponential diffusion MRI fitter")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit per-voxel signals from a CSV and print a parameter summary.
    Fit(FitArgs),
    /// Simulate voxels on the 26-point brain protocol, fit them and compare with the truth.
    Simulate(SimulateArgs),
}

/// Options shared by both subcommands.
#[derive(Debug, Parser, Clone)]
pub struct FitOptionArgs {
    /// b-values >= this estimate D in the initial guess.
    #[arg(long, default_value_t = 400.0)]
    pub split_b_d: f64,

    /// b-values < this estimate D* in the initial guess.
    #[arg(long, default_value_t = 200.0)]
    pub split_b_s0: f64,

    /// Signals are clamped from below to this value before fitting.
    #[arg(long, default_value_t = 1e-6)]
    pub min_signal: f64,

    /// Constrain the fit to S0 >= 0, 0 <= f <= 1, 0 <= D*, D <= 1.
    #[arg(long)]
    pub bounded: bool,

    /// Optimizer iteration cap.
    #[arg(long, default_value_t = 1000)]
    pub max_iter: usize,
}

/// Options for `ivim fit`.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// b-value file (whitespace or comma separated).
    #[arg(long, value_name = "FILE")]
    pub bvals: PathBuf,

    /// Optional b-vector file (3 x N or N x 3); random unit vectors otherwise.
    #[arg(long, value_name = "FILE")]
    pub bvecs: Option<PathBuf>,

    /// Signals CSV: one voxel per row, one column per b-value.
    #[arg(long, value_name = "CSV")]
    pub signals: PathBuf,

    /// Initial guess `S0,f,D*,D`; skips the estimated starting point.
    #[arg(long, value_delimiter = ',', value_name = "S0,F,DSTAR,D")]
    pub x0: Option<Vec<f64>>,

    /// b-values at or below this count as b0.
    #[arg(long, default_value_t = crate::gradients::DEFAULT_B0_THRESHOLD)]
    pub b0_threshold: f64,

    #[command(flatten)]
    pub options: FitOptionArgs,

    /// Export the parameter map to CSV.
    #[arg(long)]
    pub export: Option<PathBuf>,

    /// Export the parameter map to JSON.
    #[arg(long = "export-json")]
    pub export_json: Option<PathBuf>,
}

/// Options for `ivim simulate`.
#[derive(Debug, Parser, Clone)]
pub struct SimulateArgs {
    #[arg(long, default_value_t = 1.0)]
    pub s0: f64,

    /// Perfusion fraction.
    #[arg(long, default_value_t = 0.132)]
    pub f: f64,

    /// Pseudo-diffusion coefficient (mm^2/s).
    #[arg(long = "d-star", default_value_t = 0.00885)]
    pub d_star: f64,

    /// Diffusion coefficient (mm^2/s).
    #[arg(long, default_value_t = 0.000921)]
    pub d: f64,

    /// Signal-to-noise ratio for Rician noise; noise-free when omitted.
    #[arg(long)]
    pub snr: Option<f64>,

    /// Number of simulated voxels.
    #[arg(short = 'n', long, default_value_t = 100)]
    pub voxels: usize,

    /// Random seed for b-vectors and noise.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[command(flatten)]
    pub options: FitOptionArgs,

    /// Export the recovered parameter map to CSV.
    #[arg(long)]
    pub export: Option<PathBuf>,
}
