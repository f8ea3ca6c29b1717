//! Top-level application orchestration.
//!
//! `src/main.rs` stays tiny; this module is the "real main" that:
//! - loads `.env` and installs the log subscriber
//! - parses CLI arguments
//! - runs the fit / simulation pipeline
//! - prints reports and writes optional exports

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command, FitArgs, FitOptionArgs, SimulateArgs};
use crate::domain::{FitConfig, IvimParams, SimulationConfig};
use crate::error::{IvimError, Result};

pub mod pipeline;

/// Variable holding the log filter; `RUST_LOG` is used when it is unset.
pub const LOG_ENV: &str = "IVIM_LOG";

/// Voxels listed individually in the `fit` report.
const VOXEL_TABLE_LIMIT: usize = 10;

/// Entry point for the `ivim` binary.
pub fn run() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Fit(args) => handle_fit(args),
        Command::Simulate(args) => handle_simulate(args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    // A subscriber may already be installed (e.g. when embedded); keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn handle_fit(args: FitArgs) -> Result<()> {
    let config = fit_config_from_args(&args)?;
    let run = pipeline::run_fit(&config)?;

    println!(
        "{}",
        crate::report::format_fit_summary(&run.summary, run.model.gtab(), &config)
    );
    println!("{}", crate::report::format_voxel_table(&run.fit, VOXEL_TABLE_LIMIT));

    if let Some(path) = &config.export_csv {
        crate::io::write_params_csv(path, &run.fit)?;
    }
    if let Some(path) = &config.export_json {
        crate::io::write_params_json(path, &run.fit, run.model.gtab())?;
    }

    Ok(())
}

fn handle_simulate(args: SimulateArgs) -> Result<()> {
    let config = simulation_config_from_args(&args);
    let run = pipeline::run_simulation(&config)?;

    match &run.recovery {
        Some(recovery) => println!(
            "{}",
            crate::report::format_recovery(recovery, &run.summary, &config)
        ),
        None => println!("No simulated voxel converged."),
    }

    if let Some(path) = &config.export_csv {
        crate::io::write_params_csv(path, &run.fit)?;
    }

    Ok(())
}

pub fn fit_config_from_args(args: &FitArgs) -> Result<FitConfig> {
    let x0 = match &args.x0 {
        None => None,
        Some(values) => Some(IvimParams::from_slice(values).ok_or_else(|| {
            IvimError::invalid(format!(
                "--x0 needs 4 comma-separated values (S0,f,D*,D), got {}",
                values.len()
            ))
        })?),
    };
    let FitOptionArgs {
        split_b_d,
        split_b_s0,
        min_signal,
        bounded,
        max_iter,
    } = args.options.clone();

    Ok(FitConfig {
        bvals_path: args.bvals.clone(),
        bvecs_path: args.bvecs.clone(),
        signals_path: args.signals.clone(),
        x0,
        split_b_d,
        split_b_s0,
        min_signal,
        b0_threshold: args.b0_threshold,
        bounded,
        max_iter,
        export_csv: args.export.clone(),
        export_json: args.export_json.clone(),
    })
}

pub fn simulation_config_from_args(args: &SimulateArgs) -> SimulationConfig {
    SimulationConfig {
        truth: IvimParams::new(args.s0, args.f, args.d_star, args.d),
        voxels: args.voxels,
        snr: args.snr,
        seed: args.seed,
        split_b_d: args.options.split_b_d,
        split_b_s0: args.options.split_b_s0,
        min_signal: args.options.min_signal,
        bounded: args.options.bounded,
        max_iter: args.options.max_iter,
        export_csv: args.export.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_fit(extra: &[&str]) -> FitArgs {
        let mut argv = vec!["ivim", "fit", "--bvals", "b.txt", "--signals", "s.csv"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Fit(args) => args,
            Command::Simulate(_) => panic!("expected fit"),
        }
    }

    #[test]
    fn x0_must_have_four_values() {
        let args = parse_fit(&["--x0", "1,0.1,0.01"]);
        let err = fit_config_from_args(&args).unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let args = parse_fit(&["--x0", "1,0.1,0.01,0.001", "--bounded"]);
        let config = fit_config_from_args(&args).unwrap();
        assert_eq!(config.x0, Some(IvimParams::new(1.0, 0.1, 0.01, 0.001)));
        assert!(config.bounded);
    }
}
