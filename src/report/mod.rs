//! Reporting utilities: parameter-map summaries and formatted terminal output.

pub mod format;

pub use format::*;

use crate::domain::{IvimParams, PARAM_COUNT};
use crate::fit::IvimFit;

/// Location and range of one parameter over the summarized voxels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamStats {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

/// Whole-map summary.
///
/// `stats` covers converged voxels whose parameters are physical. Converged
/// voxels outside the physical range (negative `D`, `f > 1`, ...) are counted
/// in `n_non_physical` and left out, so one runaway voxel cannot drag the
/// mean.
#[derive(Debug, Clone, PartialEq)]
pub struct FitSummary {
    pub n_voxels: usize,
    pub n_converged: usize,
    pub n_non_physical: usize,
    pub stats: Option<[ParamStats; PARAM_COUNT]>,
}

/// Median recovered parameters against a known truth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recovery {
    pub truth: IvimParams,
    pub median: IvimParams,
    /// `|median - truth| / |truth|` per parameter (absolute error when truth is 0).
    pub rel_error: [f64; PARAM_COUNT],
}

pub fn summarize(fit: &IvimFit) -> FitSummary {
    let converged: Vec<IvimParams> = fit
        .voxel_params()
        .into_iter()
        .zip(fit.converged().iter())
        .filter(|&(_, &ok)| ok)
        .map(|(p, _)| p)
        .collect();
    let (physical, non_physical): (Vec<IvimParams>, Vec<IvimParams>) =
        converged.iter().copied().partition(|p| p.is_physical());

    FitSummary {
        n_voxels: fit.converged().len(),
        n_converged: converged.len(),
        n_non_physical: non_physical.len(),
        stats: param_stats(&physical),
    }
}

/// Compare the summarized median with `truth`; `None` if no voxel qualifies.
pub fn recovery(truth: IvimParams, fit: &IvimFit) -> Option<Recovery> {
    let stats = summarize(fit).stats?;
    let median = IvimParams::from(stats.map(|s| s.median));
    let t = truth.to_array();
    let m = median.to_array();
    let rel_error = std::array::from_fn(|k| {
        let err = (m[k] - t[k]).abs();
        if t[k] == 0.0 { err } else { err / t[k].abs() }
    });
    Some(Recovery {
        truth,
        median,
        rel_error,
    })
}

fn param_stats(params: &[IvimParams]) -> Option<[ParamStats; PARAM_COUNT]> {
    if params.is_empty() {
        return None;
    }
    let n = params.len() as f64;
    Some(std::array::from_fn(|k| {
        let mut values: Vec<f64> = params.iter().map(|p| p.to_array()[k]).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 1 {
            values[mid]
        } else {
            0.5 * (values[mid - 1] + values[mid])
        };
        ParamStats {
            mean: values.iter().sum::<f64>() / n,
            median,
            min: values[0],
            max: values[values.len() - 1],
        }
    }))
}
