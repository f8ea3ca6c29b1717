//! Stage 1: starting-point estimation for a single voxel.
//!
//! The segmented estimate exploits that the fast compartment has decayed at
//! high b-values:
//!
//! 1. `S0` is the mean signal at the lowest b-value
//! 2. a log-linear fit `ln S = ln S0' - b D` over `b >= split_b_d` gives `D`
//!    and the slow-compartment intercept `S0'`, hence `f = 1 - S0'/S0`
//! 3. subtracting `S0' exp(-b D)` over `b < split_b_s0` leaves the fast
//!    compartment, whose log-linear slope gives `D*`
//!
//! When any of that is unusable (too few points, `f` outside `(0, 1)`,
//! `D* <= D`) we fall back to a deterministic grid search over `(D*, D)`:
//! for fixed decay rates the amplitudes `(S0 f, S0 (1 - f))` are linear and
//! solved by OLS, and the lowest-SSE node wins.
//!
//! A flat or featureless voxel can leave every grid node with a negative
//! amplitude. That voxel still gets a finite monoexponential guess (`f = 0`)
//! so the batch carries on; the fitter flags it as not converged.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::domain::{IvimParams, X0Source};
use crate::error::Result;
use crate::math::{DiffusionGrid, fit_line, solve_least_squares};
use crate::models::fill_design_row;

/// Perfusion fractions below this are treated as undetectable by the segmented fit.
const MIN_FRACTION: f64 = 1e-3;

#[derive(Debug, Clone)]
struct Candidate {
    idx: usize,
    params: IvimParams,
    sse: f64,
}

/// Estimate the stage-2 starting point, falling back to the grid search.
pub fn estimate_x0(
    bvals: &[f64],
    signal: &[f64],
    split_b_d: f64,
    split_b_s0: f64,
    grid: &DiffusionGrid,
) -> Result<(IvimParams, X0Source)> {
    if let Some(params) = segmented_estimate(bvals, signal, split_b_d, split_b_s0) {
        debug!(?params, "segmented x0 estimate");
        return Ok((params, X0Source::Segmented));
    }

    warn!("segmented x0 estimate unusable; falling back to (D*, D) grid search");
    if let Some(params) = grid_estimate(bvals, signal, grid)? {
        debug!(?params, "grid x0 estimate");
        return Ok((params, X0Source::Grid));
    }

    let params = fallback_estimate(bvals, signal, grid);
    warn!(?params, "no usable (D*, D) grid node; using monoexponential guess");
    Ok((params, X0Source::Fallback))
}

/// Segmented log-linear estimate; `None` when the result is not usable.
pub fn segmented_estimate(
    bvals: &[f64],
    signal: &[f64],
    split_b_d: f64,
    split_b_s0: f64,
) -> Option<IvimParams> {
    let s0 = baseline_signal(bvals, signal)?;

    let (b_high, ln_high): (Vec<f64>, Vec<f64>) = bvals
        .iter()
        .zip(signal)
        .filter(|&(&b, &s)| b >= split_b_d && s > 0.0)
        .map(|(&b, &s)| (b, s.ln()))
        .unzip();
    let (intercept, slope) = fit_line(&b_high, &ln_high)?;
    let d = -slope;
    let s0_slow = intercept.exp();
    let f = 1.0 - s0_slow / s0;
    if !(d.is_finite() && d > 0.0 && f.is_finite() && f > MIN_FRACTION && f < 1.0) {
        return None;
    }

    let (b_low, ln_fast): (Vec<f64>, Vec<f64>) = bvals
        .iter()
        .zip(signal)
        .filter(|&(&b, _)| b < split_b_s0)
        .map(|(&b, &s)| (b, s - s0_slow * (-b * d).exp()))
        .filter(|&(_, residual)| residual > 0.0)
        .map(|(b, residual)| (b, residual.ln()))
        .unzip();
    let (_, slope_fast) = fit_line(&b_low, &ln_fast)?;
    let d_star = -slope_fast;
    if !(d_star.is_finite() && d_star > d) {
        return None;
    }

    Some(IvimParams::new(s0, f, d_star, d))
}

/// Grid search over `(D*, D)` with OLS amplitudes (parallel).
///
/// `Ok(None)` when no node gives non-negative amplitudes.
pub fn grid_estimate(
    bvals: &[f64],
    signal: &[f64],
    grid: &DiffusionGrid,
) -> Result<Option<IvimParams>> {
    let pairs = grid.pairs()?;
    let y = DVector::from_row_slice(signal);

    let candidates: Vec<Candidate> = pairs
        .par_iter()
        .enumerate()
        .filter_map(|(idx, &(d_star, d))| {
            evaluate_candidate(bvals, &y, d_star, d).map(|(params, sse)| Candidate { idx, params, sse })
        })
        .collect();

    // Deterministic selection: pick the minimum SSE; break ties by original grid index.
    let Some((first, rest)) = candidates.split_first() else {
        return Ok(None);
    };
    let mut best = first;
    for c in rest {
        if c.sse < best.sse || (c.sse == best.sse && c.idx < best.idx) {
            best = c;
        }
    }

    Ok(Some(best.params))
}

/// Monoexponential guess for signals the grid cannot explain.
///
/// `S0` is the baseline (or the largest sample), `f = 0`, and `D` is the
/// log-linear slope over all positive samples, clamped into the grid's `D`
/// range. `D*` sits on the grid's ratio line above `D`.
pub fn fallback_estimate(bvals: &[f64], signal: &[f64], grid: &DiffusionGrid) -> IvimParams {
    let s0 = baseline_signal(bvals, signal)
        .unwrap_or_else(|| signal.iter().copied().fold(0.0, f64::max));

    let (b, ln_s): (Vec<f64>, Vec<f64>) = bvals
        .iter()
        .zip(signal)
        .filter(|&(_, &s)| s > 0.0)
        .map(|(&b, &s)| (b, s.ln()))
        .unzip();
    let d = fit_line(&b, &ln_s)
        .map(|(_, slope)| -slope)
        .filter(|d| d.is_finite())
        .map_or(grid.d_min, |d| d.clamp(grid.d_min, grid.d_max));
    let d_star = (d * grid.min_ratio.max(1.0)).max(grid.d_star_min);

    IvimParams::new(s0, 0.0, d_star, d)
}

fn evaluate_candidate(bvals: &[f64], y: &DVector<f64>, d_star: f64, d: f64) -> Option<(IvimParams, f64)> {
    let n = bvals.len();
    let mut x = DMatrix::<f64>::zeros(n, 2);
    let mut row = [0.0; 2];
    for (i, &b) in bvals.iter().enumerate() {
        fill_design_row(b, d_star, d, &mut row);
        x[(i, 0)] = row[0];
        x[(i, 1)] = row[1];
    }

    let beta = solve_least_squares(&x, y)?;
    let (fast, slow) = (beta[0], beta[1]);
    // Both compartments must carry non-negative signal.
    if !(fast >= 0.0 && slow > 0.0) {
        return None;
    }

    let sse = (&x * &beta - y).norm_squared();
    if !sse.is_finite() {
        return None;
    }

    let s0 = fast + slow;
    Some((IvimParams::new(s0, fast / s0, d_star, d), sse))
}

/// Mean signal at the lowest b-value.
fn baseline_signal(bvals: &[f64], signal: &[f64]) -> Option<f64> {
    let b_min = bvals.iter().copied().fold(f64::INFINITY, f64::min);
    if !b_min.is_finite() {
        return None;
    }
    let (sum, count) = bvals
        .iter()
        .zip(signal)
        .filter(|&(&b, _)| b == b_min)
        .fold((0.0, 0usize), |(sum, count), (_, &s)| (sum + s, count + 1));
    let mean = sum / count as f64;
    (count > 0 && mean.is_finite() && mean > 0.0).then_some(mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradients::IVIM_PROTOCOL_BVALS;
    use crate::models::ivim_function;

    const TRUTH: IvimParams = IvimParams::new(1.0, 0.132, 0.00885, 0.000921);

    #[test]
    fn segmented_estimate_is_close_to_truth() {
        let signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        let p = segmented_estimate(&IVIM_PROTOCOL_BVALS, &signal, 400.0, 200.0).unwrap();
        assert!((p.s0 - 1.0).abs() < 1e-12);
        assert!((p.f - TRUTH.f).abs() < 0.03, "f={}", p.f);
        assert!((p.d - TRUTH.d).abs() / TRUTH.d < 0.1, "d={}", p.d);
        assert!((p.d_star - TRUTH.d_star).abs() / TRUTH.d_star < 0.3, "d*={}", p.d_star);
    }

    #[test]
    fn segmented_estimate_rejects_monoexponential_signal() {
        // No fast compartment: f estimate collapses to ~0 and is rejected.
        let mono = IvimParams::new(1.0, 0.0, 0.01, 0.001);
        let signal = ivim_function(&mono, &IVIM_PROTOCOL_BVALS);
        assert!(segmented_estimate(&IVIM_PROTOCOL_BVALS, &signal, 400.0, 200.0).is_none());
    }

    #[test]
    fn segmented_estimate_needs_high_b_points() {
        let bvals = [0.0, 10.0, 20.0, 50.0, 100.0, 150.0];
        let signal = ivim_function(&TRUTH, &bvals);
        assert!(segmented_estimate(&bvals, &signal, 400.0, 200.0).is_none());
    }

    #[test]
    fn grid_estimate_brackets_truth() {
        let signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        let p = grid_estimate(&IVIM_PROTOCOL_BVALS, &signal, &DiffusionGrid::default())
            .unwrap()
            .unwrap();
        assert!(p.is_physical());
        assert!((p.s0 - 1.0).abs() < 0.05);
        assert!((p.d - TRUTH.d).abs() / TRUTH.d < 0.25, "d={}", p.d);
        assert!(p.d_star > p.d);
    }

    #[test]
    fn estimate_falls_back_to_grid() {
        let bvals = [0.0, 10.0, 20.0, 50.0, 100.0, 150.0];
        let signal = ivim_function(&TRUTH, &bvals);
        let (p, source) =
            estimate_x0(&bvals, &signal, 400.0, 200.0, &DiffusionGrid::default()).unwrap();
        assert_eq!(source, X0Source::Grid);
        assert!(p.is_physical());
    }

    #[test]
    fn constant_signal_has_no_grid_node() {
        let signal = vec![5.0; IVIM_PROTOCOL_BVALS.len()];
        let grid = DiffusionGrid::default();
        assert_eq!(grid_estimate(&IVIM_PROTOCOL_BVALS, &signal, &grid).unwrap(), None);

        let (p, source) = estimate_x0(&IVIM_PROTOCOL_BVALS, &signal, 400.0, 200.0, &grid).unwrap();
        assert_eq!(source, X0Source::Fallback);
        assert_eq!(p, IvimParams::new(5.0, 0.0, grid.d_star_min, grid.d_min));
    }

    #[test]
    fn all_zero_signal_gets_a_finite_guess() {
        let signal = vec![0.0; IVIM_PROTOCOL_BVALS.len()];
        let grid = DiffusionGrid::default();
        let (p, source) = estimate_x0(&IVIM_PROTOCOL_BVALS, &signal, 400.0, 200.0, &grid).unwrap();
        assert_eq!(source, X0Source::Fallback);
        assert!(p.is_finite());
        assert_eq!((p.s0, p.f), (0.0, 0.0));
        assert!(p.d_star > p.d);
    }

    #[test]
    fn fallback_slope_is_clamped_into_grid_range() {
        let grid = DiffusionGrid::default();
        let bvals = [0.0, 500.0, 1000.0];
        // Rising signal: negative slope estimate.
        let p = fallback_estimate(&bvals, &[1.0, 2.0, 3.0], &grid);
        assert_eq!(p.d, grid.d_min);
        let mono = IvimParams::new(2.0, 0.0, 0.01, 0.001);
        let p = fallback_estimate(&bvals, &ivim_function(&mono, &bvals), &grid);
        assert!((p.d - 0.001).abs() < 1e-12);
        assert!((p.d_star - 0.002).abs() < 1e-12);
    }

    #[test]
    fn baseline_averages_repeated_b0() {
        let bvals = [0.0, 0.0, 500.0];
        let signal = [1.0, 3.0, 0.5];
        assert_eq!(baseline_signal(&bvals, &signal), Some(2.0));
        assert_eq!(baseline_signal(&[], &[]), None);
    }
}
