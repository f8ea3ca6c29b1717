//! Two-stage fitting routine for a single voxel.
//!
//! Given:
//! - b-values `b_i`
//! - observed signals `S_i`
//! - fitting options (split b-values, optional x0 and bounds, signal floor)
//!
//! we:
//! - clamp the signal from below to `min_signal`
//! - obtain a starting point (caller x0, or the stage-1 estimate)
//! - refine all four parameters with Levenberg–Marquardt (stage 2)
//!
//! and return the refined parameters with convergence diagnostics.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use nalgebra::{DVector, Dyn, OMatrix, Owned, U4, Vector4};
use tracing::{debug, warn};

use crate::domain::{Bounds, IvimParams, PARAM_COUNT, VoxelFit, X0Source};
use crate::error::{IvimError, Result};
use crate::fit::estimate::estimate_x0;
use crate::math::{BoxTransform, DiffusionGrid};
use crate::models::{ivim_jacobian_row, ivim_signal};

/// Default signal floor applied before fitting.
pub const DEFAULT_MIN_SIGNAL: f64 = 1e-6;

/// Solver tolerance; the MINPACK default of 30 machine epsilons.
pub const DEFAULT_TOL: f64 = 30.0 * f64::EPSILON;

/// Options that affect how each voxel is fitted.
#[derive(Debug, Clone, PartialEq)]
pub struct IvimOptions {
    /// b-values `>=` this are used to estimate `D` in stage 1.
    pub split_b_d: f64,
    /// b-values `<` this are used to estimate `D*` in stage 1.
    pub split_b_s0: f64,
    /// Explicit starting point; skips the stage-1 estimate.
    pub x0: Option<IvimParams>,
    /// Box constraints for stage 2.
    pub bounds: Option<Bounds>,
    /// Signals are clamped to at least this value.
    pub min_signal: f64,
    pub max_iter: usize,
    /// Relative tolerance for the cost and step criteria; also the gradient
    /// (orthogonality) tolerance.
    pub tol: f64,
    /// Fallback grid used when the segmented estimate is unusable.
    pub grid: DiffusionGrid,
}

impl Default for IvimOptions {
    fn default() -> Self {
        Self {
            split_b_d: 400.0,
            split_b_s0: 200.0,
            x0: None,
            bounds: None,
            min_signal: DEFAULT_MIN_SIGNAL,
            max_iter: 1000,
            tol: DEFAULT_TOL,
            grid: DiffusionGrid::default(),
        }
    }
}

impl IvimOptions {
    pub fn with_x0(mut self, x0: impl Into<IvimParams>) -> Self {
        self.x0 = Some(x0.into());
        self
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_min_signal(mut self, min_signal: f64) -> Self {
        self.min_signal = min_signal;
        self
    }

    pub fn with_split_b(mut self, split_b_d: f64, split_b_s0: f64) -> Self {
        self.split_b_d = split_b_d;
        self.split_b_s0 = split_b_s0;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_grid(mut self, grid: DiffusionGrid) -> Self {
        self.grid = grid;
        self
    }

    fn transform(&self) -> BoxTransform {
        match &self.bounds {
            Some(b) => BoxTransform::from_limits(&b.lower, &b.upper),
            None => BoxTransform::free(PARAM_COUNT),
        }
    }
}

/// Residuals `S(b_i; x) - S_i` for one voxel.
///
/// The solver moves unconstrained coordinates `u`; the model parameters are
/// `x = T(u)` for the box transform `T`, so every trial point is feasible.
pub struct IvimProblem<'a> {
    bvals: &'a [f64],
    signal: &'a [f64],
    transform: BoxTransform,
    u: Vector4<f64>,
}

impl<'a> IvimProblem<'a> {
    /// Unconstrained problem starting at `x0`.
    pub fn new(bvals: &'a [f64], signal: &'a [f64], x0: IvimParams) -> Self {
        Self::with_transform(bvals, signal, x0, BoxTransform::free(PARAM_COUNT))
    }

    pub fn with_transform(
        bvals: &'a [f64],
        signal: &'a [f64],
        x0: IvimParams,
        transform: BoxTransform,
    ) -> Self {
        let u = Vector4::from_column_slice(&transform.to_internal(&x0.to_array()));
        Self {
            bvals,
            signal,
            transform,
            u,
        }
    }

    /// Current model parameters.
    pub fn ivim_params(&self) -> IvimParams {
        let x = self.transform.to_external(self.u.as_slice());
        IvimParams::new(x[0], x[1], x[2], x[3])
    }
}

impl LeastSquaresProblem<f64, Dyn, U4> for IvimProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, U4>;
    type ParameterStorage = Owned<f64, U4>;

    fn set_params(&mut self, u: &Vector4<f64>) {
        self.u.copy_from(u);
    }

    fn params(&self) -> Vector4<f64> {
        self.u
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let p = self.ivim_params();
        Some(DVector::from_iterator(
            self.bvals.len(),
            self.bvals
                .iter()
                .zip(self.signal)
                .map(|(&b, &s)| ivim_signal(&p, b) - s),
        ))
    }

    fn jacobian(&self) -> Option<OMatrix<f64, Dyn, U4>> {
        let p = self.ivim_params();
        let dx_du = self.transform.derivative(self.u.as_slice());
        let rows: Vec<[f64; PARAM_COUNT]> =
            self.bvals.iter().map(|&b| ivim_jacobian_row(&p, b)).collect();
        Some(OMatrix::<f64, Dyn, U4>::from_fn_generic(
            Dyn(rows.len()),
            U4,
            |i, k| rows[i][k] * dx_du[k],
        ))
    }
}

/// Outcome of the stage-2 solve.
#[derive(Debug)]
pub struct Refinement {
    pub params: IvimParams,
    /// `0.5 * Σ r_i^2` at `params`.
    pub cost: f64,
    pub evaluations: usize,
    pub termination: TerminationReason,
}

impl Refinement {
    pub fn converged(&self) -> bool {
        self.termination.was_successful()
    }

    fn usable(&self) -> bool {
        self.converged() && self.params.is_finite()
    }
}

/// Stage 2: refine all four parameters from `x0`.
pub fn refine(bvals: &[f64], signal: &[f64], x0: IvimParams, opts: &IvimOptions) -> Refinement {
    let problem = IvimProblem::with_transform(bvals, signal, x0, opts.transform());
    let (problem, report) = LevenbergMarquardt::new()
        .with_ftol(opts.tol)
        .with_xtol(opts.tol)
        .with_gtol(opts.tol)
        .with_patience(opts.max_iter)
        .minimize(problem);
    Refinement {
        params: problem.ivim_params(),
        cost: report.objective_function,
        evaluations: report.number_of_evaluations,
        termination: report.termination,
    }
}

/// Fit one voxel with the two-stage routine.
pub fn fit_voxel(bvals: &[f64], signal: &[f64], opts: &IvimOptions) -> Result<VoxelFit> {
    if signal.len() != bvals.len() {
        return Err(IvimError::ShapeMismatch {
            what: "voxel signal",
            expected: vec![bvals.len()],
            found: vec![signal.len()],
        });
    }
    if signal.iter().any(|s| !s.is_finite()) {
        return Err(IvimError::Fit("Signal contains non-finite values.".to_string()));
    }

    let data: Vec<f64> = signal.iter().map(|&s| s.max(opts.min_signal)).collect();

    let (mut x0, mut source) = match opts.x0 {
        Some(x0) => (x0, X0Source::User),
        None => estimate_x0(bvals, &data, opts.split_b_d, opts.split_b_s0, &opts.grid)?,
    };
    x0 = project_params(x0, opts.bounds.as_ref());

    let mut refined = refine(bvals, &data, x0, opts);

    // A caller-supplied start that fails is retried from the estimated start;
    // the lower-cost result wins.
    if source == X0Source::User && !refined.usable() {
        warn!(
            termination = ?refined.termination,
            "fit from supplied x0 failed; retrying from estimated x0"
        );
        let (estimated, estimated_source) =
            estimate_x0(bvals, &data, opts.split_b_d, opts.split_b_s0, &opts.grid)?;
        let estimated = project_params(estimated, opts.bounds.as_ref());
        let retry = refine(bvals, &data, estimated, opts);
        if retry.usable() && (!refined.cost.is_finite() || retry.cost <= refined.cost) {
            refined = retry;
            x0 = estimated;
            source = estimated_source;
        }
    }

    let mut params = refined.params;
    let mut converged = refined.converged() && source != X0Source::Fallback;
    if !params.is_finite() {
        warn!("stage 2 produced non-finite parameters; keeping the starting point");
        params = x0;
        converged = false;
    } else {
        params = canonical_order(params, opts.bounds.as_ref());
        if !converged {
            warn!(
                evaluations = refined.evaluations,
                termination = ?refined.termination,
                ?source,
                "stage 2 did not converge"
            );
        }
    }

    debug!(
        ?params,
        ?source,
        evaluations = refined.evaluations,
        termination = ?refined.termination,
        cost = refined.cost,
        "voxel fitted"
    );

    Ok(VoxelFit {
        params,
        x0,
        x0_source: source,
        cost: refined.cost,
        evaluations: refined.evaluations,
        converged,
    })
}

/// The model is symmetric under `(f, D*, D) -> (1 - f, D, D*)`; report the
/// labelling with `D* >= D` unless that leaves the bounds.
fn canonical_order(params: IvimParams, bounds: Option<&Bounds>) -> IvimParams {
    if params.d_star >= params.d {
        return params;
    }
    let swapped = IvimParams::new(params.s0, 1.0 - params.f, params.d, params.d_star);
    match bounds {
        Some(b) if !b.contains(&swapped.to_array()) => params,
        _ => swapped,
    }
}

fn project_params(params: IvimParams, bounds: Option<&Bounds>) -> IvimParams {
    let Some(bounds) = bounds else {
        return params;
    };
    let mut x = params.to_array();
    bounds.project(&mut x);
    x.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradients::IVIM_PROTOCOL_BVALS;
    use crate::models::ivim_function;
    use approx::assert_relative_eq;

    const TRUTH: IvimParams = IvimParams::new(1.0, 0.132, 0.00885, 0.000921);

    #[test]
    fn fit_voxel_recovers_noise_free_parameters() {
        let signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        let fit = fit_voxel(&IVIM_PROTOCOL_BVALS, &signal, &IvimOptions::default()).unwrap();
        assert!(fit.converged);
        assert_eq!(fit.x0_source, X0Source::Segmented);
        assert_relative_eq!(fit.params.s0, TRUTH.s0, max_relative = 1e-6);
        assert_relative_eq!(fit.params.f, TRUTH.f, max_relative = 1e-5);
        assert_relative_eq!(fit.params.d_star, TRUTH.d_star, max_relative = 1e-5);
        assert_relative_eq!(fit.params.d, TRUTH.d, max_relative = 1e-6);
    }

    #[test]
    fn fit_voxel_uses_supplied_x0() {
        let signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        let opts = IvimOptions::default().with_x0([1.0, 0.1, 0.01, 0.001]);
        let fit = fit_voxel(&IVIM_PROTOCOL_BVALS, &signal, &opts).unwrap();
        assert_eq!(fit.x0_source, X0Source::User);
        assert_eq!(fit.x0, IvimParams::new(1.0, 0.1, 0.01, 0.001));
        assert_relative_eq!(fit.params.d, TRUTH.d, max_relative = 1e-6);
    }

    #[test]
    fn bounded_fit_stays_inside_box() {
        let signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        // Upper D* limit below the truth forces an active constraint.
        let bounds = Bounds::new([0.0, 0.0, 0.0, 0.0], [f64::INFINITY, 1.0, 0.005, 1.0]).unwrap();
        let opts = IvimOptions::default().with_bounds(bounds);
        let fit = fit_voxel(&IVIM_PROTOCOL_BVALS, &signal, &opts).unwrap();
        assert!(bounds.contains(&fit.params.to_array()));
        assert!(fit.params.d_star <= 0.005);
    }

    #[test]
    fn min_signal_floor_is_applied() {
        let mut signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        let last = signal.len() - 1;
        signal[last] = -0.5;
        let fit = fit_voxel(&IVIM_PROTOCOL_BVALS, &signal, &IvimOptions::default()).unwrap();
        assert!(fit.params.is_finite());
    }

    #[test]
    fn non_finite_signal_is_an_error() {
        let mut signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        signal[3] = f64::NAN;
        let err = fit_voxel(&IVIM_PROTOCOL_BVALS, &signal, &IvimOptions::default()).unwrap_err();
        assert!(matches!(err, IvimError::Fit(_)));
    }

    #[test]
    fn wrong_length_signal_is_a_shape_error() {
        let err = fit_voxel(&IVIM_PROTOCOL_BVALS, &[1.0, 0.9], &IvimOptions::default()).unwrap_err();
        assert!(err.is_value_error());
    }

    #[test]
    fn swapped_labelling_is_canonicalized() {
        let swapped = IvimParams::new(2.0, 0.868, 0.000921, 0.00885);
        let p = canonical_order(swapped, None);
        assert_eq!((p.d_star, p.d), (0.00885, 0.000921));
        assert_relative_eq!(p.f, 0.132, max_relative = 1e-12);
        assert_relative_eq!(
            ivim_signal(&p, 500.0),
            ivim_signal(&swapped, 500.0),
            max_relative = 1e-12
        );

        // Kept as-is when the swap would leave the box.
        let tight = Bounds::new([0.0; 4], [f64::INFINITY, 1.0, 0.005, 1.0]).unwrap();
        assert_eq!(canonical_order(swapped, Some(&tight)), swapped);
    }

    #[test]
    fn problem_residuals_vanish_at_truth() {
        let signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        let problem = IvimProblem::new(&IVIM_PROTOCOL_BVALS, &signal, TRUTH);
        let r = problem.residuals().unwrap();
        assert!(r.amax() < 1e-15);
        assert_eq!(problem.jacobian().unwrap().shape(), (26, 4));
    }

    #[test]
    fn bounded_jacobian_matches_finite_difference() {
        let signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        let transform = BoxTransform::from_limits(&[0.0; 4], &[f64::INFINITY, 1.0, 1.0, 1.0]);
        let start = IvimParams::new(0.9, 0.2, 0.01, 0.0012);
        let mut problem =
            IvimProblem::with_transform(&IVIM_PROTOCOL_BVALS, &signal, start, transform);
        let u = problem.params();
        let jac = problem.jacobian().unwrap();

        let h = 1e-7;
        for k in 0..PARAM_COUNT {
            let mut up = u;
            up[k] += h;
            problem.set_params(&up);
            let r_up = problem.residuals().unwrap();
            let mut dn = u;
            dn[k] -= h;
            problem.set_params(&dn);
            let r_dn = problem.residuals().unwrap();
            for i in 0..IVIM_PROTOCOL_BVALS.len() {
                let numeric = (r_up[i] - r_dn[i]) / (2.0 * h);
                assert_relative_eq!(jac[(i, k)], numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn exhausted_budget_is_not_converged() {
        let signal = ivim_function(&TRUTH, &IVIM_PROTOCOL_BVALS);
        let opts = IvimOptions::default().with_max_iter(1);
        let start = IvimParams::new(3.0, 0.5, 0.1, 0.01);
        let refined = refine(&IVIM_PROTOCOL_BVALS, &signal, start, &opts);
        assert!(!refined.converged());
        assert!(matches!(refined.termination, TerminationReason::LostPatience));
    }

    #[test]
    fn constant_voxel_is_fitted_but_flagged() {
        let signal = vec![5.0; IVIM_PROTOCOL_BVALS.len()];
        let fit = fit_voxel(&IVIM_PROTOCOL_BVALS, &signal, &IvimOptions::default()).unwrap();
        assert_eq!(fit.x0_source, X0Source::Fallback);
        assert!(!fit.converged);
        assert!(fit.params.is_finite());
    }

    #[test]
    fn zero_voxel_with_zero_floor_is_fitted_but_flagged() {
        let signal = vec![0.0; IVIM_PROTOCOL_BVALS.len()];
        let opts = IvimOptions::default().with_min_signal(0.0);
        let fit = fit_voxel(&IVIM_PROTOCOL_BVALS, &signal, &opts).unwrap();
        assert_eq!(fit.x0_source, X0Source::Fallback);
        assert!(!fit.converged);
        assert!(fit.params.is_finite());
    }
}
