//! Biexponential IVIM signal evaluation.
//!
//! The fitter relies on three primitive operations:
//! - evaluate `S(b)` given `(S0, f, D*, D)` (for residuals/predictions)
//! - the analytic Jacobian row of `S(b)` (for Levenberg–Marquardt)
//! - a design row `[exp(-b D*), exp(-b D)]` for the amplitudes, which are
//!   linear once `D*` and `D` are fixed (for OLS during x0 estimation)

use crate::domain::{IvimParams, PARAM_COUNT};

/// `S(b) = S0 * (f * exp(-b D*) + (1 - f) * exp(-b D))`.
pub fn ivim_signal(params: &IvimParams, b: f64) -> f64 {
    let fast = (-b * params.d_star).exp();
    let slow = (-b * params.d).exp();
    params.s0 * (params.f * fast + (1.0 - params.f) * slow)
}

/// Evaluate the IVIM signal at every b-value.
pub fn ivim_function(params: &IvimParams, bvals: &[f64]) -> Vec<f64> {
    bvals.iter().map(|&b| ivim_signal(params, b)).collect()
}

/// Partial derivatives of `S(b)` with respect to `(S0, f, D*, D)`.
pub fn ivim_jacobian_row(params: &IvimParams, b: f64) -> [f64; PARAM_COUNT] {
    let fast = (-b * params.d_star).exp();
    let slow = (-b * params.d).exp();
    [
        params.f * fast + (1.0 - params.f) * slow,
        params.s0 * (fast - slow),
        -params.s0 * params.f * b * fast,
        -params.s0 * (1.0 - params.f) * b * slow,
    ]
}

/// Fill the two-column amplitude design row for fixed decay rates.
///
/// With `a = S0 f` and `c = S0 (1 - f)` the model reads `S(b) = a out[0] + c out[1]`.
///
/// # Panics
/// Panics if `out` has fewer than two elements.
pub fn fill_design_row(b: f64, d_star: f64, d: f64, out: &mut [f64]) {
    out[0] = (-b * d_star).exp();
    out[1] = (-b * d).exp();
}
