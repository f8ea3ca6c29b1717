//! Least squares solver.
//!
//! We repeatedly solve small linear regression problems of the form:
//!
//! ```text
//! minimize Σ (y_i - x_i^T β)^2
//! ```
//!
//! They show up in three places:
//! - log-linear fits `ln S = ln S0 - b D` during x0 estimation
//! - the linear amplitudes `(S0 f, S0 (1 - f))` for a fixed `(D*, D)` pair
//! - damped Gauss–Newton steps inside Levenberg–Marquardt (augmented system)
//!
//! We use SVD so tall (more rows than columns) systems are handled robustly.
//! (Nalgebra's `QR::solve` is intended for square systems and will panic for
//! non-square matrices.) The column count is tiny (2–4), so SVD cost is negligible.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Exponential design columns become nearly collinear when the two decay
    // rates approach each other, so retry with looser singular-value cutoffs.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Fit `y = intercept + slope * x` by OLS.
///
/// Returns `(intercept, slope)`, or `None` with fewer than two points or a
/// degenerate `x`.
pub fn fit_line(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let first = x[0];
    if x[..n].iter().all(|&v| (v - first).abs() < f64::EPSILON) {
        return None;
    }

    let design = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { x[i] });
    let obs = DVector::from_row_slice(&y[..n]);
    let beta = solve_least_squares(&design, &obs)?;
    Some((beta[0], beta[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn fit_line_recovers_log_linear_decay() {
        let b = [400.0, 500.0, 700.0, 1000.0];
        let ln_s: Vec<f64> = b.iter().map(|&b| 0.5_f64.ln() - b * 0.001).collect();
        let (intercept, slope) = fit_line(&b, &ln_s).unwrap();
        assert!((intercept.exp() - 0.5).abs() < 1e-10);
        assert!((slope + 0.001).abs() < 1e-12);
    }

    #[test]
    fn fit_line_rejects_degenerate_inputs() {
        assert!(fit_line(&[1.0], &[2.0]).is_none());
        assert!(fit_line(&[3.0, 3.0, 3.0], &[1.0, 2.0, 3.0]).is_none());
    }
}
