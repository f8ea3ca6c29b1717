//! Grid generation for the fallback `(D*, D)` search.
//!
//! When the segmented estimate of the starting point is unusable we fall back
//! to a deterministic grid search over the two decay rates; the amplitudes are
//! linear and solved by OLS at each grid node.

use crate::error::{IvimError, Result};

/// Generate `steps` log-spaced points between `min` and `max` (inclusive).
pub fn log_space(min: f64, max: f64, steps: usize) -> Result<Vec<f64>> {
    if !(min.is_finite() && max.is_finite() && min > 0.0 && max > 0.0 && max > min) {
        return Err(IvimError::invalid(format!(
            "Invalid grid range: min={min}, max={max} (must be finite, >0, and max>min)."
        )));
    }
    if steps < 2 {
        return Err(IvimError::invalid("Grid steps must be >= 2."));
    }

    let ln_min = min.ln();
    let ln_max = max.ln();
    let step = (ln_max - ln_min) / (steps as f64 - 1.0);

    let mut out = Vec::with_capacity(steps);
    for i in 0..steps {
        out.push((ln_min + step * i as f64).exp());
    }
    Ok(out)
}

/// Ranges and resolution of the fallback grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiffusionGrid {
    pub d_min: f64,
    pub d_max: f64,
    pub d_steps: usize,
    pub d_star_min: f64,
    pub d_star_max: f64,
    pub d_star_steps: usize,
    /// Required separation `D* >= min_ratio * D` (clamped to >= 1).
    pub min_ratio: f64,
}

impl Default for DiffusionGrid {
    fn default() -> Self {
        // mm^2/s, for b-values in s/mm^2.
        Self {
            d_min: 1e-4,
            d_max: 5e-3,
            d_steps: 30,
            d_star_min: 1e-3,
            d_star_max: 0.2,
            d_star_steps: 40,
            min_ratio: 2.0,
        }
    }
}

impl DiffusionGrid {
    /// All `(D*, D)` pairs with `D* >= min_ratio * D`, `D` varying fastest.
    pub fn pairs(&self) -> Result<Vec<(f64, f64)>> {
        let d_values = log_space(self.d_min, self.d_max, self.d_steps)?;
        let d_star_values = log_space(self.d_star_min, self.d_star_max, self.d_star_steps)?;
        let min_ratio = self.min_ratio.max(1.0);

        let mut out = Vec::new();
        for &d_star in &d_star_values {
            for &d in &d_values {
                if d_star >= d * min_ratio {
                    out.push((d_star, d));
                }
            }
        }
        if out.is_empty() {
            return Err(IvimError::invalid(
                "Diffusion grid has no (D*, D) pair satisfying the D*/D ratio.",
            ));
        }
        Ok(out)
    }
}
