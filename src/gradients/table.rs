//! Acquisition gradient table.

use serde::{Deserialize, Serialize};

use crate::error::{IvimError, Result};

/// b-values at or below this count as unweighted (b0) acquisitions.
pub const DEFAULT_B0_THRESHOLD: f64 = 50.0;

/// Allowed deviation from unit norm for diffusion-weighted b-vectors.
const BVEC_NORM_TOL: f64 = 1e-2;

/// 26-point brain IVIM protocol (s/mm^2), Federau et al. 2012.
pub const IVIM_PROTOCOL_BVALS: [f64; 26] = [
    0.0, 10.0, 20.0, 30.0, 40.0, 60.0, 80.0, 100.0, 120.0, 140.0, 160.0, 180.0, 200.0, 220.0,
    240.0, 260.0, 280.0, 300.0, 350.0, 400.0, 500.0, 600.0, 700.0, 800.0, 900.0, 1000.0,
];

/// Pairs of (b-value, b-vector) describing one diffusion acquisition each.
///
/// Immutable once constructed; every constructor validates its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientTable {
    bvals: Vec<f64>,
    bvecs: Vec<[f64; 3]>,
    b0_threshold: f64,
}

impl GradientTable {
    pub fn new(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>) -> Result<Self> {
        Self::with_b0_threshold(bvals, bvecs, DEFAULT_B0_THRESHOLD)
    }

    pub fn with_b0_threshold(bvals: Vec<f64>, bvecs: Vec<[f64; 3]>, b0_threshold: f64) -> Result<Self> {
        if bvals.is_empty() {
            return Err(IvimError::invalid("Gradient table has no acquisitions."));
        }
        if bvals.len() != bvecs.len() {
            return Err(IvimError::ShapeMismatch {
                what: "b-vectors",
                expected: vec![bvals.len(), 3],
                found: vec![bvecs.len(), 3],
            });
        }
        if !(b0_threshold.is_finite() && b0_threshold >= 0.0) {
            return Err(IvimError::invalid(format!(
                "b0 threshold must be finite and >= 0, got {b0_threshold}"
            )));
        }

        for (i, (&b, g)) in bvals.iter().zip(&bvecs).enumerate() {
            if !(b.is_finite() && b >= 0.0) {
                return Err(IvimError::invalid(format!(
                    "b-value #{i} must be finite and >= 0, got {b}"
                )));
            }
            if g.iter().any(|v| !v.is_finite()) {
                return Err(IvimError::invalid(format!("b-vector #{i} is not finite")));
            }
            if b > b0_threshold {
                let norm = g.iter().map(|v| v * v).sum::<f64>().sqrt();
                if (norm - 1.0).abs() > BVEC_NORM_TOL {
                    return Err(IvimError::invalid(format!(
                        "b-vector #{i} (b={b}) must be unit length, got norm {norm:.4}"
                    )));
                }
            }
        }

        Ok(Self {
            bvals,
            bvecs,
            b0_threshold,
        })
    }

    pub fn bvals(&self) -> &[f64] {
        &self.bvals
    }

    pub fn bvecs(&self) -> &[[f64; 3]] {
        &self.bvecs
    }

    pub fn b0_threshold(&self) -> f64 {
        self.b0_threshold
    }

    pub fn len(&self) -> usize {
        self.bvals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bvals.is_empty()
    }

    /// `true` for acquisitions with `b <= b0_threshold`.
    pub fn b0s_mask(&self) -> Vec<bool> {
        self.bvals.iter().map(|&b| b <= self.b0_threshold).collect()
    }

    pub fn has_b0(&self) -> bool {
        self.bvals.iter().any(|&b| b <= self.b0_threshold)
    }

    /// Table restricted to the acquisitions where `keep` is true.
    pub fn subset(&self, keep: &[bool]) -> Result<Self> {
        if keep.len() != self.len() {
            return Err(IvimError::ShapeMismatch {
                what: "gradient subset",
                expected: vec![self.len()],
                found: vec![keep.len()],
            });
        }
        let (bvals, bvecs): (Vec<f64>, Vec<[f64; 3]>) = self
            .bvals
            .iter()
            .zip(&self.bvecs)
            .zip(keep)
            .filter(|(_, k)| **k)
            .map(|((b, g), _)| (*b, *g))
            .unzip();
        Self::with_b0_threshold(bvals, bvecs, self.b0_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_x(n: usize) -> Vec<[f64; 3]> {
        vec![[1.0, 0.0, 0.0]; n]
    }

    #[test]
    fn protocol_b0_mask_uses_threshold() {
        let gtab = GradientTable::new(IVIM_PROTOCOL_BVALS.to_vec(), unit_x(26)).unwrap();
        assert_eq!(gtab.len(), 26);
        // b = 10..=40 also fall under the default threshold.
        assert_eq!(gtab.b0s_mask().iter().filter(|&&m| m).count(), 5);
        assert!(gtab.has_b0());
    }

    #[test]
    fn zero_vector_allowed_only_for_b0() {
        let bvals = vec![0.0, 1000.0];
        assert!(GradientTable::new(bvals.clone(), vec![[0.0; 3], [0.0, 1.0, 0.0]]).is_ok());
        let err = GradientTable::new(bvals, vec![[0.0; 3], [0.0; 3]]).unwrap_err();
        assert!(err.is_value_error());
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = GradientTable::new(vec![0.0, 500.0, 1000.0], unit_x(2)).unwrap_err();
        assert!(matches!(err, IvimError::ShapeMismatch { .. }));
    }

    #[test]
    fn negative_bvalue_is_rejected() {
        assert!(GradientTable::new(vec![0.0, -5.0], unit_x(2)).is_err());
        assert!(GradientTable::new(vec![], vec![]).is_err());
    }

    #[test]
    fn subset_keeps_selected_rows() {
        let gtab = GradientTable::new(vec![0.0, 200.0, 400.0, 800.0], unit_x(4)).unwrap();
        let high = gtab.subset(&[false, false, true, true]).unwrap();
        assert_eq!(high.bvals(), &[400.0, 800.0]);
        assert!(!high.has_b0());
        assert!(gtab.subset(&[true]).is_err());
    }
}
