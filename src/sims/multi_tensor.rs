//! Multi-compartment tensor signal generator.
//!
//! Each compartment is a diffusion tensor `D_i = R diag(λ) Rᵀ` weighted by a
//! volume fraction (percent). The signal for acquisition `(b, g)` is
//! `S0 * Σ_i (fraction_i / 100) * exp(-b gᵀ D_i g)`. Two isotropic compartments
//! reproduce the IVIM signal exactly.

use nalgebra::{Matrix3, Vector3};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::domain::IvimParams;
use crate::error::{IvimError, Result};
use crate::gradients::GradientTable;

/// Allowed relative deviation of the fraction sum from 100.
const FRACTION_SUM_TOL: f64 = 1e-6;

/// One tensor compartment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compartment {
    pub evals: [f64; 3],
    /// Columns are the eigenvectors; `None` means identity.
    pub rotation: Option<Matrix3<f64>>,
    /// Volume fraction in percent.
    pub fraction: f64,
}

impl Compartment {
    pub fn isotropic(diffusivity: f64, fraction: f64) -> Self {
        Self {
            evals: [diffusivity; 3],
            rotation: None,
            fraction,
        }
    }

    fn tensor(&self) -> Matrix3<f64> {
        let diag = Matrix3::from_diagonal(&Vector3::from(self.evals));
        match self.rotation {
            Some(r) => r * diag * r.transpose(),
            None => diag,
        }
    }
}

/// The two isotropic compartments equivalent to `params` (S0 is not used).
pub fn ivim_compartments(params: &IvimParams) -> [Compartment; 2] {
    [
        Compartment::isotropic(params.d_star, params.f * 100.0),
        Compartment::isotropic(params.d, (1.0 - params.f) * 100.0),
    ]
}

/// Simulate one voxel; `snr = Some(x)` adds Rician noise with `σ = s0 / x`.
pub fn multi_tensor<R: Rng + ?Sized>(
    gtab: &GradientTable,
    compartments: &[Compartment],
    s0: f64,
    snr: Option<f64>,
    rng: &mut R,
) -> Result<Vec<f64>> {
    if compartments.is_empty() {
        return Err(IvimError::invalid("At least one compartment is required."));
    }
    if !s0.is_finite() {
        return Err(IvimError::invalid(format!("S0 must be finite, got {s0}")));
    }
    for (i, c) in compartments.iter().enumerate() {
        if !(c.fraction.is_finite() && c.fraction >= 0.0) {
            return Err(IvimError::invalid(format!(
                "fraction of compartment #{i} must be finite and >= 0, got {}",
                c.fraction
            )));
        }
        if c.evals.iter().any(|v| !v.is_finite()) {
            return Err(IvimError::invalid(format!(
                "eigenvalues of compartment #{i} are not finite"
            )));
        }
    }
    let total: f64 = compartments.iter().map(|c| c.fraction).sum();
    if ((total - 100.0) / 100.0).abs() > FRACTION_SUM_TOL {
        return Err(IvimError::invalid(format!(
            "Compartment fractions must sum to 100, got {total}"
        )));
    }

    let tensors: Vec<(Matrix3<f64>, f64)> = compartments
        .iter()
        .map(|c| (c.tensor(), c.fraction / 100.0))
        .collect();

    let signal: Vec<f64> = gtab
        .bvals()
        .iter()
        .zip(gtab.bvecs())
        .map(|(&b, g)| {
            let g = Vector3::from(*g);
            let attenuation: f64 = tensors
                .iter()
                .map(|(tensor, weight)| weight * (-b * g.dot(&(tensor * g))).exp())
                .sum();
            s0 * attenuation
        })
        .collect();

    match snr {
        None => Ok(signal),
        Some(snr) => {
            if !(snr.is_finite() && snr > 0.0) {
                return Err(IvimError::invalid(format!("SNR must be > 0, got {snr}")));
            }
            add_rician_noise(&signal, s0 / snr, rng)
        }
    }
}

/// `sqrt((s + n1)^2 + n2^2)` with independent `n1, n2 ~ N(0, sigma)`.
pub fn add_rician_noise<R: Rng + ?Sized>(signal: &[f64], sigma: f64, rng: &mut R) -> Result<Vec<f64>> {
    // `Normal::new` accepts a negative standard deviation (it mirrors the samples).
    if !(sigma.is_finite() && sigma >= 0.0) {
        return Err(IvimError::invalid(format!(
            "Noise sigma must be finite and >= 0, got {sigma}"
        )));
    }
    let normal = Normal::new(0.0, sigma)
        .map_err(|e| IvimError::invalid(format!("Noise distribution error: {e}")))?;
    Ok(signal
        .iter()
        .map(|&s| {
            let real = s + normal.sample(rng);
            let imag = normal.sample(rng);
            real.hypot(imag)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradients::{IVIM_PROTOCOL_BVALS, generate_bvecs};
    use crate::models::ivim_function;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn protocol_gtab(rng: &mut StdRng) -> GradientTable {
        let bvecs = generate_bvecs(IVIM_PROTOCOL_BVALS.len(), rng);
        GradientTable::new(IVIM_PROTOCOL_BVALS.to_vec(), bvecs).unwrap()
    }

    #[test]
    fn isotropic_compartments_match_ivim_signal() {
        let mut rng = StdRng::seed_from_u64(1);
        let gtab = protocol_gtab(&mut rng);
        let params = IvimParams::new(1.0, 0.132, 0.00885, 0.000921);
        let simulated = multi_tensor(&gtab, &ivim_compartments(&params), 1.0, None, &mut rng).unwrap();
        let expected = ivim_function(&params, gtab.bvals());
        for (s, e) in simulated.iter().zip(&expected) {
            assert_relative_eq!(*s, *e, max_relative = 1e-12);
        }
    }

    #[test]
    fn anisotropic_compartment_depends_on_direction() {
        let gtab = GradientTable::new(
            vec![0.0, 1000.0, 1000.0],
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
        )
        .unwrap();
        let stick = Compartment {
            evals: [0.0015, 0.0003, 0.0003],
            rotation: None,
            fraction: 100.0,
        };
        let mut rng = StdRng::seed_from_u64(0);
        let s = multi_tensor(&gtab, &[stick], 100.0, None, &mut rng).unwrap();
        assert_relative_eq!(s[0], 100.0);
        assert_relative_eq!(s[1], 100.0 * (-1.5f64).exp(), max_relative = 1e-12);
        assert_relative_eq!(s[2], 100.0 * (-0.3f64).exp(), max_relative = 1e-12);

        // Swapping the first two eigenvectors swaps the two directions.
        let swap = Matrix3::new(0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0);
        let rotated = Compartment {
            rotation: Some(swap),
            ..stick
        };
        let r = multi_tensor(&gtab, &[rotated], 100.0, None, &mut rng).unwrap();
        assert_relative_eq!(r[1], s[2], max_relative = 1e-12);
        assert_relative_eq!(r[2], s[1], max_relative = 1e-12);
    }

    #[test]
    fn fractions_must_sum_to_hundred() {
        let mut rng = StdRng::seed_from_u64(0);
        let gtab = protocol_gtab(&mut rng);
        let comps = [Compartment::isotropic(0.01, 40.0), Compartment::isotropic(0.001, 50.0)];
        let err = multi_tensor(&gtab, &comps, 1.0, None, &mut rng).unwrap_err();
        assert!(err.is_value_error());
        assert!(multi_tensor(&gtab, &[], 1.0, None, &mut rng).is_err());
    }

    #[test]
    fn rician_noise_is_seeded_and_non_negative() {
        let signal = vec![1.0; 64];
        let a = add_rician_noise(&signal, 0.1, &mut StdRng::seed_from_u64(7)).unwrap();
        let b = add_rician_noise(&signal, 0.1, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|&v| v >= 0.0));
        assert!(a.iter().any(|&v| (v - 1.0).abs() > 1e-6));
    }

    #[test]
    fn rician_noise_rejects_bad_sigma() {
        let signal = vec![1.0; 4];
        for sigma in [-1.0, -1e-12, f64::NAN, f64::INFINITY] {
            let err = add_rician_noise(&signal, sigma, &mut StdRng::seed_from_u64(7)).unwrap_err();
            assert!(err.is_value_error(), "sigma={sigma}");
        }
        // Zero noise leaves the signal untouched.
        let clean = add_rician_noise(&signal, 0.0, &mut StdRng::seed_from_u64(7)).unwrap();
        assert_eq!(clean, signal);
    }

    #[test]
    fn invalid_snr_is_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let gtab = protocol_gtab(&mut rng);
        let comps = [Compartment::isotropic(0.001, 100.0)];
        assert!(multi_tensor(&gtab, &comps, 1.0, Some(0.0), &mut rng).is_err());
    }
}
