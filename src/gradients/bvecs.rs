//! Synthetic b-vector generation.

use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{IvimError, Result};
use crate::gradients::GradientTable;

/// Draw `n` unit vectors uniformly distributed on the sphere.
///
/// Gaussian triples are normalized; draws too close to the origin are rejected.
pub fn generate_bvecs<R: Rng + ?Sized>(n: usize, rng: &mut R) -> Vec<[f64; 3]> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let v: [f64; 3] = [
            rng.sample(StandardNormal),
            rng.sample(StandardNormal),
            rng.sample(StandardNormal),
        ];
        let norm = v.iter().map(|c| c * c).sum::<f64>().sqrt();
        if norm < 1e-8 {
            continue;
        }
        out.push([v[0] / norm, v[1] / norm, v[2] / norm]);
    }
    out
}

/// Gradient table for `bvals` with random unit b-vectors.
pub fn gradient_table_from_bvals<R: Rng + ?Sized>(bvals: &[f64], rng: &mut R) -> Result<GradientTable> {
    if bvals.is_empty() {
        return Err(IvimError::invalid("No b-values supplied."));
    }
    let bvecs = generate_bvecs(bvals.len(), rng);
    GradientTable::new(bvals.to_vec(), bvecs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn vectors_are_unit_length() {
        let mut rng = StdRng::seed_from_u64(7);
        let v = generate_bvecs(64, &mut rng);
        assert_eq!(v.len(), 64);
        for g in v {
            let norm = (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn same_seed_same_vectors() {
        let a = generate_bvecs(5, &mut StdRng::seed_from_u64(42));
        let b = generate_bvecs(5, &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn table_from_protocol() {
        let mut rng = StdRng::seed_from_u64(1);
        let gtab = gradient_table_from_bvals(&crate::gradients::IVIM_PROTOCOL_BVALS, &mut rng).unwrap();
        assert_eq!(gtab.len(), 26);
        assert!(gradient_table_from_bvals(&[], &mut rng).is_err());
    }
}
