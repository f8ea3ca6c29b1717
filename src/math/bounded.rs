//! Box constraints through a change of variables.
//!
//! The Levenberg–Marquardt solver works on unconstrained coordinates `u`.
//! Each bounded parameter `x` is expressed as a smooth map of `u` whose range
//! is the allowed interval:
//!
//! ```text
//! [lo, hi]   x = lo + (hi - lo) (1 + sin u) / 2
//! [lo, inf)  x = lo - 1 + sqrt(u^2 + 1)
//! (-inf, hi] x = hi + 1 - sqrt(u^2 + 1)
//! free       x = u
//! ```
//!
//! so every point the solver visits is feasible. The Jacobian is carried over
//! with the chain rule via `dx/du`.

/// Smallest internal offset from a limit; at the limit itself `dx/du` vanishes
/// and the solver could not move the coordinate off it.
const EDGE: f64 = 1e-4;

/// How one coordinate is constrained.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coordinate {
    Free,
    Lower(f64),
    Upper(f64),
    Interval(f64, f64),
    Fixed(f64),
}

impl Coordinate {
    fn new(lo: f64, hi: f64) -> Self {
        match (lo.is_finite(), hi.is_finite()) {
            (true, true) if lo >= hi => Coordinate::Fixed(lo),
            (true, true) => Coordinate::Interval(lo, hi),
            (true, false) => Coordinate::Lower(lo),
            (false, true) => Coordinate::Upper(hi),
            (false, false) => Coordinate::Free,
        }
    }

    fn to_external(self, u: f64) -> f64 {
        match self {
            Coordinate::Free => u,
            Coordinate::Lower(lo) => lo - 1.0 + (u * u + 1.0).sqrt(),
            Coordinate::Upper(hi) => hi + 1.0 - (u * u + 1.0).sqrt(),
            Coordinate::Interval(lo, hi) => lo + (hi - lo) * (1.0 + u.sin()) / 2.0,
            Coordinate::Fixed(v) => v,
        }
    }

    fn to_internal(self, x: f64) -> f64 {
        match self {
            Coordinate::Free => x,
            Coordinate::Lower(lo) => {
                let t = x.max(lo) - lo + 1.0;
                (t * t - 1.0).sqrt().max(EDGE)
            }
            Coordinate::Upper(hi) => {
                let t = hi - x.min(hi) + 1.0;
                (t * t - 1.0).sqrt().max(EDGE)
            }
            Coordinate::Interval(lo, hi) => {
                let s = (2.0 * (x - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0);
                let half = std::f64::consts::FRAC_PI_2 - EDGE;
                s.asin().clamp(-half, half)
            }
            Coordinate::Fixed(_) => 0.0,
        }
    }

    fn derivative(self, u: f64) -> f64 {
        match self {
            Coordinate::Free => 1.0,
            Coordinate::Lower(_) => u / (u * u + 1.0).sqrt(),
            Coordinate::Upper(_) => -u / (u * u + 1.0).sqrt(),
            Coordinate::Interval(lo, hi) => (hi - lo) * u.cos() / 2.0,
            Coordinate::Fixed(_) => 0.0,
        }
    }
}

/// Per-coordinate maps between solver space `u` and parameter space `x`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxTransform {
    coords: Vec<Coordinate>,
}

impl BoxTransform {
    /// Identity map for `n` unconstrained coordinates.
    pub fn free(n: usize) -> Self {
        Self {
            coords: vec![Coordinate::Free; n],
        }
    }

    /// Map for `lower[k] <= x[k] <= upper[k]`; infinite limits leave that side open.
    pub fn from_limits(lower: &[f64], upper: &[f64]) -> Self {
        Self {
            coords: lower
                .iter()
                .zip(upper)
                .map(|(&lo, &hi)| Coordinate::new(lo, hi))
                .collect(),
        }
    }

    pub fn coordinates(&self) -> &[Coordinate] {
        &self.coords
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }

    /// `x` is clamped into the box first.
    pub fn to_internal(&self, x: &[f64]) -> Vec<f64> {
        self.coords.iter().zip(x).map(|(c, &v)| c.to_internal(v)).collect()
    }

    pub fn to_external(&self, u: &[f64]) -> Vec<f64> {
        self.coords.iter().zip(u).map(|(c, &v)| c.to_external(v)).collect()
    }

    /// `dx_k / du_k` at `u`.
    pub fn derivative(&self, u: &[f64]) -> Vec<f64> {
        self.coords.iter().zip(u).map(|(c, &v)| c.derivative(v)).collect()
    }
}
