//! IVIM model and fit result over voxel arrays.
//!
//! Signal arrays may have any rank >= 1; the last axis indexes acquisitions and
//! must match the gradient table. Every other axis is a voxel axis. Voxels are
//! independent, so they are fitted in parallel.

use ndarray::{ArrayBase, ArrayD, Axis, Data, Dimension, IxDyn};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::domain::{Bounds, IvimParams, PARAM_COUNT, VoxelFit};
use crate::error::{IvimError, Result};
use crate::fit::fitter::{IvimOptions, fit_voxel};
use crate::gradients::GradientTable;
use crate::models::ivim_signal;

/// A validated IVIM model bound to one gradient table.
#[derive(Debug, Clone)]
pub struct IvimModel {
    gtab: GradientTable,
    options: IvimOptions,
}

impl IvimModel {
    /// Validate `options` against `gtab` and build the model.
    ///
    /// Fails with `InvalidArgument` for a negative `min_signal`, malformed
    /// bounds or x0, a table without b0 acquisitions, or too few acquisitions.
    pub fn new(gtab: GradientTable, options: IvimOptions) -> Result<Self> {
        if !(options.min_signal.is_finite() && options.min_signal >= 0.0) {
            return Err(IvimError::invalid(format!(
                "min_signal must be a non-negative number, got {}",
                options.min_signal
            )));
        }
        if !(options.tol.is_finite() && options.tol > 0.0) {
            return Err(IvimError::invalid(format!(
                "tol must be finite and > 0, got {}",
                options.tol
            )));
        }
        if options.max_iter == 0 {
            return Err(IvimError::invalid("max_iter must be > 0"));
        }
        if !(options.split_b_d.is_finite() && options.split_b_s0.is_finite()) {
            return Err(IvimError::invalid("split b-values must be finite"));
        }
        if options.split_b_s0 > options.split_b_d {
            return Err(IvimError::invalid(format!(
                "split_b_s0 ({}) must not exceed split_b_d ({})",
                options.split_b_s0, options.split_b_d
            )));
        }
        if let Some(bounds) = &options.bounds {
            // Fields are public; re-run the constructor checks.
            Bounds::new(bounds.lower, bounds.upper)?;
        }
        if let Some(x0) = &options.x0 {
            if !x0.is_finite() {
                return Err(IvimError::invalid(format!("x0 must be finite, got {x0:?}")));
            }
            if let Some(bounds) = &options.bounds {
                if !bounds.contains(&x0.to_array()) {
                    return Err(IvimError::invalid(format!(
                        "x0 {x0:?} lies outside the bounds"
                    )));
                }
            }
        }
        if !gtab.has_b0() {
            return Err(IvimError::invalid(format!(
                "No measured signal at b <= {} (b0 threshold).",
                gtab.b0_threshold()
            )));
        }
        if gtab.len() < PARAM_COUNT {
            return Err(IvimError::invalid(format!(
                "At least {PARAM_COUNT} acquisitions are needed, got {}",
                gtab.len()
            )));
        }
        options.grid.pairs()?;

        Ok(Self { gtab, options })
    }

    /// Model with default options.
    pub fn with_defaults(gtab: GradientTable) -> Result<Self> {
        Self::new(gtab, IvimOptions::default())
    }

    pub fn gtab(&self) -> &GradientTable {
        &self.gtab
    }

    pub fn options(&self) -> &IvimOptions {
        &self.options
    }

    /// Fit a single voxel signal (one value per acquisition).
    pub fn fit_voxel(&self, signal: &[f64]) -> Result<VoxelFit> {
        fit_voxel(self.gtab.bvals(), signal, &self.options)
    }

    /// Fit every voxel of `data` selected by `mask`.
    ///
    /// `mask` must have the shape of `data` without its last axis. Voxels
    /// outside the mask get all-zero parameters and are marked not converged,
    /// as do voxels whose own fit fails (for example on NaN samples). Shape
    /// and argument errors still fail the whole call.
    pub fn fit<S, D>(&self, data: &ArrayBase<S, D>, mask: Option<&ArrayD<bool>>) -> Result<IvimFit>
    where
        S: Data<Elem = f64>,
        D: Dimension,
    {
        let shape = data.shape();
        let Some((&n_acq, voxel_shape)) = shape.split_last() else {
            return Err(IvimError::ShapeMismatch {
                what: "data",
                expected: vec![self.gtab.len()],
                found: Vec::new(),
            });
        };
        if n_acq != self.gtab.len() {
            let mut expected = voxel_shape.to_vec();
            expected.push(self.gtab.len());
            return Err(IvimError::ShapeMismatch {
                what: "data",
                expected,
                found: shape.to_vec(),
            });
        }
        if let Some(mask) = mask {
            if mask.shape() != voxel_shape {
                return Err(IvimError::ShapeMismatch {
                    what: "mask",
                    expected: voxel_shape.to_vec(),
                    found: mask.shape().to_vec(),
                });
            }
        }

        let n_vox: usize = voxel_shape.iter().product();
        let selected: Vec<bool> = match mask {
            Some(mask) => mask.iter().copied().collect(),
            None => vec![true; n_vox],
        };
        // Logical (row-major) order: voxel `i` occupies `[i * n_acq, (i + 1) * n_acq)`.
        let flat: Vec<f64> = data.iter().copied().collect();
        let bvals = self.gtab.bvals();

        info!(
            voxels = n_vox,
            selected = selected.iter().filter(|&&s| s).count(),
            acquisitions = n_acq,
            "fitting IVIM model"
        );

        let fits: Vec<Option<VoxelFit>> = (0..n_vox)
            .into_par_iter()
            .map(|i| {
                if !selected[i] {
                    return Ok(None);
                }
                let signal = &flat[i * n_acq..(i + 1) * n_acq];
                match fit_voxel(bvals, signal, &self.options) {
                    Ok(fit) => Ok(Some(fit)),
                    // One bad voxel does not abort the volume.
                    Err(IvimError::Fit(reason)) => {
                        warn!(voxel = i, %reason, "voxel fit failed; storing zeros");
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mut params = Vec::with_capacity(n_vox * PARAM_COUNT);
        let mut converged = Vec::with_capacity(n_vox);
        for fit in &fits {
            match fit {
                Some(fit) => {
                    params.extend_from_slice(&fit.params.to_array());
                    converged.push(fit.converged);
                }
                None => {
                    params.extend_from_slice(&[0.0; PARAM_COUNT]);
                    converged.push(false);
                }
            }
        }

        let failed = selected
            .iter()
            .zip(&fits)
            .filter(|&(&sel, fit)| sel && !fit.as_ref().is_some_and(|f| f.converged))
            .count();
        if failed > 0 {
            warn!(failed, "some voxels did not converge");
        }

        let mut param_shape = voxel_shape.to_vec();
        param_shape.push(PARAM_COUNT);
        let model_params = ArrayD::from_shape_vec(IxDyn(&param_shape), params)
            .map_err(|e| IvimError::Fit(format!("Failed to assemble parameter map: {e}")))?;
        let converged = ArrayD::from_shape_vec(IxDyn(voxel_shape), converged)
            .map_err(|e| IvimError::Fit(format!("Failed to assemble convergence map: {e}")))?;

        Ok(IvimFit {
            model_params,
            converged,
        })
    }
}

/// Fitted parameter maps.
#[derive(Debug, Clone, PartialEq)]
pub struct IvimFit {
    model_params: ArrayD<f64>,
    converged: ArrayD<bool>,
}

impl IvimFit {
    /// Rebuild a fit from its parameter and convergence maps, for example
    /// after reloading exported results.
    pub fn from_parts(model_params: ArrayD<f64>, converged: ArrayD<bool>) -> Result<Self> {
        let shape = model_params.shape();
        if shape.last() != Some(&PARAM_COUNT) {
            return Err(IvimError::ShapeMismatch {
                what: "parameter map",
                expected: vec![PARAM_COUNT],
                found: shape.to_vec(),
            });
        }
        let voxel_shape = &shape[..shape.len() - 1];
        if converged.shape() != voxel_shape {
            return Err(IvimError::ShapeMismatch {
                what: "convergence map",
                expected: voxel_shape.to_vec(),
                found: converged.shape().to_vec(),
            });
        }
        Ok(Self {
            model_params,
            converged,
        })
    }

    /// Parameters with shape `voxel_shape + [4]`, ordered `(S0, f, D*, D)`.
    pub fn model_params(&self) -> &ArrayD<f64> {
        &self.model_params
    }

    pub fn converged(&self) -> &ArrayD<bool> {
        &self.converged
    }

    pub fn voxel_shape(&self) -> &[usize] {
        self.converged.shape()
    }

    pub fn s0(&self) -> ArrayD<f64> {
        self.param_map(0)
    }

    pub fn perfusion_fraction(&self) -> ArrayD<f64> {
        self.param_map(1)
    }

    pub fn d_star(&self) -> ArrayD<f64> {
        self.param_map(2)
    }

    pub fn d(&self) -> ArrayD<f64> {
        self.param_map(3)
    }

    /// Parameters of the voxel at `index` (empty for a single-voxel fit).
    pub fn params_at(&self, index: &[usize]) -> Option<IvimParams> {
        if index.len() != self.voxel_shape().len() {
            return None;
        }
        let mut idx = index.to_vec();
        idx.push(0);
        let last = idx.len() - 1;
        let mut values = [0.0; PARAM_COUNT];
        for (k, value) in values.iter_mut().enumerate() {
            idx[last] = k;
            *value = *self.model_params.get(idx.as_slice())?;
        }
        Some(values.into())
    }

    /// Per-voxel parameters in row-major voxel order.
    pub fn voxel_params(&self) -> Vec<IvimParams> {
        let last = self.model_params.ndim() - 1;
        self.model_params
            .lanes(Axis(last))
            .into_iter()
            .map(|lane| IvimParams::new(lane[0], lane[1], lane[2], lane[3]))
            .collect()
    }

    /// Signal predicted for `gtab`, shape `voxel_shape + [gtab.len()]`.
    pub fn predict(&self, gtab: &GradientTable) -> ArrayD<f64> {
        let params = self.voxel_params();
        let voxel_shape = self.voxel_shape();
        let strides = row_major_strides(voxel_shape);
        let bvals = gtab.bvals();

        let mut shape = voxel_shape.to_vec();
        shape.push(gtab.len());
        ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
            let idx = idx.slice();
            let (voxel, acq) = idx.split_at(idx.len() - 1);
            let flat: usize = voxel.iter().zip(&strides).map(|(i, s)| i * s).sum();
            ivim_signal(&params[flat], bvals[acq[0]])
        })
    }

    fn param_map(&self, k: usize) -> ArrayD<f64> {
        let last = self.model_params.ndim() - 1;
        self.model_params.index_axis(Axis(last), k).to_owned()
    }
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for k in (0..shape.len().saturating_sub(1)).rev() {
        strides[k] = strides[k + 1] * shape[k + 1];
    }
    strides
}
