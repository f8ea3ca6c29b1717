//! Export fitted parameter maps to CSV and JSON.
//!
//! CSV is meant for spreadsheets (one row per voxel, flat row-major index);
//! JSON keeps the voxel shape and full indices so a map can be reloaded.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use ndarray::Dimension;

use crate::domain::{ParamsFile, VoxelRecord};
use crate::error::{IvimError, Result};
use crate::fit::IvimFit;
use crate::gradients::GradientTable;

const TOOL_NAME: &str = "ivim";

/// One record per voxel, in row-major voxel order.
pub fn voxel_records(fit: &IvimFit) -> Vec<VoxelRecord> {
    fit.converged()
        .indexed_iter()
        .zip(fit.voxel_params())
        .map(|((index, &converged), p)| VoxelRecord {
            index: index.slice().to_vec(),
            s0: p.s0,
            f: p.f,
            d_star: p.d_star,
            d: p.d,
            converged,
        })
        .collect()
}

/// Write `voxel,s0,f,d_star,d,converged` rows.
pub fn write_params_csv(path: &Path, fit: &IvimFit) -> Result<()> {
    let mut file = File::create(path)
        .map_err(|e| IvimError::io(format!("Failed to create export CSV '{}': {e}", path.display())))?;

    writeln!(file, "voxel,s0,f,d_star,d,converged")
        .map_err(|e| IvimError::io(format!("Failed to write export CSV header: {e}")))?;

    for (i, r) in voxel_records(fit).iter().enumerate() {
        writeln!(
            file,
            "{},{:.10},{:.10},{:.10},{:.10},{}",
            i, r.s0, r.f, r.d_star, r.d, r.converged
        )
        .map_err(|e| IvimError::io(format!("Failed to write export CSV row: {e}")))?;
    }

    Ok(())
}

/// Write the parameter map together with the b-values it was fitted on.
pub fn write_params_json(path: &Path, fit: &IvimFit, gtab: &GradientTable) -> Result<()> {
    let file = File::create(path)
        .map_err(|e| IvimError::io(format!("Failed to create params JSON '{}': {e}", path.display())))?;

    let doc = ParamsFile {
        tool: TOOL_NAME.to_string(),
        generated: Utc::now(),
        bvals: gtab.bvals().to_vec(),
        voxel_shape: fit.voxel_shape().to_vec(),
        voxels: voxel_records(fit),
    };

    serde_json::to_writer_pretty(file, &doc)
        .map_err(|e| IvimError::io(format!("Failed to write params JSON: {e}")))?;

    Ok(())
}

/// Read a parameter map written by [`write_params_json`].
pub fn read_params_json(path: &Path) -> Result<ParamsFile> {
    let file = File::open(path)
        .map_err(|e| IvimError::io(format!("Failed to open params JSON '{}': {e}", path.display())))?;
    serde_json::from_reader(file).map_err(|e| IvimError::invalid(format!("Invalid params JSON: {e}")))
}
