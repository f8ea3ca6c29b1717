//! Input loading: b-values, b-vectors and voxel signals.
//!
//! - b-values / b-vectors follow the FSL text layout (whitespace or comma separated)
//! - signals are a headerless-or-headed CSV, one voxel per row, one column per acquisition
//!
//! Errors carry exit code 2 (I/O, parse) or 3 (shape mismatch).

use std::fs::{self, File};
use std::path::Path;

use csv::StringRecord;
use ndarray::Array2;
use tracing::debug;

use crate::error::{IvimError, Result};

/// Read b-values from a text file.
pub fn read_bvals(path: &Path) -> Result<Vec<f64>> {
    let text = read_text(path)?;
    let bvals = parse_numbers(&text)
        .map_err(|e| IvimError::invalid(format!("Invalid b-value file '{}': {e}", path.display())))?;
    if bvals.is_empty() {
        return Err(IvimError::invalid(format!(
            "b-value file '{}' is empty",
            path.display()
        )));
    }
    Ok(bvals)
}

/// Read `n` b-vectors, either as 3 rows of `n` columns (FSL) or `n` rows of 3.
pub fn read_bvecs(path: &Path, n: usize) -> Result<Vec<[f64; 3]>> {
    let text = read_text(path)?;
    let rows: Vec<Vec<f64>> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_numbers)
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| IvimError::invalid(format!("Invalid b-vector file '{}': {e}", path.display())))?;

    let shape: Vec<usize> = vec![rows.len(), rows.first().map_or(0, Vec::len)];
    if rows.len() == 3 && rows.iter().all(|r| r.len() == n) {
        return Ok((0..n).map(|i| [rows[0][i], rows[1][i], rows[2][i]]).collect());
    }
    if rows.len() == n && rows.iter().all(|r| r.len() == 3) {
        return Ok(rows.iter().map(|r| [r[0], r[1], r[2]]).collect());
    }
    Err(IvimError::ShapeMismatch {
        what: "b-vectors",
        expected: vec![3, n],
        found: shape,
    })
}

/// Read voxel signals: one row per voxel with `n_acq` columns.
///
/// A first row that does not parse as numbers is treated as a header.
pub fn read_signals_csv(path: &Path, n_acq: usize) -> Result<Array2<f64>> {
    let file = File::open(path)
        .map_err(|e| IvimError::io(format!("Failed to open signals CSV '{}': {e}", path.display())))?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(file);

    let mut values = Vec::new();
    let mut n_rows = 0usize;
    for (idx, result) in reader.records().enumerate() {
        let line = idx + 1;
        let record = result.map_err(|e| IvimError::io(format!("CSV parse error at line {line}: {e}")))?;
        if is_blank(&record) {
            continue;
        }

        let row = match parse_record(&record) {
            Ok(row) => row,
            Err(_) if idx == 0 => {
                debug!(line, "skipping signals CSV header");
                continue;
            }
            Err(e) => {
                return Err(IvimError::invalid(format!(
                    "Invalid signal value at line {line}: {e}"
                )));
            }
        };
        if row.len() != n_acq {
            return Err(IvimError::ShapeMismatch {
                what: "signals row",
                expected: vec![n_acq],
                found: vec![row.len()],
            });
        }
        values.extend(row);
        n_rows += 1;
    }

    if n_rows == 0 {
        return Err(IvimError::invalid(format!(
            "Signals CSV '{}' contains no voxels",
            path.display()
        )));
    }

    Array2::from_shape_vec((n_rows, n_acq), values)
        .map_err(|e| IvimError::invalid(format!("Failed to assemble signals: {e}")))
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| IvimError::io(format!("Failed to read '{}': {e}", path.display())))
}

fn parse_numbers(text: &str) -> std::result::Result<Vec<f64>, String> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|tok| !tok.is_empty())
        .map(parse_f64)
        .collect()
}

fn parse_record(record: &StringRecord) -> std::result::Result<Vec<f64>, String> {
    record.iter().filter(|f| !f.is_empty()).map(parse_f64).collect()
}

fn parse_f64(tok: &str) -> std::result::Result<f64, String> {
    // Some exporters prefix the first field with a UTF-8 BOM.
    let tok = tok.trim().trim_start_matches('\u{feff}');
    tok.parse::<f64>().map_err(|_| format!("'{tok}' is not a number"))
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|f| f.is_empty())
}
