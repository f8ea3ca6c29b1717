//! Formatted terminal output.
//!
//! Formatting lives here so the fitting code stays free of presentation concerns.

use crate::domain::{FitConfig, PARAM_NAMES, SimulationConfig};
use crate::fit::IvimFit;
use crate::gradients::GradientTable;
use crate::report::{FitSummary, Recovery};

/// Header plus parameter ranges for an `ivim fit` run.
pub fn format_fit_summary(summary: &FitSummary, gtab: &GradientTable, config: &FitConfig) -> String {
    let mut out = String::new();

    out.push_str("=== ivim - IVIM model fit ===\n");
    out.push_str(&format!("Signals: {}\n", config.signals_path.display()));
    out.push_str(&format!(
        "Acquisitions: n={} | b=[{:.0}, {:.0}] | b0 threshold={}\n",
        gtab.len(),
        gtab.bvals().iter().copied().fold(f64::INFINITY, f64::min),
        gtab.bvals().iter().copied().fold(f64::NEG_INFINITY, f64::max),
        gtab.b0_threshold(),
    ));
    out.push_str(&format!(
        "Split: D from b >= {}, D* from b < {} | bounded={}\n",
        config.split_b_d, config.split_b_s0, config.bounded
    ));
    out.push_str(&format!(
        "Voxels: n={} | converged={} | non-physical={}\n",
        summary.n_voxels, summary.n_converged, summary.n_non_physical
    ));
    out.push('\n');
    out.push_str(&format_stats(summary));
    out
}

/// Truth vs recovered mean for `ivim simulate`.
pub fn format_recovery(recovery: &Recovery, summary: &FitSummary, config: &SimulationConfig) -> String {
    let mut out = String::new();

    out.push_str("=== ivim - simulated IVIM recovery ===\n");
    let snr = config
        .snr
        .map(|s| format!("{s}"))
        .unwrap_or_else(|| "noise-free".to_string());
    out.push_str(&format!(
        "Voxels: n={} | converged={} | non-physical={} | SNR={snr} | seed={}\n\n",
        summary.n_voxels, summary.n_converged, summary.n_non_physical, config.seed
    ));

    out.push_str(&header_row(&["param", "truth", "median", "rel_err"]));
    let truth = recovery.truth.to_array();
    let median = recovery.median.to_array();
    for (k, name) in PARAM_NAMES.iter().enumerate() {
        out.push_str(
            format!(
                "{:<8} {:>14} {:>14} {:>14}\n",
                name,
                fmt_param(truth[k]),
                fmt_param(median[k]),
                format!("{:.3e}", recovery.rel_error[k]),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

/// The first `limit` voxels of a parameter map.
pub fn format_voxel_table(fit: &IvimFit, limit: usize) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:<8} {:>14} {:>14} {:>14} {:>14} {:<9}\n",
            "voxel", "s0", "f", "d_star", "d", "converged"
        )
        .trim_end(),
    );
    out.push('\n');

    let params = fit.voxel_params();
    for (i, (p, ok)) in params.iter().zip(fit.converged().iter()).take(limit).enumerate() {
        out.push_str(
            format!(
                "{:<8} {:>14} {:>14} {:>14} {:>14} {:<9}\n",
                i,
                fmt_param(p.s0),
                fmt_param(p.f),
                fmt_param(p.d_star),
                fmt_param(p.d),
                ok
            )
            .trim_end(),
        );
        out.push('\n');
    }
    if params.len() > limit {
        out.push_str(&format!("... ({} more)\n", params.len() - limit));
    }
    out
}

fn format_stats(summary: &FitSummary) -> String {
    let Some(stats) = &summary.stats else {
        return "No converged voxels with physical parameters.\n".to_string();
    };
    let mut out = header_row(&["param", "median", "mean", "min", "max"]);
    for (name, s) in PARAM_NAMES.iter().zip(stats) {
        out.push_str(
            format!(
                "{:<8} {:>14} {:>14} {:>14} {:>14}\n",
                name,
                fmt_param(s.median),
                fmt_param(s.mean),
                fmt_param(s.min),
                fmt_param(s.max)
            )
            .trim_end(),
        );
        out.push('\n');
    }
    out
}

/// First column left-aligned (8 wide), the rest right-aligned (14 wide).
fn header_row(cols: &[&str]) -> String {
    let mut names = String::new();
    let mut rule = String::new();
    for (i, col) in cols.iter().enumerate() {
        if i == 0 {
            names.push_str(&format!("{col:<8}"));
            rule.push_str(&"-".repeat(8));
        } else {
            names.push_str(&format!(" {col:>14}"));
            rule.push(' ');
            rule.push_str(&"-".repeat(14));
        }
    }
    format!("{}\n{}\n", names.trim_end(), rule)
}

fn fmt_param(v: f64) -> String {
    if v != 0.0 && v.abs() < 1e-2 {
        format!("{v:.4e}")
    } else {
        format!("{v:.6}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::ParamStats;

    #[test]
    fn small_values_use_scientific_notation() {
        assert_eq!(fmt_param(0.000921), "9.2100e-4");
        assert_eq!(fmt_param(0.132), "0.132000");
        assert_eq!(fmt_param(0.0), "0.000000");
    }

    #[test]
    fn stats_table_lists_every_parameter() {
        let s = ParamStats {
            mean: 1.0,
            median: 0.9,
            min: 0.5,
            max: 1.5,
        };
        let summary = FitSummary {
            n_voxels: 2,
            n_converged: 2,
            n_non_physical: 0,
            stats: Some([s; 4]),
        };
        let text = format_stats(&summary);
        for name in PARAM_NAMES {
            assert!(text.contains(name));
        }
        assert!(text.lines().next().unwrap().contains("median"));
        assert!(!text.lines().any(|l| l.ends_with(' ')));
    }

    #[test]
    fn header_row_aligns_with_body() {
        let text = header_row(&["param", "a", "b"]);
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap().len(), 8 + 2 * 15);
        assert_eq!(lines.next().unwrap(), format!("{} {} {}", "-".repeat(8), "-".repeat(14), "-".repeat(14)));
    }

    #[test]
    fn empty_summary_says_so() {
        let summary = FitSummary {
            n_voxels: 3,
            n_converged: 1,
            n_non_physical: 1,
            stats: None,
        };
        assert_eq!(format_stats(&summary), "No converged voxels with physical parameters.\n");
    }
}
