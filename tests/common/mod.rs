#![allow(dead_code)]

use ivim_fit::GradientTable;
use ivim_fit::domain::IvimParams;
use ivim_fit::gradients::{IVIM_PROTOCOL_BVALS, generate_bvecs};
use rand::SeedableRng;
use rand::rngs::StdRng;

/// Voxel used throughout the single-voxel checks.
pub const REFERENCE: IvimParams = IvimParams::new(1.0, 0.132, 0.00885, 0.000921);

/// Two voxels with different baselines and perfusion.
pub const MULTI_VOXEL: [IvimParams; 2] = [
    IvimParams::new(1.0, 0.2052, 0.00473, 0.00066),
    IvimParams::new(101.0, 0.132, 0.00885, 0.000921),
];

/// 26-point protocol table with seeded random directions.
pub fn protocol_gtab() -> GradientTable {
    let mut rng = StdRng::seed_from_u64(1234);
    let bvecs = generate_bvecs(IVIM_PROTOCOL_BVALS.len(), &mut rng);
    GradientTable::new(IVIM_PROTOCOL_BVALS.to_vec(), bvecs).expect("protocol table is valid")
}

pub fn rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}
