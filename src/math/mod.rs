//! Mathematical utilities: least squares, grids, and bounded coordinates.

pub mod bounded;
pub mod grid;
pub mod ols;

pub use bounded::*;
pub use grid::*;
pub use ols::*;
