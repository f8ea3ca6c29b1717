//! Input/output helpers.
//!
//! - b-value / b-vector / signal loading (`ingest`)
//! - parameter map exports (CSV/JSON) (`export`)

pub mod export;
pub mod ingest;

pub use export::*;
pub use ingest::*;
