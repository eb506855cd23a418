//! Reference producers
//!
//! A small forecast pipeline built on the source framework: a synthetic
//! reader, an ensemble mean and a horizontal smoothing filter, all exchanging
//! [`StructuredGrid`] items.

mod ensemble;
mod grid;
mod smooth;
mod synthetic;

pub use ensemble::EnsembleMeanFilter;
pub use grid::{ForecastMetadata, GridSummary, StructuredGrid, MISSING_VALUE};
pub use smooth::SmoothFilter;
pub use synthetic::{SyntheticReader, LEVEL_TYPES, SYNTHETIC_VARIABLES};
