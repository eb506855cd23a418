//! Regular longitude/latitude grids.

use std::any::Any;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::data_item::DataPayload;

/// Marker for grid points without a value
pub const MISSING_VALUE: f32 = -999.0e9;

/// Forecast identity of a grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForecastMetadata {
    pub init_time: Option<DateTime<Utc>>,
    pub valid_time: Option<DateTime<Utc>>,
    pub variable: String,
    /// Ensemble member; `None` for ensemble products such as the mean
    pub member: Option<u32>,
}

/// Field on a regular lon/lat grid with `nlev` vertical levels.
///
/// Values are stored level by level, each level row-major by latitude:
/// index = `(k * nlat + j) * nlon + i`.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredGrid {
    pub metadata: ForecastMetadata,
    nlon: usize,
    nlat: usize,
    nlev: usize,
    lons: Vec<f32>,
    lats: Vec<f32>,
    data: Vec<f32>,
}

impl StructuredGrid {
    /// Global grid initialized to zero.
    pub fn zeros(metadata: ForecastMetadata, nlon: usize, nlat: usize, nlev: usize) -> Self {
        let dlon = 360.0 / nlon.max(1) as f32;
        let dlat = if nlat > 1 { 180.0 / (nlat - 1) as f32 } else { 0.0 };
        Self {
            metadata,
            nlon,
            nlat,
            nlev,
            lons: (0..nlon).map(|i| -180.0 + i as f32 * dlon).collect(),
            lats: (0..nlat).map(|j| 90.0 - j as f32 * dlat).collect(),
            data: vec![0.0; nlon * nlat * nlev],
        }
    }

    /// Grid of the same shape and coordinates with new values.
    pub fn like(&self, metadata: ForecastMetadata) -> Self {
        Self {
            metadata,
            nlon: self.nlon,
            nlat: self.nlat,
            nlev: self.nlev,
            lons: self.lons.clone(),
            lats: self.lats.clone(),
            data: vec![0.0; self.data.len()],
        }
    }

    pub fn nlon(&self) -> usize {
        self.nlon
    }

    pub fn nlat(&self) -> usize {
        self.nlat
    }

    pub fn nlev(&self) -> usize {
        self.nlev
    }

    pub fn lons(&self) -> &[f32] {
        &self.lons
    }

    pub fn lats(&self) -> &[f32] {
        &self.lats
    }

    pub fn same_shape(&self, other: &StructuredGrid) -> bool {
        self.nlon == other.nlon && self.nlat == other.nlat && self.nlev == other.nlev
    }

    #[inline]
    pub fn index(&self, k: usize, j: usize, i: usize) -> usize {
        (k * self.nlat + j) * self.nlon + i
    }

    #[inline]
    pub fn value(&self, k: usize, j: usize, i: usize) -> f32 {
        self.data[self.index(k, j, i)]
    }

    #[inline]
    pub fn set_value(&mut self, k: usize, j: usize, i: usize, value: f32) {
        let n = self.index(k, j, i);
        self.data[n] = value;
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Number of values per level.
    pub fn level_size(&self) -> usize {
        self.nlon * self.nlat
    }

    fn valid_values(&self) -> impl Iterator<Item = f32> + '_ {
        self.data.iter().copied().filter(|v| *v != MISSING_VALUE)
    }

    /// Smallest value, ignoring missing values.
    pub fn min(&self) -> Option<f32> {
        self.valid_values().reduce(f32::min)
    }

    /// Largest value, ignoring missing values.
    pub fn max(&self) -> Option<f32> {
        self.valid_values().reduce(f32::max)
    }

    /// Mean value, ignoring missing values.
    pub fn mean(&self) -> Option<f32> {
        let (sum, n) = self
            .valid_values()
            .fold((0.0f64, 0usize), |(sum, n), v| (sum + v as f64, n + 1));
        (n > 0).then(|| (sum / n as f64) as f32)
    }

    pub fn summary(&self) -> GridSummary {
        GridSummary {
            metadata: self.metadata.clone(),
            nlon: self.nlon,
            nlat: self.nlat,
            nlev: self.nlev,
            min: self.min(),
            max: self.max(),
            mean: self.mean(),
        }
    }
}

impl DataPayload for StructuredGrid {
    fn memory_size_kb(&self) -> u64 {
        let floats = self.data.len() + self.lons.len() + self.lats.len();
        (floats * std::mem::size_of::<f32>()).div_ceil(1024) as u64
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Printable statistics of a grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridSummary {
    pub metadata: ForecastMetadata,
    pub nlon: usize,
    pub nlat: usize,
    pub nlev: usize,
    pub min: Option<f32>,
    pub max: Option<f32>,
    pub mean: Option<f32>,
}
