//! Analytic forecast fields.
//!
//! Stands in for a file reader: every (level type, variable, member) triple
//! yields a deterministic field, so pipelines can be exercised without data
//! files. Production can be slowed down to mimic disk latency.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use super::grid::{ForecastMetadata, StructuredGrid};
use crate::data_item::DataItem;
use crate::error::{PipelineError, Result};
use crate::request::{keys, Request};
use crate::source::DataProducer;
use crate::task::TaskClass;

/// Variables the reader knows about.
pub const SYNTHETIC_VARIABLES: &[&str] = &["T", "U", "V", "Q", "GPH"];

/// Vertical level types the reader knows about.
pub const LEVEL_TYPES: &[&str] = &["SURFACE", "PRESSURE", "HYBRID"];

/// Reader of synthetic forecast fields.
#[derive(Debug)]
pub struct SyntheticReader {
    nlon: usize,
    nlat: usize,
    nlev: usize,
    init_time: DateTime<Utc>,
    latency: Option<Duration>,
    productions: Arc<AtomicUsize>,
}

impl SyntheticReader {
    pub fn new(nlon: usize, nlat: usize, nlev: usize) -> Self {
        Self {
            nlon,
            nlat,
            nlev,
            init_time: Utc.with_ymd_and_hms(2012, 10, 17, 0, 0, 0).single().unwrap_or_default(),
            latency: None,
            productions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sleep for `latency` in every production.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_init_time(mut self, init_time: DateTime<Utc>) -> Self {
        self.init_time = init_time;
        self
    }

    /// Counter of completed productions, shared with the caller.
    pub fn production_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.productions)
    }

    fn levels_for(&self, level_type: &str) -> Option<usize> {
        match level_type {
            "SURFACE" => Some(1),
            "PRESSURE" | "HYBRID" => Some(self.nlev),
            _ => None,
        }
    }
}

/// Value of `variable` at a grid point. `height` runs from 0 (bottom) to 1.
fn field_value(variable: &str, member: u32, lon: f32, lat: f32, height: f32) -> f32 {
    let (lon_r, lat_r) = (lon.to_radians(), lat.to_radians());
    let perturbation = member as f32 * 0.25 * (2.0 * lon_r + lat_r).sin();
    match variable {
        "T" => 288.0 - 60.0 * height + 25.0 * lat_r.cos() + perturbation,
        "U" => 10.0 + 30.0 * height * (2.0 * lat_r).cos() + perturbation,
        "V" => 5.0 * lon_r.sin() * lat_r.cos() + perturbation,
        "Q" => (0.015 * lat_r.cos() * (1.0 - height)).max(0.0) + perturbation * 1.0e-4,
        _ => 9.81 * 16000.0 * height + 100.0 * lat_r.cos() + perturbation,
    }
}

impl DataProducer for SyntheticReader {
    fn locally_required_keys(&self) -> Vec<String> {
        vec![
            keys::LEVELTYPE.to_string(),
            keys::VARIABLE.to_string(),
            keys::MEMBER.to_string(),
        ]
    }

    fn produce_data(&self, request: &Request) -> Result<DataItem> {
        let level_type = request.value(keys::LEVELTYPE);
        let variable = request.value(keys::VARIABLE);
        let member = u32::try_from(request.int_value(keys::MEMBER)).map_err(|_| {
            PipelineError::produce_failed(request.request(), "ensemble member must not be negative")
        })?;

        let nlev = self.levels_for(level_type).ok_or_else(|| {
            PipelineError::produce_failed(
                request.request(),
                format!("unknown level type '{}'", level_type),
            )
        })?;
        if !SYNTHETIC_VARIABLES.contains(&variable) {
            return Err(PipelineError::produce_failed(
                request.request(),
                format!("variable '{}' is not available", variable),
            ));
        }

        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let metadata = ForecastMetadata {
            init_time: Some(self.init_time),
            valid_time: Some(self.init_time),
            variable: variable.to_string(),
            member: Some(member),
        };
        let mut grid = StructuredGrid::zeros(metadata, self.nlon, self.nlat, nlev);
        let lons = grid.lons().to_vec();
        let lats = grid.lats().to_vec();
        for k in 0..nlev {
            let height = if nlev > 1 { k as f32 / (nlev - 1) as f32 } else { 0.0 };
            for (j, lat) in lats.iter().enumerate() {
                for (i, lon) in lons.iter().enumerate() {
                    grid.set_value(k, j, i, field_value(variable, member, *lon, *lat, height));
                }
            }
        }

        let n = self.productions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Synthetic reader produced {} (production {})", request, n);
        Ok(DataItem::new(grid))
    }

    fn task_class(&self) -> TaskClass {
        TaskClass::DiskReader
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(level_type: &str, variable: &str, member: i64) -> Request {
        Request::new()
            .with(keys::LEVELTYPE, level_type)
            .with(keys::VARIABLE, variable)
            .with(keys::MEMBER, member)
    }

    #[test]
    fn test_surface_field_has_one_level() {
        let reader = SyntheticReader::new(8, 5, 4);
        let item = reader.produce_data(&request("SURFACE", "T", 0)).unwrap();
        let grid = item.payload::<StructuredGrid>().unwrap();
        assert_eq!(grid.nlev(), 1);
        assert_eq!(grid.metadata.member, Some(0));
        assert_eq!(reader.production_counter().load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_members_differ() {
        let reader = SyntheticReader::new(8, 5, 4);
        let a = reader.produce_data(&request("HYBRID", "U", 0)).unwrap();
        let b = reader.produce_data(&request("HYBRID", "U", 3)).unwrap();
        assert_ne!(
            a.payload::<StructuredGrid>().unwrap().data(),
            b.payload::<StructuredGrid>().unwrap().data()
        );
    }

    #[test]
    fn test_unknown_variable_fails() {
        let reader = SyntheticReader::new(8, 5, 4);
        let err = reader.produce_data(&request("HYBRID", "XYZ", 0)).unwrap_err();
        assert!(err.to_string().contains("XYZ"));
        assert_eq!(reader.production_counter().load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unknown_level_type_fails() {
        let reader = SyntheticReader::new(8, 5, 4);
        assert!(reader.produce_data(&request("MODEL", "T", 0)).is_err());
    }

    #[test]
    fn test_is_disk_reader() {
        assert_eq!(SyntheticReader::new(1, 1, 1).task_class(), TaskClass::DiskReader);
    }
}
