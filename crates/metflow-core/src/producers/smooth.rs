use std::sync::Arc;

use rayon::prelude::*;

use super::grid::{StructuredGrid, MISSING_VALUE};
use crate::data_item::DataItem;
use crate::error::{PipelineError, Result};
use crate::request::{keys, Request};
use crate::source::{DataGuard, DataProducer, DataSource, ScheduledDataSource, TaskGraphContext};
use crate::task::TaskId;

/// Horizontal Gaussian smoothing.
///
/// `SMOOTH_STDDEV` is the standard deviation in grid points; zero or less
/// copies the input. Levels are smoothed in parallel.
pub struct SmoothFilter {
    input: Arc<ScheduledDataSource>,
}

impl SmoothFilter {
    pub fn new(input: Arc<ScheduledDataSource>) -> Self {
        Self { input }
    }

    fn input_request(request: &Request) -> Request {
        let mut input = request.clone();
        input.remove(keys::SMOOTH_STDDEV);
        input
    }
}

/// Normalized 1D Gaussian weights covering three standard deviations.
fn gaussian_kernel(stddev: f32) -> Vec<f32> {
    let radius = (3.0 * stddev).ceil() as i64;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|x| (-(x * x) as f32 / (2.0 * stddev * stddev)).exp())
        .collect();
    let total: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / total).collect()
}

/// Convolve one line of values. Points outside the line and missing values
/// are excluded and the remaining weights renormalized.
fn convolve_line(line: &[f32], kernel: &[f32], out: &mut [f32]) {
    let radius = (kernel.len() / 2) as i64;
    let n = line.len() as i64;
    for (x, o) in out.iter_mut().enumerate() {
        if line[x] == MISSING_VALUE {
            *o = MISSING_VALUE;
            continue;
        }
        let (mut sum, mut weight) = (0.0f32, 0.0f32);
        for (w, offset) in kernel.iter().zip(-radius..=radius) {
            let pos = x as i64 + offset;
            if pos < 0 || pos >= n {
                continue;
            }
            let v = line[pos as usize];
            if v != MISSING_VALUE {
                sum += w * v;
                weight += w;
            }
        }
        *o = if weight > 0.0 { sum / weight } else { MISSING_VALUE };
    }
}

/// Separable smoothing of one level (rows, then columns).
fn smooth_level(level: &[f32], nlon: usize, nlat: usize, kernel: &[f32], out: &mut [f32]) {
    let mut rows = vec![0.0f32; level.len()];
    for j in 0..nlat {
        let span = j * nlon..(j + 1) * nlon;
        convolve_line(&level[span.clone()], kernel, &mut rows[span]);
    }

    let mut column = vec![0.0f32; nlat];
    let mut smoothed = vec![0.0f32; nlat];
    for i in 0..nlon {
        for j in 0..nlat {
            column[j] = rows[j * nlon + i];
        }
        convolve_line(&column, kernel, &mut smoothed);
        for j in 0..nlat {
            out[j * nlon + i] = smoothed[j];
        }
    }
}

impl DataProducer for SmoothFilter {
    fn locally_required_keys(&self) -> Vec<String> {
        vec![keys::SMOOTH_STDDEV.to_string()]
    }

    fn produce_data(&self, request: &Request) -> Result<DataItem> {
        let stddev = request.float_value(keys::SMOOTH_STDDEV);
        let input = DataGuard::acquire(&*self.input, &Self::input_request(request))?;
        let grid = input.payload::<StructuredGrid>().ok_or_else(|| {
            PipelineError::produce_failed(request.request(), "input is not a structured grid")
        })?;

        let mut result = grid.like(grid.metadata.clone());
        let level_size = grid.level_size();
        if stddev <= 0.0 || level_size == 0 {
            result.data_mut().copy_from_slice(grid.data());
            return Ok(DataItem::new(result));
        }

        let kernel = gaussian_kernel(stddev);
        let (nlon, nlat) = (grid.nlon(), grid.nlat());
        result
            .data_mut()
            .par_chunks_mut(level_size)
            .zip(grid.data().par_chunks(level_size))
            .for_each(|(out, level)| smooth_level(level, nlon, nlat, &kernel, out));

        Ok(DataItem::new(result))
    }

    fn create_task_graph(&self, ctx: &TaskGraphContext, request: &Request) -> Result<TaskId> {
        let task = ctx.new_task(request.clone());
        let parent = self.input.get_task_graph(&Self::input_request(request))?;
        ctx.add_parent(task, parent)?;
        Ok(task)
    }

    fn input_sources(&self) -> Vec<(String, Arc<dyn DataSource>)> {
        vec![(String::new(), self.input.clone() as Arc<dyn DataSource>)]
    }
}
