use std::sync::Arc;

use tracing::trace;

use super::grid::{ForecastMetadata, StructuredGrid, MISSING_VALUE};
use crate::data_item::DataItem;
use crate::error::{PipelineError, Result};
use crate::request::{keys, Request};
use crate::source::{DataGuard, DataProducer, DataSource, ScheduledDataSource, TaskGraphContext};
use crate::task::TaskId;

/// Mean over the ensemble members listed in `MEMBERS`.
///
/// Each member is requested from the input with `MEMBERS` replaced by
/// `MEMBER=<m>`. Grid points missing in any member are missing in the mean.
pub struct EnsembleMeanFilter {
    input: Arc<ScheduledDataSource>,
}

impl EnsembleMeanFilter {
    pub fn new(input: Arc<ScheduledDataSource>) -> Self {
        Self { input }
    }

    fn member_requests(request: &Request) -> Vec<Request> {
        let mut base = request.clone();
        base.remove(keys::MEMBERS);
        request
            .uint_set_value(keys::MEMBERS)
            .into_iter()
            .map(|m| base.clone().with(keys::MEMBER, m))
            .collect()
    }
}

impl DataProducer for EnsembleMeanFilter {
    fn locally_required_keys(&self) -> Vec<String> {
        vec![keys::MEMBERS.to_string()]
    }

    fn produce_data(&self, request: &Request) -> Result<DataItem> {
        let requests = Self::member_requests(request);
        if requests.is_empty() {
            return Err(PipelineError::produce_failed(
                request.request(),
                "no ensemble members selected",
            ));
        }

        let members = DataGuard::acquire_all(&*self.input, &requests)?;
        let grids = members
            .iter()
            .map(|guard| {
                guard.payload::<StructuredGrid>().ok_or_else(|| {
                    PipelineError::produce_failed(request.request(), "input is not a structured grid")
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let first = grids[0];
        if grids.iter().any(|g| !g.same_shape(first)) {
            return Err(PipelineError::produce_failed(
                request.request(),
                "ensemble members have different grid shapes",
            ));
        }

        let metadata = ForecastMetadata {
            member: None,
            ..first.metadata.clone()
        };
        let mut mean = first.like(metadata);
        let n = grids.len() as f32;
        for (idx, out) in mean.data_mut().iter_mut().enumerate() {
            let mut sum = 0.0f32;
            let mut missing = false;
            for grid in &grids {
                let v = grid.data()[idx];
                if v == MISSING_VALUE {
                    missing = true;
                    break;
                }
                sum += v;
            }
            *out = if missing { MISSING_VALUE } else { sum / n };
        }

        trace!("Ensemble mean over {} members for {}", grids.len(), request);
        Ok(DataItem::new(mean))
    }

    fn create_task_graph(&self, ctx: &TaskGraphContext, request: &Request) -> Result<TaskId> {
        let task = ctx.new_task(request.clone());
        for member_request in Self::member_requests(request) {
            let parent = self.input.get_task_graph(&member_request)?;
            ctx.add_parent(task, parent)?;
        }
        Ok(task)
    }

    fn input_sources(&self) -> Vec<(String, Arc<dyn DataSource>)> {
        vec![(String::new(), self.input.clone() as Arc<dyn DataSource>)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_member_requests_replace_members_key() {
        let members: BTreeSet<u32> = [0, 2].into_iter().collect();
        let request = Request::new()
            .with(keys::VARIABLE, "T")
            .with(keys::MEMBERS, members);

        let requests = EnsembleMeanFilter::member_requests(&request);

        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].request(), "MEMBER=0;VARIABLE=T");
        assert_eq!(requests[1].request(), "MEMBER=2;VARIABLE=T");
    }
}
