use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use crate::engine::EngineHandle;
use crate::job::{BatchReport, Job, JobItem, JobOutcome, ItemOutcome, Stage, Timings};
use crate::request::BatchItemSpec;
use crate::telemetry::JobLogger;

use super::cancel::{CancelFlag, Deadline};
use super::context::JobRun;
use super::progress::{ProgressEmitter, ProgressSink};
use super::runner::Pipeline;

/// Shared per-request state: one job id, one deadline and one cancel flag
/// for a single job or every item of a batch.
#[derive(Clone)]
pub struct RunScope {
    pub job_id: String,
    pub deadline: Deadline,
    pub cancel: CancelFlag,
    pub sinks: Vec<Arc<dyn ProgressSink>>,
    pub logger: JobLogger,
}

impl RunScope {
    pub fn run_for(&self, job: Job) -> JobRun {
        let mut progress = ProgressEmitter::new(&self.job_id, self.sinks.clone());
        if let Some(item) = &job.item {
            progress = progress.for_item(item);
        }
        JobRun::new(
            job,
            self.deadline,
            self.cancel.clone(),
            progress,
            self.logger.clone(),
        )
    }
}

/// Runs batch items one after another on the shared engine. Every item gets
/// exactly one outcome; a failing item never stops the ones after it, while
/// cancellation turns every remaining item into `cancelled`.
pub async fn run_batch(
    pipeline: &Pipeline,
    engine: &EngineHandle,
    scope: &RunScope,
    raw: &Value,
    items: Vec<BatchItemSpec>,
) -> BatchReport {
    let raw_items = ["items", "batch"]
        .into_iter()
        .find_map(|key| raw.get(key).and_then(Value::as_array));
    let total = items.len();
    let mut outcomes = Vec::with_capacity(total);

    for (index, item) in items.into_iter().enumerate() {
        let raw_item = raw_items
            .and_then(|all| all.get(index))
            .cloned()
            .unwrap_or(Value::Null);
        let membership = JobItem {
            item_id: item.item_id.clone(),
            index,
            parent_job_id: scope.job_id.clone(),
        };
        let job = Job::new(&scope.job_id, raw_item, item.spec).with_item(membership);

        let result = if scope.cancel.is_cancelled() {
            skip_cancelled(scope, job)
        } else {
            info!("Running batch item {} of {} ({})", index + 1, total, item.item_id);
            pipeline.run(scope.run_for(job), engine).await
        };

        outcomes.push(ItemOutcome {
            item_id: item.item_id,
            item_index: index,
            result,
        });
    }

    let report = BatchReport::new(&scope.job_id, outcomes);
    let mut details = Map::new();
    details.insert(
        "status".to_string(),
        serde_json::to_value(report.status).unwrap_or(Value::Null),
    );
    details.insert("items".to_string(), Value::from(total));
    scope.logger.info(
        "batch_completed",
        details,
        Some(scope.deadline.elapsed().as_millis() as u64),
    );
    report
}

/// Terminal outcome for an item that never started.
fn skip_cancelled(scope: &RunScope, job: Job) -> JobOutcome {
    let run = scope.run_for(job);
    let mut details = Map::new();
    details.insert("stage".to_string(), Value::from(Stage::Pending.label()));
    run.progress.emit_terminal("cancelled", details);
    JobOutcome::Cancelled {
        job_id: run.job.id.clone(),
        item_id: run.job.item_id().map(str::to_string),
        stage: Stage::Pending,
        timings: Timings::default(),
    }
}
