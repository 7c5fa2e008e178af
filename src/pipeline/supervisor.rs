//! Retry supervisor: sweeps the failure ledger on a fixed schedule and
//! resubmits each failed unit to the stage its classification routes to.

use tracing::info;
use uuid::Uuid;

use crate::app_state::PipelineContext;
use crate::models::task::QueuedTask;
use crate::services::queue::TaskQueue;

use super::PipelineError;

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub resubmitted: u64,
}

/// One sweep over the ledger. For every entry: route by failure kind
/// (`upload…` back to ingestion, everything else to the matching processing
/// stage), enqueue the resubmission, then delete the entry.
///
/// The delete happens after the enqueue, not after the retry completes, so
/// a crash mid-sweep can double-retry an entry; downstream writes are
/// idempotent, which makes that harmless.
pub async fn sweep(ctx: &PipelineContext) -> Result<SweepReport, PipelineError> {
    let mut report = SweepReport::default();

    for record in ctx.failures.entries()? {
        let task = if record.kind.routes_to_ingestion() {
            QueuedTask::IngestBatch {
                task_id: Uuid::new_v4(),
                asset_ids: record.asset_ids.clone(),
                domain: record.domain,
            }
        } else {
            QueuedTask::ProcessBatch {
                task_id: Uuid::new_v4(),
                asset_ids: record.asset_ids.clone(),
                domain: record.domain,
            }
        };

        ctx.queue.enqueue(&task).await?;
        ctx.failures.remove(record.task_id)?;
        report.resubmitted += 1;
    }

    if report.resubmitted > 0 {
        info!(resubmitted = report.resubmitted, "Restarted failed tasks");
    }
    metrics::counter!("retry_resubmissions_total").increment(report.resubmitted);
    Ok(report)
}
