//! Periodic housekeeping: age out `is_new` flags and purge flushed staging
//! entries. The ledgers are never touched here.

use chrono::{Duration, Utc};
use tracing::info;

use crate::app_state::PipelineContext;
use crate::db::AssetStore;
use crate::store::{CF_FACE_CROPS, CF_RAW};

use super::PipelineError;

#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceReport {
    pub expired_flags: u64,
    pub purged_entries: u64,
}

/// One maintenance pass. `is_new_ttl` is how long an asset counts as new.
pub async fn run(
    ctx: &PipelineContext,
    is_new_ttl: Duration,
) -> Result<MaintenanceReport, PipelineError> {
    let cutoff = Utc::now() - is_new_ttl;
    let expired_flags = ctx.assets.expire_new_flags(cutoff).await?;

    let purged_entries = ctx.staging.purge(CF_RAW)? + ctx.staging.purge(CF_FACE_CROPS)?;

    if !ctx.index.is_empty() {
        let labels = ctx.index.recluster();
        info!(embeddings = labels.len(), "Reclustered similarity index");
    }

    info!(expired_flags, purged_entries, "Maintenance sweep finished");
    Ok(MaintenanceReport {
        expired_flags,
        purged_entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::{Asset, Domain};
    use crate::models::task::{FailedTaskRecord, FailureKind};
    use crate::pipeline::testutil::{harness, StubInference};

    #[tokio::test]
    async fn test_maintenance_expires_flags_and_purges_staging() {
        let h = harness(StubInference::default());

        let mut old = Asset::new("old.jpg", Domain::Ocr);
        old.created_at = Utc::now() - Duration::hours(2);
        h.assets.create(&old).await.unwrap();

        h.ctx.staging.put(CF_RAW, "old.jpg", b"bytes").unwrap();
        h.ctx
            .staging
            .put(CF_FACE_CROPS, "old.jpg_0", b"crop")
            .unwrap();

        let report = run(&h.ctx, Duration::hours(1)).await.unwrap();
        assert_eq!(report.expired_flags, 1);
        assert_eq!(report.purged_entries, 2);
        assert!(!h.ctx.staging.exists(CF_RAW, "old.jpg").unwrap());
    }

    #[tokio::test]
    async fn test_maintenance_leaves_ledger_alone() {
        let h = harness(StubInference::default());
        let record = FailedTaskRecord::new(
            uuid::Uuid::new_v4(),
            FailureKind::OcrExtract,
            vec!["img.jpg".into()],
            Domain::Ocr,
            "timeout",
        );
        h.ctx.failures.record(&record).unwrap();

        run(&h.ctx, Duration::hours(1)).await.unwrap();
        assert!(h.ctx.failures.get(record.task_id).unwrap().is_some());
    }
}
