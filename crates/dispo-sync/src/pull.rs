//! Merges the remote job and absence lists into the local cache.

use std::sync::Arc;

use dispo_core::DateWindow;
use dispo_storage::local::{ensure_customer, ensure_technician, upsert_absence, upsert_job};
use dispo_storage::{DispoRemote, LocalStore, MergeOutcome};
use serde::Serialize;
use tracing::info;

use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PullSummary {
    pub jobs_inserted: usize,
    pub jobs_updated: usize,
    pub absences_inserted: usize,
    pub absences_updated: usize,
    /// Remote absences left alone because of queued local changes.
    pub absences_skipped: usize,
}

#[derive(Clone)]
pub struct PullReconciler {
    store: LocalStore,
    remote: Arc<dyn DispoRemote>,
}

impl PullReconciler {
    pub fn new(store: LocalStore, remote: Arc<dyn DispoRemote>) -> Self {
        Self { store, remote }
    }

    /// Fetches both lists, then merges them in a single local transaction.
    /// Nothing is written unless both requests succeed.
    pub async fn pull(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<PullSummary, SyncError> {
        let (jobs, absences) = tokio::join!(
            self.remote.fetch_jobs(technician_id, window),
            self.remote.fetch_absences(technician_id, window)
        );
        let jobs = jobs.map_err(|err| SyncError::from_remote(technician_id, err))?;
        let absences = absences.map_err(|err| SyncError::from_remote(technician_id, err))?;

        let mut summary = PullSummary::default();
        let mut tx = self.store.begin().await?;
        ensure_technician(&mut tx, technician_id).await?;

        for job in &jobs.jobs {
            let customer_id = ensure_customer(&mut tx, job).await?;
            match upsert_job(&mut tx, job, customer_id, technician_id).await? {
                MergeOutcome::Inserted(_) => summary.jobs_inserted += 1,
                MergeOutcome::Updated(_) | MergeOutcome::Kept(_) => summary.jobs_updated += 1,
                MergeOutcome::Suppressed => {}
            }
        }
        for absence in &absences.absences {
            match upsert_absence(&mut tx, absence, technician_id).await? {
                MergeOutcome::Inserted(_) => summary.absences_inserted += 1,
                MergeOutcome::Updated(_) => summary.absences_updated += 1,
                MergeOutcome::Kept(_) | MergeOutcome::Suppressed => summary.absences_skipped += 1,
            }
        }
        tx.commit().await?;

        self.store
            .update_technician_display(
                technician_id,
                jobs.technician_full_name.as_deref(),
                jobs.technician_username.as_deref(),
            )
            .await?;

        info!(
            technician_id,
            jobs_inserted = summary.jobs_inserted,
            jobs_updated = summary.jobs_updated,
            absences_inserted = summary.absences_inserted,
            absences_updated = summary.absences_updated,
            absences_skipped = summary.absences_skipped,
            "pull merged"
        );
        Ok(summary)
    }
}
