//! One connectivity check, pull and push pass, and the timer that drives it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use dispo_core::DateWindow;
use dispo_storage::{DispoRemote, LocalStore};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{PullReconciler, PullSummary, PushReplayer, PushSummary, SyncError};

/// Serializes sync work per device. Timer ticks skip when it is held; manual
/// syncs wait for it.
#[derive(Debug, Clone, Default)]
pub struct SyncGate(Arc<Mutex<()>>);

impl SyncGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_enter(&self) -> Option<OwnedMutexGuard<()>> {
        self.0.clone().try_lock_owned().ok()
    }

    pub async fn enter(&self) -> OwnedMutexGuard<()> {
        self.0.clone().lock_owned().await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// False when the tick was skipped because another sync held the gate.
    pub ran: bool,
    pub connected: bool,
    pub pull: Option<PullSummary>,
    pub push: Option<PushSummary>,
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct SyncCycle {
    store: LocalStore,
    remote: Arc<dyn DispoRemote>,
    technician_id: i64,
    days_back: u32,
    days_ahead: u32,
    gate: SyncGate,
}

impl SyncCycle {
    pub fn new(store: LocalStore, remote: Arc<dyn DispoRemote>, technician_id: i64) -> Self {
        Self {
            store,
            remote,
            technician_id,
            days_back: 30,
            days_ahead: 90,
            gate: SyncGate::new(),
        }
    }

    pub fn with_window(mut self, days_back: u32, days_ahead: u32) -> Self {
        self.days_back = days_back;
        self.days_ahead = days_ahead;
        self
    }

    pub fn with_gate(mut self, gate: SyncGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn gate(&self) -> &SyncGate {
        &self.gate
    }

    pub fn window(&self) -> DateWindow {
        DateWindow::around(Utc::now().date_naive(), self.days_back, self.days_ahead)
    }

    /// Runs a cycle unless one is already in progress. Remote failures end the
    /// cycle early and are reported, not returned; local store failures are
    /// returned.
    pub async fn run(&self) -> Result<CycleReport, SyncError> {
        let Some(_guard) = self.gate.try_enter() else {
            debug!(
                technician_id = self.technician_id,
                "previous sync cycle still running; tick skipped"
            );
            return Ok(CycleReport::default());
        };
        self.run_entered().await
    }

    /// Runs a cycle; the caller must hold the gate.
    pub async fn run_entered(&self) -> Result<CycleReport, SyncError> {
        let span = info_span!("sync_cycle", technician_id = self.technician_id);
        self.stages().instrument(span).await
    }

    async fn stages(&self) -> Result<CycleReport, SyncError> {
        let technician_id = self.technician_id;
        let mut report = CycleReport {
            ran: true,
            ..CycleReport::default()
        };

        if let Err(err) = self.remote.check_connection(technician_id).await {
            return abandon(report, SyncError::from_remote(technician_id, err));
        }
        report.connected = true;

        let window = self.window();
        match PullReconciler::new(self.store.clone(), self.remote.clone())
            .pull(technician_id, &window)
            .await
        {
            Ok(summary) => {
                report.pull = Some(summary);
                self.store.persist().await?;
            }
            Err(err) => return abandon(report, err),
        }

        match PushReplayer::new(self.store.clone(), self.remote.clone())
            .push(technician_id)
            .await
        {
            Ok(summary) => {
                report.push = Some(summary);
                self.store.persist().await?;
            }
            Err(err) => return abandon(report, err),
        }

        info!("sync cycle finished");
        Ok(report)
    }
}

fn abandon(mut report: CycleReport, err: SyncError) -> Result<CycleReport, SyncError> {
    if !err.is_remote() {
        return Err(err);
    }
    warn!(error = %err, connected = report.connected, "sync cycle abandoned");
    report.error = Some(err.to_string());
    Ok(report)
}

/// Repeats the cycle at a fixed interval. The scheduler is returned unstarted.
pub async fn build_scheduler(cycle: Arc<SyncCycle>, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let cycle = cycle.clone();
        Box::pin(async move {
            match cycle.run().await {
                Ok(report) if !report.ran => {}
                Ok(report) => debug!(connected = report.connected, "scheduled sync cycle done"),
                Err(err) => warn!(error = %err, "scheduled sync cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating sync job every {}s", interval.as_secs()))?;
    sched.add(job).await.context("adding sync job")?;
    Ok(sched)
}
