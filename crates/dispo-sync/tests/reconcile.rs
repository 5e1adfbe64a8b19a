use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dispo_core::{
    AbsenceInput, AbsenceRecord, DateWindow, EntityType, EquipmentMasterRecord, JobRecord,
    JobUpdate, LocalStatus, MutationAction, RemoteAbsenceList, RemoteJobList,
};
use dispo_storage::{DispoRemote, LocalStore, RemoteError};
use dispo_sync::{PullReconciler, PushReplayer, SyncCycle};
use serde_json::json;

const TECH: i64 = 5;

#[derive(Default)]
struct MockRemote {
    jobs: Mutex<Vec<JobRecord>>,
    absences: Mutex<Vec<AbsenceRecord>>,
    calls: Mutex<Vec<String>>,
    failing_jobs: HashSet<i64>,
    created_absence_id: Option<i64>,
    absences_down: bool,
    status_on_check: Option<u16>,
    /// Local absence the technician deletes while a create call is in flight.
    delete_during_create: Mutex<Option<(LocalStore, i64)>>,
}

impl MockRemote {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn set_jobs(&self, jobs: Vec<JobRecord>) {
        *self.jobs.lock().unwrap() = jobs;
    }
}

fn status_error(context: &'static str, status: u16, message: Option<&str>) -> RemoteError {
    RemoteError::HttpStatus {
        context,
        status,
        message: message.map(str::to_string),
    }
}

#[async_trait]
impl DispoRemote for MockRemote {
    async fn fetch_jobs(
        &self,
        technician_id: i64,
        _window: &DateWindow,
    ) -> Result<RemoteJobList, RemoteError> {
        self.record(format!("fetch_jobs {technician_id}"));
        Ok(RemoteJobList {
            ok: true,
            technician_id: Some(technician_id),
            technician_full_name: Some("Eva Berg".into()),
            technician_username: None,
            jobs: self.jobs.lock().unwrap().clone(),
        })
    }

    async fn fetch_absences(
        &self,
        technician_id: i64,
        _window: &DateWindow,
    ) -> Result<RemoteAbsenceList, RemoteError> {
        self.record(format!("fetch_absences {technician_id}"));
        if self.absences_down {
            return Err(status_error("fetch absences", 502, None));
        }
        Ok(RemoteAbsenceList {
            ok: true,
            technician_id: Some(technician_id),
            absences: self.absences.lock().unwrap().clone(),
        })
    }

    async fn update_job(
        &self,
        _technician_id: i64,
        remote_job_id: i64,
        update: &JobUpdate,
    ) -> Result<(), RemoteError> {
        self.record(format!("update_job {remote_job_id} {}", update.action()));
        if self.failing_jobs.contains(&remote_job_id) {
            return Err(status_error("update job", 500, Some("locked")));
        }
        Ok(())
    }

    async fn create_absence(
        &self,
        _technician_id: i64,
        input: &AbsenceInput,
    ) -> Result<Option<i64>, RemoteError> {
        self.record(format!("create_absence {}", input.start_datetime));
        let pending_delete = self.delete_during_create.lock().unwrap().take();
        if let Some((store, absence_id)) = pending_delete {
            assert!(store.delete_absence(TECH, absence_id).await.unwrap());
        }
        Ok(self.created_absence_id)
    }

    async fn update_absence(
        &self,
        _technician_id: i64,
        remote_id: i64,
        _input: &AbsenceInput,
    ) -> Result<(), RemoteError> {
        self.record(format!("update_absence {remote_id}"));
        Ok(())
    }

    async fn delete_absence(&self, _technician_id: i64, remote_id: i64) -> Result<(), RemoteError> {
        self.record(format!("delete_absence {remote_id}"));
        Ok(())
    }

    async fn equipment_by_serials(
        &self,
        _serials: &[String],
    ) -> Result<Vec<EquipmentMasterRecord>, RemoteError> {
        Ok(Vec::new())
    }

    async fn check_connection(&self, technician_id: i64) -> Result<(), RemoteError> {
        self.record(format!("check {technician_id}"));
        match self.status_on_check {
            Some(403) => Err(status_error("fetch jobs", 403, Some("Kein aktiver Monteur"))),
            Some(status) => Err(status_error("fetch jobs", status, None)),
            None => Ok(()),
        }
    }
}

fn remote_job(id: i64, start: &str) -> JobRecord {
    JobRecord {
        id,
        job_number: Some(format!("A-{id}")),
        customer_name: Some("Stadtwerke Nord".into()),
        start_datetime: Some(start.into()),
        status: Some("geplant".into()),
        ..Default::default()
    }
}

async fn pulled(remote: &Arc<MockRemote>) -> LocalStore {
    let store = LocalStore::open_in_memory().await.unwrap();
    PullReconciler::new(store.clone(), remote.clone())
        .pull(TECH, &DateWindow::default())
        .await
        .unwrap();
    store
}

async fn local_job_id(store: &LocalStore, remote_id: i64) -> i64 {
    store
        .jobs_for_technician(TECH, &DateWindow::default())
        .await
        .unwrap()
        .into_iter()
        .find(|job| job.server_id == Some(remote_id))
        .map(|job| job.id)
        .expect("job cached")
}

#[tokio::test]
async fn pull_merges_and_keeps_rows_the_remote_no_longer_lists() {
    let remote = Arc::new(MockRemote::default());
    remote.set_jobs(vec![
        remote_job(100, "2024-05-06T08:00:00"),
        remote_job(101, "2024-05-07T08:00:00"),
    ]);
    remote.absences.lock().unwrap().push(AbsenceRecord {
        id: 40,
        technician_id: TECH,
        start_datetime: "2024-05-20 00:00:00".into(),
        end_datetime: "2024-05-24 00:00:00".into(),
        kind: "vacation".into(),
        ..Default::default()
    });
    let store = pulled(&remote).await;
    let offline_absence = store
        .create_absence(TECH, &AbsenceInput::new("2024-06-01", "2024-06-02", Some("sick")))
        .await
        .unwrap();

    let mut changed = remote_job(100, "2024-05-06T09:30:00");
    changed.description = Some("Bremse prüfen".into());
    remote.set_jobs(vec![changed]);
    let summary = PullReconciler::new(store.clone(), remote.clone())
        .pull(TECH, &DateWindow::default())
        .await
        .unwrap();
    assert_eq!(summary.jobs_inserted, 0);
    assert_eq!(summary.jobs_updated, 1);
    assert_eq!(summary.absences_updated, 1);

    let jobs = store.jobs_for_technician(TECH, &DateWindow::default()).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].start_datetime.as_deref(), Some("2024-05-06 09:30:00"));
    assert_eq!(jobs[0].description.as_deref(), Some("Bremse prüfen"));
    assert!(store.absence(TECH, offline_absence).await.unwrap().is_some());

    let tech = store.technician(TECH).await.unwrap().unwrap();
    assert_eq!(tech.full_name.as_deref(), Some("Eva Berg"));
    assert_eq!(tech.username.as_deref(), Some("tech_5"));
}

#[tokio::test]
async fn failed_absence_fetch_writes_nothing() {
    let remote = Arc::new(MockRemote {
        absences_down: true,
        ..Default::default()
    });
    remote.set_jobs(vec![remote_job(100, "2024-05-06 08:00:00")]);
    let store = LocalStore::open_in_memory().await.unwrap();

    let err = PullReconciler::new(store.clone(), remote.clone())
        .pull(TECH, &DateWindow::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "fetch absences failed with http status 502");
    assert!(store
        .jobs_for_technician(TECH, &DateWindow::default())
        .await
        .unwrap()
        .is_empty());
    assert!(store.technician(TECH).await.unwrap().is_none());
}

#[tokio::test]
async fn push_replays_in_enqueue_order_and_drains_queue() {
    let remote = Arc::new(MockRemote::default());
    remote.set_jobs(vec![remote_job(100, "2024-05-06 08:00:00")]);
    let store = pulled(&remote).await;
    let job = local_job_id(&store, 100).await;

    store
        .update_job(TECH, job, &JobUpdate::Status(LocalStatus::Erledigt))
        .await
        .unwrap();
    store
        .update_job(TECH, job, &JobUpdate::Description("Lager getauscht".into()))
        .await
        .unwrap();

    let summary = PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();
    assert_eq!(summary.replayed, 2);
    let replays: Vec<_> = remote
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("update_job"))
        .collect();
    assert_eq!(replays, vec!["update_job 100 status", "update_job 100 description"]);
    assert!(store.pending_mutations().await.unwrap().is_empty());
}

#[tokio::test]
async fn push_keeps_only_the_failed_mutation() {
    let remote = Arc::new(MockRemote {
        failing_jobs: HashSet::from([2]),
        ..Default::default()
    });
    remote.set_jobs(vec![
        remote_job(1, "2024-05-06 08:00:00"),
        remote_job(2, "2024-05-07 08:00:00"),
        remote_job(3, "2024-05-08 08:00:00"),
    ]);
    let store = pulled(&remote).await;
    for remote_id in [1, 2, 3] {
        let job = local_job_id(&store, remote_id).await;
        store
            .update_job(TECH, job, &JobUpdate::Status(LocalStatus::InArbeit))
            .await
            .unwrap();
    }
    let queued = store.pending_mutations().await.unwrap();

    let summary = PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();
    assert_eq!((summary.replayed, summary.failed, summary.skipped), (2, 1, 0));

    let left = store.pending_mutations().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].sequence, queued[1].sequence);
}

#[tokio::test]
async fn later_mutations_of_a_failed_entity_wait() {
    let remote = Arc::new(MockRemote {
        failing_jobs: HashSet::from([2]),
        ..Default::default()
    });
    remote.set_jobs(vec![remote_job(2, "2024-05-07 08:00:00")]);
    let store = pulled(&remote).await;
    let job = local_job_id(&store, 2).await;
    store
        .update_job(TECH, job, &JobUpdate::Status(LocalStatus::Erledigt))
        .await
        .unwrap();
    store
        .update_job(TECH, job, &JobUpdate::Description("erledigt".into()))
        .await
        .unwrap();

    let summary = PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();
    assert_eq!((summary.replayed, summary.failed, summary.skipped), (0, 1, 1));
    assert_eq!(store.pending_mutations().await.unwrap().len(), 2);
    assert_eq!(
        remote.calls().iter().filter(|c| c.starts_with("update_job")).count(),
        1
    );
}

#[tokio::test]
async fn created_absence_records_the_remote_id() {
    let remote = Arc::new(MockRemote {
        created_absence_id: Some(991),
        ..Default::default()
    });
    let store = LocalStore::open_in_memory().await.unwrap();
    sqlx::query("INSERT INTO users (id, username) VALUES (5, 'tech_5')")
        .execute(store.pool())
        .await
        .unwrap();
    sqlx::query(
        "INSERT INTO absences (id, technician_id, start_datetime, end_datetime, type) \
         VALUES (7, 5, '2024-05-01 00:00:00', '2024-05-03 00:00:00', 'vacation')",
    )
    .execute(store.pool())
    .await
    .unwrap();
    store
        .enqueue(
            EntityType::Absence,
            7,
            MutationAction::Create,
            &json!({
                "start_datetime": "2024-05-01 00:00:00",
                "end_datetime": "2024-05-03 00:00:00",
                "type": "vacation"
            }),
        )
        .await
        .unwrap();

    PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();

    assert_eq!(store.remote_link(EntityType::Absence, 7).await.unwrap(), Some(Some(991)));
    assert!(store.pending_mutations().await.unwrap().is_empty());
    assert_eq!(remote.calls(), vec!["create_absence 2024-05-01 00:00:00"]);
}

#[tokio::test]
async fn offline_absence_create_then_update_uses_new_remote_id() {
    let remote = Arc::new(MockRemote {
        created_absence_id: Some(991),
        ..Default::default()
    });
    let store = LocalStore::open_in_memory().await.unwrap();
    let id = store
        .create_absence(TECH, &AbsenceInput::new("2024-05-01", "2024-05-03", None))
        .await
        .unwrap();
    store
        .update_absence(TECH, id, &AbsenceInput::new("2024-05-01", "2024-05-04", None))
        .await
        .unwrap();

    PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();
    assert_eq!(
        remote.calls(),
        vec!["create_absence 2024-05-01 00:00:00", "update_absence 991"]
    );

    store.delete_absence(TECH, id).await.unwrap();
    PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();
    assert_eq!(remote.calls().last().map(String::as_str), Some("delete_absence 991"));
}

#[tokio::test]
async fn edited_then_deleted_synced_absence_only_sends_the_delete() {
    let remote = Arc::new(MockRemote::default());
    remote.absences.lock().unwrap().push(AbsenceRecord {
        id: 800,
        technician_id: TECH,
        start_datetime: "2024-06-03 00:00:00".into(),
        end_datetime: "2024-06-05 00:00:00".into(),
        kind: "vacation".into(),
        ..Default::default()
    });
    let store = pulled(&remote).await;
    let local_id = store
        .absences_for_technician(TECH, &DateWindow::default())
        .await
        .unwrap()
        .into_iter()
        .find(|absence| absence.server_id == Some(800))
        .map(|absence| absence.id)
        .expect("absence cached");

    assert!(store
        .update_absence(TECH, local_id, &AbsenceInput::new("2024-06-03", "2024-06-07", None))
        .await
        .unwrap());
    assert!(store.delete_absence(TECH, local_id).await.unwrap());

    let summary = PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();

    assert_eq!(summary.replayed, 1);
    let sent: Vec<String> = remote
        .calls()
        .into_iter()
        .filter(|call| !call.starts_with("fetch_"))
        .collect();
    assert_eq!(sent, vec!["delete_absence 800"]);
    assert!(store.pending_mutations().await.unwrap().is_empty());
}

#[tokio::test]
async fn mutations_for_vanished_rows_are_discarded() {
    let remote = Arc::new(MockRemote::default());
    let store = LocalStore::open_in_memory().await.unwrap();
    store
        .enqueue(
            EntityType::Absence,
            42,
            MutationAction::Update,
            &json!({
                "start_datetime": "2024-05-01 00:00:00",
                "end_datetime": "2024-05-03 00:00:00",
                "type": "vacation"
            }),
        )
        .await
        .unwrap();
    store
        .enqueue(EntityType::Job, 77, MutationAction::Status, &json!({"status": "erledigt"}))
        .await
        .unwrap();

    let summary = PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();

    assert_eq!(summary.discarded, 2);
    assert_eq!(summary.replayed, 0);
    assert_eq!(summary.failed, 0);
    assert!(remote.calls().is_empty());
    assert!(store.pending_mutations().await.unwrap().is_empty());
}

#[tokio::test]
async fn absence_deleted_during_create_queues_remote_delete() {
    let remote = Arc::new(MockRemote {
        created_absence_id: Some(991),
        ..Default::default()
    });
    let store = LocalStore::open_in_memory().await.unwrap();
    let id = store
        .create_absence(TECH, &AbsenceInput::new("2024-05-01", "2024-05-03", None))
        .await
        .unwrap();
    *remote.delete_during_create.lock().unwrap() = Some((store.clone(), id));

    let summary = PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();

    assert_eq!(summary.replayed, 1);
    assert_eq!(store.remote_link(EntityType::Absence, id).await.unwrap(), None);
    let pending = store.pending_mutations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_type, EntityType::Absence);
    assert_eq!(pending[0].entity_id, 991);
    assert_eq!(pending[0].action, MutationAction::Delete);

    PushReplayer::new(store.clone(), remote.clone())
        .push(TECH)
        .await
        .unwrap();
    assert_eq!(
        remote.calls(),
        vec!["create_absence 2024-05-01 00:00:00", "delete_absence 991"]
    );
    assert!(store.pending_mutations().await.unwrap().is_empty());
}

#[tokio::test]
async fn cycle_runs_check_pull_push_and_persists() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = LocalStore::open(dir.path().join("monteur.db")).await.unwrap();
    let remote = Arc::new(MockRemote::default());
    remote.set_jobs(vec![remote_job(100, "2024-05-06 08:00:00")]);

    let cycle = SyncCycle::new(store.clone(), remote.clone(), TECH);
    let report = cycle.run().await.unwrap();
    assert!(report.ran && report.connected);
    assert_eq!(report.pull.map(|p| p.jobs_inserted), Some(1));
    assert_eq!(report.push.map(|p| p.replayed), Some(0));
    assert_eq!(remote.calls()[0], "check 5");
}

#[tokio::test]
async fn cycle_reports_offline_and_leaves_queue_alone() {
    let remote = Arc::new(MockRemote {
        status_on_check: Some(503),
        ..Default::default()
    });
    let store = LocalStore::open_in_memory().await.unwrap();
    store
        .create_absence(TECH, &AbsenceInput::new("2024-05-01", "2024-05-03", None))
        .await
        .unwrap();

    let report = SyncCycle::new(store.clone(), remote.clone(), TECH)
        .run()
        .await
        .unwrap();
    assert!(report.ran);
    assert!(!report.connected);
    assert!(report.pull.is_none());
    assert_eq!(report.error.as_deref(), Some("fetch jobs failed with http status 503"));
    assert_eq!(store.pending_mutations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn cycle_surfaces_unknown_technician() {
    let remote = Arc::new(MockRemote {
        status_on_check: Some(403),
        ..Default::default()
    });
    let store = LocalStore::open_in_memory().await.unwrap();
    let report = SyncCycle::new(store, remote, TECH).run().await.unwrap();
    assert_eq!(
        report.error.as_deref(),
        Some("technician not recognized: Kein aktiver Monteur")
    );
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    let remote = Arc::new(MockRemote::default());
    let store = LocalStore::open_in_memory().await.unwrap();
    let cycle = SyncCycle::new(store, remote.clone(), TECH);

    let _held = cycle.gate().try_enter().expect("gate free");
    let report = cycle.run().await.unwrap();
    assert!(!report.ran);
    assert!(remote.calls().is_empty());
}
