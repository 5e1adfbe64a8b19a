use std::sync::Arc;

use chrono::{Days, Utc};
use dispo_core::{AbsenceInput, DateWindow, EntityType, JobUpdate, LocalStatus};
use dispo_storage::{CentralDb, DispoRemote, HttpClientConfig, HttpDispoRemote, LocalStore};
use dispo_sync::SyncCycle;
use dispo_web::{central_app, CentralState};
use tokio::net::TcpListener;

async fn central_server() -> (CentralDb, String) {
    let db = CentralDb::connect("sqlite::memory:").await.expect("connect");
    db.migrate().await.expect("migrate");

    let tomorrow = Utc::now()
        .date_naive()
        .checked_add_days(Days::new(1))
        .expect("date");
    let start = format!("{} 08:00:00", tomorrow.format("%Y-%m-%d"));
    let seed = [
        "INSERT INTO users (id, username, full_name, role, active) VALUES (1, 'eva', 'Eva Berg', 'monteur', 1)"
            .to_string(),
        "INSERT INTO customers (id, name, phone) VALUES (10, 'Stadtwerke Nord', '0401234')".to_string(),
        format!(
            "INSERT INTO jobs (id, job_number, customer_id, start_datetime, status, fabrikationsnummern) \
             VALUES (100, 'A-100', 10, '{start}', 'geplant', 'F-1')"
        ),
        "INSERT INTO job_technicians (job_id, technician_id) VALUES (100, 1)".to_string(),
        "INSERT INTO equipment_master (fabrikationsnummer, type) VALUES ('F-1', 'Hubwerk')".to_string(),
    ];
    for sql in &seed {
        sqlx::query(sql).execute(db.pool()).await.expect("seed");
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = central_app(CentralState::new(&db, None));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (db, format!("http://{addr}"))
}

async fn scalar(db: &CentralDb, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(db.pool()).await.expect(sql)
}

#[tokio::test]
async fn cycle_pulls_edits_and_pushes_against_the_central_api() {
    let (db, base_url) = central_server().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let store = LocalStore::open(dir.path().join("monteur.db")).await.expect("store");
    let remote: Arc<dyn DispoRemote> =
        Arc::new(HttpDispoRemote::new(&base_url, None, &HttpClientConfig::default()).expect("client"));
    let cycle = SyncCycle::new(store.clone(), remote.clone(), 1);

    let report = cycle.run().await.expect("first cycle");
    assert!(report.connected, "{report:?}");
    assert_eq!(report.pull.map(|p| p.jobs_inserted), Some(1));

    let jobs = store.jobs_for_technician(1, &DateWindow::default()).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].server_id, Some(100));
    assert_eq!(jobs[0].customer_name.as_deref(), Some("Stadtwerke Nord"));
    let technician = store.technician(1).await.unwrap().unwrap();
    assert_eq!(technician.full_name.as_deref(), Some("Eva Berg"));

    let local_id = jobs[0].id;
    assert!(store
        .update_job(1, local_id, &JobUpdate::Status(LocalStatus::Erledigt))
        .await
        .unwrap());
    let absence_id = store
        .create_absence(1, &AbsenceInput::new("2030-01-07", "2030-01-08", Some("Urlaub")))
        .await
        .unwrap();

    let report = cycle.run().await.expect("second cycle");
    assert_eq!(report.push.map(|p| p.replayed), Some(2), "{report:?}");
    assert!(store.pending_mutations().await.unwrap().is_empty());

    let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE id = 100")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(status, "erledigt");
    assert_eq!(scalar(&db, "SELECT COUNT(*) FROM absences WHERE technician_id = 1").await, 1);
    let remote_absence = store
        .remote_link(EntityType::Absence, absence_id)
        .await
        .unwrap()
        .flatten()
        .expect("linked");
    assert_eq!(
        scalar(&db, &format!("SELECT COUNT(*) FROM absences WHERE id = {remote_absence}")).await,
        1
    );

    assert!(store.delete_absence(1, absence_id).await.unwrap());
    let report = cycle.run().await.expect("third cycle");
    assert_eq!(report.push.map(|p| p.replayed), Some(1));
    assert_eq!(scalar(&db, "SELECT COUNT(*) FROM absences").await, 0);

    let masters = remote.equipment_by_serials(&["F-1".to_string()]).await.unwrap();
    assert_eq!(masters[0].attributes.equipment_type.as_deref(), Some("Hubwerk"));
}

#[tokio::test]
async fn unknown_technician_is_reported_not_raised() {
    let (_db, base_url) = central_server().await;
    let store = LocalStore::open_in_memory().await.expect("store");
    let remote: Arc<dyn DispoRemote> =
        Arc::new(HttpDispoRemote::new(&base_url, None, &HttpClientConfig::default()).expect("client"));

    let report = SyncCycle::new(store.clone(), remote, 42).run().await.expect("cycle");
    assert!(report.ran);
    assert!(!report.connected);
    assert_eq!(
        report.error.as_deref(),
        Some("technician not recognized: user 42 is not an active technician")
    );
    assert!(store.jobs_for_technician(42, &DateWindow::default()).await.unwrap().is_empty());
}
