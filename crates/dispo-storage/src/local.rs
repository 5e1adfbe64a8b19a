//! Embedded SQLite cache on the technician device.
//!
//! Every technician-facing write runs in one short transaction together with
//! the pending-mutation row it produces, so the queue never disagrees with the
//! cached data. The pool holds a single connection; SQLite has one writer.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use dispo_core::{
    now_timestamp, normalize_remote_datetime, AbsenceInput, AbsenceRecord, DateWindow, EntityType,
    JobRecord, JobUpdate, LocalStatus, MutationAction, PendingMutation, Technician,
};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;

use crate::{absence_from_row, job_from_row, StoreError, JOB_COLUMNS};

const UNKNOWN_CUSTOMER: &str = "Unbekannt";
const DEFAULT_JOB_TYPE: &str = "Service";
const DEFAULT_COUNTRY: &str = "DE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted(i64),
    Updated(i64),
    /// Row left untouched because local changes are still queued for it.
    Kept(i64),
    /// Remote row ignored because the technician deleted it locally.
    Suppressed,
}

impl MergeOutcome {
    pub fn local_id(self) -> Option<i64> {
        match self {
            Self::Inserted(id) | Self::Updated(id) | Self::Kept(id) => Some(id),
            Self::Suppressed => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Opens (creating if needed) the cache file in WAL mode and applies the
    /// embedded migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        Self::connect(options).await
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations/local").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Folds the write-ahead log back into the main database file.
    pub async fn persist(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn technician(&self, technician_id: i64) -> Result<Option<Technician>, StoreError> {
        let row = sqlx::query("SELECT id, username, full_name FROM users WHERE id = ?")
            .bind(technician_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> Result<Technician, StoreError> {
            Ok(Technician {
                id: row.try_get("id")?,
                username: row.try_get("username")?,
                full_name: row.try_get("full_name")?,
            })
        })
        .transpose()
    }

    /// Applies whichever of the display fields the remote supplied.
    pub async fn update_technician_display(
        &self,
        technician_id: i64,
        full_name: Option<&str>,
        username: Option<&str>,
    ) -> Result<(), StoreError> {
        let full_name = full_name.map(str::trim).filter(|v| !v.is_empty());
        let username = username.map(str::trim).filter(|v| !v.is_empty());
        if full_name.is_none() && username.is_none() {
            return Ok(());
        }
        sqlx::query(
            "UPDATE users SET full_name = COALESCE(?, full_name), username = COALESCE(?, username) WHERE id = ?",
        )
        .bind(full_name)
        .bind(username)
        .bind(technician_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn jobs_for_technician(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut sql = format!("{} WHERE 1 = 1", job_select());
        let lower = window.lower_bound();
        let upper = window.upper_bound();
        if lower.is_some() {
            sql.push_str(" AND j.start_datetime >= ?");
        }
        if upper.is_some() {
            sql.push_str(" AND j.start_datetime <= ?");
        }
        sql.push_str(" ORDER BY j.start_datetime ASC, j.id ASC");

        let mut query = sqlx::query(&sql).bind(technician_id);
        for bound in [lower, upper].into_iter().flatten() {
            query = query.bind(bound);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(job_from_row).collect::<Result<_, _>>()?)
    }

    /// Returns the job only when it is assigned to the technician.
    pub async fn job_for_technician(
        &self,
        technician_id: i64,
        job_id: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("{} WHERE j.id = ?", job_select());
        let row = sqlx::query(&sql)
            .bind(technician_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    /// Applies one technician edit and queues it for replay. Returns `false`
    /// when the job does not exist or is not assigned to the technician.
    pub async fn update_job(
        &self,
        technician_id: i64,
        job_id: i64,
        update: &JobUpdate,
    ) -> Result<bool, StoreError> {
        let (column, value) = match update {
            JobUpdate::Status(status) => ("status", Some(status.as_str().to_string())),
            JobUpdate::Description(text) => ("description", Some(text.clone())),
            JobUpdate::EquipmentLines(lines) => ("fabrikationsnummern", lines.clone()),
        };
        let sql = format!(
            "UPDATE jobs SET {column} = ?, updated_at = ?, updated_by = ? \
             WHERE id = ? AND id IN (SELECT job_id FROM job_technicians WHERE technician_id = ?)"
        );

        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(&sql)
            .bind(value)
            .bind(now_timestamp())
            .bind(technician_id)
            .bind(job_id)
            .bind(technician_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if changed == 0 {
            return Ok(false);
        }
        let sequence =
            enqueue_on(&mut tx, EntityType::Job, job_id, update.action(), &update.payload()).await?;
        tx.commit().await?;
        debug!(job_id, sequence, action = %update.action(), "queued job change");
        Ok(true)
    }

    pub async fn absences_for_technician(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<Vec<AbsenceRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT id, server_id, technician_id, start_datetime, end_datetime, type \
             FROM absences WHERE technician_id = ?",
        );
        let lower = window.lower_bound();
        let upper = window.upper_bound();
        if lower.is_some() {
            sql.push_str(" AND end_datetime >= ?");
        }
        if upper.is_some() {
            sql.push_str(" AND start_datetime <= ?");
        }
        sql.push_str(" ORDER BY start_datetime ASC, id ASC");

        let mut query = sqlx::query(&sql).bind(technician_id);
        for bound in [lower, upper].into_iter().flatten() {
            query = query.bind(bound);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(absence_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn absence(
        &self,
        technician_id: i64,
        absence_id: i64,
    ) -> Result<Option<AbsenceRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, server_id, technician_id, start_datetime, end_datetime, type \
             FROM absences WHERE id = ? AND technician_id = ?",
        )
        .bind(absence_id)
        .bind(technician_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(absence_from_row).transpose()?)
    }

    /// Creates a local absence (no remote id yet) and queues its creation.
    pub async fn create_absence(
        &self,
        technician_id: i64,
        input: &AbsenceInput,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        ensure_technician(&mut tx, technician_id).await?;
        let id = sqlx::query(
            "INSERT INTO absences (technician_id, start_datetime, end_datetime, type, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(technician_id)
        .bind(&input.start_datetime)
        .bind(&input.end_datetime)
        .bind(input.kind_or_empty())
        .bind(now_timestamp())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();
        enqueue_on(
            &mut tx,
            EntityType::Absence,
            id,
            MutationAction::Create,
            &absence_payload(input),
        )
        .await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn update_absence(
        &self,
        technician_id: i64,
        absence_id: i64,
        input: &AbsenceInput,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE absences SET start_datetime = ?, end_datetime = ?, type = ?, updated_at = ? \
             WHERE id = ? AND technician_id = ?",
        )
        .bind(&input.start_datetime)
        .bind(&input.end_datetime)
        .bind(input.kind_or_empty())
        .bind(now_timestamp())
        .bind(absence_id)
        .bind(technician_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed == 0 {
            return Ok(false);
        }
        enqueue_on(
            &mut tx,
            EntityType::Absence,
            absence_id,
            MutationAction::Update,
            &absence_payload(input),
        )
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Deletes a local absence and drops its queued create/update rows. A
    /// synced absence also queues a remote delete keyed by its remote id.
    pub async fn delete_absence(
        &self,
        technician_id: i64,
        absence_id: i64,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let server_id: Option<Option<i64>> =
            sqlx::query_scalar("SELECT server_id FROM absences WHERE id = ? AND technician_id = ?")
                .bind(absence_id)
                .bind(technician_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(server_id) = server_id else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM absences WHERE id = ? AND technician_id = ?")
            .bind(absence_id)
            .bind(technician_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "DELETE FROM pending_changes WHERE entity_type = 'absence' AND entity_id = ? \
             AND action IN ('create', 'update')",
        )
        .bind(absence_id)
        .execute(&mut *tx)
        .await?;

        if let Some(remote_id) = server_id {
            enqueue_on(
                &mut tx,
                EntityType::Absence,
                remote_id,
                MutationAction::Delete,
                &JsonValue::Object(Default::default()),
            )
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        entity_id: i64,
        action: MutationAction,
        payload: &JsonValue,
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        enqueue_on(&mut conn, entity_type, entity_id, action, payload).await
    }

    /// Queue contents in replay order.
    pub async fn pending_mutations(&self) -> Result<Vec<PendingMutation>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, entity_type, entity_id, action, payload, created_at \
             FROM pending_changes ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mutation_from_row).collect()
    }

    pub async fn remove_mutation(&self, sequence: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_changes WHERE id = ?")
            .bind(sequence)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remote id of a cached job or absence: `None` once the local row is
    /// gone, `Some(None)` while it has never been synced.
    pub async fn remote_link(
        &self,
        entity_type: EntityType,
        local_id: i64,
    ) -> Result<Option<Option<i64>>, StoreError> {
        let sql = match entity_type {
            EntityType::Job => "SELECT server_id FROM jobs WHERE id = ?",
            EntityType::Absence => "SELECT server_id FROM absences WHERE id = ?",
        };
        let link: Option<Option<i64>> = sqlx::query_scalar(sql)
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(link)
    }

    /// Links a local absence to its remote row. Returns `false` when the
    /// local row was deleted in the meantime.
    pub async fn set_absence_server_id(
        &self,
        absence_id: i64,
        server_id: i64,
    ) -> Result<bool, StoreError> {
        let changed = sqlx::query("UPDATE absences SET server_id = ?, synced_at = ? WHERE id = ?")
            .bind(server_id)
            .bind(now_timestamp())
            .bind(absence_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(changed > 0)
    }
}

fn job_select() -> String {
    format!(
        "SELECT {JOB_COLUMNS}, j.server_id, j.synced_at, j.updated_at \
         FROM jobs j \
         INNER JOIN job_technicians jt ON jt.job_id = j.id AND jt.technician_id = ? \
         INNER JOIN customers c ON c.id = j.customer_id \
         LEFT JOIN job_addresses ja ON ja.job_id = j.id"
    )
}

fn absence_payload(input: &AbsenceInput) -> JsonValue {
    serde_json::to_value(input).unwrap_or_else(|_| JsonValue::Object(Default::default()))
}

async fn enqueue_on(
    conn: &mut SqliteConnection,
    entity_type: EntityType,
    entity_id: i64,
    action: MutationAction,
    payload: &JsonValue,
) -> Result<i64, StoreError> {
    let sequence = sqlx::query(
        "INSERT INTO pending_changes (entity_type, entity_id, action, payload, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(entity_type.as_str())
    .bind(entity_id)
    .bind(action.as_str())
    .bind(payload.to_string())
    .bind(now_timestamp())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(sequence)
}

fn mutation_from_row(row: &SqliteRow) -> Result<PendingMutation, StoreError> {
    let sequence: i64 = row.try_get("id")?;
    let corrupt = |reason: String| StoreError::CorruptMutation { sequence, reason };

    let entity_type: String = row.try_get("entity_type")?;
    let action: String = row.try_get("action")?;
    let payload: String = row.try_get("payload")?;
    Ok(PendingMutation {
        sequence,
        entity_type: EntityType::parse(&entity_type)
            .ok_or_else(|| corrupt(format!("unknown entity type {entity_type:?}")))?,
        entity_id: row.try_get("entity_id")?,
        action: MutationAction::parse(&action)
            .ok_or_else(|| corrupt(format!("unknown action {action:?}")))?,
        payload: serde_json::from_str(&payload).map_err(|err| corrupt(err.to_string()))?,
        created_at: row.try_get("created_at")?,
    })
}

/// Creates the placeholder technician row a pull or an offline absence needs.
pub async fn ensure_technician(
    conn: &mut SqliteConnection,
    technician_id: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR IGNORE INTO users (id, username, full_name, role, active) VALUES (?, ?, 'Monteur', 'monteur', 1)",
    )
    .bind(technician_id)
    .bind(format!("tech_{technician_id}"))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Resolves the customer by name, creating it from the job snapshot.
pub async fn ensure_customer(
    conn: &mut SqliteConnection,
    job: &JobRecord,
) -> Result<i64, StoreError> {
    let name = job
        .customer_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(UNKNOWN_CUSTOMER);

    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM customers WHERE name = ? ORDER BY id LIMIT 1")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    if let Some(id) = existing {
        return Ok(id);
    }

    let id = sqlx::query(
        "INSERT INTO customers (name, street, house_number, zip, city, phone, contact_person, contact_phone) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(name)
    .bind(&job.street)
    .bind(&job.house_number)
    .bind(&job.zip)
    .bind(&job.city)
    .bind(&job.customer_phone)
    .bind(&job.contact_person)
    .bind(&job.contact_phone)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Merges one remote job by its remote id. Fields with queued local edits keep
/// their local value until the edit has been pushed.
pub async fn upsert_job(
    conn: &mut SqliteConnection,
    job: &JobRecord,
    customer_id: i64,
    technician_id: i64,
) -> Result<MergeOutcome, StoreError> {
    let status = LocalStatus::from_remote(job.status.as_deref());
    let start = job.start_datetime.as_deref().map(normalize_remote_datetime);
    let end = job.end_datetime.as_deref().map(normalize_remote_datetime);
    let job_type = job
        .job_type
        .as_deref()
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_JOB_TYPE);
    let synced_at = now_timestamp();

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM jobs WHERE server_id = ?")
        .bind(job.id)
        .fetch_optional(&mut *conn)
        .await?;

    let outcome = match existing {
        Some(local_id) => {
            sqlx::query(
                "UPDATE jobs SET job_number = ?, customer_id = ?, job_type = ?, \
                   start_datetime = ?, end_datetime = ?, \
                   status = CASE WHEN EXISTS (SELECT 1 FROM pending_changes p WHERE p.entity_type = 'job' \
                       AND p.entity_id = jobs.id AND p.action = 'status') THEN status ELSE ? END, \
                   description = CASE WHEN EXISTS (SELECT 1 FROM pending_changes p WHERE p.entity_type = 'job' \
                       AND p.entity_id = jobs.id AND p.action = 'description') THEN description ELSE ? END, \
                   fabrikationsnummern = CASE WHEN EXISTS (SELECT 1 FROM pending_changes p WHERE p.entity_type = 'job' \
                       AND p.entity_id = jobs.id AND p.action = 'fabrikationsnummern') THEN fabrikationsnummern ELSE ? END, \
                   priority = ?, required_technicians = ?, eap_nummer = ?, bestellnummer = ?, synced_at = ? \
                 WHERE id = ?",
            )
            .bind(&job.job_number)
            .bind(customer_id)
            .bind(job_type)
            .bind(&start)
            .bind(&end)
            .bind(status.as_str())
            .bind(&job.description)
            .bind(&job.fabrikationsnummern)
            .bind(&job.priority)
            .bind(job.required_technicians)
            .bind(&job.eap_nummer)
            .bind(&job.bestellnummer)
            .bind(&synced_at)
            .bind(local_id)
            .execute(&mut *conn)
            .await?;
            MergeOutcome::Updated(local_id)
        }
        None => {
            let local_id = sqlx::query(
                "INSERT INTO jobs (server_id, job_number, customer_id, job_type, start_datetime, end_datetime, \
                   status, priority, required_technicians, description, fabrikationsnummern, eap_nummer, \
                   bestellnummer, synced_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(job.id)
            .bind(&job.job_number)
            .bind(customer_id)
            .bind(job_type)
            .bind(&start)
            .bind(&end)
            .bind(status.as_str())
            .bind(&job.priority)
            .bind(job.required_technicians)
            .bind(&job.description)
            .bind(&job.fabrikationsnummern)
            .bind(&job.eap_nummer)
            .bind(&job.bestellnummer)
            .bind(&synced_at)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
            sqlx::query(
                "INSERT OR IGNORE INTO job_technicians (job_id, technician_id) VALUES (?, ?)",
            )
                .bind(local_id)
                .bind(technician_id)
                .execute(&mut *conn)
                .await?;
            MergeOutcome::Inserted(local_id)
        }
    };

    if job.street.is_some() {
        if let Some(local_id) = outcome.local_id() {
            upsert_job_address(conn, local_id, job).await?;
        }
    }
    Ok(outcome)
}

pub async fn upsert_job_address(
    conn: &mut SqliteConnection,
    job_id: i64,
    job: &JobRecord,
) -> Result<(), StoreError> {
    let country = job
        .country
        .as_deref()
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_COUNTRY);
    sqlx::query(
        "INSERT INTO job_addresses (job_id, street, house_number, zip, city, country, address_extra_1, address_extra_2) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT (job_id) DO UPDATE SET street = excluded.street, house_number = excluded.house_number, \
           zip = excluded.zip, city = excluded.city, country = excluded.country, \
           address_extra_1 = excluded.address_extra_1, address_extra_2 = excluded.address_extra_2",
    )
    .bind(job_id)
    .bind(&job.street)
    .bind(&job.house_number)
    .bind(&job.zip)
    .bind(&job.city)
    .bind(country)
    .bind(&job.address_extra_1)
    .bind(&job.address_extra_2)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Merges one remote absence by its remote id, attributed to the technician.
pub async fn upsert_absence(
    conn: &mut SqliteConnection,
    absence: &AbsenceRecord,
    technician_id: i64,
) -> Result<MergeOutcome, StoreError> {
    let deleted_locally: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM pending_changes WHERE entity_type = 'absence' AND action = 'delete' AND entity_id = ? LIMIT 1",
    )
    .bind(absence.id)
    .fetch_optional(&mut *conn)
    .await?;
    if deleted_locally.is_some() {
        return Ok(MergeOutcome::Suppressed);
    }

    let start = normalize_remote_datetime(&absence.start_datetime);
    let end = normalize_remote_datetime(&absence.end_datetime);
    let synced_at = now_timestamp();

    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM absences WHERE server_id = ?")
        .bind(absence.id)
        .fetch_optional(&mut *conn)
        .await?;

    match existing {
        Some(local_id) => {
            let changed = sqlx::query(
                "UPDATE absences SET start_datetime = ?, end_datetime = ?, type = ?, synced_at = ? \
                 WHERE id = ? AND NOT EXISTS (SELECT 1 FROM pending_changes p \
                   WHERE p.entity_type = 'absence' AND p.action <> 'delete' AND p.entity_id = absences.id)",
            )
            .bind(&start)
            .bind(&end)
            .bind(&absence.kind)
            .bind(&synced_at)
            .bind(local_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
            Ok(if changed == 0 {
                MergeOutcome::Kept(local_id)
            } else {
                MergeOutcome::Updated(local_id)
            })
        }
        None => {
            let local_id = sqlx::query(
                "INSERT INTO absences (server_id, technician_id, start_datetime, end_datetime, type, synced_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(absence.id)
            .bind(technician_id)
            .bind(&start)
            .bind(&end)
            .bind(&absence.kind)
            .bind(&synced_at)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
            Ok(MergeOutcome::Inserted(local_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn remote_job(id: i64, customer: &str, start: &str) -> JobRecord {
        JobRecord {
            id,
            job_number: Some(format!("A-{id}")),
            customer_name: Some(customer.to_string()),
            start_datetime: Some(start.to_string()),
            end_datetime: Some(start.to_string()),
            status: Some("geplant".to_string()),
            ..Default::default()
        }
    }

    async fn merge_jobs(
        store: &LocalStore,
        technician_id: i64,
        jobs: &[JobRecord],
    ) -> Vec<MergeOutcome> {
        let mut tx = store.begin().await.unwrap();
        ensure_technician(&mut tx, technician_id).await.unwrap();
        let mut out = Vec::new();
        for job in jobs {
            let customer_id = ensure_customer(&mut tx, job).await.unwrap();
            out.push(upsert_job(&mut tx, job, customer_id, technician_id).await.unwrap());
        }
        tx.commit().await.unwrap();
        out
    }

    #[tokio::test]
    async fn file_backed_store_persists_after_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("monteur.db");
        {
            let store = LocalStore::open(&path).await.unwrap();
            merge_jobs(&store, 5, &[remote_job(100, "ACME", "2024-05-06 08:00:00")]).await;
            store.persist().await.unwrap();
            store.pool().close().await;
        }
        let reopened = LocalStore::open(&path).await.unwrap();
        let jobs = reopened
            .jobs_for_technician(5, &DateWindow::default())
            .await
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].server_id, Some(100));
    }

    #[tokio::test]
    async fn merge_inserts_then_updates_in_place() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut job = remote_job(100, "ACME", "2024-05-06T08:00:00.000Z");
        job.street = Some("Hafenstr.".into());
        job.status = Some("cancelled".into());

        let first = merge_jobs(&store, 5, &[job.clone()]).await;
        let MergeOutcome::Inserted(local_id) = first[0] else {
            panic!("expected insert, got {first:?}");
        };

        job.description = Some("neu".into());
        let second = merge_jobs(&store, 5, &[job]).await;
        assert_eq!(second[0], MergeOutcome::Updated(local_id));

        let cached = store.job_for_technician(5, local_id).await.unwrap().unwrap();
        assert_eq!(cached.start_datetime.as_deref(), Some("2024-05-06 08:00:00"));
        assert_eq!(cached.status.as_deref(), Some("geplant"));
        assert_eq!(cached.job_type.as_deref(), Some("Service"));
        assert_eq!(cached.country.as_deref(), Some("DE"));
        assert_eq!(cached.description.as_deref(), Some("neu"));

        let tech = store.technician(5).await.unwrap().unwrap();
        assert_eq!(tech.username.as_deref(), Some("tech_5"));
        assert_eq!(tech.full_name.as_deref(), Some("Monteur"));
    }

    #[tokio::test]
    async fn customers_resolve_by_name_with_unknown_fallback() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut nameless = remote_job(2, "", "2024-05-06 10:00:00");
        nameless.customer_name = None;
        merge_jobs(
            &store,
            5,
            &[remote_job(1, "ACME", "2024-05-06 08:00:00"), nameless, remote_job(3, "ACME", "2024-05-07 08:00:00")],
        )
        .await;

        let jobs = store.jobs_for_technician(5, &DateWindow::default()).await.unwrap();
        assert_eq!(jobs[0].customer_id, jobs[2].customer_id);
        assert_eq!(jobs[1].customer_name.as_deref(), Some("Unbekannt"));
    }

    #[tokio::test]
    async fn job_edits_queue_mutations_and_survive_a_pull() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let outcomes = merge_jobs(&store, 5, &[remote_job(100, "ACME", "2024-05-06 08:00:00")]).await;
        let local_id = outcomes[0].local_id().unwrap();

        assert!(store
            .update_job(5, local_id, &JobUpdate::Status(LocalStatus::Erledigt))
            .await
            .unwrap());
        assert!(!store
            .update_job(6, local_id, &JobUpdate::Description("fremd".into()))
            .await
            .unwrap());

        let mut remote = remote_job(100, "ACME", "2024-05-06 09:00:00");
        remote.status = Some("in_arbeit".into());
        remote.description = Some("vom Server".into());
        merge_jobs(&store, 5, &[remote]).await;

        let cached = store.job_for_technician(5, local_id).await.unwrap().unwrap();
        assert_eq!(cached.status.as_deref(), Some("erledigt"));
        assert_eq!(cached.description.as_deref(), Some("vom Server"));
        assert_eq!(cached.start_datetime.as_deref(), Some("2024-05-06 09:00:00"));

        let pending = store.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_type, EntityType::Job);
        assert_eq!(pending[0].action, MutationAction::Status);
        assert_eq!(pending[0].payload, json!({"status": "erledigt"}));
    }

    #[tokio::test]
    async fn job_window_filters_on_start_datetime() {
        let store = LocalStore::open_in_memory().await.unwrap();
        merge_jobs(
            &store,
            5,
            &[
                remote_job(1, "ACME", "2024-04-30 23:59:59"),
                remote_job(2, "ACME", "2024-05-01 00:00:00"),
                remote_job(3, "ACME", "2024-05-31 23:59:59"),
                remote_job(4, "ACME", "2024-06-01 00:00:00"),
            ],
        )
        .await;
        let window = DateWindow::new(NaiveDate::from_ymd_opt(2024, 5, 1), NaiveDate::from_ymd_opt(2024, 5, 31));
        let ids: Vec<_> = store
            .jobs_for_technician(5, &window)
            .await
            .unwrap()
            .into_iter()
            .filter_map(|j| j.server_id)
            .collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn absence_lifecycle_queues_create_update_delete() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let input = AbsenceInput::new("2024-05-01", "2024-05-03", Some("urlaub"));
        let id = store.create_absence(9, &input).await.unwrap();
        let updated = AbsenceInput::new("2024-05-02", "2024-05-03", None);
        assert!(store.update_absence(9, id, &updated).await.unwrap());
        assert!(!store.update_absence(8, id, &updated).await.unwrap());

        let actions: Vec<_> = store
            .pending_mutations()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.action)
            .collect();
        assert_eq!(actions, vec![MutationAction::Create, MutationAction::Update]);

        // never synced: the remote never saw it, so nothing is left to replay
        assert!(store.delete_absence(9, id).await.unwrap());
        assert!(store.pending_mutations().await.unwrap().is_empty());
        assert!(store.absence(9, id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deleting_a_synced_absence_queues_remote_delete_and_blocks_reinsert() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = AbsenceRecord {
            id: 77,
            technician_id: 9,
            start_datetime: "2024-05-01T00:00:00".into(),
            end_datetime: "2024-05-02T00:00:00".into(),
            kind: "vacation".into(),
            ..Default::default()
        };
        let mut tx = store.begin().await.unwrap();
        ensure_technician(&mut tx, 9).await.unwrap();
        let local_id = upsert_absence(&mut tx, &remote, 9).await.unwrap().local_id().unwrap();
        tx.commit().await.unwrap();

        assert!(store.delete_absence(9, local_id).await.unwrap());
        let pending = store.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, 77);
        assert_eq!(pending[0].action, MutationAction::Delete);

        let mut tx = store.begin().await.unwrap();
        assert_eq!(upsert_absence(&mut tx, &remote, 9).await.unwrap(), MergeOutcome::Suppressed);
        tx.commit().await.unwrap();
        assert!(store
            .absences_for_technician(9, &DateWindow::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn deleting_an_edited_synced_absence_leaves_only_the_remote_delete() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = AbsenceRecord {
            id: 77,
            technician_id: 9,
            start_datetime: "2024-05-01 00:00:00".into(),
            end_datetime: "2024-05-02 00:00:00".into(),
            kind: "vacation".into(),
            ..Default::default()
        };
        let mut tx = store.begin().await.unwrap();
        ensure_technician(&mut tx, 9).await.unwrap();
        let local_id = upsert_absence(&mut tx, &remote, 9).await.unwrap().local_id().unwrap();
        tx.commit().await.unwrap();
        assert_eq!(
            store.remote_link(EntityType::Absence, local_id).await.unwrap(),
            Some(Some(77))
        );

        let edit = AbsenceInput::new("2024-05-01", "2024-05-04", None);
        assert!(store.update_absence(9, local_id, &edit).await.unwrap());
        assert!(store.delete_absence(9, local_id).await.unwrap());

        let pending = store.pending_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].entity_id, 77);
        assert_eq!(pending[0].action, MutationAction::Delete);
        assert_eq!(store.remote_link(EntityType::Absence, local_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn pending_absence_edits_are_kept_on_pull() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let remote = AbsenceRecord {
            id: 12,
            technician_id: 9,
            start_datetime: "2024-05-01 00:00:00".into(),
            end_datetime: "2024-05-02 00:00:00".into(),
            kind: "vacation".into(),
            ..Default::default()
        };
        let mut tx = store.begin().await.unwrap();
        ensure_technician(&mut tx, 9).await.unwrap();
        let local_id = upsert_absence(&mut tx, &remote, 9).await.unwrap().local_id().unwrap();
        tx.commit().await.unwrap();

        let edit = AbsenceInput::new("2024-05-01", "2024-05-05", Some("vacation"));
        store.update_absence(9, local_id, &edit).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(upsert_absence(&mut tx, &remote, 9).await.unwrap(), MergeOutcome::Kept(local_id));
        tx.commit().await.unwrap();
        let cached = store.absence(9, local_id).await.unwrap().unwrap();
        assert_eq!(cached.end_datetime, "2024-05-05 00:00:00");
    }

    #[tokio::test]
    async fn sequence_ids_increase_after_removal() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let first = store
            .enqueue(EntityType::Job, 1, MutationAction::Status, &json!({"status": "erledigt"}))
            .await
            .unwrap();
        store.remove_mutation(first).await.unwrap();
        let second = store
            .enqueue(EntityType::Job, 1, MutationAction::Description, &json!({"description": "x"}))
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn technician_display_keeps_missing_fields() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let mut conn = store.pool().acquire().await.unwrap();
        ensure_technician(&mut conn, 3).await.unwrap();
        drop(conn);

        store.update_technician_display(3, Some("Eva Berg"), None).await.unwrap();
        let tech = store.technician(3).await.unwrap().unwrap();
        assert_eq!(tech.full_name.as_deref(), Some("Eva Berg"));
        assert_eq!(tech.username.as_deref(), Some("tech_3"));
    }
}
