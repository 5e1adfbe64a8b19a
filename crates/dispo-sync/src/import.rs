//! Idempotent batch import into the central ledger tables.

use dispo_adapters::{
    payload_hash, NormalizeError, NormalizedAbsence, NormalizedAssignment, NormalizedJob,
    NormalizedPayload, PayloadNormalizer,
};
use dispo_core::{now_timestamp, BatchStatus};
use dispo_storage::CentralDb;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::any::AnyRow;
use sqlx::{AnyConnection, AnyPool, Row};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

const ERROR_MESSAGE_LIMIT: usize = 2000;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error("import failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub batch_id: i64,
    pub processed_jobs: i64,
    pub processed_absences: i64,
    pub processed_assignments: i64,
    pub idempotent: bool,
}

/// One row of the import ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportBatch {
    pub id: i64,
    pub source_system: String,
    pub correlation_id: String,
    pub payload_hash: String,
    pub processing_status: BatchStatus,
    pub processed_jobs: i64,
    pub processed_absences: i64,
    pub processed_assignments: i64,
    pub error_message: Option<String>,
    pub received_at: String,
    pub updated_at: String,
}

impl ImportBatch {
    fn outcome(&self, idempotent: bool) -> ImportOutcome {
        ImportOutcome {
            batch_id: self.id,
            processed_jobs: self.processed_jobs,
            processed_absences: self.processed_absences,
            processed_assignments: self.processed_assignments,
            idempotent,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportService {
    pool: AnyPool,
    normalizer: PayloadNormalizer,
}

impl ImportService {
    pub fn new(db: &CentralDb) -> Self {
        Self {
            pool: db.pool().clone(),
            normalizer: PayloadNormalizer::new(),
        }
    }

    /// Normalizes and imports a raw inbound payload.
    pub async fn import_value(&self, payload: &JsonValue) -> Result<ImportOutcome, ImportError> {
        let normalized = self.normalizer.normalize(payload)?;
        self.import(&normalized, payload).await
    }

    pub async fn import(
        &self,
        payload: &NormalizedPayload,
        raw: &JsonValue,
    ) -> Result<ImportOutcome, ImportError> {
        let span = info_span!(
            "dispo_import",
            source_system = %payload.source_system,
            correlation_id = %payload.correlation_id
        );
        self.import_inner(payload, raw).instrument(span).await
    }

    async fn import_inner(
        &self,
        payload: &NormalizedPayload,
        raw: &JsonValue,
    ) -> Result<ImportOutcome, ImportError> {
        let hash = payload_hash(raw);
        let raw_json = raw.to_string();

        let batch_id = match self.claim_batch(payload, &hash, &raw_json).await? {
            Claim::AlreadyProcessed(batch) => {
                info!(batch_id = batch.id, "batch already processed");
                return Ok(batch.outcome(true));
            }
            Claim::Ready(id) => id,
        };

        let mut tx = self.pool.begin().await?;
        match apply_records(&mut tx, batch_id, payload).await {
            Ok(outcome) => match tx.commit().await {
                Ok(()) => {
                    info!(
                        batch_id,
                        jobs = outcome.processed_jobs,
                        absences = outcome.processed_absences,
                        assignments = outcome.processed_assignments,
                        "batch processed"
                    );
                    Ok(outcome)
                }
                Err(err) => {
                    self.record_failure(batch_id, &err.to_string()).await;
                    Err(err.into())
                }
            },
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(batch_id, error = %rollback_err, "rollback failed");
                }
                self.record_failure(batch_id, &err.to_string()).await;
                Err(err.into())
            }
        }
    }

    /// Finds or creates the ledger row for this (source, correlation id).
    async fn claim_batch(
        &self,
        payload: &NormalizedPayload,
        hash: &str,
        raw_json: &str,
    ) -> Result<Claim, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let existing =
            find_batch(&mut conn, &payload.source_system, &payload.correlation_id).await?;
        let existing = match existing {
            Some(batch) => batch,
            None => {
                let now = now_timestamp();
                let inserted: Option<i64> = sqlx::query_scalar(
                    "INSERT INTO dispo_import_batches \
                       (source_system, correlation_id, payload_hash, payload_json, processing_status, received_at, updated_at) \
                     VALUES ($1, $2, $3, $4, 'pending', $5, $5) \
                     ON CONFLICT (source_system, correlation_id) DO NOTHING RETURNING id",
                )
                .bind(&payload.source_system)
                .bind(&payload.correlation_id)
                .bind(hash)
                .bind(raw_json)
                .bind(&now)
                .fetch_optional(&mut *conn)
                .await?;
                if let Some(id) = inserted {
                    return Ok(Claim::Ready(id));
                }
                // lost the insert race; the winner's row decides
                find_batch(&mut conn, &payload.source_system, &payload.correlation_id)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)?
            }
        };

        if existing.processing_status == BatchStatus::Processed {
            return Ok(Claim::AlreadyProcessed(existing));
        }

        sqlx::query(
            "UPDATE dispo_import_batches SET processing_status = 'pending', payload_hash = $1, payload_json = $2, \
               processed_jobs = 0, processed_absences = 0, processed_assignments = 0, error_message = NULL, \
               updated_at = $3 \
             WHERE id = $4",
        )
        .bind(hash)
        .bind(raw_json)
        .bind(now_timestamp())
        .bind(existing.id)
        .execute(&mut *conn)
        .await?;
        info!(
            batch_id = existing.id,
            previous = existing.processing_status.as_str(),
            "reprocessing batch"
        );
        Ok(Claim::Ready(existing.id))
    }

    async fn record_failure(&self, batch_id: i64, message: &str) {
        let truncated: String = message.chars().take(ERROR_MESSAGE_LIMIT).collect();
        warn!(batch_id, error = %truncated, "batch import failed");
        let result = sqlx::query(
            "UPDATE dispo_import_batches SET processing_status = 'failed', processed_jobs = 0, \
               processed_absences = 0, processed_assignments = 0, error_message = $1, updated_at = $2 \
             WHERE id = $3",
        )
        .bind(&truncated)
        .bind(now_timestamp())
        .bind(batch_id)
        .execute(&self.pool)
        .await;
        if let Err(err) = result {
            warn!(batch_id, error = %err, "could not record batch failure");
        }
    }

    pub async fn batch(
        &self,
        source_system: &str,
        correlation_id: &str,
    ) -> Result<Option<ImportBatch>, ImportError> {
        let mut conn = self.pool.acquire().await?;
        Ok(find_batch(&mut conn, source_system, correlation_id).await?)
    }
}

enum Claim {
    AlreadyProcessed(ImportBatch),
    Ready(i64),
}

async fn find_batch(
    conn: &mut AnyConnection,
    source_system: &str,
    correlation_id: &str,
) -> Result<Option<ImportBatch>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, source_system, correlation_id, payload_hash, processing_status, processed_jobs, \
           processed_absences, processed_assignments, error_message, received_at, updated_at \
         FROM dispo_import_batches WHERE source_system = $1 AND correlation_id = $2",
    )
    .bind(source_system)
    .bind(correlation_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(batch_from_row).transpose()
}

fn batch_from_row(row: &AnyRow) -> Result<ImportBatch, sqlx::Error> {
    let status: String = row.try_get("processing_status")?;
    Ok(ImportBatch {
        id: row.try_get("id")?,
        source_system: row.try_get("source_system")?,
        correlation_id: row.try_get("correlation_id")?,
        payload_hash: row.try_get("payload_hash")?,
        processing_status: BatchStatus::parse(&status).unwrap_or_default(),
        processed_jobs: row.try_get("processed_jobs")?,
        processed_absences: row.try_get("processed_absences")?,
        processed_assignments: row.try_get("processed_assignments")?,
        error_message: row.try_get("error_message")?,
        received_at: row.try_get("received_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Upserts every record and marks the batch processed, all on the caller's
/// transaction.
async fn apply_records(
    conn: &mut AnyConnection,
    batch_id: i64,
    payload: &NormalizedPayload,
) -> Result<ImportOutcome, sqlx::Error> {
    let now = now_timestamp();
    for job in &payload.jobs {
        upsert_job(conn, job, &now).await?;
    }
    for absence in &payload.absences {
        upsert_absence(conn, absence, &now).await?;
    }
    for assignment in &payload.assignments {
        upsert_assignment(conn, assignment, &now).await?;
    }

    let outcome = ImportOutcome {
        batch_id,
        processed_jobs: count(payload.jobs.len()),
        processed_absences: count(payload.absences.len()),
        processed_assignments: count(payload.assignments.len()),
        idempotent: false,
    };
    sqlx::query(
        "UPDATE dispo_import_batches SET processing_status = 'processed', processed_jobs = $1, \
           processed_absences = $2, processed_assignments = $3, error_message = NULL, updated_at = $4 \
         WHERE id = $5",
    )
    .bind(outcome.processed_jobs)
    .bind(outcome.processed_absences)
    .bind(outcome.processed_assignments)
    .bind(&now)
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(outcome)
}

fn count(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}

async fn upsert_job(
    conn: &mut AnyConnection,
    job: &NormalizedJob,
    now: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO dispo_jobs (external_job_id, customer_name, address_street, address_postal_code, address_city, \
           scheduled_date, scheduled_time_from, scheduled_time_to, priority, status, technician_code, raw_job_json, \
           created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13) \
         ON CONFLICT (external_job_id) DO UPDATE SET customer_name = excluded.customer_name, \
           address_street = excluded.address_street, address_postal_code = excluded.address_postal_code, \
           address_city = excluded.address_city, scheduled_date = excluded.scheduled_date, \
           scheduled_time_from = excluded.scheduled_time_from, scheduled_time_to = excluded.scheduled_time_to, \
           priority = excluded.priority, status = excluded.status, technician_code = excluded.technician_code, \
           raw_job_json = excluded.raw_job_json, updated_at = excluded.updated_at",
    )
    .bind(&job.job_id)
    .bind(&job.customer_name)
    .bind(&job.address_street)
    .bind(&job.address_postal_code)
    .bind(&job.address_city)
    .bind(&job.scheduled_date)
    .bind(&job.scheduled_from)
    .bind(&job.scheduled_to)
    .bind(job.priority.as_str())
    .bind(job.status.as_str())
    .bind(&job.technician_code)
    .bind(&job.raw_json)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_absence(
    conn: &mut AnyConnection,
    absence: &NormalizedAbsence,
    now: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO dispo_absences (external_absence_id, technician_code, date_from, date_to, type, note, \
           raw_absence_json, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) \
         ON CONFLICT (external_absence_id) DO UPDATE SET technician_code = excluded.technician_code, \
           date_from = excluded.date_from, date_to = excluded.date_to, type = excluded.type, \
           note = excluded.note, raw_absence_json = excluded.raw_absence_json, updated_at = excluded.updated_at",
    )
    .bind(&absence.absence_id)
    .bind(&absence.technician_code)
    .bind(&absence.date_from)
    .bind(&absence.date_to)
    .bind(absence.absence_type.as_str())
    .bind(&absence.note)
    .bind(&absence.raw_json)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_assignment(
    conn: &mut AnyConnection,
    assignment: &NormalizedAssignment,
    now: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO dispo_job_assignments (external_assignment_id, external_job_id, technician_code, role, \
           raw_assignment_json, created_at, updated_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $6) \
         ON CONFLICT (external_assignment_id) DO UPDATE SET external_job_id = excluded.external_job_id, \
           technician_code = excluded.technician_code, role = excluded.role, \
           raw_assignment_json = excluded.raw_assignment_json, updated_at = excluded.updated_at",
    )
    .bind(&assignment.assignment_id)
    .bind(&assignment.job_id)
    .bind(&assignment.technician_code)
    .bind(&assignment.role)
    .bind(&assignment.raw_json)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}
