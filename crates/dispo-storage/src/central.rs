//! Central dispatch database. PostgreSQL in production, SQLite for tests and
//! single-box installs, both through the `Any` driver.

use dispo_core::{
    now_timestamp, AbsenceInput, AbsenceRecord, DateWindow, EquipmentMasterRecord, JobRecord,
    JobUpdate, Technician,
};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tracing::info;

use crate::{absence_from_row, equipment_from_row, job_from_row, StoreError, JOB_COLUMNS};

#[derive(Debug, Clone)]
pub struct CentralDb {
    pool: AnyPool,
    sqlite: bool,
}

impl CentralDb {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        sqlx::any::install_default_drivers();
        let sqlite = database_url.starts_with("sqlite:");
        if !sqlite && !database_url.starts_with("postgres") {
            return Err(StoreError::UnsupportedUrl(redact(database_url)));
        }

        let options = if sqlite {
            // an in-memory database lives and dies with its one connection
            AnyPoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            AnyPoolOptions::new().max_connections(10)
        };
        let pool = options.connect(database_url).await?;
        Ok(Self { pool, sqlite })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        if self.sqlite {
            sqlx::migrate!("./migrations/central-sqlite").run(&self.pool).await?;
        } else {
            sqlx::migrate!("./migrations/central-postgres").run(&self.pool).await?;
        }
        info!(sqlite = self.sqlite, "central migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn is_sqlite(&self) -> bool {
        self.sqlite
    }

    pub fn repository(&self) -> DispoRepository {
        DispoRepository::new(self.pool.clone())
    }
}

fn redact(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => format!("***@{host}"),
        None => url.to_string(),
    }
}

/// Technician-scoped reads and writes against the dispatch tables.
#[derive(Debug, Clone)]
pub struct DispoRepository {
    pool: AnyPool,
}

impl DispoRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    /// Active user with the `monteur` role.
    pub async fn is_technician(&self, technician_id: i64) -> Result<bool, StoreError> {
        let found: Option<i64> =
            sqlx::query_scalar(
                "SELECT id FROM users WHERE id = $1 AND role = 'monteur' AND active = 1",
            )
            .bind(technician_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn technician(&self, technician_id: i64) -> Result<Option<Technician>, StoreError> {
        let row = sqlx::query("SELECT id, username, full_name FROM users WHERE id = $1")
            .bind(technician_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Technician {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            full_name: row.try_get("full_name")?,
        }))
    }

    pub async fn jobs_for_technician(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let mut sql = job_select();
        let lower = window.lower_bound();
        let upper = window.upper_bound();
        let mut next = 2;
        sql.push_str(" WHERE 1 = 1");
        if lower.is_some() {
            sql.push_str(&format!(" AND j.start_datetime >= ${next}"));
            next += 1;
        }
        if upper.is_some() {
            sql.push_str(&format!(" AND j.start_datetime <= ${next}"));
        }
        sql.push_str(" ORDER BY j.start_datetime ASC, j.id ASC");

        let mut query = sqlx::query(&sql).bind(technician_id);
        for bound in [lower, upper].into_iter().flatten() {
            query = query.bind(bound);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(job_from_row).collect::<Result<_, _>>()?)
    }

    /// `None` for a missing job and for a job not assigned to the technician.
    pub async fn job_for_technician(
        &self,
        job_id: i64,
        technician_id: i64,
    ) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!("{} WHERE j.id = $2", job_select());
        let row = sqlx::query(&sql)
            .bind(technician_id)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(job_from_row).transpose()?)
    }

    pub async fn update_job(
        &self,
        job_id: i64,
        technician_id: i64,
        update: &JobUpdate,
    ) -> Result<bool, StoreError> {
        let (column, value) = match update {
            JobUpdate::Status(status) => ("status", Some(status.as_str().to_string())),
            JobUpdate::Description(text) => ("description", Some(text.clone())),
            JobUpdate::EquipmentLines(lines) => ("fabrikationsnummern", lines.clone()),
        };
        let sql = format!(
            "UPDATE jobs SET {column} = $1, updated_at = $2, updated_by = $3 \
             WHERE id = $4 AND EXISTS (SELECT 1 FROM job_technicians jt \
               WHERE jt.job_id = jobs.id AND jt.technician_id = $3)"
        );
        let changed = sqlx::query(&sql)
            .bind(value)
            .bind(now_timestamp())
            .bind(technician_id)
            .bind(job_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(changed > 0)
    }

    /// Absences overlapping the window.
    pub async fn absences_for_technician(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<Vec<AbsenceRecord>, StoreError> {
        let mut sql = String::from(
            "SELECT id, CAST(NULL AS BIGINT) AS server_id, technician_id, start_datetime, end_datetime, type \
             FROM absences WHERE technician_id = $1",
        );
        let lower = window.lower_bound();
        let upper = window.upper_bound();
        let mut next = 2;
        if lower.is_some() {
            sql.push_str(&format!(" AND end_datetime >= ${next}"));
            next += 1;
        }
        if upper.is_some() {
            sql.push_str(&format!(" AND start_datetime <= ${next}"));
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
        absence_id: i64,
        technician_id: i64,
    ) -> Result<Option<AbsenceRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT id, CAST(NULL AS BIGINT) AS server_id, technician_id, start_datetime, end_datetime, type \
             FROM absences WHERE id = $1 AND technician_id = $2",
        )
        .bind(absence_id)
        .bind(technician_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(absence_from_row).transpose()?)
    }

    pub async fn create_absence(
        &self,
        technician_id: i64,
        input: &AbsenceInput,
    ) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO absences (technician_id, start_datetime, end_datetime, type, created_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(technician_id)
        .bind(&input.start_datetime)
        .bind(&input.end_datetime)
        .bind(input.kind_or_empty())
        .bind(now_timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn update_absence(
        &self,
        absence_id: i64,
        technician_id: i64,
        input: &AbsenceInput,
    ) -> Result<bool, StoreError> {
        let changed = sqlx::query(
            "UPDATE absences SET start_datetime = $1, end_datetime = $2, type = $3 \
             WHERE id = $4 AND technician_id = $5",
        )
        .bind(&input.start_datetime)
        .bind(&input.end_datetime)
        .bind(input.kind_or_empty())
        .bind(absence_id)
        .bind(technician_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed > 0)
    }

    pub async fn delete_absence(
        &self,
        absence_id: i64,
        technician_id: i64,
    ) -> Result<bool, StoreError> {
        let changed = sqlx::query("DELETE FROM absences WHERE id = $1 AND technician_id = $2")
            .bind(absence_id)
            .bind(technician_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(changed > 0)
    }

    /// Master records for the given serial numbers; unknown serials are absent
    /// from the result.
    pub async fn equipment_by_serials(
        &self,
        serials: &[String],
    ) -> Result<Vec<EquipmentMasterRecord>, StoreError> {
        if serials.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=serials.len())
            .map(|n| format!("${n}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT fabrikationsnummer, type, leistung, nenngeschwindigkeit, kraftaufnehmer, dms_nr, \
               tacho, elektronik, material, position \
             FROM equipment_master WHERE fabrikationsnummer IN ({placeholders}) ORDER BY fabrikationsnummer"
        );
        let mut query = sqlx::query(&sql);
        for serial in serials {
            query = query.bind(serial.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(equipment_from_row).collect::<Result<_, _>>()?)
    }
}

fn job_select() -> String {
    format!(
        "SELECT {JOB_COLUMNS}, CAST(NULL AS BIGINT) AS server_id, CAST(NULL AS TEXT) AS synced_at, j.updated_at \
         FROM jobs j \
         INNER JOIN job_technicians jt ON jt.job_id = j.id AND jt.technician_id = $1 \
         INNER JOIN customers c ON c.id = j.customer_id \
         LEFT JOIN job_addresses ja ON ja.job_id = j.id"
    )
}
