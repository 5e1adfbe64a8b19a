//! Local SQLite cache, central database access and the HTTP client for the
//! remote dispatch API.

use std::time::Duration;

use dispo_core::{AbsenceRecord, EquipmentAttributes, EquipmentMasterRecord, JobRecord};
use sqlx::{ColumnIndex, Decode, Row, Type};
use thiserror::Error;

pub mod central;
pub mod local;
pub mod remote;

pub use central::{CentralDb, DispoRepository};
pub use local::{LocalStore, MergeOutcome};
pub use remote::{
    DispoRemote, HttpConnector, HttpDispoRemote, RemoteConnector, RemoteCredentials, RemoteError,
    RemoteTarget,
};

pub const CRATE_NAME: &str = "dispo-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("pending mutation #{sequence} is unreadable: {reason}")]
    CorruptMutation { sequence: i64, reason: String },
    #[error("unsupported database url: {0}")]
    UnsupportedUrl(String),
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Job listing columns shared by the local cache and the central tables.
/// Both selects alias to the names read by [`job_from_row`].
pub(crate) const JOB_COLUMNS: &str = "j.id, j.job_number, j.customer_id, j.job_type, j.start_datetime, \
     j.end_datetime, j.status, j.priority, j.required_technicians, j.description, \
     j.fabrikationsnummern, j.eap_nummer, j.bestellnummer, \
     c.name AS customer_name, c.phone AS customer_phone, c.contact_person, c.contact_phone, \
     ja.street, ja.house_number, ja.zip, ja.city, ja.country, ja.address_extra_1, ja.address_extra_2";

pub(crate) fn job_from_row<'r, R>(row: &'r R) -> Result<JobRecord, sqlx::Error>
where
    R: Row,
    for<'c> &'c str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    Ok(JobRecord {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        job_number: row.try_get("job_number")?,
        customer_id: row.try_get("customer_id")?,
        job_type: row.try_get("job_type")?,
        start_datetime: row.try_get("start_datetime")?,
        end_datetime: row.try_get("end_datetime")?,
        status: row.try_get("status")?,
        priority: row.try_get("priority")?,
        required_technicians: row.try_get("required_technicians")?,
        description: row.try_get("description")?,
        fabrikationsnummern: row.try_get("fabrikationsnummern")?,
        eap_nummer: row.try_get("eap_nummer")?,
        bestellnummer: row.try_get("bestellnummer")?,
        customer_name: row.try_get("customer_name")?,
        customer_phone: row.try_get("customer_phone")?,
        contact_person: row.try_get("contact_person")?,
        contact_phone: row.try_get("contact_phone")?,
        street: row.try_get("street")?,
        house_number: row.try_get("house_number")?,
        zip: row.try_get("zip")?,
        city: row.try_get("city")?,
        country: row.try_get("country")?,
        address_extra_1: row.try_get("address_extra_1")?,
        address_extra_2: row.try_get("address_extra_2")?,
        synced_at: row.try_get("synced_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub(crate) fn absence_from_row<'r, R>(row: &'r R) -> Result<AbsenceRecord, sqlx::Error>
where
    R: Row,
    for<'c> &'c str: ColumnIndex<R>,
    i64: Decode<'r, R::Database> + Type<R::Database>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    Ok(AbsenceRecord {
        id: row.try_get("id")?,
        server_id: row.try_get("server_id")?,
        technician_id: row.try_get("technician_id")?,
        start_datetime: row.try_get("start_datetime")?,
        end_datetime: row.try_get("end_datetime")?,
        kind: row.try_get("type")?,
    })
}

pub(crate) fn equipment_from_row<'r, R>(row: &'r R) -> Result<EquipmentMasterRecord, sqlx::Error>
where
    R: Row,
    for<'c> &'c str: ColumnIndex<R>,
    String: Decode<'r, R::Database> + Type<R::Database>,
{
    Ok(EquipmentMasterRecord {
        serial_number: row.try_get("fabrikationsnummer")?,
        attributes: EquipmentAttributes {
            equipment_type: row.try_get("type")?,
            rated_output: row.try_get("leistung")?,
            rated_speed: row.try_get("nenngeschwindigkeit")?,
            load_cell: row.try_get("kraftaufnehmer")?,
            strain_gauge_id: row.try_get("dms_nr")?,
            tachometer: row.try_get("tacho")?,
            electronics: row.try_get("elektronik")?,
            material: row.try_get("material")?,
            position: row.try_get("position")?,
        },
    })
}
