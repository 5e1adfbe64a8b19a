//! Inbound payload adapter: validates third-party dispatch payloads and
//! canonicalizes their bilingual field names into typed import records.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use dispo_core::{AbsenceType, JobStatus, Priority};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dispo-adapters";

type Keys = &'static [&'static str];
type Paths = &'static [&'static [&'static str]];

pub const SOURCE_SYSTEM_KEYS: Keys = &["sourceSystem", "source_system", "source"];
pub const CORRELATION_ID_KEYS: Keys =
    &["correlationId", "correlation_id", "requestId", "messageId"];

pub const JOB_COLLECTION_PATHS: Paths = &[
    &["jobs"],
    &["orders"],
    &["auftraege"],
    &["data", "jobs"],
    &["data", "orders"],
    &["data", "auftraege"],
];
pub const ABSENCE_COLLECTION_PATHS: Paths = &[
    &["absences"],
    &["vacations"],
    &["abwesenheiten"],
    &["data", "absences"],
    &["data", "vacations"],
    &["data", "abwesenheiten"],
];
pub const ASSIGNMENT_COLLECTION_PATHS: Paths = &[
    &["assignments"],
    &["jobAssignments"],
    &["zuweisungen"],
    &["data", "assignments"],
    &["data", "jobAssignments"],
    &["data", "zuweisungen"],
];

const TECHNICIAN_CODE_KEYS: Keys =
    &["technicianCode", "technician_code", "monteurCode", "monteur_id"];

const JOB_ID_KEYS: Keys = &["jobId", "job_id", "id", "auftragId", "auftrag_id", "externalId"];
const CUSTOMER_NAME_KEYS: Keys = &["customerName", "customer_name", "kunde", "kundenname"];
const ADDRESS_KEYS: Keys = &["address", "adresse"];
const STREET_KEYS: Keys = &["street", "strasse"];
const POSTAL_CODE_KEYS: Keys = &["postalCode", "plz", "zip"];
const CITY_KEYS: Keys = &["city", "ort"];
const SCHEDULE_KEYS: Keys = &["schedule", "termin"];
const SCHEDULE_DATE_KEYS: Keys = &["date", "datum", "scheduledDate", "scheduled_date"];
const SCHEDULE_FROM_KEYS: Keys = &["from", "von", "start", "startTime"];
const SCHEDULE_TO_KEYS: Keys = &["to", "bis", "end", "endTime"];
const PRIORITY_KEYS: Keys = &["priority", "prio", "prioritaet"];
const STATUS_KEYS: Keys = &["status", "state"];

const ABSENCE_ID_KEYS: Keys = &["absenceId", "absence_id", "id", "externalId"];
const DATE_FROM_KEYS: Keys = &["dateFrom", "from", "von", "startDate", "start_date"];
const DATE_TO_KEYS: Keys = &["dateTo", "to", "bis", "endDate", "end_date"];
const ABSENCE_TYPE_KEYS: Keys = &["type", "absenceType", "grund"];
const NOTE_KEYS: Keys = &["note", "bemerkung", "reason"];

const ASSIGNMENT_ID_KEYS: Keys = &["assignmentId", "assignment_id", "id", "externalId"];
const ASSIGNMENT_JOB_ID_KEYS: Keys = &["jobId", "job_id", "auftragId", "auftrag_id"];
const ROLE_KEYS: Keys = &["role", "rolle"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("payload must be a JSON object")]
    NotAnObjectPayload,
    #[error("{location}: one of the fields [{}] is required", .candidates.join(", "))]
    MissingField { location: String, candidates: Keys },
    #[error("{location}: field \"{key}\" must be a string")]
    NotAString { location: String, key: String },
    #[error("{location}: field \"{key}\" must be an object")]
    NotAnObject { location: String, key: String },
    #[error("{collection}[{index}] must be an object")]
    ElementNotObject { collection: &'static str, index: usize },
    #[error("no processable data found; expected at least jobs, absences or assignments")]
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedJob {
    pub job_id: String,
    pub customer_name: String,
    pub address_street: Option<String>,
    pub address_postal_code: Option<String>,
    pub address_city: Option<String>,
    pub scheduled_date: Option<String>,
    pub scheduled_from: Option<String>,
    pub scheduled_to: Option<String>,
    pub priority: Priority,
    pub status: JobStatus,
    pub technician_code: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedAbsence {
    pub absence_id: String,
    pub technician_code: String,
    pub date_from: String,
    pub date_to: String,
    pub absence_type: AbsenceType,
    pub note: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedAssignment {
    pub assignment_id: String,
    pub job_id: String,
    pub technician_code: String,
    pub role: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedPayload {
    pub source_system: String,
    pub correlation_id: String,
    /// True when the sender supplied no correlation id and one was generated.
    pub correlation_generated: bool,
    pub jobs: Vec<NormalizedJob>,
    pub absences: Vec<NormalizedAbsence>,
    pub assignments: Vec<NormalizedAssignment>,
}

impl NormalizedPayload {
    pub fn record_count(&self) -> usize {
        self.jobs.len() + self.absences.len() + self.assignments.len()
    }
}

/// Stateless normalizer for batch import payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadNormalizer;

impl PayloadNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn normalize(&self, payload: &JsonValue) -> Result<NormalizedPayload, NormalizeError> {
        let root = payload.as_object().ok_or(NormalizeError::NotAnObjectPayload)?;
        let top = Record::new("payload".to_string(), root);

        let source_system = top.required_string(SOURCE_SYSTEM_KEYS)?;
        let (correlation_id, correlation_generated) =
            match top.optional_string(CORRELATION_ID_KEYS)? {
                Some(id) => (id, false),
                None => (generate_correlation_id(), true),
            };

        let jobs = extract_collection(root, JOB_COLLECTION_PATHS);
        let absences = extract_collection(root, ABSENCE_COLLECTION_PATHS);
        let assignments = extract_collection(root, ASSIGNMENT_COLLECTION_PATHS);
        if jobs.is_empty() && absences.is_empty() && assignments.is_empty() {
            return Err(NormalizeError::Empty);
        }

        Ok(NormalizedPayload {
            source_system,
            correlation_id,
            correlation_generated,
            jobs: each_object("jobs", jobs, normalize_job)?,
            absences: each_object("absences", absences, normalize_absence)?,
            assignments: each_object("assignments", assignments, normalize_assignment)?,
        })
    }
}

fn normalize_job(record: Record<'_>, raw: &JsonValue) -> Result<NormalizedJob, NormalizeError> {
    let address = record.optional_object(ADDRESS_KEYS, "address")?;
    let schedule = record.optional_object(SCHEDULE_KEYS, "schedule")?;

    let (address_street, address_postal_code, address_city) = match &address {
        Some(addr) => (
            addr.optional_string(STREET_KEYS)?,
            addr.optional_string(POSTAL_CODE_KEYS)?,
            addr.optional_string(CITY_KEYS)?,
        ),
        None => (None, None, None),
    };
    let (scheduled_date, scheduled_from, scheduled_to) = match &schedule {
        Some(sched) => (
            sched.optional_string(SCHEDULE_DATE_KEYS)?,
            sched.optional_string(SCHEDULE_FROM_KEYS)?,
            sched.optional_string(SCHEDULE_TO_KEYS)?,
        ),
        None => (None, None, None),
    };

    let priority = record
        .optional_string(PRIORITY_KEYS)?
        .map(|p| Priority::from_free_text(&p))
        .unwrap_or_default();
    let status = record
        .optional_string(STATUS_KEYS)?
        .map(|s| JobStatus::from_free_text(&s))
        .unwrap_or_default();

    Ok(NormalizedJob {
        job_id: record.required_string(JOB_ID_KEYS)?,
        customer_name: record.required_string(CUSTOMER_NAME_KEYS)?,
        address_street,
        address_postal_code,
        address_city,
        scheduled_date,
        scheduled_from,
        scheduled_to,
        priority,
        status,
        technician_code: record.optional_string(TECHNICIAN_CODE_KEYS)?,
        raw_json: raw.to_string(),
    })
}

fn normalize_absence(
    record: Record<'_>,
    raw: &JsonValue,
) -> Result<NormalizedAbsence, NormalizeError> {
    let technician_code = record.required_string(TECHNICIAN_CODE_KEYS)?;
    let date_from = record.required_string(DATE_FROM_KEYS)?;
    let date_to = record.required_string(DATE_TO_KEYS)?;
    let absence_type = record
        .optional_string(ABSENCE_TYPE_KEYS)?
        .map(|t| AbsenceType::from_free_text(&t))
        .unwrap_or_default();
    let absence_id = match record.optional_string(ABSENCE_ID_KEYS)? {
        Some(id) => id,
        None => deterministic_id(&[&technician_code, &date_from, &date_to, absence_type.as_str()]),
    };

    Ok(NormalizedAbsence {
        absence_id,
        technician_code,
        date_from,
        date_to,
        absence_type,
        note: record.optional_string(NOTE_KEYS)?,
        raw_json: raw.to_string(),
    })
}

fn normalize_assignment(
    record: Record<'_>,
    raw: &JsonValue,
) -> Result<NormalizedAssignment, NormalizeError> {
    let job_id = record.required_string(ASSIGNMENT_JOB_ID_KEYS)?;
    let technician_code = record.required_string(TECHNICIAN_CODE_KEYS)?;
    let assignment_id = match record.optional_string(ASSIGNMENT_ID_KEYS)? {
        Some(id) => id,
        None => deterministic_id(&[&job_id, &technician_code]),
    };

    Ok(NormalizedAssignment {
        assignment_id,
        job_id,
        technician_code,
        role: record.optional_string(ROLE_KEYS)?,
        raw_json: raw.to_string(),
    })
}

/// A JSON object plus the path used in validation messages.
struct Record<'a> {
    location: String,
    fields: &'a Map<String, JsonValue>,
}

impl<'a> Record<'a> {
    fn new(location: String, fields: &'a Map<String, JsonValue>) -> Self {
        Self { location, fields }
    }

    /// First non-blank string among `keys`, trimmed. Null and blank values
    /// count as absent; any other non-string value is rejected.
    fn optional_string(&self, keys: Keys) -> Result<Option<String>, NormalizeError> {
        for key in keys {
            match self.fields.get(*key) {
                None | Some(JsonValue::Null) => continue,
                Some(JsonValue::String(value)) => {
                    let trimmed = value.trim();
                    if !trimmed.is_empty() {
                        return Ok(Some(trimmed.to_string()));
                    }
                }
                Some(_) => {
                    return Err(NormalizeError::NotAString {
                        location: self.location.clone(),
                        key: (*key).to_string(),
                    })
                }
            }
        }
        Ok(None)
    }

    fn required_string(&self, keys: Keys) -> Result<String, NormalizeError> {
        self.optional_string(keys)?
            .ok_or_else(|| NormalizeError::MissingField {
                location: self.location.clone(),
                candidates: keys,
            })
    }

    fn optional_object(
        &self,
        keys: Keys,
        label: &str,
    ) -> Result<Option<Record<'a>>, NormalizeError> {
        for key in keys {
            match self.fields.get(*key) {
                None | Some(JsonValue::Null) => continue,
                Some(JsonValue::Object(map)) => {
                    return Ok(Some(Record::new(format!("{}.{label}", self.location), map)))
                }
                Some(_) => {
                    return Err(NormalizeError::NotAnObject {
                        location: self.location.clone(),
                        key: (*key).to_string(),
                    })
                }
            }
        }
        Ok(None)
    }
}

fn extract_collection<'a>(root: &'a Map<String, JsonValue>, paths: Paths) -> &'a [JsonValue] {
    for path in paths {
        let Some((first, rest)) = path.split_first() else {
            continue;
        };
        let mut current = root.get(*first);
        for segment in rest {
            current = current.and_then(|value| value.get(*segment));
        }
        if let Some(JsonValue::Array(items)) = current {
            return items;
        }
    }
    &[]
}

fn each_object<T>(
    collection: &'static str,
    items: &[JsonValue],
    normalize: impl Fn(Record<'_>, &JsonValue) -> Result<T, NormalizeError>,
) -> Result<Vec<T>, NormalizeError> {
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let fields = item
                .as_object()
                .ok_or(NormalizeError::ElementNotObject { collection, index })?;
            normalize(Record::new(format!("{collection}[{index}]"), fields), item)
        })
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable id for records the sender did not identify: the hash of the
/// `|`-joined natural key parts.
pub fn deterministic_id(parts: &[&str]) -> String {
    sha256_hex(parts.join("|").as_bytes())
}

/// Hash of the raw payload as stored in the batch ledger.
pub fn payload_hash(payload: &JsonValue) -> String {
    sha256_hex(payload.to_string().as_bytes())
}

/// Random 16-hex-character token. Generated ids are never deduplicated.
pub fn generate_correlation_id() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(16);
    token
}

/// Reads a batch payload from disk.
pub fn load_payload_file(path: impl AsRef<Path>) -> Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
