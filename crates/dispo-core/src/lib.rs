//! Core domain model, vocabularies and equipment enrichment for Dispo sync.

use std::collections::HashMap;
use std::fmt;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "dispo-core";

/// Storage format for every timestamp column, local and central.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Job status in the central (import) vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Planned,
    InProgress,
    Done,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }

    /// Total mapping from the bilingual free-text vocabulary of source systems.
    /// Anything unrecognized is `Planned`.
    pub fn from_free_text(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "planned" | "geplant" => Self::Planned,
            "in_progress" | "in arbeit" | "in_arbeit" | "running" => Self::InProgress,
            "done" | "erledigt" | "completed" => Self::Done,
            "cancelled" | "storniert" | "abgesagt" => Self::Cancelled,
            _ => Self::Planned,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job status as stored in the technician-facing tables (local cache and the
/// dispatch tables the technician API serves).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalStatus {
    #[default]
    Geplant,
    InArbeit,
    Erledigt,
}

impl LocalStatus {
    pub const ALL: [LocalStatus; 3] = [Self::Geplant, Self::InArbeit, Self::Erledigt];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Geplant => "geplant",
            Self::InArbeit => "in_arbeit",
            Self::Erledigt => "erledigt",
        }
    }

    /// Exact token match; no trimming, no case folding.
    pub fn parse(input: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == input)
    }

    /// Remote statuses outside the local enum fall back to `Geplant`.
    pub fn from_remote(input: Option<&str>) -> Self {
        input.and_then(Self::parse).unwrap_or_default()
    }

    pub fn from_central(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Planned => Some(Self::Geplant),
            JobStatus::InProgress => Some(Self::InArbeit),
            JobStatus::Done => Some(Self::Erledigt),
            JobStatus::Cancelled => None,
        }
    }
}

impl From<LocalStatus> for JobStatus {
    fn from(status: LocalStatus) -> Self {
        match status {
            LocalStatus::Geplant => JobStatus::Planned,
            LocalStatus::InArbeit => JobStatus::InProgress,
            LocalStatus::Erledigt => JobStatus::Done,
        }
    }
}

impl fmt::Display for LocalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    /// Unrecognized priorities are `Normal`.
    pub fn from_free_text(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "low" | "niedrig" => Self::Low,
            "high" | "hoch" | "urgent" | "dringend" => Self::High,
            _ => Self::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsenceType {
    #[default]
    Vacation,
    Sick,
    Other,
}

impl AbsenceType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vacation => "vacation",
            Self::Sick => "sick",
            Self::Other => "other",
        }
    }

    /// Unrecognized absence types are `Other`.
    pub fn from_free_text(input: &str) -> Self {
        match input.trim().to_lowercase().as_str() {
            "urlaub" | "vacation" | "holiday" => Self::Vacation,
            "krank" | "sick" | "sickness" => Self::Sick,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Pending,
    Processed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "pending" => Some(Self::Pending),
            "processed" => Some(Self::Processed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Job,
    Absence,
}

impl EntityType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Job => "job",
            Self::Absence => "absence",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "job" => Some(Self::Job),
            "absence" => Some(Self::Absence),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationAction {
    Status,
    Description,
    Fabrikationsnummern,
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Description => "description",
            Self::Fabrikationsnummern => "fabrikationsnummern",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input {
            "status" => Some(Self::Status),
            "description" => Some(Self::Description),
            "fabrikationsnummern" => Some(Self::Fabrikationsnummern),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A locally queued change awaiting replay against the remote system.
///
/// `sequence` is strictly increasing in enqueue order. `entity_id` is the
/// local row id, except for absence deletes where it is the remote id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMutation {
    pub sequence: i64,
    pub entity_type: EntityType,
    pub entity_id: i64,
    pub action: MutationAction,
    pub payload: JsonValue,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobUpdateError {
    #[error("invalid status {0:?}; allowed: geplant, in_arbeit, erledigt")]
    InvalidStatus(String),
    #[error("one of status, description or fabrikationsnummern is required")]
    Missing,
    #[error("action {0} does not update a job")]
    NotAJobAction(MutationAction),
}

/// One technician-editable concern of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobUpdate {
    Status(LocalStatus),
    Description(String),
    /// Serialized equipment line items, `None` clears the field.
    EquipmentLines(Option<String>),
}

impl JobUpdate {
    pub fn action(&self) -> MutationAction {
        match self {
            Self::Status(_) => MutationAction::Status,
            Self::Description(_) => MutationAction::Description,
            Self::EquipmentLines(_) => MutationAction::Fabrikationsnummern,
        }
    }

    /// Payload snapshot stored with the queued mutation and merged into the
    /// remote request body.
    pub fn payload(&self) -> JsonValue {
        match self {
            Self::Status(status) => json!({ "status": status.as_str() }),
            Self::Description(text) => json!({ "description": text }),
            Self::EquipmentLines(lines) => json!({ "fabrikationsnummern": lines }),
        }
    }

    /// Reads a partial job update body. Status wins over description, which
    /// wins over equipment lines, when several are present.
    pub fn from_request(body: &JsonValue) -> Result<Self, JobUpdateError> {
        if let Some(JsonValue::String(status)) = body.get("status") {
            let trimmed = status.trim();
            return LocalStatus::parse(trimmed)
                .map(Self::Status)
                .ok_or_else(|| JobUpdateError::InvalidStatus(trimmed.to_string()));
        }
        if let Some(description) = body.get("description") {
            let text = description.as_str().unwrap_or_default().to_string();
            return Ok(Self::Description(text));
        }
        if let Some(lines) = body.get("fabrikationsnummern") {
            let value = match lines {
                JsonValue::Null => None,
                JsonValue::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            };
            return Ok(Self::EquipmentLines(value));
        }
        Err(JobUpdateError::Missing)
    }

    pub fn from_mutation(
        action: MutationAction,
        payload: &JsonValue,
    ) -> Result<Self, JobUpdateError> {
        let key = match action {
            MutationAction::Status => "status",
            MutationAction::Description => "description",
            MutationAction::Fabrikationsnummern => "fabrikationsnummern",
            other => return Err(JobUpdateError::NotAJobAction(other)),
        };
        let value = payload.get(key).cloned().unwrap_or(JsonValue::Null);
        Self::from_request(&json!({ key: value }))
    }
}

/// Absence create/update body; also the payload snapshot of queued absence
/// mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbsenceInput {
    pub start_datetime: String,
    pub end_datetime: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

impl AbsenceInput {
    pub fn new(start: &str, end: &str, kind: Option<&str>) -> Self {
        Self {
            start_datetime: normalize_input_datetime(start),
            end_datetime: normalize_input_datetime(end),
            kind: kind.map(ToString::to_string),
        }
    }

    /// Accepts `start_datetime|start|date_from` and `end_datetime|end|date_to`.
    /// Returns `None` when either bound is missing.
    pub fn from_request(body: &JsonValue) -> Option<Self> {
        let start = first_non_empty_str(body, &["start_datetime", "start", "date_from"])?;
        let end = first_non_empty_str(body, &["end_datetime", "end", "date_to"])?;
        let kind = body
            .get("type")
            .and_then(JsonValue::as_str)
            .filter(|t| !t.is_empty());
        Some(Self::new(start, end, kind))
    }

    pub fn kind_or_empty(&self) -> &str {
        self.kind.as_deref().unwrap_or_default()
    }
}

fn first_non_empty_str<'a>(body: &'a JsonValue, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| body.get(*key).and_then(JsonValue::as_str))
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// Date-only input gains a midnight time; everything else is kept as given.
pub fn normalize_input_datetime(raw: &str) -> String {
    let trimmed = raw.trim();
    if NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").is_ok() {
        format!("{trimmed} 00:00:00")
    } else {
        trimmed.to_string()
    }
}

/// Remote timestamps may be ISO-8601; the cache stores `YYYY-MM-DD HH:MM:SS`.
pub fn normalize_remote_datetime(raw: &str) -> String {
    raw.replace('T', " ").chars().take(19).collect()
}

/// Inclusive day window used to scope job and absence listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl DateWindow {
    pub fn new(date_from: Option<NaiveDate>, date_to: Option<NaiveDate>) -> Self {
        Self { date_from, date_to }
    }

    pub fn around(today: NaiveDate, days_back: u32, days_ahead: u32) -> Self {
        Self {
            date_from: today.checked_sub_days(chrono::Days::new(u64::from(days_back))),
            date_to: today.checked_add_days(chrono::Days::new(u64::from(days_ahead))),
        }
    }

    pub fn lower_bound(&self) -> Option<String> {
        self.date_from
            .map(|d| format!("{} 00:00:00", d.format("%Y-%m-%d")))
    }

    pub fn upper_bound(&self) -> Option<String> {
        self.date_to.map(|d| format!("{} 23:59:59", d.format("%Y-%m-%d")))
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(from) = self.date_from {
            pairs.push(("date_from", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = self.date_to {
            pairs.push(("date_to", to.format("%Y-%m-%d").to_string()));
        }
        pairs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Technician {
    pub id: i64,
    pub username: Option<String>,
    pub full_name: Option<String>,
}

/// A job joined with its customer and job-specific address, as served by the
/// technician API and as mirrored in the local cache. `server_id` is only set
/// on cached rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRecord {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    pub job_number: Option<String>,
    pub customer_id: Option<i64>,
    pub job_type: Option<String>,
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub required_technicians: Option<i64>,
    pub description: Option<String>,
    #[serde(alias = "Fabrikationsnummern")]
    pub fabrikationsnummern: Option<String>,
    pub eap_nummer: Option<String>,
    pub bestellnummer: Option<String>,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub contact_person: Option<String>,
    pub contact_phone: Option<String>,
    pub street: Option<String>,
    pub house_number: Option<String>,
    pub zip: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub address_extra_1: Option<String>,
    pub address_extra_2: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbsenceRecord {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    pub technician_id: i64,
    pub start_datetime: String,
    pub end_datetime: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Body of the technician job list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteJobList {
    pub ok: bool,
    pub technician_id: Option<i64>,
    pub technician_full_name: Option<String>,
    pub technician_username: Option<String>,
    pub jobs: Vec<JobRecord>,
}

/// Body of the technician absence list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteAbsenceList {
    pub ok: bool,
    pub technician_id: Option<i64>,
    pub absences: Vec<AbsenceRecord>,
}

/// Technical attributes shared by job line items and the equipment master.
/// Wire keys follow the dispatch system's German column names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentAttributes {
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub equipment_type: Option<String>,
    #[serde(
        rename = "leistung",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub rated_output: Option<String>,
    #[serde(
        rename = "nenngeschwindigkeit",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub rated_speed: Option<String>,
    #[serde(
        rename = "kraftaufnehmer",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub load_cell: Option<String>,
    #[serde(
        rename = "dms_nr",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub strain_gauge_id: Option<String>,
    #[serde(
        rename = "tacho",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub tachometer: Option<String>,
    #[serde(
        rename = "elektronik",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub electronics: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub material: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub position: Option<String>,
}

impl EquipmentAttributes {
    fn fields_mut(&mut self) -> [&mut Option<String>; 9] {
        [
            &mut self.equipment_type,
            &mut self.rated_output,
            &mut self.rated_speed,
            &mut self.load_cell,
            &mut self.strain_gauge_id,
            &mut self.tachometer,
            &mut self.electronics,
            &mut self.material,
            &mut self.position,
        ]
    }

    fn fields(&self) -> [&Option<String>; 9] {
        [
            &self.equipment_type,
            &self.rated_output,
            &self.rated_speed,
            &self.load_cell,
            &self.strain_gauge_id,
            &self.tachometer,
            &self.electronics,
            &self.material,
            &self.position,
        ]
    }

    pub fn has_detail(&self) -> bool {
        self.fields().into_iter().any(|f| !is_blank(f))
    }

    /// Copies master values into blank fields only; populated fields win.
    pub fn fill_blanks_from(&mut self, master: &EquipmentAttributes) {
        for (mine, theirs) in self.fields_mut().into_iter().zip(master.fields()) {
            if is_blank(mine) && !is_blank(theirs) {
                *mine = theirs.clone();
            }
        }
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |v| v.trim().is_empty())
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<JsonValue>::deserialize(deserializer)? {
        Some(JsonValue::String(s)) => Some(s),
        Some(JsonValue::Number(n)) => Some(n.to_string()),
        Some(JsonValue::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// One equipment line item of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentLine {
    #[serde(
        rename = "fabrikationsnummer",
        alias = "Fabrikationsnummer",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub serial_number: Option<String>,
    #[serde(flatten)]
    pub attributes: EquipmentAttributes,
}

impl EquipmentLine {
    pub fn serial_only(serial: &str) -> Self {
        Self {
            serial_number: Some(serial.to_string()),
            attributes: EquipmentAttributes::default(),
        }
    }
}

/// Equipment master record, keyed by serial/fabrication number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentMasterRecord {
    #[serde(rename = "fabrikationsnummer")]
    pub serial_number: String,
    #[serde(flatten)]
    pub attributes: EquipmentAttributes,
}

/// Parses the `fabrikationsnummern` field: either a JSON array of line
/// records or a free-text list of serials separated by whitespace, `;` or `,`.
pub fn parse_equipment_lines(raw: &str) -> Vec<EquipmentLine> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if let Ok(lines) = serde_json::from_str::<Vec<EquipmentLine>>(trimmed) {
        if !lines.is_empty() {
            return lines;
        }
    }
    trimmed
        .split(|c: char| c.is_whitespace() || c == ';' || c == ',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(EquipmentLine::serial_only)
        .collect()
}

pub fn encode_equipment_lines(lines: &[EquipmentLine]) -> String {
    serde_json::to_string(lines).unwrap_or_else(|_| "[]".to_string())
}

/// Distinct trimmed serial numbers in line order.
pub fn serial_numbers(lines: &[EquipmentLine]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for serial in lines
        .iter()
        .filter_map(|line| line.serial_number.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        if !out.iter().any(|known| known == serial) {
            out.push(serial.to_string());
        }
    }
    out
}

/// Fills blank technical fields of each line from the master record with the
/// same serial number. Job-specific values are never overwritten.
pub fn enrich_equipment_lines(
    lines: &[EquipmentLine],
    masters: &[EquipmentMasterRecord],
) -> Vec<EquipmentLine> {
    let by_serial: HashMap<&str, &EquipmentMasterRecord> = masters
        .iter()
        .map(|m| (m.serial_number.trim(), m))
        .collect();

    lines
        .iter()
        .map(|line| {
            let mut enriched = line.clone();
            let master = line
                .serial_number
                .as_deref()
                .map(str::trim)
                .and_then(|serial| by_serial.get(serial));
            if let Some(master) = master {
                enriched.attributes.fill_blanks_from(&master.attributes);
            }
            enriched
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_vocabularies_fall_back_to_planned() {
        assert_eq!(JobStatus::from_free_text("  Erledigt "), JobStatus::Done);
        assert_eq!(JobStatus::from_free_text("In Arbeit"), JobStatus::InProgress);
        assert_eq!(JobStatus::from_free_text("abgesagt"), JobStatus::Cancelled);
        assert_eq!(JobStatus::from_free_text("on hold"), JobStatus::Planned);

        assert_eq!(LocalStatus::from_remote(Some("in_arbeit")), LocalStatus::InArbeit);
        assert_eq!(LocalStatus::from_remote(Some("cancelled")), LocalStatus::Geplant);
        assert_eq!(LocalStatus::from_remote(Some("Erledigt")), LocalStatus::Geplant);
        assert_eq!(LocalStatus::from_remote(None), LocalStatus::Geplant);
    }

    #[test]
    fn local_to_central_mapping_is_total() {
        for status in LocalStatus::ALL {
            let central = JobStatus::from(status);
            assert_eq!(LocalStatus::from_central(central), Some(status));
        }
        assert_eq!(LocalStatus::from_central(JobStatus::Cancelled), None);
    }

    #[test]
    fn priority_and_absence_type_fall_back() {
        assert_eq!(Priority::from_free_text("DRINGEND"), Priority::High);
        assert_eq!(Priority::from_free_text("niedrig"), Priority::Low);
        assert_eq!(Priority::from_free_text("asap-ish"), Priority::Normal);

        assert_eq!(AbsenceType::from_free_text("Urlaub"), AbsenceType::Vacation);
        assert_eq!(AbsenceType::from_free_text("krank"), AbsenceType::Sick);
        assert_eq!(AbsenceType::from_free_text("training"), AbsenceType::Other);
    }

    #[test]
    fn job_update_request_precedence_and_validation() {
        let body = json!({"job_id": 4, "status": "erledigt", "description": "x"});
        let update = JobUpdate::from_request(&body).expect("status update");
        assert_eq!(update, JobUpdate::Status(LocalStatus::Erledigt));
        assert_eq!(update.payload(), json!({"status": "erledigt"}));

        let err = JobUpdate::from_request(&json!({"status": "done"})).unwrap_err();
        assert_eq!(err, JobUpdateError::InvalidStatus("done".into()));

        let lines = JobUpdate::from_request(&json!({"fabrikationsnummern": [{"fabrikationsnummer": "A1"}]}))
            .expect("lines update");
        assert_eq!(
            lines,
            JobUpdate::EquipmentLines(Some(r#"[{"fabrikationsnummer":"A1"}]"#.into()))
        );

        assert_eq!(JobUpdate::from_request(&json!({"job_id": 1})), Err(JobUpdateError::Missing));
    }

    #[test]
    fn job_update_reads_back_from_queued_payload() {
        let update = JobUpdate::Description("Lager getauscht".into());
        let restored = JobUpdate::from_mutation(update.action(), &update.payload()).expect("restore");
        assert_eq!(restored, update);
        assert!(JobUpdate::from_mutation(MutationAction::Create, &json!({})).is_err());
    }

    #[test]
    fn absence_input_accepts_synonyms_and_normalizes_dates() {
        let input = AbsenceInput::from_request(&json!({"date_from": "2024-05-01", "end": "2024-05-03 12:00:00", "type": "vacation"}))
            .expect("input");
        assert_eq!(input.start_datetime, "2024-05-01 00:00:00");
        assert_eq!(input.end_datetime, "2024-05-03 12:00:00");
        assert_eq!(input.kind.as_deref(), Some("vacation"));

        assert!(AbsenceInput::from_request(&json!({"start": "2024-05-01"})).is_none());
    }

    #[test]
    fn remote_datetimes_are_truncated() {
        assert_eq!(
            normalize_remote_datetime("2024-05-01T08:30:00.000Z"),
            "2024-05-01 08:30:00"
        );
        assert_eq!(normalize_remote_datetime(""), "");
    }

    #[test]
    fn date_window_bounds_cover_whole_days() {
        let today = NaiveDate::from_ymd_opt(2024, 5, 10).unwrap();
        let window = DateWindow::around(today, 9, 5);
        assert_eq!(window.lower_bound().as_deref(), Some("2024-05-01 00:00:00"));
        assert_eq!(window.upper_bound().as_deref(), Some("2024-05-15 23:59:59"));
        assert_eq!(
            window.query_pairs(),
            vec![("date_from", "2024-05-01".to_string()), ("date_to", "2024-05-15".to_string())]
        );
    }

    #[test]
    fn equipment_lines_parse_json_or_free_text() {
        let json_lines = parse_equipment_lines(r#"[{"Fabrikationsnummer": 4711, "leistung": 5.5}]"#);
        assert_eq!(json_lines.len(), 1);
        assert_eq!(json_lines[0].serial_number.as_deref(), Some("4711"));
        assert_eq!(json_lines[0].attributes.rated_output.as_deref(), Some("5.5"));

        let text_lines = parse_equipment_lines("A-1; A-2,\nA-3  A-1");
        assert_eq!(serial_numbers(&text_lines), vec!["A-1", "A-2", "A-3"]);
        assert!(parse_equipment_lines("   ").is_empty());
    }

    #[test]
    fn enrichment_fills_blanks_and_keeps_job_specific_values() {
        let lines = vec![
            EquipmentLine {
                serial_number: Some("F-100".into()),
                attributes: EquipmentAttributes {
                    rated_output: Some("7,5 kW".into()),
                    material: Some("  ".into()),
                    ..Default::default()
                },
            },
            EquipmentLine::serial_only("F-200"),
        ];
        let masters = vec![EquipmentMasterRecord {
            serial_number: "F-100".into(),
            attributes: EquipmentAttributes {
                equipment_type: Some("Hubwerk".into()),
                rated_output: Some("5 kW".into()),
                material: Some("Stahl".into()),
                ..Default::default()
            },
        }];

        let enriched = enrich_equipment_lines(&lines, &masters);
        assert_eq!(enriched[0].attributes.rated_output.as_deref(), Some("7,5 kW"));
        assert_eq!(enriched[0].attributes.equipment_type.as_deref(), Some("Hubwerk"));
        assert_eq!(enriched[0].attributes.material.as_deref(), Some("Stahl"));
        assert_eq!(enriched[1], lines[1]);
        assert!(!enriched[1].attributes.has_detail());
    }

    #[test]
    fn job_record_serializes_server_id_only_when_known() {
        let remote = JobRecord {
            id: 12,
            ..Default::default()
        };
        let value = serde_json::to_value(&remote).unwrap();
        assert!(value.get("server_id").is_none());

        let parsed: JobRecord =
            serde_json::from_value(json!({"id": 3, "Fabrikationsnummern": "A-1", "unknown": true})).unwrap();
        assert_eq!(parsed.fabrikationsnummern.as_deref(), Some("A-1"));
    }
}
