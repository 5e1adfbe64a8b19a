//! Axum apps for the central dispatch API and the technician's local API.

use std::collections::HashMap;
use std::fmt::Display;

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use dispo_core::{AbsenceInput, DateWindow, JobUpdate};
use dispo_storage::remote::TECHNICIAN_HEADER;
use serde_json::{json, Value as JsonValue};
use tracing::error;

pub mod central;
pub mod local;

pub use central::{central_app, serve_central, CentralState};
pub use local::{local_app, serve_local, LocalState};

pub const CRATE_NAME: &str = "dispo-web";

pub(crate) type Params = HashMap<String, String>;

pub(crate) fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "ok": false, "error": message.into() }))).into_response()
}

pub(crate) fn server_error(err: impl Display) -> Response {
    error!(error = %err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// `technician_id` query parameter first, then the `X-Technician-Id` header.
/// Non-positive or non-numeric values count as missing.
pub(crate) fn technician_id(params: &Params, headers: &HeaderMap) -> Option<i64> {
    let from_query = params.get("technician_id").map(String::as_str);
    let from_header = headers.get(TECHNICIAN_HEADER).and_then(|v| v.to_str().ok());
    from_query
        .into_iter()
        .chain(from_header)
        .find_map(parse_id)
}

pub(crate) fn parse_id(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Reads an id that may arrive as a JSON number or a numeric string.
pub(crate) fn body_id(body: &JsonValue, key: &str) -> Option<i64> {
    match body.get(key)? {
        JsonValue::Number(n) => n.as_i64().filter(|id| *id > 0),
        JsonValue::String(s) => parse_id(s),
        _ => None,
    }
}

/// An empty body reads as an empty object; anything else must be a JSON
/// object.
pub(crate) fn json_object(body: &Bytes) -> Result<JsonValue, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(value) if value.is_object() => Ok(value),
        Ok(_) => Err(json_error(StatusCode::BAD_REQUEST, "request body must be a JSON object")),
        Err(err) => Err(json_error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {err}"))),
    }
}

/// `date_from`/`date_to` as `YYYY-MM-DD`; absent or blank bounds are open.
pub(crate) fn window_from_params(params: &Params) -> Result<DateWindow, Response> {
    let bound = |key: &str| -> Result<Option<NaiveDate>, Response> {
        match params.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map(Some)
                .map_err(|_| {
                    json_error(StatusCode::BAD_REQUEST, format!("{key} must be YYYY-MM-DD"))
                }),
        }
    };
    Ok(DateWindow::new(bound("date_from")?, bound("date_to")?))
}

pub(crate) fn job_update_from_body(body: &JsonValue) -> Result<(i64, JobUpdate), Response> {
    let job_id = body_id(body, "job_id")
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "job_id is required"))?;
    let update = JobUpdate::from_request(body)
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok((job_id, update))
}

pub(crate) fn absence_input(body: &JsonValue) -> Result<AbsenceInput, Response> {
    AbsenceInput::from_request(body).ok_or_else(|| {
        json_error(StatusCode::BAD_REQUEST, "start_datetime and end_datetime are required")
    })
}

/// Absence id from the body first, then the query.
pub(crate) fn absence_id(body: &JsonValue, params: &Params) -> Result<i64, Response> {
    body_id(body, "id")
        .or_else(|| params.get("id").and_then(|raw| parse_id(raw)))
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "id is required"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn technician_id_prefers_query_then_header() {
        let mut headers = HeaderMap::new();
        headers.insert(TECHNICIAN_HEADER, HeaderValue::from_static("7"));

        let params: Params = [("technician_id".to_string(), "3".to_string())].into();
        assert_eq!(technician_id(&params, &headers), Some(3));
        assert_eq!(technician_id(&Params::new(), &headers), Some(7));

        let bad: Params = [("technician_id".to_string(), "abc".to_string())].into();
        assert_eq!(technician_id(&bad, &headers), Some(7));
        assert_eq!(technician_id(&bad, &HeaderMap::new()), None);
    }

    #[test]
    fn body_ids_accept_numbers_and_numeric_strings() {
        let body = json!({"a": 5, "b": " 6 ", "c": -1, "d": true});
        assert_eq!(body_id(&body, "a"), Some(5));
        assert_eq!(body_id(&body, "b"), Some(6));
        assert_eq!(body_id(&body, "c"), None);
        assert_eq!(body_id(&body, "d"), None);
        assert_eq!(body_id(&body, "missing"), None);
    }

    #[test]
    fn window_params_reject_malformed_dates() {
        let params: Params = [("date_from".to_string(), "2024-05-01".to_string())].into();
        let window = window_from_params(&params).unwrap();
        assert_eq!(window.date_from, NaiveDate::from_ymd_opt(2024, 5, 1));
        assert_eq!(window.date_to, None);

        let bad: Params = [("date_to".to_string(), "05/31/2024".to_string())].into();
        assert_eq!(window_from_params(&bad).unwrap_err().status(), StatusCode::BAD_REQUEST);
    }
}
