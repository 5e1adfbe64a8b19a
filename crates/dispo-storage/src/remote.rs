//! HTTP client for the central technician API.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use dispo_core::{
    AbsenceInput, DateWindow, EquipmentMasterRecord, JobUpdate, RemoteAbsenceList, RemoteJobList,
};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

use crate::HttpClientConfig;

pub const TECHNICIAN_HEADER: &str = "X-Technician-Id";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(#[source] reqwest::Error),
    #[error("{context} failed with http status {status}{}", message_suffix(.message))]
    HttpStatus {
        context: &'static str,
        status: u16,
        message: Option<String>,
    },
    #[error("{context}: unexpected response body: {message}")]
    Decode {
        context: &'static str,
        message: String,
    },
    #[error("request failed: {0}")]
    Client(#[source] reqwest::Error),
}

fn message_suffix(message: &Option<String>) -> String {
    message.as_deref().map(|m| format!(": {m}")).unwrap_or_default()
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Network-level failure; the next cycle may succeed without any change.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::HttpStatus { status, .. } => {
                let status =
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Error text reported by the remote body, if any.
    pub fn remote_message(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { message, .. } => message.as_deref(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Unreachable(err)
        } else {
            Self::Client(err)
        }
    }
}

/// Operations the pull and push stages need from the central system.
#[async_trait]
pub trait DispoRemote: Send + Sync {
    async fn fetch_jobs(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<RemoteJobList, RemoteError>;

    async fn fetch_absences(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<RemoteAbsenceList, RemoteError>;

    async fn update_job(
        &self,
        technician_id: i64,
        remote_job_id: i64,
        update: &JobUpdate,
    ) -> Result<(), RemoteError>;

    /// Returns the id the remote assigned, when it reports one.
    async fn create_absence(
        &self,
        technician_id: i64,
        input: &AbsenceInput,
    ) -> Result<Option<i64>, RemoteError>;

    async fn update_absence(
        &self,
        technician_id: i64,
        remote_id: i64,
        input: &AbsenceInput,
    ) -> Result<(), RemoteError>;

    async fn delete_absence(&self, technician_id: i64, remote_id: i64) -> Result<(), RemoteError>;

    async fn equipment_by_serials(
        &self,
        serials: &[String],
    ) -> Result<Vec<EquipmentMasterRecord>, RemoteError>;

    async fn check_connection(&self, technician_id: i64) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredentials {
    pub username: String,
    pub password: String,
}

impl RemoteCredentials {
    /// Both parts must be non-empty, otherwise requests go unauthenticated.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
                Some(Self { username, password })
            }
            _ => None,
        }
    }
}

/// Where a sync should go; supplied per request by the local client API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub base_url: String,
    pub credentials: Option<RemoteCredentials>,
}

pub trait RemoteConnector: Send + Sync {
    fn connect(&self, target: &RemoteTarget) -> anyhow::Result<Arc<dyn DispoRemote>>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpConnector {
    pub config: HttpClientConfig,
}

impl RemoteConnector for HttpConnector {
    fn connect(&self, target: &RemoteTarget) -> anyhow::Result<Arc<dyn DispoRemote>> {
        let remote =
            HttpDispoRemote::new(&target.base_url, target.credentials.clone(), &self.config)?;
        Ok(Arc::new(remote))
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedBody {
    #[serde(default)]
    id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct EquipmentBody {
    #[serde(default)]
    data: Vec<EquipmentMasterRecord>,
}

#[derive(Debug, Clone)]
pub struct HttpDispoRemote {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<RemoteCredentials>,
}

impl HttpDispoRemote {
    pub fn new(
        base_url: &str,
        credentials: Option<RemoteCredentials>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        anyhow::ensure!(!base_url.is_empty(), "remote base url is empty");

        Ok(Self {
            client,
            base_url,
            credentials,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str, technician_id: Option<i64>) -> RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{}", self.base_url, path));
        if let Some(credentials) = &self.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }
        if let Some(id) = technician_id {
            builder = builder
                .header(TECHNICIAN_HEADER, id.to_string())
                .query(&[("technician_id", id.to_string())]);
        }
        builder
    }

    async fn send(
        &self,
        context: &'static str,
        builder: RequestBuilder,
    ) -> Result<Response, RemoteError> {
        let response = builder
            .send()
            .instrument(info_span!("remote_request", context))
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .ok()
            .and_then(|body| body.error);
        debug!(context, status = status.as_u16(), ?message, "remote rejected request");
        Err(RemoteError::HttpStatus {
            context,
            status: status.as_u16(),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        context: &'static str,
        builder: RequestBuilder,
    ) -> Result<T, RemoteError> {
        let response = self.send(context, builder).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| RemoteError::Decode {
            context,
            message: err.to_string(),
        })
    }
}

fn with_fields(mut head: JsonValue, fields: JsonValue) -> JsonValue {
    if let (Some(target), JsonValue::Object(extra)) = (head.as_object_mut(), fields) {
        target.extend(extra);
    }
    head
}

#[async_trait]
impl DispoRemote for HttpDispoRemote {
    async fn fetch_jobs(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<RemoteJobList, RemoteError> {
        let builder = self
            .request(Method::GET, "/api/my_jobs", Some(technician_id))
            .query(&window.query_pairs());
        self.send_json("fetch jobs", builder).await
    }

    async fn fetch_absences(
        &self,
        technician_id: i64,
        window: &DateWindow,
    ) -> Result<RemoteAbsenceList, RemoteError> {
        let builder = self
            .request(Method::GET, "/api/my_absences", Some(technician_id))
            .query(&window.query_pairs());
        self.send_json("fetch absences", builder).await
    }

    async fn update_job(
        &self,
        technician_id: i64,
        remote_job_id: i64,
        update: &JobUpdate,
    ) -> Result<(), RemoteError> {
        let body = with_fields(json!({ "job_id": remote_job_id }), update.payload());
        let builder = self
            .request(Method::PATCH, "/api/job", Some(technician_id))
            .json(&body);
        self.send("update job", builder).await?;
        Ok(())
    }

    async fn create_absence(
        &self,
        technician_id: i64,
        input: &AbsenceInput,
    ) -> Result<Option<i64>, RemoteError> {
        let builder = self
            .request(Method::POST, "/api/absence", Some(technician_id))
            .json(input);
        let created: CreatedBody = self.send_json("create absence", builder).await?;
        Ok(created.id)
    }

    async fn update_absence(
        &self,
        technician_id: i64,
        remote_id: i64,
        input: &AbsenceInput,
    ) -> Result<(), RemoteError> {
        let fields = serde_json::to_value(input).map_err(|err| RemoteError::Decode {
            context: "update absence",
            message: err.to_string(),
        })?;
        let builder = self
            .request(Method::PATCH, "/api/absence", Some(technician_id))
            .json(&with_fields(json!({ "id": remote_id }), fields));
        self.send("update absence", builder).await?;
        Ok(())
    }

    async fn delete_absence(&self, technician_id: i64, remote_id: i64) -> Result<(), RemoteError> {
        let builder = self
            .request(Method::DELETE, "/api/absence", Some(technician_id))
            .query(&[("id", remote_id.to_string())]);
        self.send("delete absence", builder).await?;
        Ok(())
    }

    async fn equipment_by_serials(
        &self,
        serials: &[String],
    ) -> Result<Vec<EquipmentMasterRecord>, RemoteError> {
        if serials.is_empty() {
            return Ok(Vec::new());
        }
        let builder = self
            .request(Method::GET, "/api/anlagenstamm_by_fab", None)
            .query(&[("fabs", serials.join(","))]);
        let body: EquipmentBody = self.send_json("equipment lookup", builder).await?;
        Ok(body.data)
    }

    async fn check_connection(&self, technician_id: i64) -> Result<(), RemoteError> {
        let today = Utc::now().date_naive();
        let window = DateWindow::new(Some(today), Some(today));
        self.fetch_jobs(technician_id, &window).await.map(|_| ())
    }
}
