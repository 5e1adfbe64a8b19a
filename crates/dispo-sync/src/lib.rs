//! Batch import, pull/push reconciliation and the periodic sync cycle.

use dispo_storage::{RemoteError, StoreError};
use thiserror::Error;

pub mod config;
pub mod cycle;
pub mod import;
pub mod pull;
pub mod push;

pub use config::{CentralConfig, ClientConfig};
pub use cycle::{build_scheduler, CycleReport, SyncCycle, SyncGate};
pub use import::{ImportBatch, ImportError, ImportOutcome, ImportService};
pub use pull::{PullReconciler, PullSummary};
pub use push::{PushReplayer, PushSummary};

pub const CRATE_NAME: &str = "dispo-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("technician not recognized: {0}")]
    TechnicianNotRecognized(String),
    #[error(transparent)]
    Remote(RemoteError),
    #[error("a sync is already running")]
    Busy,
}

impl SyncError {
    /// Classifies a remote failure; a 403 means the remote does not know the
    /// technician (or not as an active one).
    pub fn from_remote(technician_id: i64, err: RemoteError) -> Self {
        if err.status() == Some(403) {
            let detail = err
                .remote_message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("id {technician_id}"));
            return Self::TechnicianNotRecognized(detail);
        }
        Self::Remote(err)
    }

    /// Failures that only concern connectivity; the cached data stays usable.
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::TechnicianNotRecognized(_))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forbidden_maps_to_unrecognized_technician() {
        let err = SyncError::from_remote(
            7,
            RemoteError::HttpStatus {
                context: "fetch jobs",
                status: 403,
                message: Some("Kein Monteur".into()),
            },
        );
        assert_eq!(err.to_string(), "technician not recognized: Kein Monteur");

        let bare = SyncError::from_remote(
            7,
            RemoteError::HttpStatus {
                context: "fetch jobs",
                status: 403,
                message: None,
            },
        );
        assert_eq!(bare.to_string(), "technician not recognized: id 7");
        assert!(bare.is_remote());
    }

    #[test]
    fn other_statuses_stay_remote_errors() {
        let err = SyncError::from_remote(
            7,
            RemoteError::HttpStatus {
                context: "fetch absences",
                status: 500,
                message: None,
            },
        );
        assert!(matches!(err, SyncError::Remote(_)));
        assert_eq!(err.to_string(), "fetch absences failed with http status 500");
    }
}
