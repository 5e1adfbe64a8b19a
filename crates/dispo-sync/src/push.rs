//! Replays the pending-mutation queue against the remote in sequence order.

use std::collections::HashSet;
use std::sync::Arc;

use dispo_core::{AbsenceInput, EntityType, JobUpdate, MutationAction, PendingMutation};
use dispo_storage::{DispoRemote, LocalStore, RemoteError, StoreError};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub replayed: usize,
    pub failed: usize,
    /// Entries held back because an earlier entry for the same entity failed.
    pub skipped: usize,
    /// Entries dropped because their local row no longer exists.
    pub discarded: usize,
}

enum ReplayError {
    Remote(RemoteError),
    Invalid(String),
    Stale(String),
    Store(StoreError),
}

impl From<RemoteError> for ReplayError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}

impl From<StoreError> for ReplayError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

#[derive(Clone)]
pub struct PushReplayer {
    store: LocalStore,
    remote: Arc<dyn DispoRemote>,
}

impl PushReplayer {
    pub fn new(store: LocalStore, remote: Arc<dyn DispoRemote>) -> Self {
        Self { store, remote }
    }

    /// Walks the queue once. A failed entry stays queued and holds back the
    /// later entries of the same entity; other entities continue. Entries
    /// whose local row is gone are dropped. Local store failures abort the
    /// walk.
    pub async fn push(&self, technician_id: i64) -> Result<PushSummary, SyncError> {
        let pending = self.store.pending_mutations().await?;
        let mut summary = PushSummary::default();
        let mut blocked: HashSet<(EntityType, i64)> = HashSet::new();

        for mutation in pending {
            let entity = (mutation.entity_type, mutation.entity_id);
            if blocked.contains(&entity) {
                debug!(sequence = mutation.sequence, "held back behind a failed mutation");
                summary.skipped += 1;
                continue;
            }

            match self.replay(technician_id, &mutation).await {
                Ok(()) => {
                    self.store.remove_mutation(mutation.sequence).await?;
                    summary.replayed += 1;
                }
                Err(ReplayError::Store(err)) => return Err(err.into()),
                Err(ReplayError::Stale(reason)) => {
                    warn!(
                        technician_id,
                        sequence = mutation.sequence,
                        action = %mutation.action,
                        reason = %reason,
                        "mutation target gone; dropped from queue"
                    );
                    self.store.remove_mutation(mutation.sequence).await?;
                    summary.discarded += 1;
                }
                Err(ReplayError::Remote(err)) => {
                    warn!(
                        technician_id,
                        sequence = mutation.sequence,
                        action = %mutation.action,
                        transient = err.is_transient(),
                        error = %err,
                        "mutation replay failed; kept in queue"
                    );
                    blocked.insert(entity);
                    summary.failed += 1;
                }
                Err(ReplayError::Invalid(reason)) => {
                    warn!(
                        technician_id,
                        sequence = mutation.sequence,
                        action = %mutation.action,
                        reason = %reason,
                        "mutation payload unusable; kept in queue"
                    );
                    blocked.insert(entity);
                    summary.failed += 1;
                }
            }
        }

        info!(
            technician_id,
            replayed = summary.replayed,
            failed = summary.failed,
            skipped = summary.skipped,
            discarded = summary.discarded,
            "push finished"
        );
        Ok(summary)
    }

    async fn replay(
        &self,
        technician_id: i64,
        mutation: &PendingMutation,
    ) -> Result<(), ReplayError> {
        match (mutation.entity_type, mutation.action) {
            (
                EntityType::Job,
                action @ (MutationAction::Status
                | MutationAction::Description
                | MutationAction::Fabrikationsnummern),
            ) => {
                let update = JobUpdate::from_mutation(action, &mutation.payload)
                    .map_err(|err| ReplayError::Invalid(err.to_string()))?;
                let remote_id = self.remote_id(EntityType::Job, mutation.entity_id).await?;
                self.remote.update_job(technician_id, remote_id, &update).await?;
            }
            (EntityType::Absence, MutationAction::Create) => {
                let input = absence_input(mutation)?;
                if self
                    .store
                    .remote_link(EntityType::Absence, mutation.entity_id)
                    .await?
                    .is_none()
                {
                    return Err(ReplayError::Stale(format!(
                        "absence {} is no longer cached",
                        mutation.entity_id
                    )));
                }
                if let Some(remote_id) = self.remote.create_absence(technician_id, &input).await? {
                    self.link_created_absence(mutation.entity_id, remote_id).await?;
                }
            }
            (EntityType::Absence, MutationAction::Update) => {
                let input = absence_input(mutation)?;
                let remote_id = self.remote_id(EntityType::Absence, mutation.entity_id).await?;
                self.remote
                    .update_absence(technician_id, remote_id, &input)
                    .await?;
            }
            (EntityType::Absence, MutationAction::Delete) => {
                self.remote
                    .delete_absence(technician_id, mutation.entity_id)
                    .await?;
            }
            (entity_type, action) => {
                return Err(ReplayError::Invalid(format!(
                    "action {action} does not apply to {}",
                    entity_type.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Remote id recorded on the local row. Entries never fall back to the
    /// local id: that would address an unrelated remote row.
    async fn remote_id(&self, entity_type: EntityType, local_id: i64) -> Result<i64, ReplayError> {
        match self.store.remote_link(entity_type, local_id).await? {
            Some(Some(remote_id)) => Ok(remote_id),
            Some(None) => Err(ReplayError::Invalid(format!(
                "{} {local_id} has no remote id yet",
                entity_type.as_str()
            ))),
            None => Err(ReplayError::Stale(format!(
                "{} {local_id} is no longer cached",
                entity_type.as_str()
            ))),
        }
    }

    /// Records the remote id of a created absence. When the technician
    /// deleted the absence while the create was in flight, the new remote row
    /// gets a queued delete instead.
    async fn link_created_absence(&self, local_id: i64, remote_id: i64) -> Result<(), ReplayError> {
        if self.store.set_absence_server_id(local_id, remote_id).await? {
            debug!(local_id, remote_id, "absence linked to remote id");
            return Ok(());
        }
        let sequence = self
            .store
            .enqueue(EntityType::Absence, remote_id, MutationAction::Delete, &json!({}))
            .await?;
        info!(local_id, remote_id, sequence, "absence deleted during create; remote delete queued");
        Ok(())
    }
}

fn absence_input(mutation: &PendingMutation) -> Result<AbsenceInput, ReplayError> {
    serde_json::from_value(mutation.payload.clone())
        .map_err(|err| ReplayError::Invalid(err.to_string()))
}
