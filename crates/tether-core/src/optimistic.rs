use std::{collections::HashMap, future::Future};

use serde_json::Value;
use tether_platform::Severity;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    backend::SyncBackend,
    collection::{CollectionError, SyncedCollection},
    context::SyncContext,
    error::{BackendError, MutationFailure},
    normalization::{decode_row, encode_insert, mutation_failure_notice},
    types::{EntityPayload, Settlement, Table, TentativeEntity},
};

/// Misuse of the mutation queue, as opposed to a failed commit.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("temporary id '{0}' is already outstanding")]
    DuplicateTentative(String),
    #[error("temporary id '{0}' is not outstanding")]
    UnknownTentative(String),
    #[error("commit for '{0}' is already in flight")]
    CommitInFlight(String),
    #[error(transparent)]
    Collection(#[from] CollectionError),
}

#[derive(Debug, Clone)]
struct Outstanding {
    author_id: String,
    payload: EntityPayload,
    committing: bool,
}

/// Everything needed to run one commit away from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitTicket {
    pub temp_id: String,
    pub table: Table,
    pub row: Value,
}

/// Tracks tentative entities from optimistic insert until they settle.
#[derive(Debug)]
pub struct OptimisticMutationQueue {
    ctx: SyncContext,
    outstanding: HashMap<String, Outstanding>,
}

impl OptimisticMutationQueue {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            outstanding: HashMap::new(),
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn is_outstanding(&self, temp_id: &str) -> bool {
        self.outstanding.contains_key(temp_id)
    }

    /// Stamp `payload` with the current user and clock under a fresh temporary id.
    pub fn tentative(&self, payload: EntityPayload) -> Result<TentativeEntity, MutationFailure> {
        let author_id = self.ctx.current_user_id()?;
        Ok(TentativeEntity::mint(author_id, self.ctx.now_ms(), payload))
    }

    /// Same as [`Self::tentative`] with a caller-chosen temporary id.
    pub fn tentative_with_id(
        &self,
        temp_id: impl Into<String>,
        payload: EntityPayload,
    ) -> Result<TentativeEntity, MutationFailure> {
        let author_id = self.ctx.current_user_id()?;
        Ok(TentativeEntity::new(temp_id, author_id, self.ctx.now_ms(), payload))
    }

    /// Insert the pending item. Returns its position in the collection.
    pub fn apply_optimistic(
        &mut self,
        collection: &mut SyncedCollection,
        tentative: TentativeEntity,
    ) -> Result<usize, QueueError> {
        if self.outstanding.contains_key(&tentative.temp_id) {
            return Err(QueueError::DuplicateTentative(tentative.temp_id));
        }

        let temp_id = tentative.temp_id.clone();
        let outstanding = Outstanding {
            author_id: tentative.author_id.clone(),
            payload: tentative.payload.clone(),
            committing: false,
        };
        let position = collection.insert_tentative(tentative)?;
        debug!(%temp_id, position, "optimistic item applied");
        self.outstanding.insert(temp_id, outstanding);
        Ok(position)
    }

    /// Mark the commit for `temp_id` as started.
    pub fn begin_commit(&mut self, temp_id: &str) -> Result<CommitTicket, QueueError> {
        let entry = self
            .outstanding
            .get_mut(temp_id)
            .ok_or_else(|| QueueError::UnknownTentative(temp_id.to_owned()))?;
        if entry.committing {
            return Err(QueueError::CommitInFlight(temp_id.to_owned()));
        }
        entry.committing = true;

        Ok(CommitTicket {
            temp_id: temp_id.to_owned(),
            table: entry.payload.table(),
            row: encode_insert(&entry.author_id, &entry.payload),
        })
    }

    /// Reconcile a finished commit with the collection.
    ///
    /// A failed commit whose item was already confirmed by its own realtime
    /// echo settles as confirmed: the server evidently stored it.
    pub fn settle(
        &mut self,
        collection: &mut SyncedCollection,
        temp_id: &str,
        result: Result<Value, BackendError>,
    ) -> Result<Settlement, QueueError> {
        let outstanding = self
            .outstanding
            .remove(temp_id)
            .ok_or_else(|| QueueError::UnknownTentative(temp_id.to_owned()))?;
        let table = outstanding.payload.table();

        let decoded =
            result.and_then(|row| decode_row(table, &row).map_err(BackendError::from));

        let failure = match decoded {
            Ok(entity) => {
                collection.confirm_tentative(temp_id, entity.clone())?;
                debug!(%temp_id, server_id = %entity.id, "optimistic item confirmed");
                return Ok(Settlement::Confirmed {
                    temp_id: temp_id.to_owned(),
                    entity,
                });
            }
            Err(err) => MutationFailure::from(err),
        };

        match collection.remove_tentative(temp_id) {
            Ok(_) => {
                warn!(%temp_id, code = failure.code(), "optimistic item rolled back");
                self.ctx
                    .notify(mutation_failure_notice(table), Severity::Error);
                Ok(Settlement::RolledBack {
                    temp_id: temp_id.to_owned(),
                    failure,
                    restored: outstanding.payload,
                })
            }
            Err(CollectionError::AlreadyConfirmed { server_id, .. }) => {
                let entity = collection
                    .get(&server_id)
                    .map(|item| item.entity.clone())
                    .ok_or_else(|| CollectionError::UnknownTentative(temp_id.to_owned()))?;
                debug!(%temp_id, %server_id, code = failure.code(), "commit failed after echo; keeping confirmed item");
                Ok(Settlement::Confirmed {
                    temp_id: temp_id.to_owned(),
                    entity,
                })
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Run `remote_call` for `temp_id` and settle its result.
    pub async fn commit_with<F, Fut>(
        &mut self,
        collection: &mut SyncedCollection,
        temp_id: &str,
        remote_call: F,
    ) -> Result<Settlement, QueueError>
    where
        F: FnOnce(CommitTicket) -> Fut,
        Fut: Future<Output = Result<Value, BackendError>>,
    {
        let ticket = self.begin_commit(temp_id)?;
        let result = match self.ctx.current_user_id() {
            Ok(_) => remote_call(ticket).await,
            Err(err) => Err(err),
        };
        self.settle(collection, temp_id, result)
    }

    /// Commit `temp_id` through `backend`.
    pub async fn commit(
        &mut self,
        collection: &mut SyncedCollection,
        backend: &dyn SyncBackend,
        temp_id: &str,
    ) -> Result<Settlement, QueueError> {
        let ticket = self.begin_commit(temp_id)?;
        let result = submit_commit(backend, &self.ctx, &ticket).await;
        self.settle(collection, temp_id, result)
    }
}

/// Perform the backend insert for a ticket. Fails with an auth error,
/// without touching the backend, when the session is gone.
pub async fn submit_commit(
    backend: &dyn SyncBackend,
    ctx: &SyncContext,
    ticket: &CommitTicket,
) -> Result<Value, BackendError> {
    ctx.current_user_id()?;
    backend.insert_entity(ticket.table, ticket.row.clone()).await
}
