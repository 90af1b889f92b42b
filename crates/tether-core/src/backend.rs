use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    error::BackendError,
    types::{ChangeKind, CollectionScope, ResourceFilter, Table},
};

/// Backend-assigned identifier of one change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedId(pub u64);

/// Undecoded change-feed delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub kind: ChangeKind,
    pub table: Table,
    pub row: Value,
}

/// An open change feed. The sender side closing means the transport dropped.
#[derive(Debug)]
pub struct ChangeFeed {
    pub id: FeedId,
    pub changes: mpsc::Receiver<RawChange>,
}

/// One page of history rows, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub rows: Vec<Value>,
    /// Explicit continuation flag when the backend knows it.
    pub has_more: Option<bool>,
}

/// Remote data/RPC layer the sync core talks to.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    /// Rows for `scope` ordered newest first, covering
    /// `page_index * page_size .. (page_index + 1) * page_size`.
    async fn fetch_page(
        &self,
        scope: &CollectionScope,
        page_index: u32,
        page_size: u16,
    ) -> Result<HistoryPage, BackendError>;

    /// Insert a row and return it as stored, with its durable id.
    async fn insert_entity(&self, table: Table, row: Value) -> Result<Value, BackendError>;

    async fn subscribe_changes(&self, filter: &ResourceFilter) -> Result<ChangeFeed, BackendError>;

    async fn unsubscribe(&self, feed: FeedId);
}
