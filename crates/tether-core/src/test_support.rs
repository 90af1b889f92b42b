use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Value, json};
use tether_platform::{InMemorySessionProvider, RecordingNotificationSink};
use tokio::sync::mpsc;

use crate::{
    backend::{ChangeFeed, FeedId, HistoryPage, RawChange, SyncBackend},
    context::{ManualClock, SyncContext},
    error::BackendError,
    types::{CollectionScope, ResourceFilter, Table},
};

pub(crate) fn test_context(
    user_id: &str,
) -> (SyncContext, InMemorySessionProvider, RecordingNotificationSink) {
    let session = InMemorySessionProvider::signed_in(user_id);
    let notices = RecordingNotificationSink::default();
    let ctx = SyncContext::with_clock(
        Arc::new(session.clone()),
        Arc::new(notices.clone()),
        Arc::new(ManualClock::new(1_700_000_000_000)),
    );
    (ctx, session, notices)
}

pub(crate) fn message_row(
    id: &str,
    conversation_id: &str,
    sender_id: &str,
    text: &str,
    created_at_secs: i64,
) -> Value {
    let created_at = DateTime::from_timestamp(created_at_secs, 0)
        .expect("valid timestamp")
        .to_rfc3339();
    json!({
        "id": id,
        "conversation_id": conversation_id,
        "sender_id": sender_id,
        "text": text,
        "created_at": created_at,
    })
}

#[derive(Default)]
struct Script {
    pages: VecDeque<Result<HistoryPage, BackendError>>,
    inserts: VecDeque<Result<Value, BackendError>>,
    feeds: VecDeque<Result<ChangeFeed, BackendError>>,
    page_calls: Vec<(CollectionScope, u32, u16)>,
    insert_calls: Vec<(Table, Value)>,
    subscribe_calls: Vec<ResourceFilter>,
    released: Vec<FeedId>,
}

/// Backend that replays queued responses and records every call.
#[derive(Default)]
pub(crate) struct ScriptedBackend {
    script: Mutex<Script>,
}

impl ScriptedBackend {
    pub(crate) fn push_page(&self, page: Result<HistoryPage, BackendError>) {
        self.script.lock().expect("script lock").pages.push_back(page);
    }

    pub(crate) fn push_insert(&self, row: Result<Value, BackendError>) {
        self.script.lock().expect("script lock").inserts.push_back(row);
    }

    /// Queue a feed for the next subscribe call and return its sending side.
    pub(crate) fn push_feed(&self, id: FeedId) -> mpsc::Sender<RawChange> {
        let (tx, changes) = mpsc::channel(16);
        self.script
            .lock()
            .expect("script lock")
            .feeds
            .push_back(Ok(ChangeFeed { id, changes }));
        tx
    }

    pub(crate) fn push_subscribe_error(&self, err: BackendError) {
        self.script
            .lock()
            .expect("script lock")
            .feeds
            .push_back(Err(err));
    }

    pub(crate) fn page_calls(&self) -> Vec<(CollectionScope, u32, u16)> {
        self.script.lock().expect("script lock").page_calls.clone()
    }

    pub(crate) fn insert_calls(&self) -> Vec<(Table, Value)> {
        self.script.lock().expect("script lock").insert_calls.clone()
    }

    pub(crate) fn subscribe_calls(&self) -> Vec<ResourceFilter> {
        self.script.lock().expect("script lock").subscribe_calls.clone()
    }

    pub(crate) fn released(&self) -> Vec<FeedId> {
        self.script.lock().expect("script lock").released.clone()
    }
}

#[async_trait]
impl SyncBackend for ScriptedBackend {
    async fn fetch_page(
        &self,
        scope: &CollectionScope,
        page_index: u32,
        page_size: u16,
    ) -> Result<HistoryPage, BackendError> {
        let mut script = self.script.lock().expect("script lock");
        script.page_calls.push((scope.clone(), page_index, page_size));
        script
            .pages
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::network("no scripted page")))
    }

    async fn insert_entity(&self, table: Table, row: Value) -> Result<Value, BackendError> {
        let mut script = self.script.lock().expect("script lock");
        script.insert_calls.push((table, row));
        script
            .inserts
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::network("no scripted insert")))
    }

    async fn subscribe_changes(&self, filter: &ResourceFilter) -> Result<ChangeFeed, BackendError> {
        let mut script = self.script.lock().expect("script lock");
        script.subscribe_calls.push(filter.clone());
        script
            .feeds
            .pop_front()
            .unwrap_or_else(|| Err(BackendError::network("no scripted feed")))
    }

    async fn unsubscribe(&self, feed: FeedId) {
        self.script.lock().expect("script lock").released.push(feed);
    }
}
