use std::{
    cmp::Reverse,
    collections::{HashMap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat};
use serde_json::{Map, Value, json};
use tether_core::{
    BackendError, ChangeFeed, ChangeKind, CollectionScope, ErrorCategory, FeedId, HistoryPage,
    RawChange, ResourceFilter, SyncBackend, Table,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

const FEED_BUFFER: usize = 64;
const SERVER_EPOCH_MS: i64 = 1_700_000_000_000;

struct FeedEntry {
    id: FeedId,
    filter: ResourceFilter,
    tx: mpsc::Sender<RawChange>,
}

struct MemoryState {
    tables: HashMap<Table, Vec<Value>>,
    feeds: Vec<FeedEntry>,
    next_feed_id: u64,
    next_swipe_id: i64,
    server_clock_ms: i64,
    insert_failures: VecDeque<BackendError>,
    fetch_failures: VecDeque<BackendError>,
    subscribe_failures: VecDeque<BackendError>,
    insert_delay: Option<Duration>,
    echo_own_inserts: bool,
    released: Vec<FeedId>,
    subscribe_calls: usize,
    fetch_calls: usize,
    insert_calls: usize,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            feeds: Vec::new(),
            next_feed_id: 1,
            next_swipe_id: 1,
            server_clock_ms: SERVER_EPOCH_MS,
            insert_failures: VecDeque::new(),
            fetch_failures: VecDeque::new(),
            subscribe_failures: VecDeque::new(),
            insert_delay: None,
            echo_own_inserts: true,
            released: Vec::new(),
            subscribe_calls: 0,
            fetch_calls: 0,
            insert_calls: 0,
        }
    }
}

impl MemoryState {
    /// Assign server-owned columns and append the row to its table.
    fn store(&mut self, table: Table, row: Value) -> Result<Value, BackendError> {
        let Value::Object(mut fields) = row else {
            return Err(BackendError::validation("row must be a JSON object"));
        };
        validate(table, &fields)?;

        let id = match table {
            Table::Swipes => {
                let id = self.next_swipe_id;
                self.next_swipe_id += 1;
                json!(id)
            }
            _ => json!(Uuid::new_v4().to_string()),
        };
        self.server_clock_ms += 1_000;
        let created_at = DateTime::from_timestamp_millis(self.server_clock_ms)
            .ok_or_else(|| {
                BackendError::new(ErrorCategory::Internal, "clock_overflow", "server clock out of range")
            })?
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        fields.entry("id").or_insert(id);
        fields.insert("created_at".to_owned(), Value::String(created_at));
        let row = Value::Object(fields);
        self.tables.entry(table).or_default().push(row.clone());
        Ok(row)
    }

    fn broadcast(&self, kind: ChangeKind, table: Table, row: &Value) {
        for feed in &self.feeds {
            let filter = &feed.filter;
            if filter.change != kind || filter.scope.table != table || !filter.scope.matches_row(row) {
                continue;
            }
            let change = RawChange {
                kind,
                table,
                row: row.clone(),
            };
            match feed.tx.try_send(change) {
                Ok(()) => trace!(feed = feed.id.0, table = table.as_str(), "change pushed"),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(feed = feed.id.0, "change feed full; dropping change")
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    trace!(feed = feed.id.0, "change feed receiver gone")
                }
            }
        }
    }
}

fn validate(table: Table, fields: &Map<String, Value>) -> Result<(), BackendError> {
    if table == Table::Messages {
        let text = fields.get("text").and_then(Value::as_str).unwrap_or_default();
        if text.trim().is_empty() {
            return Err(BackendError::validation("message text must not be empty"));
        }
    }
    Ok(())
}

fn created_at_ms(row: &Value) -> i64 {
    row.get("created_at")
        .and_then(Value::as_str)
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|at| at.timestamp_millis())
        .unwrap_or(i64::MIN)
}

/// Process-local backend: per-table row storage, server id assignment,
/// newest-first paging, change-feed fan-out and scripted faults.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store rows without notifying feeds. Returns the stored rows.
    pub fn seed(&self, table: Table, rows: Vec<Value>) -> Result<Vec<Value>, BackendError> {
        let mut state = self.state();
        rows.into_iter().map(|row| state.store(table, row)).collect()
    }

    /// Seed `count` messages from `sender_id`, oldest first. Returns their ids.
    pub fn seed_messages(
        &self,
        conversation_id: &str,
        sender_id: &str,
        count: usize,
    ) -> Result<Vec<String>, BackendError> {
        let rows = (0..count)
            .map(|index| {
                json!({
                    "conversation_id": conversation_id,
                    "sender_id": sender_id,
                    "text": format!("message {index}"),
                })
            })
            .collect();
        let stored = self.seed(Table::Messages, rows)?;
        Ok(stored
            .iter()
            .filter_map(|row| row.get("id").and_then(Value::as_str).map(str::to_owned))
            .collect())
    }

    /// Insert on behalf of another client and notify matching feeds.
    pub fn push_remote(&self, table: Table, row: Value) -> Result<Value, BackendError> {
        let mut state = self.state();
        let row = state.store(table, row)?;
        state.broadcast(ChangeKind::Insert, table, &row);
        Ok(row)
    }

    /// Merge `patch` into the row with `id` and notify update feeds.
    pub fn update_row(&self, table: Table, id: &str, patch: Value) -> Option<Value> {
        let mut state = self.state();
        let rows = state.tables.get_mut(&table)?;
        let row = rows.iter_mut().find(|row| row_id(row).as_deref() == Some(id))?;
        if let (Value::Object(fields), Value::Object(patch)) = (&mut *row, patch) {
            fields.extend(patch);
        }
        let updated = row.clone();
        state.broadcast(ChangeKind::Update, table, &updated);
        Some(updated)
    }

    pub fn fail_next_insert(&self, err: BackendError) {
        self.state().insert_failures.push_back(err);
    }

    pub fn fail_next_fetch(&self, err: BackendError) {
        self.state().fetch_failures.push_back(err);
    }

    pub fn fail_next_subscribe(&self, err: BackendError) {
        self.state().subscribe_failures.push_back(err);
    }

    /// Drop every open feed as a transport loss would.
    pub fn sever_feeds(&self) {
        let severed = std::mem::take(&mut self.state().feeds);
        debug!(count = severed.len(), "severing change feeds");
    }

    pub fn set_insert_delay(&self, delay: Option<Duration>) {
        self.state().insert_delay = delay;
    }

    /// Whether inserts made through [`SyncBackend::insert_entity`] are echoed to feeds.
    pub fn set_echo(&self, echo: bool) {
        self.state().echo_own_inserts = echo;
    }

    pub fn released_feeds(&self) -> Vec<FeedId> {
        self.state().released.clone()
    }

    pub fn active_feed_count(&self) -> usize {
        self.state().feeds.len()
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn fetch_calls(&self) -> usize {
        self.state().fetch_calls
    }

    pub fn insert_calls(&self) -> usize {
        self.state().insert_calls
    }

    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state().tables.get(&table).cloned().unwrap_or_default()
    }
}

fn row_id(row: &Value) -> Option<String> {
    match row.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SyncBackend for InMemoryBackend {
    async fn fetch_page(
        &self,
        scope: &CollectionScope,
        page_index: u32,
        page_size: u16,
    ) -> Result<HistoryPage, BackendError> {
        let mut state = self.state();
        state.fetch_calls += 1;
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }

        let mut rows: Vec<Value> = state
            .tables
            .get(&scope.table)
            .map(|rows| {
                rows.iter()
                    .rev()
                    .filter(|row| scope.matches_row(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|row| Reverse(created_at_ms(row)));

        let size = usize::from(page_size);
        let start = (page_index as usize).saturating_mul(size);
        let rows = rows.into_iter().skip(start).take(size).collect();
        Ok(HistoryPage {
            rows,
            has_more: None,
        })
    }

    async fn insert_entity(&self, table: Table, row: Value) -> Result<Value, BackendError> {
        let delay = {
            let mut state = self.state();
            state.insert_calls += 1;
            state.insert_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if let Some(err) = state.insert_failures.pop_front() {
            return Err(err);
        }
        let row = state.store(table, row)?;
        if state.echo_own_inserts {
            state.broadcast(ChangeKind::Insert, table, &row);
        }
        Ok(row)
    }

    async fn subscribe_changes(&self, filter: &ResourceFilter) -> Result<ChangeFeed, BackendError> {
        let mut state = self.state();
        state.subscribe_calls += 1;
        if let Some(err) = state.subscribe_failures.pop_front() {
            return Err(err);
        }

        let id = FeedId(state.next_feed_id);
        state.next_feed_id += 1;
        let (tx, changes) = mpsc::channel(FEED_BUFFER);
        state.feeds.push(FeedEntry {
            id,
            filter: filter.clone(),
            tx,
        });
        debug!(feed = id.0, topic = %filter.topic(), "change feed opened");
        Ok(ChangeFeed { id, changes })
    }

    async fn unsubscribe(&self, feed: FeedId) {
        let mut state = self.state();
        state.feeds.retain(|entry| entry.id != feed);
        state.released.push(feed);
        debug!(feed = feed.0, "change feed released");
    }
}

#[cfg(test)]
mod tests {
    use tether_core::{SwipeDirection, decode_row};

    use super::*;

    #[tokio::test]
    async fn pages_newest_first_within_scope() {
        let backend = InMemoryBackend::new();
        backend.seed_messages("c1", "u2", 5).expect("seed c1");
        backend.seed_messages("c2", "u2", 2).expect("seed c2");

        let scope = CollectionScope::eq(Table::Messages, "conversation_id", "c1");
        let first = backend.fetch_page(&scope, 0, 2).await.expect("page 0");
        let texts: Vec<&str> = first
            .rows
            .iter()
            .filter_map(|row| row["text"].as_str())
            .collect();
        assert_eq!(texts, vec!["message 4", "message 3"]);

        let last = backend.fetch_page(&scope, 2, 2).await.expect("page 2");
        assert_eq!(last.rows.len(), 1);
        assert_eq!(last.rows[0]["text"], "message 0");
        assert_eq!(backend.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn inserts_assign_ids_and_echo_to_matching_feeds() {
        let backend = InMemoryBackend::new();
        let filter = ResourceFilter::inserts(CollectionScope::eq(
            Table::Messages,
            "conversation_id",
            "c1",
        ));
        let mut feed = backend.subscribe_changes(&filter).await.expect("feed");

        let stored = backend
            .insert_entity(
                Table::Messages,
                json!({ "conversation_id": "c1", "sender_id": "u1", "text": "hi" }),
            )
            .await
            .expect("insert");
        let entity = decode_row(Table::Messages, &stored).expect("stored row decodes");
        assert!(!tether_core::is_temp_id(&entity.id));

        let change = feed.changes.recv().await.expect("echo");
        assert_eq!(change.kind, ChangeKind::Insert);
        assert_eq!(change.row, stored);

        backend
            .push_remote(
                Table::Messages,
                json!({ "conversation_id": "c2", "sender_id": "u2", "text": "elsewhere" }),
            )
            .expect("remote insert");
        assert!(feed.changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn swipe_ids_are_numeric() {
        let backend = InMemoryBackend::new();
        let row = backend
            .push_remote(
                Table::Swipes,
                json!({ "swiper_id": "u9", "swiped_id": "u1", "direction": SwipeDirection::Right }),
            )
            .expect("swipe");
        assert!(row["id"].is_i64());
        let entity = decode_row(Table::Swipes, &row).expect("decodes");
        assert_eq!(entity.id, "1");
    }

    #[tokio::test]
    async fn rejects_empty_messages() {
        let backend = InMemoryBackend::new();
        let err = backend
            .insert_entity(
                Table::Messages,
                json!({ "conversation_id": "c1", "sender_id": "u1", "text": "   " }),
            )
            .await
            .expect_err("empty text");
        assert_eq!(err.category, ErrorCategory::Validation);
        assert!(backend.rows(Table::Messages).is_empty());
    }

    #[tokio::test]
    async fn scripted_faults_fire_once() {
        let backend = InMemoryBackend::new();
        backend.fail_next_fetch(BackendError::network("offline"));
        backend.fail_next_subscribe(BackendError::network("refused"));

        let scope = CollectionScope::table(Table::Trips);
        assert!(backend.fetch_page(&scope, 0, 10).await.is_err());
        assert!(backend.fetch_page(&scope, 0, 10).await.is_ok());

        let filter = ResourceFilter::updates(scope);
        assert!(backend.subscribe_changes(&filter).await.is_err());
        assert!(backend.subscribe_changes(&filter).await.is_ok());
        assert_eq!(backend.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn updates_reach_update_feeds_and_severing_closes_them() {
        let backend = InMemoryBackend::new();
        let stored = backend
            .seed(Table::Trips, vec![json!({ "id": "trip-1", "slots": 4 })])
            .expect("seed trip");
        assert_eq!(stored[0]["id"], "trip-1");

        let filter = ResourceFilter::updates(CollectionScope::table(Table::Trips));
        let mut feed = backend.subscribe_changes(&filter).await.expect("feed");

        let updated = backend
            .update_row(Table::Trips, "trip-1", json!({ "slots": 3 }))
            .expect("trip exists");
        assert_eq!(updated["slots"], 3);
        let change = feed.changes.recv().await.expect("update delivered");
        assert_eq!(change.kind, ChangeKind::Update);

        backend.sever_feeds();
        assert!(feed.changes.recv().await.is_none());
        assert_eq!(backend.active_feed_count(), 0);
        assert!(backend.released_feeds().is_empty());
    }
}
