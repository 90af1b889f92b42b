use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::{error::MutationFailure, retry::ReconnectPolicy, state_machine::SubscriptionState};

/// Prefix carried by every client-minted temporary identifier.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Author recorded for rows that have no owning user (trip inventory).
pub const SYSTEM_AUTHOR: &str = "system";

/// Returns `true` for identifiers minted by [`TentativeEntity::mint`].
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Server tables the client keeps in sync.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Chat messages (`conversation_id`, `sender_id`, `text`).
    Messages,
    /// Swipes; a right swipe on the current user is a like.
    Swipes,
    /// Trip inventory; only slot counts change at runtime.
    Trips,
    /// In-app notifications addressed to one user.
    Notifications,
}

impl Table {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::Swipes => "swipes",
            Self::Trips => "trips",
            Self::Notifications => "notifications",
        }
    }

    /// Column holding the author of a row, when the table has one.
    pub fn author_column(self) -> Option<&'static str> {
        match self {
            Self::Messages => Some("sender_id"),
            Self::Swipes => Some("swiper_id"),
            Self::Trips => None,
            Self::Notifications => Some("user_id"),
        }
    }
}

/// Swipe direction as stored by the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SwipeDirection {
    Left,
    Right,
}

impl SwipeDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// Notification categories emitted by server-side triggers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    NewMatch,
    NewMessage,
    NewBlindDateRequest,
    BlindDateAccepted,
    VibeCheckMatch,
}

/// Fully typed entity payload, one variant per synchronized table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    Message {
        conversation_id: String,
        text: String,
    },
    Like {
        swiped_id: String,
        direction: SwipeDirection,
    },
    TripSlotUpdate {
        slots: u32,
    },
    Notification {
        message: String,
        notification_type: NotificationType,
        source_entity_id: Option<String>,
        is_read: bool,
    },
}

impl EntityPayload {
    pub fn table(&self) -> Table {
        match self {
            Self::Message { .. } => Table::Messages,
            Self::Like { .. } => Table::Swipes,
            Self::TripSlotUpdate { .. } => Table::Trips,
            Self::Notification { .. } => Table::Notifications,
        }
    }

    /// User-typed text, for payloads that carry composer input.
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Message { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// A server-identified record in a synchronized collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    pub id: String,
    pub author_id: String,
    /// Creation time in milliseconds since Unix epoch.
    pub created_at_ms: u64,
    pub payload: EntityPayload,
}

impl Entity {
    /// Value of a backend column for this entity, used for equality filters.
    pub fn column(&self, name: &str) -> Option<String> {
        if name == "id" {
            return Some(self.id.clone());
        }
        if self.payload.table().author_column() == Some(name) {
            return Some(self.author_id.clone());
        }

        match (&self.payload, name) {
            (EntityPayload::Message { conversation_id, .. }, "conversation_id") => {
                Some(conversation_id.clone())
            }
            (EntityPayload::Like { swiped_id, .. }, "swiped_id") => Some(swiped_id.clone()),
            (EntityPayload::Like { direction, .. }, "direction") => {
                Some(direction.as_str().to_owned())
            }
            (EntityPayload::TripSlotUpdate { slots }, "slots") => Some(slots.to_string()),
            _ => None,
        }
    }
}

/// Locally minted placeholder awaiting server confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TentativeEntity {
    pub temp_id: String,
    pub author_id: String,
    pub created_at_ms: u64,
    pub payload: EntityPayload,
}

impl TentativeEntity {
    pub fn new(
        temp_id: impl Into<String>,
        author_id: impl Into<String>,
        created_at_ms: u64,
        payload: EntityPayload,
    ) -> Self {
        Self {
            temp_id: temp_id.into(),
            author_id: author_id.into(),
            created_at_ms,
            payload,
        }
    }

    /// Mint a tentative entity with a fresh `temp-<uuid>` identifier.
    pub fn mint(author_id: impl Into<String>, created_at_ms: u64, payload: EntityPayload) -> Self {
        Self::new(
            format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()),
            author_id,
            created_at_ms,
            payload,
        )
    }

    pub fn into_item(self) -> CollectionItem {
        CollectionItem {
            entity: Entity {
                id: self.temp_id,
                author_id: self.author_id,
                created_at_ms: self.created_at_ms,
                payload: self.payload,
            },
            pending: true,
        }
    }
}

/// One row of a synchronized collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionItem {
    pub entity: Entity,
    /// `true` while the entity is a tentative placeholder.
    pub pending: bool,
}

impl CollectionItem {
    pub fn confirmed(entity: Entity) -> Self {
        Self {
            entity,
            pending: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.entity.id
    }
}

/// Where live inserts land and which end history extends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CollectionOrder {
    /// Oldest first: live inserts append at the tail, history prepends at the head.
    Chronological,
    /// Newest first: live inserts land at the head, history extends the tail.
    NewestFirst,
}

/// Table plus optional equality filter (`column=eq.value`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CollectionScope {
    pub table: Table,
    pub eq: Option<(String, String)>,
}

impl CollectionScope {
    pub fn table(table: Table) -> Self {
        Self { table, eq: None }
    }

    pub fn eq(table: Table, column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            table,
            eq: Some((column.into(), value.into())),
        }
    }

    /// Stable topic label, for example `messages:conversation_id=eq.c1`.
    pub fn topic(&self) -> String {
        match &self.eq {
            Some((column, value)) => format!("{}:{column}=eq.{value}", self.table.as_str()),
            None => self.table.as_str().to_owned(),
        }
    }

    pub fn matches_entity(&self, entity: &Entity) -> bool {
        if entity.payload.table() != self.table {
            return false;
        }
        match &self.eq {
            Some((column, value)) => entity.column(column).as_deref() == Some(value.as_str()),
            None => true,
        }
    }

    /// Filter check against an undecoded backend row.
    pub fn matches_row(&self, row: &Value) -> bool {
        let Some((column, value)) = &self.eq else {
            return true;
        };
        match row.get(column) {
            Some(Value::String(s)) => s == value,
            Some(Value::Number(n)) => n.to_string() == *value,
            Some(Value::Bool(b)) => b.to_string() == *value,
            _ => false,
        }
    }
}

/// Kind of row change delivered by the change feed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Update,
}

/// A `(table, change, filter)` subscription target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceFilter {
    pub scope: CollectionScope,
    pub change: ChangeKind,
}

impl ResourceFilter {
    pub fn inserts(scope: CollectionScope) -> Self {
        Self {
            scope,
            change: ChangeKind::Insert,
        }
    }

    pub fn updates(scope: CollectionScope) -> Self {
        Self {
            scope,
            change: ChangeKind::Update,
        }
    }

    pub fn topic(&self) -> String {
        let change = match self.change {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
        };
        format!("{change}:{}", self.scope.topic())
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.change == event.kind && self.scope.matches_entity(&event.entity)
    }
}

/// Decoded change-feed event handed to subscription handlers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity: Entity,
}

/// Subscription status update, emitted on every lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelStatus {
    pub topic: String,
    pub state: SubscriptionState,
    /// Reconnect attempt number while reconnecting.
    pub attempt: Option<u32>,
    /// Delay before the next reconnect attempt.
    pub retry_in_ms: Option<u64>,
}

/// Final result of one optimistic mutation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Settlement {
    /// The tentative item now carries the server entity.
    Confirmed { temp_id: String, entity: Entity },
    /// The tentative item was removed; `restored` is the caller's original input.
    RolledBack {
        temp_id: String,
        failure: MutationFailure,
        restored: EntityPayload,
    },
}

impl Settlement {
    pub fn temp_id(&self) -> &str {
        match self {
            Self::Confirmed { temp_id, .. } | Self::RolledBack { temp_id, .. } => temp_id,
        }
    }
}

/// How a live change was folded into the collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    /// Already present (for example an echo of our own confirmed write).
    Duplicate,
    /// Echo of our own write confirmed a pending item in place.
    AdoptedTentative { temp_id: String },
    Updated,
    /// Update for an entity the collection does not hold.
    Ignored,
}

/// Runtime tuning values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// History page length.
    pub page_size: u16,
    /// Hard cap the backend enforces on page length.
    pub pagination_limit_cap: u16,
    pub reconnect: ReconnectPolicy,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            page_size: 30,
            pagination_limit_cap: 100,
            reconnect: ReconnectPolicy::default(),
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

/// Command channel input accepted by a view runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncCommand {
    /// Open the change-feed subscription for the view.
    Subscribe,
    /// Tear the subscription down; queued events for it are discarded.
    Unsubscribe,
    /// Start a fresh history cycle from page 0.
    LoadInitial,
    /// Load the next older page, if any.
    LoadOlder,
    /// Apply a mutation optimistically and commit it.
    Submit {
        payload: EntityPayload,
        /// Caller-chosen temporary id; minted when `None`.
        temp_id: Option<String>,
    },
    /// Unsubscribe and stop the runtime.
    Shutdown,
}

/// Event channel output emitted by a view runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncEvent {
    /// A tentative item was inserted and its commit started.
    TentativeApplied { temp_id: String },
    /// An optimistic mutation settled.
    Settled(Settlement),
    /// A live change was merged.
    LiveMerged { id: String, outcome: MergeOutcome },
    /// A history page was merged.
    PageLoaded {
        page_index: u32,
        inserted: usize,
        has_more: bool,
    },
    /// A history page failed; `has_more` is unchanged.
    PageLoadFailed { page_index: u32, code: String },
    /// Subscription lifecycle update.
    ChannelStatus(ChannelStatus),
    /// The session is no longer valid; the owning view should re-authenticate.
    SessionInvalid { code: String },
    /// A command could not be carried out.
    FatalError {
        code: String,
        message: String,
        recoverable: bool,
    },
}
