//! Realtime sync core for server-owned collections.
//!
//! This crate defines the entity model, the three reconciliation components
//! (realtime change feeds, optimistic mutations, paged history), the backend
//! boundary they talk to, and the command/event protocol used by runtimes.

/// Backend data/RPC boundary trait and raw wire shapes.
pub mod backend;
/// Async command/event channel primitives.
pub mod channel;
/// Ordered, id-deduplicated collection merge buffer.
pub mod collection;
/// Explicit collaborator context (session, notifications, clock).
pub mod context;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Row decoding and outcome normalization at the backend edge.
pub mod normalization;
/// Optimistic mutation queue.
pub mod optimistic;
/// Bounded history paging.
pub mod pagination;
/// Change-feed subscriptions with reconnect.
pub mod realtime;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Subscription lifecycle state machine.
pub mod state_machine;
/// Entity model and runtime protocol types.
pub mod types;

#[cfg(test)]
mod test_support;

pub use backend::{ChangeFeed, FeedId, HistoryPage, RawChange, SyncBackend};
pub use channel::{EventPublisher, EventStream, RuntimeEnd, SyncChannelError, SyncChannels};
pub use collection::{CollectionError, ConfirmOutcome, SyncedCollection};
pub use context::{Clock, ManualClock, SyncContext, SystemClock};
pub use error::{
    BackendError, ChannelError, ErrorCategory, MutationFailure, PageLoadError, SyncError,
    classify_http_status,
};
pub use normalization::{RowDecodeError, decode_change, decode_row, encode_insert};
pub use optimistic::{CommitTicket, OptimisticMutationQueue, QueueError, submit_commit};
pub use pagination::{
    DEFAULT_PAGE_SIZE, IgnoreReason, LoadOutcome, MAX_PAGE_SIZE, PageRequest,
    PaginatedHistoryLoader, bounded_page_size,
};
pub use realtime::{ChangeHandler, RealtimeSyncChannel, SubscriptionHandle};
pub use retry::ReconnectPolicy;
pub use state_machine::{SubscriptionAction, SubscriptionState, SubscriptionStateMachine};
pub use types::{
    ChangeEvent, ChangeKind, ChannelStatus, CollectionItem, CollectionOrder, CollectionScope,
    Entity, EntityPayload, MergeOutcome, NotificationType, ResourceFilter, RuntimeConfig,
    SYSTEM_AUTHOR, Settlement, SwipeDirection, SyncCommand, SyncEvent, TEMP_ID_PREFIX, Table,
    TentativeEntity, is_temp_id,
};
