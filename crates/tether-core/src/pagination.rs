use serde::{Deserialize, Serialize};
use tether_platform::Severity;
use tracing::{debug, warn};

use crate::{
    backend::{HistoryPage, SyncBackend},
    collection::SyncedCollection,
    context::SyncContext,
    error::{BackendError, PageLoadError},
    normalization::{decode_row, page_failure_notice},
    types::{CollectionScope, Entity},
};

pub const DEFAULT_PAGE_SIZE: u16 = 30;
pub const MAX_PAGE_SIZE: u16 = 100;

/// Clamp a requested page size against safety and backend caps.
///
/// The result is always in `1..=100`.
pub fn bounded_page_size(requested: u16, backend_cap: u16) -> u16 {
    let safe_requested = requested.max(1);
    let safe_cap = backend_cap.max(1);
    safe_requested.min(safe_cap).min(MAX_PAGE_SIZE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IgnoreReason {
    /// Another page fetch has not finished yet.
    InFlight,
    /// The backend reported no older history.
    Exhausted,
    /// A completion arrived for a page that is not the one in flight.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded {
        page_index: u32,
        inserted: usize,
        has_more: bool,
    },
    Ignored(IgnoreReason),
}

/// A page fetch the loader has committed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub scope: CollectionScope,
    pub page_index: u32,
    pub page_size: u16,
}

impl PageRequest {
    pub async fn fetch(&self, backend: &dyn SyncBackend) -> Result<HistoryPage, BackendError> {
        backend
            .fetch_page(&self.scope, self.page_index, self.page_size)
            .await
    }
}

/// Loads older history one bounded page at a time, never two at once.
pub struct PaginatedHistoryLoader {
    ctx: SyncContext,
    scope: CollectionScope,
    page_size: u16,
    next_page: u32,
    has_more: bool,
    in_flight: Option<u32>,
    accept: Option<fn(&Entity) -> bool>,
}

impl PaginatedHistoryLoader {
    pub fn new(ctx: SyncContext, scope: CollectionScope, page_size: u16, backend_cap: u16) -> Self {
        Self {
            ctx,
            scope,
            page_size: bounded_page_size(page_size, backend_cap),
            next_page: 0,
            has_more: true,
            in_flight: None,
            accept: None,
        }
    }

    /// Keep only entities for which `accept` holds. Rejected rows still
    /// count towards the page length.
    pub fn with_filter(mut self, accept: fn(&Entity) -> bool) -> Self {
        self.accept = Some(accept);
        self
    }

    pub fn scope(&self) -> &CollectionScope {
        &self.scope
    }

    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    pub fn next_page(&self) -> u32 {
        self.next_page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Reserve a fetch of `page_index`.
    pub fn begin_page(&mut self, page_index: u32) -> Result<PageRequest, IgnoreReason> {
        if self.in_flight.is_some() {
            return Err(IgnoreReason::InFlight);
        }
        self.in_flight = Some(page_index);
        Ok(PageRequest {
            scope: self.scope.clone(),
            page_index,
            page_size: self.page_size,
        })
    }

    /// Start a fresh cycle at page 0.
    pub fn begin_initial(&mut self) -> Result<PageRequest, IgnoreReason> {
        if self.in_flight.is_some() {
            return Err(IgnoreReason::InFlight);
        }
        self.next_page = 0;
        self.has_more = true;
        self.begin_page(0)
    }

    pub fn begin_more(&mut self) -> Result<PageRequest, IgnoreReason> {
        if self.in_flight.is_some() {
            return Err(IgnoreReason::InFlight);
        }
        if !self.has_more {
            return Err(IgnoreReason::Exhausted);
        }
        self.begin_page(self.next_page)
    }

    /// Merge a finished fetch. On failure `has_more` and `next_page` are kept.
    ///
    /// A result for any page other than the reserved one is dropped untouched.
    pub fn finish(
        &mut self,
        collection: &mut SyncedCollection,
        page_index: u32,
        result: Result<HistoryPage, BackendError>,
    ) -> Result<LoadOutcome, PageLoadError> {
        if self.in_flight != Some(page_index) {
            debug!(page_index, in_flight = ?self.in_flight, "dropping stale page result");
            return Ok(LoadOutcome::Ignored(IgnoreReason::Stale));
        }
        self.in_flight = None;

        let page = match result {
            Ok(page) => page,
            Err(source) => {
                warn!(page_index, code = %source.code, topic = %self.scope.topic(), "history page failed");
                self.ctx.notify(
                    page_failure_notice(self.scope.table, page_index),
                    Severity::Error,
                );
                return Err(PageLoadError::Fetch { page_index, source });
            }
        };

        let row_count = page.rows.len();
        let mut entities = Vec::with_capacity(row_count);
        for row in &page.rows {
            match decode_row(self.scope.table, row) {
                Ok(entity) if self.accept.is_none_or(|accept| accept(&entity)) => {
                    entities.push(entity)
                }
                Ok(entity) => debug!(page_index, id = %entity.id, "history row filtered out"),
                Err(err) => warn!(page_index, error = %err, "skipping malformed history row"),
            }
        }
        entities.reverse();
        let inserted = collection.merge_history(entities);

        let page_has_more = page
            .has_more
            .unwrap_or(row_count >= usize::from(self.page_size));
        self.has_more = self.has_more && page_has_more;
        self.next_page = self.next_page.max(page_index.saturating_add(1));

        debug!(
            page_index,
            rows = row_count,
            inserted,
            has_more = self.has_more,
            "history page merged"
        );
        Ok(LoadOutcome::Loaded {
            page_index,
            inserted,
            has_more: self.has_more,
        })
    }

    pub async fn load_page(
        &mut self,
        collection: &mut SyncedCollection,
        backend: &dyn SyncBackend,
        page_index: u32,
    ) -> Result<LoadOutcome, PageLoadError> {
        match self.begin_page(page_index) {
            Ok(request) => self.run(collection, backend, request).await,
            Err(reason) => Ok(LoadOutcome::Ignored(reason)),
        }
    }

    pub async fn load_initial(
        &mut self,
        collection: &mut SyncedCollection,
        backend: &dyn SyncBackend,
    ) -> Result<LoadOutcome, PageLoadError> {
        match self.begin_initial() {
            Ok(request) => self.run(collection, backend, request).await,
            Err(reason) => Ok(LoadOutcome::Ignored(reason)),
        }
    }

    pub async fn load_more(
        &mut self,
        collection: &mut SyncedCollection,
        backend: &dyn SyncBackend,
    ) -> Result<LoadOutcome, PageLoadError> {
        match self.begin_more() {
            Ok(request) => self.run(collection, backend, request).await,
            Err(reason) => Ok(LoadOutcome::Ignored(reason)),
        }
    }

    async fn run(
        &mut self,
        collection: &mut SyncedCollection,
        backend: &dyn SyncBackend,
        request: PageRequest,
    ) -> Result<LoadOutcome, PageLoadError> {
        let result = request.fetch(backend).await;
        self.finish(collection, request.page_index, result)
    }
}
