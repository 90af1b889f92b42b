//! Per-view sync runtime.
//!
//! A runtime owns one [`SyncedCollection`] and drives the realtime channel,
//! the optimistic mutation queue and the history loader for it from a single
//! task. Views talk to it through [`RuntimeHandle`]: commands in, events and
//! collection snapshots out.

use std::sync::Arc;

use serde_json::Value;
use tether_core::{
    BackendError, ChangeEvent, ChangeKind, ChannelStatus, CollectionItem, EntityPayload,
    ErrorCategory, EventPublisher, EventStream, HistoryPage, IgnoreReason, LoadOutcome,
    MergeOutcome, MutationFailure, OptimisticMutationQueue, PageRequest, PaginatedHistoryLoader,
    QueueError, RealtimeSyncChannel, RuntimeConfig, RuntimeEnd, Settlement, SubscriptionHandle,
    SubscriptionState, SyncBackend, SyncChannelError, SyncChannels, SyncCommand, SyncContext,
    SyncEvent, SyncedCollection, TEMP_ID_PREFIX,
    normalization::{mutation_failure_notice, normalize_fatal_error, normalize_mutation_failure},
    submit_commit,
};
use tether_platform::Severity;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub mod memory;
mod view;

pub use memory::InMemoryBackend;
pub use view::ViewSpec;

/// Read-only state of a view, republished after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewSnapshot {
    pub items: Vec<CollectionItem>,
    pub has_more: bool,
    pub loading_older: bool,
    pub unread_count: usize,
    pub subscription: Option<SubscriptionState>,
}

#[derive(Clone, Debug)]
pub struct RuntimeHandle {
    channels: SyncChannels,
    snapshot_rx: watch::Receiver<ViewSnapshot>,
}

impl RuntimeHandle {
    pub async fn send(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.channels.send_command(command).await
    }

    pub fn subscribe(&self) -> EventStream {
        self.channels.subscribe()
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<ViewSnapshot> {
        self.snapshot_rx.clone()
    }
}

/// Spawn a runtime for `view`. It stops on [`SyncCommand::Shutdown`] or
/// once every handle is dropped, releasing its subscription either way.
pub fn spawn_runtime(
    backend: Arc<dyn SyncBackend>,
    ctx: SyncContext,
    view: ViewSpec,
    config: RuntimeConfig,
) -> RuntimeHandle {
    let (channels, RuntimeEnd { commands, events }) =
        SyncChannels::open(config.command_buffer, config.event_buffer);
    let runtime = ViewRuntime::new(backend, ctx, view, &config, events, commands);
    let snapshot_rx = runtime.snapshot_tx.subscribe();
    tokio::spawn(async move {
        runtime.run().await;
    });

    RuntimeHandle {
        channels,
        snapshot_rx,
    }
}

enum Completion {
    Commit {
        temp_id: String,
        result: Result<Value, BackendError>,
    },
    Page {
        page_index: u32,
        result: Result<HistoryPage, BackendError>,
    },
}

struct ViewRuntime {
    backend: Arc<dyn SyncBackend>,
    ctx: SyncContext,
    view: ViewSpec,
    events: EventPublisher,
    command_rx: mpsc::Receiver<SyncCommand>,
    snapshot_tx: watch::Sender<ViewSnapshot>,
    collection: SyncedCollection,
    queue: OptimisticMutationQueue,
    loader: PaginatedHistoryLoader,
    realtime: RealtimeSyncChannel,
    subscription: Option<SubscriptionHandle>,
    subscription_state: Option<SubscriptionState>,
    generation: u64,
    live_tx: mpsc::UnboundedSender<(u64, ChangeEvent)>,
    live_rx: mpsc::UnboundedReceiver<(u64, ChangeEvent)>,
    status_rx: mpsc::UnboundedReceiver<ChannelStatus>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
}

impl ViewRuntime {
    fn new(
        backend: Arc<dyn SyncBackend>,
        ctx: SyncContext,
        view: ViewSpec,
        config: &RuntimeConfig,
        events: EventPublisher,
        command_rx: mpsc::Receiver<SyncCommand>,
    ) -> Self {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let mut loader = PaginatedHistoryLoader::new(
            ctx.clone(),
            view.scope(),
            config.page_size,
            config.pagination_limit_cap,
        );
        if let Some(accept) = view.entity_filter() {
            loader = loader.with_filter(accept);
        }
        let realtime =
            RealtimeSyncChannel::new(Arc::clone(&backend), config.reconnect).with_status_sink(status_tx);
        let (snapshot_tx, _) = watch::channel(ViewSnapshot {
            has_more: true,
            ..ViewSnapshot::default()
        });

        Self {
            collection: SyncedCollection::new(view.order()),
            queue: OptimisticMutationQueue::new(ctx.clone()),
            backend,
            ctx,
            view,
            events,
            command_rx,
            snapshot_tx,
            loader,
            realtime,
            subscription: None,
            subscription_state: None,
            generation: 0,
            live_tx,
            live_rx,
            status_rx,
            completion_tx,
            completion_rx,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(command) => {
                        if let Err(err) = self.handle_command(command).await {
                            let recoverable = is_recoverable(&err);
                            self.emit(normalize_fatal_error(err, recoverable));
                        }
                    }
                },
                Some((generation, event)) = self.live_rx.recv() => self.handle_live(generation, event),
                Some(status) = self.status_rx.recv() => self.handle_status(status),
                Some(completion) = self.completion_rx.recv() => self.handle_completion(completion),
            }
            self.publish_snapshot();
        }

        self.teardown().await;
        info!(topic = %self.view.filter().topic(), "view runtime stopped");
    }

    async fn handle_command(&mut self, command: SyncCommand) -> Result<(), BackendError> {
        match command {
            SyncCommand::Subscribe => self.handle_subscribe().await,
            SyncCommand::Unsubscribe => {
                self.handle_unsubscribe().await;
                Ok(())
            }
            SyncCommand::LoadInitial => {
                let request = self.loader.begin_initial();
                self.start_page(request);
                Ok(())
            }
            SyncCommand::LoadOlder => {
                let request = self.loader.begin_more();
                self.start_page(request);
                Ok(())
            }
            SyncCommand::Submit { payload, temp_id } => self.handle_submit(payload, temp_id),
            SyncCommand::Shutdown => Ok(()),
        }
    }

    async fn handle_subscribe(&mut self) -> Result<(), BackendError> {
        self.generation += 1;
        let generation = self.generation;
        let live_tx = self.live_tx.clone();
        let handler = move |event: ChangeEvent| {
            let _ = live_tx.send((generation, event));
        };

        match self.realtime.subscribe(self.view.filter(), handler).await {
            Ok(handle) => {
                debug!(topic = %handle.topic(), generation, "view subscribed");
                self.subscription = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.subscription = None;
                Err(err.backend_error().clone())
            }
        }
    }

    async fn handle_unsubscribe(&mut self) {
        // Events already queued for the old subscription are dropped.
        self.generation += 1;
        if let Some(handle) = self.subscription.take() {
            self.realtime.unsubscribe(&handle).await;
        }
    }

    fn handle_submit(
        &mut self,
        payload: EntityPayload,
        temp_id: Option<String>,
    ) -> Result<(), BackendError> {
        let tentative = match temp_id.clone() {
            Some(temp_id) => self.queue.tentative_with_id(temp_id, payload.clone()),
            None => self.queue.tentative(payload.clone()),
        };
        let tentative = match tentative {
            Ok(tentative) => tentative,
            Err(failure) => {
                let temp_id =
                    temp_id.unwrap_or_else(|| format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4()));
                self.reject_submit(temp_id, failure, payload);
                return Ok(());
            }
        };

        let temp_id = tentative.temp_id.clone();
        self.queue
            .apply_optimistic(&mut self.collection, tentative)
            .map_err(queue_error)?;
        let ticket = self.queue.begin_commit(&temp_id).map_err(queue_error)?;
        self.emit(SyncEvent::TentativeApplied {
            temp_id: temp_id.clone(),
        });

        let backend = Arc::clone(&self.backend);
        let ctx = self.ctx.clone();
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = submit_commit(backend.as_ref(), &ctx, &ticket).await;
            let _ = completion_tx.send(Completion::Commit {
                temp_id: ticket.temp_id,
                result,
            });
        });
        Ok(())
    }

    /// Settle a mutation that never reached the collection.
    fn reject_submit(&mut self, temp_id: String, failure: MutationFailure, payload: EntityPayload) {
        warn!(%temp_id, code = failure.code(), "mutation rejected before apply");
        self.ctx.notify(mutation_failure_notice(payload.table()), Severity::Error);
        if let Some(event) = normalize_mutation_failure(&failure) {
            self.emit(event);
        }
        self.emit(SyncEvent::Settled(Settlement::RolledBack {
            temp_id,
            failure,
            restored: payload,
        }));
    }

    fn start_page(&mut self, request: Result<PageRequest, IgnoreReason>) {
        let request = match request {
            Ok(request) => request,
            Err(reason) => {
                debug!(?reason, "history load ignored");
                return;
            }
        };

        let backend = Arc::clone(&self.backend);
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = request.fetch(backend.as_ref()).await;
            let _ = completion_tx.send(Completion::Page {
                page_index: request.page_index,
                result,
            });
        });
    }

    fn handle_live(&mut self, generation: u64, event: ChangeEvent) {
        if generation != self.generation || self.subscription.is_none() {
            trace!(id = %event.entity.id, generation, "dropping change from stale subscription");
            return;
        }
        if !self.view.accepts(&event.entity) {
            trace!(id = %event.entity.id, "change rejected by view");
            return;
        }

        let own_user_id = self.ctx.current_user_id_opt();
        let id = event.entity.id.clone();
        let outcome = match event.kind {
            ChangeKind::Insert => {
                let notice = self.view.live_notice(&event.entity, own_user_id.as_deref());
                let outcome = self
                    .collection
                    .merge_live(event.entity, own_user_id.as_deref());
                if outcome == MergeOutcome::Inserted
                    && let Some((message, severity)) = notice
                {
                    self.ctx.notify(&message, severity);
                }
                outcome
            }
            ChangeKind::Update => self.collection.apply_update(event.entity),
        };

        debug!(%id, ?outcome, "live change merged");
        self.emit(SyncEvent::LiveMerged { id, outcome });
    }

    fn handle_status(&mut self, status: ChannelStatus) {
        if status.state == SubscriptionState::Failed {
            self.ctx.notify("Live updates unavailable", Severity::Error);
        }
        self.subscription_state = Some(status.state);
        self.emit(SyncEvent::ChannelStatus(status));
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Commit { temp_id, result } => {
                match self.queue.settle(&mut self.collection, &temp_id, result) {
                    Ok(settlement) => {
                        if let Settlement::RolledBack { failure, .. } = &settlement
                            && let Some(event) = normalize_mutation_failure(failure)
                        {
                            self.emit(event);
                        }
                        self.emit(SyncEvent::Settled(settlement));
                    }
                    Err(err) => {
                        warn!(%temp_id, error = %err, "settlement failed");
                        self.emit(normalize_fatal_error(queue_error(err), false));
                    }
                }
            }
            Completion::Page { page_index, result } => {
                match self.loader.finish(&mut self.collection, page_index, result) {
                    Ok(LoadOutcome::Loaded {
                        page_index,
                        inserted,
                        has_more,
                    }) => self.emit(SyncEvent::PageLoaded {
                        page_index,
                        inserted,
                        has_more,
                    }),
                    Ok(LoadOutcome::Ignored(reason)) => debug!(?reason, "page completion ignored"),
                    Err(err) => self.emit(SyncEvent::PageLoadFailed {
                        page_index: err.page_index(),
                        code: err.code().to_owned(),
                    }),
                }
            }
        }
    }

    /// Events always follow the snapshot that reflects them.
    fn emit(&self, event: SyncEvent) {
        self.publish_snapshot();
        self.events.publish(event);
    }

    fn publish_snapshot(&self) {
        let items = self.collection.snapshot();
        let unread_count = self
            .view
            .unread_count(items.iter().map(|item| &item.entity));
        self.snapshot_tx.send_replace(ViewSnapshot {
            items,
            has_more: self.loader.has_more(),
            loading_older: self.loader.is_loading(),
            unread_count,
            subscription: self.subscription_state,
        });
    }

    async fn teardown(&mut self) {
        self.generation += 1;
        self.subscription = None;
        self.realtime.unsubscribe_all().await;
        while let Ok(status) = self.status_rx.try_recv() {
            self.subscription_state = Some(status.state);
            self.emit(SyncEvent::ChannelStatus(status));
        }
        self.publish_snapshot();
    }
}

fn is_recoverable(err: &BackendError) -> bool {
    matches!(err.category, ErrorCategory::Network | ErrorCategory::RateLimited)
}

fn queue_error(err: QueueError) -> BackendError {
    let code = match &err {
        QueueError::DuplicateTentative(_) => "duplicate_temp_id",
        QueueError::UnknownTentative(_) => "unknown_temp_id",
        QueueError::CommitInFlight(_) => "commit_in_flight",
        QueueError::Collection(_) => "collection_conflict",
    };
    BackendError::new(ErrorCategory::Config, code, err.to_string())
}
