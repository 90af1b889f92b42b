use std::{collections::HashMap, sync::Arc};

use rand::{SeedableRng, rngs::StdRng};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::{
    backend::{ChangeFeed, RawChange, SyncBackend},
    error::ChannelError,
    normalization::decode_change,
    retry::ReconnectPolicy,
    state_machine::{SubscriptionAction, SubscriptionStateMachine},
    types::{ChangeEvent, ChannelStatus, ResourceFilter},
};

/// Receives decoded change events for one subscription.
pub trait ChangeHandler: Send + Sync + 'static {
    fn handle(&self, event: ChangeEvent);
}

impl<F> ChangeHandler for F
where
    F: Fn(ChangeEvent) + Send + Sync + 'static,
{
    fn handle(&self, event: ChangeEvent) {
        self(event)
    }
}

/// Caller-side token for one live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    filter: ResourceFilter,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn filter(&self) -> &ResourceFilter {
        &self.filter
    }

    pub fn topic(&self) -> String {
        self.filter.topic()
    }
}

struct ActiveSubscription {
    handle_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the change-feed subscriptions of one view.
///
/// At most one feed is live per [`ResourceFilter`]. Each feed runs in a
/// forwarding task that decodes deliveries, hands matching ones to the
/// handler, and re-establishes the feed per [`ReconnectPolicy`] if it drops
/// after going live.
pub struct RealtimeSyncChannel {
    backend: Arc<dyn SyncBackend>,
    policy: ReconnectPolicy,
    status_tx: Option<mpsc::UnboundedSender<ChannelStatus>>,
    active: HashMap<ResourceFilter, ActiveSubscription>,
    next_handle_id: u64,
}

impl RealtimeSyncChannel {
    pub fn new(backend: Arc<dyn SyncBackend>, policy: ReconnectPolicy) -> Self {
        Self {
            backend,
            policy,
            status_tx: None,
            active: HashMap::new(),
            next_handle_id: 1,
        }
    }

    /// Report lifecycle transitions of every subscription on `status_tx`.
    pub fn with_status_sink(mut self, status_tx: mpsc::UnboundedSender<ChannelStatus>) -> Self {
        self.status_tx = Some(status_tx);
        self
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, handle: &SubscriptionHandle) -> bool {
        self.active
            .get(&handle.filter)
            .is_some_and(|active| active.handle_id == handle.id)
    }

    /// Open a subscription. An existing subscription for the same filter is
    /// torn down first.
    pub async fn subscribe<H: ChangeHandler>(
        &mut self,
        filter: ResourceFilter,
        handler: H,
    ) -> Result<SubscriptionHandle, ChannelError> {
        if let Some(previous) = self.active.remove(&filter) {
            debug!(topic = %filter.topic(), "replacing existing subscription");
            Self::stop(previous).await;
        }

        let topic = filter.topic();
        let mut machine = SubscriptionStateMachine::new(topic.clone());
        let statuses = machine
            .apply(SubscriptionAction::Subscribe)
            .map_err(|source| ChannelError::InvalidState {
                topic: topic.clone(),
                source,
            })?;
        self.publish(statuses);

        let feed = match self.backend.subscribe_changes(&filter).await {
            Ok(feed) => feed,
            Err(source) => {
                warn!(%topic, code = %source.code, "subscription setup failed");
                if let Ok(statuses) = machine.apply(SubscriptionAction::SetupFailed) {
                    self.publish(statuses);
                }
                return Err(ChannelError::SetupFailed { topic, source });
            }
        };

        let statuses = machine
            .apply(SubscriptionAction::Established)
            .map_err(|source| ChannelError::InvalidState {
                topic: topic.clone(),
                source,
            })?;
        self.publish(statuses);
        debug!(%topic, feed = feed.id.0, "subscription live");

        let handle_id = self.next_handle_id;
        self.next_handle_id += 1;

        let cancel = CancellationToken::new();
        let forwarder = Forwarder {
            backend: Arc::clone(&self.backend),
            filter: filter.clone(),
            policy: self.policy,
            status_tx: self.status_tx.clone(),
            cancel: cancel.clone(),
            handler: Arc::new(handler),
            machine,
        };
        let task = tokio::spawn(forwarder.run(feed));

        self.active.insert(
            filter.clone(),
            ActiveSubscription {
                handle_id,
                cancel,
                task,
            },
        );
        Ok(SubscriptionHandle {
            id: handle_id,
            filter,
        })
    }

    /// Stop delivery and release the backend feed. Safe to call repeatedly.
    pub async fn unsubscribe(&mut self, handle: &SubscriptionHandle) {
        let owned = self
            .active
            .get(&handle.filter)
            .is_some_and(|active| active.handle_id == handle.id);
        if !owned {
            trace!(topic = %handle.topic(), "unsubscribe for inactive handle ignored");
            return;
        }
        if let Some(active) = self.active.remove(&handle.filter) {
            Self::stop(active).await;
        }
    }

    pub async fn unsubscribe_all(&mut self) {
        for (_, active) in self.active.drain() {
            Self::stop(active).await;
        }
    }

    async fn stop(active: ActiveSubscription) {
        active.cancel.cancel();
        if let Err(err) = active.task.await
            && err.is_panic()
        {
            error!("subscription forwarder panicked");
        }
    }

    fn publish(&self, statuses: Vec<ChannelStatus>) {
        publish(self.status_tx.as_ref(), statuses);
    }
}

impl Drop for RealtimeSyncChannel {
    fn drop(&mut self) {
        for active in self.active.values() {
            active.cancel.cancel();
        }
    }
}

fn publish(status_tx: Option<&mpsc::UnboundedSender<ChannelStatus>>, statuses: Vec<ChannelStatus>) {
    let Some(tx) = status_tx else {
        return;
    };
    for status in statuses {
        let _ = tx.send(status);
    }
}

struct Forwarder {
    backend: Arc<dyn SyncBackend>,
    filter: ResourceFilter,
    policy: ReconnectPolicy,
    status_tx: Option<mpsc::UnboundedSender<ChannelStatus>>,
    cancel: CancellationToken,
    handler: Arc<dyn ChangeHandler>,
    machine: SubscriptionStateMachine,
}

impl Forwarder {
    async fn run(mut self, mut feed: ChangeFeed) {
        loop {
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        self.close(feed).await;
                        return;
                    }
                    change = feed.changes.recv() => match change {
                        Some(raw) => self.deliver(raw),
                        None => break,
                    },
                }
            }

            warn!(topic = %self.machine.topic(), feed = feed.id.0, "change feed dropped");
            self.backend.unsubscribe(feed.id).await;
            match self.reconnect().await {
                Some(next) => feed = next,
                None => return,
            }
        }
    }

    fn deliver(&self, raw: RawChange) {
        if self.cancel.is_cancelled() {
            trace!(topic = %self.machine.topic(), "dropping change delivered after unsubscribe");
            return;
        }
        if raw.kind != self.filter.change || raw.table != self.filter.scope.table {
            trace!(topic = %self.machine.topic(), "change for another resource ignored");
            return;
        }

        match decode_change(raw.kind, raw.table, &raw.row) {
            Ok(event) if self.filter.matches(&event) => {
                trace!(topic = %self.machine.topic(), id = %event.entity.id, "forwarding change");
                self.handler.handle(event);
            }
            Ok(event) => {
                trace!(topic = %self.machine.topic(), id = %event.entity.id, "change outside filter ignored");
            }
            Err(err) => {
                warn!(topic = %self.machine.topic(), error = %err, "dropping undecodable change");
            }
        }
    }

    async fn reconnect(&mut self) -> Option<ChangeFeed> {
        self.transition(SubscriptionAction::FeedLost);

        let mut rng = StdRng::from_os_rng();
        let mut retry_hint = None;
        let mut attempt = 0;
        while self.policy.allows_attempt(attempt) {
            let delay = self.policy.jittered_delay(attempt, retry_hint, &mut rng);
            let mut status = self.machine.status();
            status.attempt = Some(attempt + 1);
            status.retry_in_ms = Some(delay.as_millis() as u64);
            publish(self.status_tx.as_ref(), vec![status]);
            warn!(
                topic = %self.machine.topic(),
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "reconnecting change feed"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.transition(SubscriptionAction::Unsubscribe);
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.backend.subscribe_changes(&self.filter).await {
                Ok(feed) => {
                    if self.cancel.is_cancelled() {
                        self.close(feed).await;
                        return None;
                    }
                    self.transition(SubscriptionAction::Established);
                    debug!(topic = %self.machine.topic(), feed = feed.id.0, "change feed re-established");
                    return Some(feed);
                }
                Err(err) => {
                    warn!(topic = %self.machine.topic(), code = %err.code, "reconnect attempt failed");
                    retry_hint = err.retry_after_ms;
                    attempt += 1;
                }
            }
        }

        error!(topic = %self.machine.topic(), attempts = attempt, "reconnect attempts exhausted");
        self.transition(SubscriptionAction::RetriesExhausted);
        None
    }

    async fn close(&mut self, feed: ChangeFeed) {
        self.backend.unsubscribe(feed.id).await;
        self.transition(SubscriptionAction::Unsubscribe);
    }

    fn transition(&mut self, action: SubscriptionAction) {
        match self.machine.apply(action) {
            Ok(statuses) => publish(self.status_tx.as_ref(), statuses),
            Err(err) => warn!(topic = %self.machine.topic(), code = %err.code, "ignored subscription transition"),
        }
    }
}
