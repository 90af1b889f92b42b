//! Scripted conversation session against the in-memory backend: history
//! paging, a confirmed send, a rolled-back send, a remote message and a
//! change-feed reconnect, then shutdown.

mod config;
mod logging;

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tether_core::{
    BackendError, EntityPayload, MergeOutcome, Settlement, SubscriptionState, SyncChannelError,
    SyncCommand, SyncContext, SyncEvent, Table,
};
use tether_platform::{InMemorySessionProvider, TracingNotificationSink};
use tether_runtime::{InMemoryBackend, RuntimeHandle, ViewSpec, spawn_runtime};
use thiserror::Error;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::timeout,
};
use tracing::{error, info};

use crate::config::{ConfigError, SmokeConfig};

#[derive(Debug, Error)]
enum SmokeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Channel(#[from] SyncChannelError),
    #[error("event stream failed during {step}: {source}")]
    Events {
        step: &'static str,
        source: RecvError,
    },
    #[error("timed out waiting for {step}")]
    Timeout { step: &'static str },
    #[error("unexpected outcome for {step}: {detail}")]
    Unexpected { step: &'static str, detail: String },
}

struct Session {
    handle: RuntimeHandle,
    events: broadcast::Receiver<SyncEvent>,
    step_timeout: Duration,
}

impl Session {
    async fn send(&self, command: SyncCommand) -> Result<(), SmokeError> {
        Ok(self.handle.send(command).await?)
    }

    /// Wait for the first event accepted by `select`, skipping the rest.
    async fn wait_for<T>(
        &mut self,
        step: &'static str,
        mut select: impl FnMut(SyncEvent) -> Option<T>,
    ) -> Result<T, SmokeError> {
        let events = &mut self.events;
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Some(found) = select(event) {
                            return Ok(found);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        info!(step, skipped, "event stream lagged");
                    }
                    Err(source) => return Err(SmokeError::Events { step, source }),
                }
            }
        };
        timeout(self.step_timeout, wait)
            .await
            .map_err(|_| SmokeError::Timeout { step })?
    }

    async fn wait_for_state(
        &mut self,
        step: &'static str,
        state: SubscriptionState,
    ) -> Result<(), SmokeError> {
        self.wait_for(step, |event| match event {
            SyncEvent::ChannelStatus(status) if status.state == state => Some(()),
            _ => None,
        })
        .await
    }
}

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(err) = run().await {
        error!(error = %err, "smoke run failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SmokeError> {
    let config = SmokeConfig::from_env()?;
    info!(
        user = %config.user_id,
        conversation = %config.conversation_id,
        page_size = config.runtime.page_size,
        "starting smoke session"
    );

    let backend = Arc::new(InMemoryBackend::new());
    backend.seed_messages(&config.conversation_id, &config.peer_id, config.seed_messages)?;

    let ctx = SyncContext::new(
        Arc::new(InMemorySessionProvider::signed_in(config.user_id.clone())),
        Arc::new(TracingNotificationSink),
    );
    let view = ViewSpec::Conversation {
        conversation_id: config.conversation_id.clone(),
    };
    let handle = spawn_runtime(backend.clone(), ctx, view, config.runtime);
    let mut session = Session {
        events: handle.subscribe(),
        handle,
        step_timeout: Duration::from_millis(config.step_timeout_ms),
    };

    session.send(SyncCommand::Subscribe).await?;
    session.wait_for_state("subscribe", SubscriptionState::Live).await?;

    session.send(SyncCommand::LoadInitial).await?;
    let mut pages = 0;
    loop {
        let has_more = session
            .wait_for("history page", |event| match event {
                SyncEvent::PageLoaded {
                    page_index,
                    inserted,
                    has_more,
                } => {
                    info!(page_index, inserted, has_more, "history page loaded");
                    Some(Ok(has_more))
                }
                SyncEvent::PageLoadFailed { page_index, code } => Some(Err(format!(
                    "page {page_index} failed with {code}"
                ))),
                _ => None,
            })
            .await?
            .map_err(|detail| SmokeError::Unexpected {
                step: "history page",
                detail,
            })?;
        pages += 1;
        if !has_more {
            break;
        }
        session.send(SyncCommand::LoadOlder).await?;
    }
    let loaded = session.handle.snapshot().items.len();
    if loaded != config.seed_messages {
        return Err(SmokeError::Unexpected {
            step: "history",
            detail: format!("loaded {loaded} of {} messages", config.seed_messages),
        });
    }
    info!(pages, loaded, "history exhausted");

    let message = |text: &str| EntityPayload::Message {
        conversation_id: config.conversation_id.clone(),
        text: text.to_owned(),
    };

    session
        .send(SyncCommand::Submit {
            payload: message("hello from smoke"),
            temp_id: None,
        })
        .await?;
    let settlement = session
        .wait_for("confirmed send", |event| match event {
            SyncEvent::Settled(settlement) => Some(settlement),
            _ => None,
        })
        .await?;
    match settlement {
        Settlement::Confirmed { temp_id, entity } => {
            info!(%temp_id, id = %entity.id, "send confirmed");
        }
        other => {
            return Err(SmokeError::Unexpected {
                step: "confirmed send",
                detail: format!("{other:?}"),
            });
        }
    }

    backend.fail_next_insert(BackendError::network("scripted outage"));
    session
        .send(SyncCommand::Submit {
            payload: message("this one fails"),
            temp_id: None,
        })
        .await?;
    let restored = session
        .wait_for("rolled back send", |event| match event {
            SyncEvent::Settled(Settlement::RolledBack { restored, .. }) => Some(restored),
            _ => None,
        })
        .await?;
    info!(restored = ?restored.text(), "send rolled back");

    backend.push_remote(
        Table::Messages,
        json!({
            "conversation_id": config.conversation_id,
            "sender_id": config.peer_id,
            "text": "reply from peer",
        }),
    )?;
    // The confirmed send's own echo merges as a duplicate or adoption.
    let merged = session
        .wait_for("remote message", |event| match event {
            SyncEvent::LiveMerged {
                id,
                outcome: MergeOutcome::Inserted,
            } => Some(id),
            _ => None,
        })
        .await?;
    info!(id = %merged, "remote message merged");

    backend.sever_feeds();
    session
        .wait_for_state("reconnect", SubscriptionState::Reconnecting)
        .await?;
    session.wait_for_state("reconnect", SubscriptionState::Live).await?;

    session.send(SyncCommand::Shutdown).await?;
    session
        .wait_for_state("shutdown", SubscriptionState::Closed)
        .await?;

    let snapshot = session.handle.snapshot();
    info!(
        items = snapshot.items.len(),
        pending = snapshot.items.iter().filter(|item| item.pending).count(),
        released_feeds = backend.released_feeds().len(),
        "smoke session complete"
    );
    Ok(())
}
