//! Command and event plumbing between a view handle and its runtime task.
//!
//! [`SyncChannels::open`] splits one link into the view's side, which is
//! cloned into every handle, and a [`RuntimeEnd`] moved into the runtime.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::types::{SyncCommand, SyncEvent};

/// Receiver a view reads runtime events from.
pub type EventStream = broadcast::Receiver<SyncEvent>;

#[derive(Debug, Error)]
pub enum SyncChannelError {
    /// The runtime has stopped and dropped its command receiver.
    #[error("runtime is no longer accepting commands")]
    CommandChannelClosed,
}

/// The view's side of a runtime link.
#[derive(Clone, Debug)]
pub struct SyncChannels {
    commands: mpsc::Sender<SyncCommand>,
    events: broadcast::Sender<SyncEvent>,
}

/// The runtime's side. `commands` yields `None` once every
/// [`SyncChannels`] clone is gone.
#[derive(Debug)]
pub struct RuntimeEnd {
    pub commands: mpsc::Receiver<SyncCommand>,
    pub events: EventPublisher,
}

/// Publishing half of the event stream, owned by the runtime.
#[derive(Debug)]
pub struct EventPublisher {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventPublisher {
    /// Deliver `event` to every current subscriber and return how many got it.
    /// Views that subscribe later never see it.
    pub fn publish(&self, event: SyncEvent) -> usize {
        match self.tx.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                trace!(?event, "no event subscribers");
                0
            }
        }
    }
}

impl SyncChannels {
    /// Buffers are clamped to at least one slot.
    pub fn open(command_buffer: usize, event_buffer: usize) -> (Self, RuntimeEnd) {
        let (commands, command_rx) = mpsc::channel(command_buffer.max(1));
        let (events, _) = broadcast::channel(event_buffer.max(1));
        let publisher = EventPublisher { tx: events.clone() };

        (
            Self { commands, events },
            RuntimeEnd {
                commands: command_rx,
                events: publisher,
            },
        )
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    /// Waits for buffer space; fails only once the runtime has stopped.
    pub async fn send_command(&self, command: SyncCommand) -> Result<(), SyncChannelError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncChannelError::CommandChannelClosed)
    }
}
