use serde::{Deserialize, Serialize};

use crate::{error::BackendError, types::ChannelStatus};

/// Lifecycle of one change-feed subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Never subscribed.
    Idle,
    /// Initial subscribe call in flight.
    Subscribing,
    /// Feed established and forwarding events.
    Live,
    /// Feed dropped; reconnect attempts are running.
    Reconnecting,
    /// Torn down by the owner.
    Closed,
    /// Setup failed or reconnect attempts were exhausted.
    Failed,
}

/// Inputs that drive [`SubscriptionStateMachine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Subscribe,
    Established,
    SetupFailed,
    FeedLost,
    RetriesExhausted,
    Unsubscribe,
}

#[derive(Debug, Clone)]
pub struct SubscriptionStateMachine {
    topic: String,
    state: SubscriptionState,
}

impl SubscriptionStateMachine {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            state: SubscriptionState::Idle,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn apply(&mut self, action: SubscriptionAction) -> Result<Vec<ChannelStatus>, BackendError> {
        use SubscriptionState::*;

        match action {
            SubscriptionAction::Subscribe => {
                self.transition_from_any_of(&[Idle, Closed, Failed], Subscribing, "subscribe")
            }
            SubscriptionAction::Established => {
                self.transition_from_any_of(&[Subscribing, Reconnecting], Live, "established")
            }
            SubscriptionAction::SetupFailed => {
                self.transition_from_state(Subscribing, Failed, "setup_failed")
            }
            SubscriptionAction::FeedLost => {
                self.transition_from_state(Live, Reconnecting, "feed_lost")
            }
            SubscriptionAction::RetriesExhausted => {
                self.transition_from_state(Reconnecting, Failed, "retries_exhausted")
            }
            SubscriptionAction::Unsubscribe => {
                if self.state == Closed {
                    Ok(Vec::new())
                } else {
                    self.state = Closed;
                    Ok(vec![self.status()])
                }
            }
        }
    }

    /// Status for the current state without reconnect details.
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            topic: self.topic.clone(),
            state: self.state,
            attempt: None,
            retry_in_ms: None,
        }
    }

    fn transition_from_state(
        &mut self,
        expected: SubscriptionState,
        next: SubscriptionState,
        action: &str,
    ) -> Result<Vec<ChannelStatus>, BackendError> {
        self.transition_from_any_of(&[expected], next, action)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[SubscriptionState],
        next: SubscriptionState,
        action: &str,
    ) -> Result<Vec<ChannelStatus>, BackendError> {
        if !expected.contains(&self.state) {
            return Err(BackendError::invalid_state(self.state, action));
        }
        self.state = next;
        Ok(vec![self.status()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_happy_path_with_reconnect() {
        let mut sm = SubscriptionStateMachine::new("insert:messages");

        sm.apply(SubscriptionAction::Subscribe).expect("subscribe");
        assert_eq!(sm.state(), SubscriptionState::Subscribing);

        sm.apply(SubscriptionAction::Established).expect("established");
        assert_eq!(sm.state(), SubscriptionState::Live);

        sm.apply(SubscriptionAction::FeedLost).expect("feed lost");
        assert_eq!(sm.state(), SubscriptionState::Reconnecting);

        sm.apply(SubscriptionAction::Established).expect("re-established");
        assert_eq!(sm.state(), SubscriptionState::Live);

        let events = sm.apply(SubscriptionAction::Unsubscribe).expect("unsubscribe");
        assert_eq!(sm.state(), SubscriptionState::Closed);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, "insert:messages");
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let mut sm = SubscriptionStateMachine::new("t");
        sm.apply(SubscriptionAction::Subscribe).expect("subscribe");
        sm.apply(SubscriptionAction::Unsubscribe).expect("first");
        let again = sm.apply(SubscriptionAction::Unsubscribe).expect("second");
        assert!(again.is_empty());
        assert_eq!(sm.state(), SubscriptionState::Closed);
    }

    #[test]
    fn rejects_feed_loss_when_not_live() {
        let mut sm = SubscriptionStateMachine::new("t");
        let err = sm
            .apply(SubscriptionAction::FeedLost)
            .expect_err("idle subscription cannot lose a feed");
        assert_eq!(err.code, "invalid_state_transition");
    }

    #[test]
    fn failed_subscription_can_be_retried_by_owner() {
        let mut sm = SubscriptionStateMachine::new("t");
        sm.apply(SubscriptionAction::Subscribe).expect("subscribe");
        sm.apply(SubscriptionAction::SetupFailed).expect("setup failed");
        assert_eq!(sm.state(), SubscriptionState::Failed);

        sm.apply(SubscriptionAction::Subscribe)
            .expect("owner may subscribe again");
        assert_eq!(sm.state(), SubscriptionState::Subscribing);
    }

    #[test]
    fn exhausted_retries_fail_the_subscription() {
        let mut sm = SubscriptionStateMachine::new("t");
        sm.apply(SubscriptionAction::Subscribe).expect("subscribe");
        sm.apply(SubscriptionAction::Established).expect("live");
        sm.apply(SubscriptionAction::FeedLost).expect("lost");
        sm.apply(SubscriptionAction::RetriesExhausted).expect("exhausted");
        assert_eq!(sm.state(), SubscriptionState::Failed);
    }
}
