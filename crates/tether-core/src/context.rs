use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use chrono::Utc;
use tether_platform::{NotificationSink, SessionError, SessionProvider, Severity};

use crate::error::BackendError;

/// Wall clock used to stamp tentative entities.
pub trait Clock: Send + Sync {
    /// Milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
    }
}

/// Settable clock for tests and scripted runs.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by_ms: u64) -> u64 {
        self.now_ms.fetch_add(by_ms, Ordering::SeqCst) + by_ms
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Collaborators handed to every component at construction.
#[derive(Clone)]
pub struct SyncContext {
    session: Arc<dyn SessionProvider>,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
}

impl SyncContext {
    pub fn new(session: Arc<dyn SessionProvider>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self::with_clock(session, notifier, Arc::new(SystemClock))
    }

    pub fn with_clock(
        session: Arc<dyn SessionProvider>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session,
            notifier,
            clock,
        }
    }

    pub fn session(&self) -> &dyn SessionProvider {
        self.session.as_ref()
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Current user id, with session failures mapped to backend errors.
    pub fn current_user_id(&self) -> Result<String, BackendError> {
        self.session.current_user_id().map_err(|err| match err {
            SessionError::SignedOut => BackendError::unauthorized("no active session"),
            SessionError::Backend(message) => BackendError::unauthorized(message),
        })
    }

    /// Current user id, or `None` when signed out.
    pub fn current_user_id_opt(&self) -> Option<String> {
        self.session.current_user_id().ok()
    }

    pub fn notify(&self, message: &str, severity: Severity) {
        self.notifier.notify(message, severity);
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("now_ms", &self.clock.now_ms())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tether_platform::{InMemorySessionProvider, RecordingNotificationSink};

    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn maps_signed_out_session_to_auth_error() {
        let session = InMemorySessionProvider::default();
        let ctx = SyncContext::new(
            Arc::new(session.clone()),
            Arc::new(RecordingNotificationSink::default()),
        );

        let err = ctx.current_user_id().expect_err("signed out");
        assert_eq!(err.category, ErrorCategory::Auth);
        assert_eq!(ctx.current_user_id_opt(), None);

        session.sign_in("u1").expect("sign in");
        assert_eq!(ctx.current_user_id().expect("signed in"), "u1");
    }

    #[test]
    fn routes_notifications_to_sink() {
        let sink = RecordingNotificationSink::default();
        let ctx = SyncContext::new(
            Arc::new(InMemorySessionProvider::signed_in("u1")),
            Arc::new(sink.clone()),
        );
        ctx.notify("Failed to send message", Severity::Error);
        assert_eq!(
            sink.messages_with(Severity::Error),
            vec!["Failed to send message".to_owned()]
        );
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.advance(500), 1_500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }
}
