//! Session and user-notification boundaries.
//!
//! The sync core never reaches for ambient state: the current user comes from a
//! [`SessionProvider`] and every user-visible message goes through a
//! [`NotificationSink`]. Both are handed to components explicitly.

use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no active session")]
    SignedOut,
    #[error("session provider failure: {0}")]
    Backend(String),
}

/// Source of the authenticated user identity.
pub trait SessionProvider: Send + Sync {
    /// Current user id, or [`SessionError::SignedOut`] once the session was invalidated.
    fn current_user_id(&self) -> Result<String, SessionError>;
}

#[derive(Clone, Default)]
pub struct InMemorySessionProvider {
    user_id: Arc<RwLock<Option<String>>>,
}

impl InMemorySessionProvider {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Arc::new(RwLock::new(Some(user_id.into()))),
        }
    }

    pub fn sign_in(&self, user_id: impl Into<String>) -> Result<(), SessionError> {
        let mut guard = self
            .user_id
            .write()
            .map_err(|_| SessionError::Backend("poisoned lock".to_owned()))?;
        *guard = Some(user_id.into());
        Ok(())
    }

    pub fn sign_out(&self) -> Result<(), SessionError> {
        let mut guard = self
            .user_id
            .write()
            .map_err(|_| SessionError::Backend("poisoned lock".to_owned()))?;
        *guard = None;
        Ok(())
    }
}

impl SessionProvider for InMemorySessionProvider {
    fn current_user_id(&self) -> Result<String, SessionError> {
        let guard = self
            .user_id
            .read()
            .map_err(|_| SessionError::Backend("poisoned lock".to_owned()))?;
        guard.clone().ok_or(SessionError::SignedOut)
    }
}

/// Severity attached to a user-facing notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Info,
    Error,
}

/// Fire-and-forget sink for transient, dismissible user notifications.
///
/// Display, queuing and dismissal belong to the implementation.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Routes notifications into the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Success | Severity::Info => info!(target: "tether::notify", %message, ?severity),
            Severity::Error => warn!(target: "tether::notify", %message, ?severity),
        }
    }
}

/// Keeps every notification in memory, in delivery order.
#[derive(Clone, Default)]
pub struct RecordingNotificationSink {
    entries: Arc<Mutex<Vec<(String, Severity)>>>,
}

impl RecordingNotificationSink {
    pub fn entries(&self) -> Vec<(String, Severity)> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn messages_with(&self, severity: Severity) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(_, s)| *s == severity)
            .map(|(message, _)| message)
            .collect()
    }
}

impl NotificationSink for RecordingNotificationSink {
    fn notify(&self, message: &str, severity: Severity) {
        match self.entries.lock() {
            Ok(mut entries) => entries.push((message.to_owned(), severity)),
            Err(_) => error!(%message, "notification recorder lock poisoned"),
        }
    }
}
