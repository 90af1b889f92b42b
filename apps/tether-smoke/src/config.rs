//! Environment-backed configuration for `tether-smoke`.

use std::env;

use tether_core::{MAX_PAGE_SIZE, ReconnectPolicy, RuntimeConfig};
use thiserror::Error;

const DEFAULT_USER_ID: &str = "u1";
const DEFAULT_PEER_ID: &str = "u2";
const DEFAULT_CONVERSATION_ID: &str = "c1";
const DEFAULT_SEED_MESSAGES: usize = 45;
const DEFAULT_STEP_TIMEOUT_MS: u64 = 2_000;

/// Scenario and runtime tuning used by the smoke binary.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Signed-in user the scenario acts as.
    pub user_id: String,
    /// Remote participant whose messages are pushed by the backend.
    pub peer_id: String,
    pub conversation_id: String,
    /// History rows seeded before the conversation view opens.
    pub seed_messages: usize,
    /// Upper bound for each scripted step to observe its event.
    pub step_timeout_ms: u64,
    pub runtime: RuntimeConfig,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let defaults = RuntimeConfig::default();
        let default_policy = defaults.reconnect;

        let user_id = trimmed_or("TETHER_USER", DEFAULT_USER_ID, &mut lookup);
        let peer_id = trimmed_or("TETHER_PEER", DEFAULT_PEER_ID, &mut lookup);
        let conversation_id =
            trimmed_or("TETHER_CONVERSATION", DEFAULT_CONVERSATION_ID, &mut lookup);
        if user_id == peer_id {
            return Err(ConfigError::InvalidValue {
                key: "TETHER_PEER",
                value: peer_id,
                reason: "must differ from TETHER_USER".to_owned(),
            });
        }

        let seed_messages = parse_or("TETHER_SEED_MESSAGES", DEFAULT_SEED_MESSAGES, &mut lookup)?;
        let step_timeout_ms =
            parse_or("TETHER_STEP_TIMEOUT_MS", DEFAULT_STEP_TIMEOUT_MS, &mut lookup)?;
        let page_size = parse_or("TETHER_PAGE_SIZE", defaults.page_size, &mut lookup)?;
        let pagination_limit_cap = parse_or(
            "TETHER_PAGINATION_LIMIT_CAP",
            defaults.pagination_limit_cap,
            &mut lookup,
        )?;
        let base_delay_ms = parse_or(
            "TETHER_RECONNECT_BASE_MS",
            default_policy.base_delay_ms(),
            &mut lookup,
        )?;
        let max_delay_ms = parse_or(
            "TETHER_RECONNECT_MAX_MS",
            default_policy.max_delay_ms(),
            &mut lookup,
        )?;
        let max_attempts = parse_or(
            "TETHER_RECONNECT_ATTEMPTS",
            default_policy.max_attempts(),
            &mut lookup,
        )?;
        let event_buffer = parse_or("TETHER_EVENT_BUFFER", defaults.event_buffer, &mut lookup)?;

        if page_size == 0 {
            return Err(at_least_one("TETHER_PAGE_SIZE"));
        }
        if pagination_limit_cap == 0 || pagination_limit_cap > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "TETHER_PAGINATION_LIMIT_CAP",
                value: pagination_limit_cap.to_string(),
                reason: format!("must be between 1 and {MAX_PAGE_SIZE}"),
            });
        }
        if max_delay_ms < base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "TETHER_RECONNECT_MAX_MS",
                value: max_delay_ms.to_string(),
                reason: format!("must be at least TETHER_RECONNECT_BASE_MS ({base_delay_ms})"),
            });
        }
        if event_buffer == 0 {
            return Err(at_least_one("TETHER_EVENT_BUFFER"));
        }

        Ok(Self {
            user_id,
            peer_id,
            conversation_id,
            seed_messages,
            step_timeout_ms,
            runtime: RuntimeConfig {
                page_size,
                pagination_limit_cap,
                reconnect: ReconnectPolicy::new(base_delay_ms, max_delay_ms, max_attempts),
                event_buffer,
                ..defaults
            },
        })
    }
}

/// Errors produced while parsing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed or is out of range.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn at_least_one(key: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: "0".to_owned(),
        reason: "must be at least 1".to_owned(),
    }
}

fn trimmed_or<F>(key: &'static str, default: &str, lookup: &mut F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_owned())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };
    value
        .trim()
        .parse::<T>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            reason: err.to_string(),
            value,
        })
}
