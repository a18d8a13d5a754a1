//! Environment-backed configuration for `chat-smoke`.

use std::env;

use chat_core::RuntimeConfig;
use thiserror::Error;

const DEFAULT_SEED_MESSAGES: usize = 45;
const DEFAULT_MESSAGE: &str = "Hello from chat-smoke";

/// Runtime configuration used by the smoke run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeConfig {
    /// Tuning forwarded to the chat session.
    pub runtime: RuntimeConfig,
    /// Records seeded into the shared conversation before the run.
    pub seed_messages: usize,
    /// Text sent once the shared conversation is live.
    pub message: String,
    /// When set, a direct conversation with this user is ensured as well.
    pub direct_target: Option<String>,
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

        let page_size = parse_or("CHAT_PAGE_SIZE", defaults.page_size, &mut lookup)?;
        let auto_reattach =
            parse_bool_or("CHAT_AUTO_REATTACH", defaults.auto_reattach, &mut lookup)?;
        let reattach_base_delay_ms = parse_or(
            "CHAT_REATTACH_BASE_DELAY_MS",
            defaults.reattach_base_delay_ms,
            &mut lookup,
        )?;
        let reattach_max_delay_ms = parse_or(
            "CHAT_REATTACH_MAX_DELAY_MS",
            defaults.reattach_max_delay_ms,
            &mut lookup,
        )?;
        let event_buffer = parse_or("CHAT_EVENT_BUFFER", defaults.event_buffer, &mut lookup)?;
        let seed_messages =
            parse_or("CHAT_SMOKE_SEED_MESSAGES", DEFAULT_SEED_MESSAGES, &mut lookup)?;
        let message = optional_trimmed_env("CHAT_SMOKE_MESSAGE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_MESSAGE.to_owned());
        let direct_target = optional_trimmed_env("CHAT_SMOKE_DIRECT_TARGET", &mut lookup);

        if page_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_PAGE_SIZE",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_EVENT_BUFFER",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if reattach_max_delay_ms < reattach_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "CHAT_REATTACH_MAX_DELAY_MS",
                value: reattach_max_delay_ms.to_string(),
                reason: format!("must not be below the base delay of {reattach_base_delay_ms}ms"),
            });
        }

        Ok(Self {
            runtime: RuntimeConfig {
                page_size,
                auto_reattach,
                reattach_base_delay_ms,
                reattach_max_delay_ms,
                event_buffer,
            },
            seed_messages,
            message,
            direct_target,
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_bool_or<F>(key: &'static str, default: bool, lookup: &mut F) -> Result<bool, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected true or false".to_owned(),
        }),
    }
}
