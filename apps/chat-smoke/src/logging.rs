//! Tracing setup for the smoke binary.

use std::env;

use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,chat_smoke=debug,chat_runtime=debug,chat_core=info";

/// Install the global subscriber.
///
/// Filter precedence:
/// 1) `RUST_LOG`
/// 2) `CHAT_SMOKE_LOG`
/// 3) `CHAT_LOG`
/// 4) built-in default
pub fn init() {
    let _ = tracing_subscriber::fmt()
        .with_target(true)
        .with_thread_names(true)
        .with_env_filter(filter_from_env())
        .try_init();
}

fn filter_from_env() -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }

    ["CHAT_SMOKE_LOG", "CHAT_LOG"]
        .into_iter()
        .filter_map(|key| env::var(key).ok())
        .filter(|value| !value.trim().is_empty())
        .find_map(|value| EnvFilter::try_new(value).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}
