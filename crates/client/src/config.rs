//! Chat client configuration from environment variables.

use std::str::FromStr;
use std::time::Duration;

use supportdesk_shared::{channel_url, ChannelIdentity, ChatError};
use url::Url;

use crate::backoff::ReconnectConfig;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_WS_PATH: &str = "/chat/ws";
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// HTTP(S) base of the chat backend; the channel uses the matching ws scheme.
    pub api_base_url: String,
    /// Path of the chat endpoint under the base URL.
    pub ws_path: String,
    pub reconnect: ReconnectConfig,
    /// Interval between keepalive frames while the connection is open.
    pub keepalive_interval: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            reconnect: ReconnectConfig::default(),
            keepalive_interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
        }
    }
}

impl ChatConfig {
    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SUPPORTDESK_API_BASE_URL`: backend base URL (default: "http://localhost:8080")
    /// - `SUPPORTDESK_WS_PATH`: chat endpoint path (default: "/chat/ws")
    /// - `SUPPORTDESK_MAX_RECONNECT_ATTEMPTS`: attempts per outage (default: 5)
    /// - `SUPPORTDESK_KEEPALIVE_SECS`: keepalive interval (default: 30)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let api_base_url = std::env::var("SUPPORTDESK_API_BASE_URL")
            .unwrap_or_else(|_| defaults.api_base_url.clone());
        let ws_path =
            std::env::var("SUPPORTDESK_WS_PATH").unwrap_or_else(|_| defaults.ws_path.clone());

        let max_attempts = env_parse(
            "SUPPORTDESK_MAX_RECONNECT_ATTEMPTS",
            defaults.reconnect.max_attempts,
        );
        let keepalive_secs = env_parse("SUPPORTDESK_KEEPALIVE_SECS", DEFAULT_KEEPALIVE_SECS);

        Self {
            api_base_url,
            ws_path,
            reconnect: ReconnectConfig {
                max_attempts,
                ..defaults.reconnect
            },
            keepalive_interval: Duration::from_secs(keepalive_secs.max(1)),
        }
    }

    /// Channel URL for `identity`.
    pub fn channel_url(&self, identity: &ChannelIdentity) -> Result<Url, ChatError> {
        channel_url(&self.api_base_url, &self.ws_path, identity)
    }
}

fn env_parse<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            crate::log_warn!("{key}={raw:?} is not valid, using {default}");
            default
        }),
        Err(_) => default,
    }
}
