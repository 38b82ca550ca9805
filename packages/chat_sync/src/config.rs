//! Client configuration, figment-deserialized from defaults / config.toml /
//! env vars.
//!
//! Three equivalent ways to configure:
//!
//!   config.toml:     [reconnect]
//!                    max_attempts = 5
//!
//!   env var:         CHAT_RECONNECT__MAX_ATTEMPTS=5   (double underscore = nesting)
//!
//!   (single underscore stays within field names: CHAT_TYPING__IDLE_TIMEOUT_MS)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ReconnectConfig;

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub reconnect: ReconnectFileConfig,
    #[serde(default)]
    pub typing: TypingFileConfig,
}

/// Endpoint addresses (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            api_url: default_api_url(),
        }
    }
}

/// Reconnection tunables (lives under `[reconnect]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconnectFileConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectFileConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

/// Typing/presence tunables (lives under `[typing]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TypingFileConfig {
    /// Idle period after which a typing session auto-stops.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// TTL for remote typing signals without a refresh.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// How often expired typing entries and idle sessions are swept.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for TypingFileConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
            ttl_ms: default_ttl_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

fn default_ws_url() -> String {
    "ws://localhost:8000/ws".to_string()
}
fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    5
}
fn default_idle_timeout_ms() -> u64 {
    3000
}
fn default_ttl_ms() -> u64 {
    5000
}
fn default_sweep_interval_ms() -> u64 {
    1000
}

/// Build a figment that layers: defaults → config.toml → CHAT_* env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CHAT_").split("__"))
}

/// Resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    pub ws_url: String,
    pub api_url: String,
    pub reconnect: ReconnectConfig,
    pub typing: TypingConfig,
}

#[derive(Clone, Debug)]
pub struct TypingConfig {
    pub idle_timeout: Duration,
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl SyncConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            ws_url: fc.server.ws_url.clone(),
            api_url: fc.server.api_url.clone(),
            reconnect: ReconnectConfig {
                base_delay: Duration::from_millis(fc.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(fc.reconnect.max_delay_ms),
                max_attempts: fc.reconnect.max_attempts,
            },
            typing: TypingConfig {
                idle_timeout: Duration::from_millis(fc.typing.idle_timeout_ms),
                ttl: Duration::from_millis(fc.typing.ttl_ms),
                sweep_interval: Duration::from_millis(fc.typing.sweep_interval_ms),
            },
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_file(&FileConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = SyncConfig::default();
        assert_eq!(config.reconnect.base_delay, Duration::from_millis(1000));
        assert_eq!(config.reconnect.max_delay, Duration::from_millis(30_000));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.typing.idle_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[reconnect]\nmax_attempts = 9\n\n[server]\nws_url = \"ws://example:9000/ws\"\n",
        )
        .unwrap();

        let fc: FileConfig = load_config(dir.path()).extract().unwrap();
        assert_eq!(fc.reconnect.max_attempts, 9);
        assert_eq!(fc.server.ws_url, "ws://example:9000/ws");
        // Untouched sections keep their defaults.
        assert_eq!(fc.typing.idle_timeout_ms, 3000);
    }
}
