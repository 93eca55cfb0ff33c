use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::transport::state::ReconnectPolicy;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [transport]
//                    ping_interval_secs = 20
//
//   env var:         CREW_TRANSPORT__PING_INTERVAL_SECS=20   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub transport: TransportFileConfig,
}

/// Session defaults (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Orchestrator websocket endpoint, e.g. `ws://127.0.0.1:8700`.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Default crew to address when the CLI is given none.
    #[serde(default)]
    pub crew_id: Option<String>,
    /// Default single agent to address.
    #[serde(default)]
    pub agent_id: Option<String>,
    /// Model override forwarded with every request.
    #[serde(default)]
    pub model: Option<String>,
}

/// Transport tunables (lives under `[transport]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransportFileConfig {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Grace beyond the ping interval before a missing pong counts as a
    /// liveness failure.
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_growth")]
    pub reconnect_growth: f64,
    #[serde(default = "default_reconnect_max_delay_secs")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    #[serde(default = "default_reconnect_jitter_ms")]
    pub reconnect_jitter_ms: u64,
    /// Maximum envelopes buffered while disconnected; further sends fail.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
}

impl Default for TransportFileConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
            reconnect_base_ms: default_reconnect_base_ms(),
            reconnect_growth: default_reconnect_growth(),
            reconnect_max_delay_secs: default_reconnect_max_delay_secs(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_jitter_ms: default_reconnect_jitter_ms(),
            queue_limit: default_queue_limit(),
        }
    }
}

fn default_ping_interval_secs() -> u64 {
    20
}
fn default_pong_timeout_secs() -> u64 {
    10
}
fn default_reconnect_base_ms() -> u64 {
    500
}
fn default_reconnect_growth() -> f64 {
    2.0
}
fn default_reconnect_max_delay_secs() -> u64 {
    30
}
fn default_reconnect_max_attempts() -> u32 {
    10
}
fn default_reconnect_jitter_ms() -> u64 {
    250
}
fn default_queue_limit() -> usize {
    1024
}

/// Resolved transport configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub queue_limit: usize,
}

impl ChannelConfig {
    pub fn from_file(fc: &TransportFileConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(fc.ping_interval_secs),
            pong_timeout: Duration::from_secs(fc.pong_timeout_secs),
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(fc.reconnect_base_ms),
                growth: fc.reconnect_growth,
                max_delay: Duration::from_secs(fc.reconnect_max_delay_secs),
                max_attempts: fc.reconnect_max_attempts,
                jitter: Duration::from_millis(fc.reconnect_jitter_ms),
            },
            queue_limit: fc.queue_limit,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_file(&TransportFileConfig::default())
    }
}

/// Build a figment that layers: defaults → config.toml → CREW_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CREW_TRANSPORT__QUEUE_LIMIT=256`  →  `transport.queue_limit = 256`
///   `CREW_SESSION__ENDPOINT=ws://…`    →  `session.endpoint = "ws://…"`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("CREW_").split("__"))
}

/// Default data directory: `~/.crewlink`.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".crewlink")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_file_config_defaults() {
        let d = TransportFileConfig::default();
        assert_eq!(d.ping_interval_secs, 20);
        assert_eq!(d.pong_timeout_secs, 10);
        assert_eq!(d.reconnect_base_ms, 500);
        assert_eq!(d.reconnect_max_attempts, 10);
        assert_eq!(d.queue_limit, 1024);
    }

    #[test]
    fn test_channel_config_from_file() {
        let fc = TransportFileConfig {
            ping_interval_secs: 5,
            pong_timeout_secs: 2,
            reconnect_base_ms: 100,
            reconnect_growth: 3.0,
            reconnect_max_delay_secs: 7,
            reconnect_max_attempts: 4,
            reconnect_jitter_ms: 50,
            queue_limit: 16,
        };
        let cc = ChannelConfig::from_file(&fc);
        assert_eq!(cc.ping_interval, Duration::from_secs(5));
        assert_eq!(cc.pong_timeout, Duration::from_secs(2));
        assert_eq!(cc.reconnect.base, Duration::from_millis(100));
        assert_eq!(cc.reconnect.growth, 3.0);
        assert_eq!(cc.reconnect.max_delay, Duration::from_secs(7));
        assert_eq!(cc.reconnect.max_attempts, 4);
        assert_eq!(cc.queue_limit, 16);
    }

    #[test]
    fn test_load_config_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert!(fc.session.endpoint.is_none());
        assert_eq!(fc.transport.ping_interval_secs, 20);
    }

    #[test]
    fn test_load_config_toml_sets_values() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("config.toml"),
            "[session]\nendpoint = \"ws://10.0.0.5:9000\"\n\n[transport]\nqueue_limit = 64\n",
        )
        .unwrap();
        let fc: FileConfig = load_config(tmp.path()).extract().unwrap();
        assert_eq!(fc.session.endpoint.as_deref(), Some("ws://10.0.0.5:9000"));
        assert_eq!(fc.transport.queue_limit, 64);
        // untouched values keep their defaults
        assert_eq!(fc.transport.reconnect_max_attempts, 10);
    }
}
