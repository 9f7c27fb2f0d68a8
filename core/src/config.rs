//! Tracker configuration options.

use serde::Deserialize;
use std::fs;

/// Loads a configuration file from `path`. Panics if the file cannot be read
/// or contains invalid options.
pub fn load_config(path: &str) -> ConnTrackConfig {
    let config_str = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("Failed to read configuration file {}: {}", path, err));
    let config: ConnTrackConfig = toml::from_str(&config_str)
        .unwrap_or_else(|err| panic!("Malformed configuration file {}: {}", path, err));
    config
}

/// Returns the default configuration.
pub fn default_config() -> ConnTrackConfig {
    ConnTrackConfig::default()
}

/// Connection tracker options.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnTrackConfig {
    /// Number of hash buckets. Derived from `memory_budget` if unset.
    #[serde(default)]
    pub nb_buckets: Option<usize>,

    /// Maximum number of live connection records (confirmed plus
    /// provisional). Defaults to eight entries per bucket.
    #[serde(default)]
    pub max_entries: Option<usize>,

    /// Memory budget in bytes used to size the table when `nb_buckets` is
    /// unset.
    #[serde(default = "default_memory_budget")]
    pub memory_budget: usize,

    /// Period between timeout checks (in milliseconds).
    #[serde(default = "default_timeout_resolution")]
    pub timeout_resolution: u64,

    /// Per-protocol inactivity timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_memory_budget() -> usize {
    64 * 1024 * 1024
}

fn default_timeout_resolution() -> u64 {
    100
}

impl Default for ConnTrackConfig {
    fn default() -> Self {
        ConnTrackConfig {
            nb_buckets: None,
            max_entries: None,
            memory_budget: default_memory_budget(),
            timeout_resolution: default_timeout_resolution(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Per-protocol inactivity timeouts (in milliseconds).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_tcp_syn_sent")]
    pub tcp_syn_sent: u64,
    #[serde(default = "default_tcp_syn_recv")]
    pub tcp_syn_recv: u64,
    #[serde(default = "default_tcp_established")]
    pub tcp_established: u64,
    #[serde(default = "default_tcp_fin_wait")]
    pub tcp_fin_wait: u64,
    #[serde(default = "default_tcp_close_wait")]
    pub tcp_close_wait: u64,
    #[serde(default = "default_tcp_last_ack")]
    pub tcp_last_ack: u64,
    #[serde(default = "default_tcp_time_wait")]
    pub tcp_time_wait: u64,
    #[serde(default = "default_tcp_close")]
    pub tcp_close: u64,
    #[serde(default = "default_udp_unreplied")]
    pub udp_unreplied: u64,
    #[serde(default = "default_udp_stream")]
    pub udp_stream: u64,
    #[serde(default = "default_icmp")]
    pub icmp: u64,
    #[serde(default = "default_generic")]
    pub generic: u64,
}

fn default_tcp_syn_sent() -> u64 {
    30_000
}

fn default_tcp_syn_recv() -> u64 {
    60_000
}

fn default_tcp_established() -> u64 {
    3_600_000
}

fn default_tcp_fin_wait() -> u64 {
    120_000
}

fn default_tcp_close_wait() -> u64 {
    60_000
}

fn default_tcp_last_ack() -> u64 {
    30_000
}

fn default_tcp_time_wait() -> u64 {
    120_000
}

fn default_tcp_close() -> u64 {
    10_000
}

fn default_udp_unreplied() -> u64 {
    30_000
}

fn default_udp_stream() -> u64 {
    180_000
}

fn default_icmp() -> u64 {
    30_000
}

fn default_generic() -> u64 {
    600_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            tcp_syn_sent: default_tcp_syn_sent(),
            tcp_syn_recv: default_tcp_syn_recv(),
            tcp_established: default_tcp_established(),
            tcp_fin_wait: default_tcp_fin_wait(),
            tcp_close_wait: default_tcp_close_wait(),
            tcp_last_ack: default_tcp_last_ack(),
            tcp_time_wait: default_tcp_time_wait(),
            tcp_close: default_tcp_close(),
            udp_unreplied: default_udp_unreplied(),
            udp_stream: default_udp_stream(),
            icmp: default_icmp(),
            generic: default_generic(),
        }
    }
}

impl TimeoutConfig {
    /// The largest configured timeout, used to size the timer wheel.
    pub(crate) fn max_timeout(&self) -> u64 {
        [
            self.tcp_syn_sent,
            self.tcp_syn_recv,
            self.tcp_established,
            self.tcp_fin_wait,
            self.tcp_close_wait,
            self.tcp_last_ack,
            self.tcp_time_wait,
            self.tcp_close,
            self.udp_unreplied,
            self.udp_stream,
            self.icmp,
            self.generic,
        ]
        .into_iter()
        .max()
        .unwrap_or(default_generic())
    }
}

/// Resolved runtime parameters derived from a [`ConnTrackConfig`].
#[derive(Debug, Clone)]
pub(crate) struct TrackerConfig {
    pub(crate) nb_buckets: usize,
    pub(crate) max_entries: usize,
    pub(crate) timeout_resolution: u64,
    pub(crate) timeouts: TimeoutConfig,
}

impl From<&ConnTrackConfig> for TrackerConfig {
    fn from(config: &ConnTrackConfig) -> Self {
        // Roughly 16 KiB of budget per bucket, matching the historical
        // sizing of one bucket per 16k of table memory.
        let nb_buckets = config
            .nb_buckets
            .unwrap_or_else(|| (config.memory_budget / 16384).clamp(16, 8192));
        let max_entries = config.max_entries.unwrap_or(nb_buckets * 8);
        if config.timeout_resolution == 0 {
            panic!("Timeout check period must be non-zero");
        }
        TrackerConfig {
            nb_buckets,
            max_entries,
            timeout_resolution: config.timeout_resolution,
            timeouts: config.timeouts.clone(),
        }
    }
}
