// Shared types between the controller, the monitor and the control socket

//! Shared data structures
//!
//! This module defines data structures shared between components:
//! the station and ban records owned by the controller, and the
//! configuration structures loaded from TOML.

use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// A client currently associated with the access point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Station {
    pub address: IpAddr,
    pub associated_at: Instant,
}

/// Why a client was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanReason {
    ManualKick,            // Operator or portal asked for a kick
    AutoDisconnectTimeout, // Connected longer than the auto-disconnect timeout
}

impl BanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BanReason::ManualKick => "manual_kick",
            BanReason::AutoDisconnectTimeout => "auto_disconnect_timeout",
        }
    }
}

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

/// General configuration options
#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    /// Hotspot interface clients associate with
    pub interface: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// JSON-lines activity log (disabled when absent)
    #[serde(default)]
    pub event_log: Option<PathBuf>,
}

/// Ban and auto-disconnect policy
#[derive(Debug, Deserialize, Clone)]
pub struct PolicyConfig {
    #[serde(default = "default_manual_kick_grace")]
    pub manual_kick_grace_secs: u64,
    /// Standing auto-disconnect policy installed at startup
    #[serde(default)]
    pub auto_disconnect_minutes: Option<u64>,
    #[serde(default = "default_reconciliation_interval")]
    pub reconciliation_interval_secs: u64,
}

/// Packet filter and station polling options
#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    #[serde(default = "default_command_timeout")]
    pub command_timeout_millis: u64,
    #[serde(default = "default_station_poll_interval")]
    pub station_poll_interval_secs: u64,
}

impl PolicyConfig {
    pub fn manual_kick_grace(&self) -> Duration {
        Duration::from_secs(self.manual_kick_grace_secs)
    }

    pub fn auto_disconnect_timeout(&self) -> Option<Duration> {
        self.auto_disconnect_minutes
            .map(|minutes| Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_secs(self.reconciliation_interval_secs)
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            manual_kick_grace_secs: default_manual_kick_grace(),
            auto_disconnect_minutes: None,
            reconciliation_interval_secs: default_reconciliation_interval(),
        }
    }
}

impl FilterConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_millis)
    }

    pub fn station_poll_interval(&self) -> Duration {
        Duration::from_secs(self.station_poll_interval_secs)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            command_timeout_millis: default_command_timeout(),
            station_poll_interval_secs: default_station_poll_interval(),
        }
    }
}

/// Default control socket location
pub const DEFAULT_SOCKET_PATH: &str = "/run/hotspot-guard/control.sock";

/// Default auto-disconnect timeout offered by the CLI
pub const DEFAULT_AUTO_DISCONNECT_MINUTES: u64 = 30;

/// Longest accepted kick grace period (one day)
pub const MAX_MANUAL_KICK_GRACE_SECS: u64 = 24 * 60 * 60;

/// Longest accepted auto-disconnect timeout (one week)
pub const MAX_AUTO_DISCONNECT_MINUTES: u64 = 7 * 24 * 60;

/// Longest accepted reconciliation or station poll interval
pub const MAX_INTERVAL_SECS: u64 = 60 * 60;

/// Longest accepted packet filter command timeout
pub const MAX_COMMAND_TIMEOUT_MILLIS: u64 = 60_000;

// Default values for configuration
fn default_manual_kick_grace() -> u64 {
    30
}

fn default_reconciliation_interval() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    2000
}

fn default_station_poll_interval() -> u64 {
    5
}

fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

fn default_log_level() -> String {
    "info".to_string()
}
