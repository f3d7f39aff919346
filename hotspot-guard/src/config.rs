// Configuration file parser

//! Configuration file parsing and validation
//!
//! This module handles loading TOML configuration files and validating
//! their contents. It also validates values that come from operators at
//! runtime: interface names and client addresses.

use crate::error::GuardError;
use crate::types::{
    Config, DEFAULT_SOCKET_PATH, MAX_AUTO_DISCONNECT_MINUTES, MAX_COMMAND_TIMEOUT_MILLIS,
    MAX_INTERVAL_SECS, MAX_MANUAL_KICK_GRACE_SECS,
};
use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load configuration from TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

    let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;

    validate_config(&config)?;
    Ok(config)
}

/// Resolve the control socket path for CLI commands
///
/// Falls back to the default socket when the config file does not exist, so
/// client commands work on hosts that run the daemon with defaults.
pub fn socket_path_for<P: AsRef<Path>>(config_path: P) -> Result<PathBuf> {
    if !config_path.as_ref().exists() {
        return Ok(PathBuf::from(DEFAULT_SOCKET_PATH));
    }
    Ok(load_config(config_path)?.general.socket_path)
}

/// Validate configuration values
fn validate_config(config: &Config) -> Result<()> {
    validate_interface_name(&config.general.interface)
        .context("Invalid hotspot interface")?;

    if config.general.socket_path.as_os_str().is_empty() {
        anyhow::bail!("socket_path cannot be empty");
    }

    ensure_in_range(
        "manual_kick_grace_secs",
        config.policy.manual_kick_grace_secs,
        MAX_MANUAL_KICK_GRACE_SECS,
    )?;
    ensure_in_range(
        "reconciliation_interval_secs",
        config.policy.reconciliation_interval_secs,
        MAX_INTERVAL_SECS,
    )?;

    if let Some(minutes) = config.policy.auto_disconnect_minutes {
        if minutes == 0 {
            anyhow::bail!("auto_disconnect_minutes must be > 0 (omit it to disable the policy)");
        }
        auto_disconnect_timeout(minutes).context("Invalid auto_disconnect_minutes")?;
    }

    ensure_in_range(
        "command_timeout_millis",
        config.filter.command_timeout_millis,
        MAX_COMMAND_TIMEOUT_MILLIS,
    )?;
    ensure_in_range(
        "station_poll_interval_secs",
        config.filter.station_poll_interval_secs,
        MAX_INTERVAL_SECS,
    )?;

    Ok(())
}

fn ensure_in_range(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 {
        anyhow::bail!("{} must be > 0", name);
    }
    if value > max {
        anyhow::bail!("{} must be at most {} (got {})", name, max, value);
    }
    Ok(())
}

/// Convert an operator-supplied auto-disconnect timeout in minutes
///
/// `0` disables the policy.
///
/// # Errors
///
/// Returns an error if the timeout exceeds one week.
pub fn auto_disconnect_timeout(minutes: u64) -> Result<Option<Duration>> {
    if minutes == 0 {
        return Ok(None);
    }
    if minutes > MAX_AUTO_DISCONNECT_MINUTES {
        anyhow::bail!(
            "auto-disconnect timeout must be at most {} minutes (got {})",
            MAX_AUTO_DISCONNECT_MINUTES,
            minutes
        );
    }
    Ok(Some(Duration::from_secs(minutes * 60)))
}

/// Validates that an interface name is safe to use in shell commands.
/// Only allows alphanumeric characters, hyphens, and underscores to prevent command injection.
///
/// # Errors
///
/// Returns an error if the interface name is empty or contains invalid characters.
pub fn validate_interface_name(name: &str) -> Result<()> {
    if name.is_empty() {
        anyhow::bail!("Interface name cannot be empty");
    }

    // Check for valid characters: alphanumeric, hyphen, underscore
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        anyhow::bail!(
            "Interface name contains invalid characters: '{}'. Only alphanumeric, hyphens, and underscores are allowed",
            name
        );
    }

    Ok(())
}

/// Parse a client address supplied by an operator
///
/// Only unicast host addresses are accepted; unspecified, loopback,
/// multicast and broadcast addresses would block the hotspot itself.
pub fn parse_client_address(input: &str) -> std::result::Result<IpAddr, GuardError> {
    let trimmed = input.trim();
    let address: IpAddr = trimmed
        .parse()
        .map_err(|_| GuardError::MalformedAddress(input.to_string()))?;

    let unusable = match address {
        IpAddr::V4(v4) => {
            v4.is_unspecified() || v4.is_loopback() || v4.is_multicast() || v4.is_broadcast()
        }
        IpAddr::V6(v6) => v6.is_unspecified() || v6.is_loopback() || v6.is_multicast(),
    };

    if unusable {
        return Err(GuardError::MalformedAddress(input.to_string()));
    }

    Ok(address)
}
