// Client activity log for the event host
//!
//! Appends one JSON object per line for every session transition (kick,
//! auto-disconnect, unban, expiry) so the host can review who was
//! disconnected and why.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Session transitions worth recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    Kicked,
    AutoDisconnected,
    Unbanned,
    Expired,
}

impl SessionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionAction::Kicked => "kicked",
            SessionAction::AutoDisconnected => "auto_disconnected",
            SessionAction::Unbanned => "unbanned",
            SessionAction::Expired => "ban_expired",
        }
    }
}

#[derive(Serialize)]
struct LogEntry<'a> {
    timestamp: u64,
    ip: IpAddr,
    action: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
}

/// Append-only JSON-lines activity log
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    /// Open the log, creating its directory if needed
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).context("Failed to create event log directory")?;
            }
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry
    pub fn record(&self, address: IpAddr, action: SessionAction, details: Option<&str>) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let entry = LogEntry {
            timestamp,
            ip: address,
            action: action.as_str(),
            details,
        };
        let mut line = serde_json::to_string(&entry).context("Failed to encode event")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open event log")?;
        file.write_all(line.as_bytes())
            .context("Failed to write event log")?;

        Ok(())
    }
}
