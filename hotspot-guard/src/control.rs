//! Administrative control socket
//!
//! The daemon listens on a Unix domain socket for newline-delimited JSON
//! requests (`list`, `count`, `kick`, `unban`, `auto_disconnect`) and answers
//! each with one JSON line. Client addresses are validated here, so malformed
//! input never reaches the controller loop. The CLI subcommands use
//! [`send_request`] to talk to a running daemon.

use crate::config::{auto_disconnect_timeout, parse_client_address};
use crate::controller::{ControllerHandle, StationStatus};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::time;

/// How long a CLI client waits for the daemon
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest accepted request line
const MAX_REQUEST_BYTES: usize = 4096;

/// Requests accepted on the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    List,
    Count,
    Kick { address: String },
    Unban { address: String },
    AutoDisconnect { timeout_minutes: u64 },
}

/// One station as reported over the socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationView {
    pub address: IpAddr,
    pub connected_secs: u64,
    /// Seconds until the ban lifts, if the station is banned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banned_secs: Option<u64>,
}

impl StationView {
    pub fn from_status(status: &StationStatus, now: Instant) -> Self {
        Self {
            address: status.address,
            connected_secs: now.saturating_duration_since(status.associated_at).as_secs(),
            banned_secs: status
                .banned_until
                .map(|until| until.saturating_duration_since(now).as_secs()),
        }
    }
}

/// Responses sent on the control socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlResponse {
    Stations { stations: Vec<StationView> },
    Count { count: usize },
    Accepted,
    Error { message: String },
}

impl ControlResponse {
    fn error(message: impl Into<String>) -> Self {
        ControlResponse::Error {
            message: message.into(),
        }
    }
}

/// Execute one control request against the controller
pub async fn dispatch(request: ControlRequest, handle: &ControllerHandle) -> ControlResponse {
    let result = match request {
        ControlRequest::List => handle.list().await.map(|stations| {
            let now = Instant::now();
            ControlResponse::Stations {
                stations: stations
                    .iter()
                    .map(|status| StationView::from_status(status, now))
                    .collect(),
            }
        }),
        ControlRequest::Count => handle
            .count()
            .await
            .map(|count| ControlResponse::Count { count }),
        ControlRequest::Kick { address } => match parse_client_address(&address) {
            Ok(address) => handle.kick(address).await.map(|_| ControlResponse::Accepted),
            Err(e) => return ControlResponse::error(e.to_string()),
        },
        ControlRequest::Unban { address } => match parse_client_address(&address) {
            Ok(address) => handle.unban(address).await.map(|_| ControlResponse::Accepted),
            Err(e) => return ControlResponse::error(e.to_string()),
        },
        ControlRequest::AutoDisconnect { timeout_minutes } => {
            let timeout = match auto_disconnect_timeout(timeout_minutes) {
                Ok(timeout) => timeout,
                Err(e) => return ControlResponse::error(e.to_string()),
            };
            handle
                .set_auto_disconnect(timeout)
                .await
                .map(|_| ControlResponse::Accepted)
        }
    };

    result.unwrap_or_else(|e| ControlResponse::error(e.to_string()))
}

/// Bind the control socket, replacing a stale socket file
pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir).context("Failed to create control socket directory")?;
        }
    }
    if path.exists() {
        std::fs::remove_file(path).context("Failed to remove stale control socket")?;
    }
    UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket {:?}", path))
}

/// Accept control connections until `shutdown` changes
pub async fn serve(
    listener: UnixListener,
    handle: ControllerHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                break;
            }
            result = listener.accept() => {
                let (stream, _addr) = match result {
                    Ok(pair) => pair,
                    Err(e) => {
                        log::warn!("Control socket accept error: {}", e);
                        continue;
                    }
                };

                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handle).await {
                        log::debug!("Control connection closed: {}", e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(stream: UnixStream, handle: ControllerHandle) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        // Never buffer more than one oversized request
        let read = (&mut reader)
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if read == 0 {
            break;
        }

        if line.last() != Some(&b'\n') && line.len() > MAX_REQUEST_BYTES {
            write_response(&mut writer, &ControlResponse::error("request too large")).await?;
            // The rest of the line is still unread, so stop here
            break;
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim();
        if text.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<ControlRequest>(text) {
            Ok(request) => {
                log::debug!("Control request: {:?}", request);
                dispatch(request, &handle).await
            }
            Err(e) => ControlResponse::error(format!("invalid request: {}", e)),
        };
        write_response(&mut writer, &response).await?;
    }

    Ok(())
}

async fn write_response<W>(writer: &mut W, response: &ControlResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_string(response)?;
    payload.push('\n');
    writer.write_all(payload.as_bytes()).await?;
    Ok(())
}

/// Send one request to a running daemon and wait for its answer
pub async fn send_request(path: &Path, request: &ControlRequest) -> Result<ControlResponse> {
    let exchange = async {
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("Failed to connect to {:?}", path))?;
        let (reader, mut writer) = stream.into_split();

        let mut payload = serde_json::to_string(request)?;
        payload.push('\n');
        writer.write_all(payload.as_bytes()).await?;

        let mut lines = BufReader::new(reader).lines();
        let line = lines
            .next_line()
            .await?
            .context("Daemon closed the connection without answering")?;
        serde_json::from_str::<ControlResponse>(&line).context("Invalid response from daemon")
    };

    time::timeout(CLIENT_TIMEOUT, exchange)
        .await
        .context("Timed out waiting for daemon")?
}
