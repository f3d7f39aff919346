//! Error taxonomy for the session controller
//!
//! None of these errors are fatal to the daemon. Malformed addresses are
//! rejected at the control socket, filter failures are retried on the next
//! reconciliation tick, and registry inconsistencies are ignored.

use std::net::IpAddr;
use thiserror::Error;

/// Errors produced by the session controller and its collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// A client address could not be parsed or is not a unicast host address
    #[error("Malformed client address: {0}")]
    MalformedAddress(String),

    /// The packet filter could not be reached or did not answer in time
    #[error("Packet filter unavailable: {0}")]
    FilterUnavailable(String),

    /// An event referenced a station the registry never saw
    #[error("No associated station for {0}")]
    RegistryInconsistent(IpAddr),

    /// The controller loop is no longer running
    #[error("Session controller has stopped")]
    ControllerStopped,
}

/// Result alias for controller operations
pub type Result<T> = std::result::Result<T, GuardError>;
