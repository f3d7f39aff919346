// Hotspot Guard Library
// Shared modules for daemon, CLI and tests

#![warn(missing_docs)]

//! Hotspot client session controller
//!
//! This library tracks the clients associated with a Wi-Fi hotspot, blocks
//! individual clients for a grace period on request, and lifts those blocks
//! automatically when they expire. It can also disconnect clients that have
//! been connected longer than a configurable timeout.
//!
//! # Main Components
//!
//! - [`config`]: Configuration file parsing and input validation
//! - [`registry`]: Station registry of associated clients
//! - [`ban_table`]: Ban entries and their expiry
//! - [`filter`]: Packet filter adapter (iptables)
//! - [`controller`]: Session controller state machine and event loop
//! - [`station_monitor`]: Association detection on the hotspot interface
//! - [`control`]: Unix socket administrative interface
//! - [`event_log`]: JSON-lines client activity log
//! - [`error`]: Error taxonomy
//! - [`types`]: Shared data structures

pub mod ban_table;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod event_log;
pub mod filter;
pub mod registry;
pub mod station_monitor;
pub mod types;
