// Access point station monitor via the kernel neighbour table

//! Station association detection
//!
//! This module watches the hotspot interface for clients coming and going.
//! It polls `ip neigh show dev <interface>`, diffs consecutive snapshots and
//! emits association/disassociation events stamped with the time they were
//! observed.

use crate::config::validate_interface_name;
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Station event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationEvent {
    /// A client appeared on the hotspot interface
    Associated { address: IpAddr, at: Instant },
    /// A client is no longer listed on the hotspot interface
    Disassociated { address: IpAddr, at: Instant },
}

/// Neighbour states that still count as an associated client
const LIVE_STATES: [&str; 6] = ["REACHABLE", "STALE", "DELAY", "PROBE", "PERMANENT", "NOARP"];

/// Station monitor
pub struct StationMonitor {
    interface: String,
    poll_interval: Duration,
}

impl StationMonitor {
    /// Create a new station monitor
    ///
    /// # Errors
    ///
    /// Returns an error if the interface name contains characters that are
    /// unsafe to pass to `ip`.
    pub fn new(interface: String, poll_interval: Duration) -> Result<Self> {
        validate_interface_name(&interface)?;
        Ok(Self {
            interface,
            poll_interval,
        })
    }

    /// Get the monitored interface
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Parse `ip neigh show dev <iface>` output into the set of live client addresses
    /// Format: "192.168.4.23 lladdr aa:bb:cc:dd:ee:ff REACHABLE" (one line per neighbour)
    #[doc(hidden)]
    pub fn parse_neighbours(output: &str) -> BTreeSet<IpAddr> {
        output
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let address = fields.next()?.parse::<IpAddr>().ok()?;
                let rest: Vec<&str> = fields.collect();

                // Entries without a link-layer address are unresolved
                if !rest.contains(&"lladdr") {
                    return None;
                }
                if !rest.iter().any(|field| LIVE_STATES.contains(field)) {
                    return None;
                }
                Some(address)
            })
            .collect()
    }

    /// Compare two snapshots, returning (appeared, disappeared)
    #[doc(hidden)]
    pub fn diff(
        previous: &BTreeSet<IpAddr>,
        current: &BTreeSet<IpAddr>,
    ) -> (Vec<IpAddr>, Vec<IpAddr>) {
        let appeared = current.difference(previous).copied().collect();
        let disappeared = previous.difference(current).copied().collect();
        (appeared, disappeared)
    }

    /// Get the clients currently listed on the interface
    pub async fn current_stations(&self) -> Result<BTreeSet<IpAddr>> {
        let output = Command::new("ip")
            .args(["neigh", "show", "dev", &self.interface])
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute 'ip neigh show'")?;

        anyhow::ensure!(
            output.status.success(),
            "ip neigh show failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );

        Ok(Self::parse_neighbours(&String::from_utf8_lossy(&output.stdout)))
    }

    /// Poll for station changes and send events until the receiver goes away
    pub async fn monitor(&self, tx: mpsc::Sender<StationEvent>) -> Result<()> {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut known: BTreeSet<IpAddr> = BTreeSet::new();

        log::info!(
            "Starting station monitor on {} (every {}s)",
            self.interface,
            self.poll_interval.as_secs()
        );

        loop {
            ticker.tick().await;

            let current = match self.current_stations().await {
                Ok(stations) => stations,
                Err(e) => {
                    log::warn!("Failed to read stations on {}: {}", self.interface, e);
                    continue;
                }
            };

            let at = Instant::now();
            let (appeared, disappeared) = Self::diff(&known, &current);

            for address in disappeared {
                log::info!("Station left: {}", address);
                if tx.send(StationEvent::Disassociated { address, at }).await.is_err() {
                    return Ok(());
                }
            }
            for address in appeared {
                log::info!("Station joined: {}", address);
                if tx.send(StationEvent::Associated { address, at }).await.is_err() {
                    return Ok(());
                }
            }

            known = current;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 4, last))
    }

    #[test]
    fn test_monitor_rejects_unsafe_interface() {
        assert!(StationMonitor::new("wlan0; reboot".to_string(), Duration::from_secs(5)).is_err());
        let monitor = StationMonitor::new("wlan0".to_string(), Duration::from_secs(5)).unwrap();
        assert_eq!(monitor.interface(), "wlan0");
    }

    #[test]
    fn test_parse_neighbours() {
        let output = "192.168.4.23 lladdr aa:bb:cc:dd:ee:01 REACHABLE\n\
                      192.168.4.24 lladdr aa:bb:cc:dd:ee:02 STALE\n\
                      192.168.4.25 lladdr aa:bb:cc:dd:ee:03 DELAY\n";
        let stations = StationMonitor::parse_neighbours(output);
        assert_eq!(stations, [ip(23), ip(24), ip(25)].into_iter().collect::<BTreeSet<IpAddr>>());
    }

    #[test]
    fn test_parse_neighbours_skips_unresolved() {
        let output = "192.168.4.30  FAILED\n\
                      192.168.4.31  INCOMPLETE\n\
                      192.168.4.32 lladdr aa:bb:cc:dd:ee:04 FAILED\n\
                      192.168.4.33 lladdr aa:bb:cc:dd:ee:05 REACHABLE\n";
        let stations = StationMonitor::parse_neighbours(output);
        assert_eq!(stations, [ip(33)].into_iter().collect::<BTreeSet<IpAddr>>());
    }

    #[test]
    fn test_parse_neighbours_ipv6_and_flags() {
        let output = "fe80::1 lladdr aa:bb:cc:dd:ee:06 router REACHABLE\n";
        let stations = StationMonitor::parse_neighbours(output);
        assert_eq!(stations.len(), 1);
        assert!(stations.contains(&"fe80::1".parse::<IpAddr>().unwrap()));
    }

    #[test]
    fn test_parse_neighbours_garbage() {
        assert!(StationMonitor::parse_neighbours("").is_empty());
        assert!(StationMonitor::parse_neighbours("\n\n").is_empty());
        assert!(StationMonitor::parse_neighbours("not-an-ip lladdr x REACHABLE\n").is_empty());
    }

    #[test]
    fn test_diff() {
        let previous: BTreeSet<IpAddr> = [ip(1), ip(2), ip(3)].into_iter().collect();
        let current: BTreeSet<IpAddr> = [ip(2), ip(3), ip(4)].into_iter().collect();

        let (appeared, disappeared) = StationMonitor::diff(&previous, &current);
        assert_eq!(appeared, vec![ip(4)]);
        assert_eq!(disappeared, vec![ip(1)]);
    }

    #[test]
    fn test_diff_unchanged() {
        let snapshot: BTreeSet<IpAddr> = [ip(1), ip(2)].into_iter().collect();
        let (appeared, disappeared) = StationMonitor::diff(&snapshot, &snapshot);
        assert!(appeared.is_empty());
        assert!(disappeared.is_empty());
    }
}
