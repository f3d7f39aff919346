//! Station registry
//!
//! Authoritative set of clients currently associated with the access point,
//! keyed by address and ordered by connection start time.

use crate::error::{GuardError, Result};
use crate::types::Station;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Instant;

/// Associated stations, oldest connection first
#[derive(Debug, Default)]
pub struct StationRegistry {
    by_address: HashMap<IpAddr, Instant>,
    // (associated_at, address) keeps snapshot order stable on ties
    by_age: BTreeSet<(Instant, IpAddr)>,
}

impl StationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an association event
    ///
    /// Returns false if the station was already present; its original
    /// `associated_at` is kept.
    pub fn record_association(&mut self, address: IpAddr, at: Instant) -> bool {
        if self.by_address.contains_key(&address) {
            return false;
        }
        self.by_address.insert(address, at);
        self.by_age.insert((at, address));
        true
    }

    /// Record a disassociation event and return the removed station
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::RegistryInconsistent`] if the address was not
    /// associated. The registry is left unchanged.
    pub fn record_disassociation(&mut self, address: IpAddr) -> Result<Station> {
        let associated_at = self
            .by_address
            .remove(&address)
            .ok_or(GuardError::RegistryInconsistent(address))?;
        self.by_age.remove(&(associated_at, address));
        Ok(Station {
            address,
            associated_at,
        })
    }

    /// Iterate over associated stations, oldest connection first
    pub fn snapshot(&self) -> impl Iterator<Item = Station> + '_ {
        self.by_age
            .iter()
            .map(|&(associated_at, address)| Station {
                address,
                associated_at,
            })
    }

    /// Number of associated stations
    pub fn count(&self) -> usize {
        self.by_address.len()
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn associated_at(&self, address: &IpAddr) -> Option<Instant> {
        self.by_address.get(address).copied()
    }
}
