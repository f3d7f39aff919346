//! Ban table
//!
//! Maps a blocked client address to the moment its ban expires. At most one
//! entry exists per address; banning again refreshes the expiry. The table
//! also remembers whether the packet filter has acknowledged each block, so
//! the controller can retry blocks that failed.

use crate::types::BanReason;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A time-bounded block on one client address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ban {
    pub address: IpAddr,
    pub expires_at: Instant,
    pub reason: BanReason,
    enforced: bool,
}

impl Ban {
    /// Whether the packet filter has confirmed the block
    pub fn is_enforced(&self) -> bool {
        self.enforced
    }
}

/// Expiry used when `now + duration` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// All active bans, keyed by address
#[derive(Debug, Default)]
pub struct BanTable {
    bans: HashMap<IpAddr, Ban>,
}

impl BanTable {
    /// Create an empty ban table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a ban and return its new expiry
    ///
    /// An existing entry keeps its enforcement state; only the expiry and the
    /// reason are replaced.
    pub fn ban(
        &mut self,
        address: IpAddr,
        duration: Duration,
        reason: BanReason,
        now: Instant,
    ) -> Instant {
        let expires_at = now
            .checked_add(duration)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.bans
            .entry(address)
            .and_modify(|ban| {
                ban.expires_at = expires_at;
                ban.reason = reason;
            })
            .or_insert(Ban {
                address,
                expires_at,
                reason,
                enforced: false,
            });
        expires_at
    }

    /// Remove a ban on explicit request (no-op if absent)
    pub fn unban(&mut self, address: &IpAddr) -> Option<Ban> {
        self.bans.remove(address)
    }

    /// Addresses whose ban has expired at `now`
    pub fn expired(&self, now: Instant) -> impl Iterator<Item = IpAddr> + '_ {
        self.bans
            .values()
            .filter(move |ban| ban.expires_at <= now)
            .map(|ban| ban.address)
    }

    /// Remove an expired entry once the filter rule is gone
    pub fn evict(&mut self, address: &IpAddr) -> Option<Ban> {
        self.bans.remove(address)
    }

    /// Addresses with a live ban the filter has not confirmed yet
    pub fn unenforced(&self, now: Instant) -> impl Iterator<Item = IpAddr> + '_ {
        self.bans
            .values()
            .filter(move |ban| !ban.enforced && ban.expires_at > now)
            .map(|ban| ban.address)
    }

    /// Record that the filter now blocks `address`
    pub fn mark_enforced(&mut self, address: &IpAddr) -> bool {
        match self.bans.get_mut(address) {
            Some(ban) => {
                ban.enforced = true;
                true
            }
            None => false,
        }
    }

    /// Record that the filter may no longer block `address`
    ///
    /// A failed unblock can leave some rules removed, so the next ban on the
    /// address has to re-issue the block.
    pub fn mark_unenforced(&mut self, address: &IpAddr) -> bool {
        match self.bans.get_mut(address) {
            Some(ban) => {
                ban.enforced = false;
                true
            }
            None => false,
        }
    }

    /// Pull the expiry of a ban forward to `now` so the next sweep lifts it
    pub fn expire_now(&mut self, address: &IpAddr, now: Instant) -> bool {
        match self.bans.get_mut(address) {
            Some(ban) => {
                ban.expires_at = ban.expires_at.min(now);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, address: &IpAddr) -> Option<&Ban> {
        self.bans.get(address)
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.bans.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 4, last))
    }

    const GRACE: Duration = Duration::from_secs(30);

    #[test]
    fn test_ban_returns_expiry() {
        let mut table = BanTable::new();
        let t0 = Instant::now();

        let expiry = table.ban(ip(10), GRACE, BanReason::ManualKick, t0);
        assert_eq!(expiry, t0 + GRACE);

        let ban = table.get(&ip(10)).unwrap();
        assert_eq!(ban.expires_at, expiry);
        assert_eq!(ban.reason, BanReason::ManualKick);
        assert!(!ban.is_enforced());
    }

    #[test]
    fn test_rebanning_refreshes_instead_of_duplicating() {
        let mut table = BanTable::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(10);

        table.ban(ip(10), GRACE, BanReason::ManualKick, t0);
        table.mark_enforced(&ip(10));
        let expiry = table.ban(ip(10), GRACE, BanReason::AutoDisconnectTimeout, t1);

        assert_eq!(table.len(), 1);
        let ban = table.get(&ip(10)).unwrap();
        assert_eq!(ban.expires_at, t1 + GRACE);
        assert_eq!(expiry, t1 + GRACE);
        assert_eq!(ban.reason, BanReason::AutoDisconnectTimeout);
        assert!(ban.is_enforced());
    }

    #[test]
    fn test_rebanning_with_shorter_duration_takes_later_call() {
        let mut table = BanTable::new();
        let t0 = Instant::now();

        table.ban(ip(10), Duration::from_secs(600), BanReason::ManualKick, t0);
        table.ban(ip(10), GRACE, BanReason::ManualKick, t0);

        assert_eq!(table.get(&ip(10)).unwrap().expires_at, t0 + GRACE);
    }

    #[test]
    fn test_unban_is_idempotent() {
        let mut table = BanTable::new();
        let t0 = Instant::now();
        table.ban(ip(10), GRACE, BanReason::ManualKick, t0);

        assert!(table.unban(&ip(10)).is_some());
        assert!(table.unban(&ip(10)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_expired_does_not_mutate() {
        let mut table = BanTable::new();
        let t0 = Instant::now();
        table.ban(ip(10), GRACE, BanReason::ManualKick, t0);
        table.ban(ip(11), Duration::from_secs(120), BanReason::ManualKick, t0);

        let at = t0 + GRACE;
        let expired: Vec<IpAddr> = table.expired(at).collect();
        assert_eq!(expired, vec![ip(10)]);
        assert_eq!(table.len(), 2);

        // Still reported until evicted
        assert_eq!(table.expired(at).count(), 1);
        assert!(table.evict(&ip(10)).is_some());
        assert_eq!(table.expired(at).count(), 0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expired_before_deadline_is_empty() {
        let mut table = BanTable::new();
        let t0 = Instant::now();
        table.ban(ip(10), GRACE, BanReason::ManualKick, t0);

        assert_eq!(table.expired(t0 + Duration::from_secs(29)).count(), 0);
    }

    #[test]
    fn test_unenforced_excludes_confirmed_and_expired() {
        let mut table = BanTable::new();
        let t0 = Instant::now();
        table.ban(ip(1), GRACE, BanReason::ManualKick, t0);
        table.ban(ip(2), GRACE, BanReason::ManualKick, t0);
        table.ban(ip(3), Duration::from_secs(1), BanReason::ManualKick, t0);
        table.mark_enforced(&ip(2));

        let pending: Vec<IpAddr> = table.unenforced(t0 + Duration::from_secs(5)).collect();
        assert_eq!(pending, vec![ip(1)]);
    }

    #[test]
    fn test_mark_enforced_unknown_address() {
        let mut table = BanTable::new();
        assert!(!table.mark_enforced(&ip(99)));
    }

    #[test]
    fn test_expire_now_pulls_expiry_forward() {
        let mut table = BanTable::new();
        let t0 = Instant::now();
        table.ban(ip(10), GRACE, BanReason::ManualKick, t0);

        let now = t0 + Duration::from_secs(3);
        assert!(table.expire_now(&ip(10), now));
        assert_eq!(table.expired(now).collect::<Vec<_>>(), vec![ip(10)]);
        assert!(!table.expire_now(&ip(11), now));
    }

    #[test]
    fn test_mark_unenforced_requeues_block() {
        let mut table = BanTable::new();
        let t0 = Instant::now();
        table.ban(ip(10), GRACE, BanReason::ManualKick, t0);
        table.mark_enforced(&ip(10));
        assert_eq!(table.unenforced(t0).count(), 0);

        assert!(table.mark_unenforced(&ip(10)));
        assert!(!table.get(&ip(10)).unwrap().is_enforced());
        assert_eq!(table.unenforced(t0).collect::<Vec<_>>(), vec![ip(10)]);
        assert!(!table.mark_unenforced(&ip(11)));
    }

    #[test]
    fn test_huge_duration_does_not_overflow() {
        let mut table = BanTable::new();
        let t0 = Instant::now();

        let expiry = table.ban(ip(10), Duration::MAX, BanReason::ManualKick, t0);
        assert!(expiry >= t0);
        assert_eq!(table.len(), 1);

        let expiry = table.ban(
            ip(11),
            Duration::from_secs(9_223_372_036_854_775_807),
            BanReason::ManualKick,
            t0,
        );
        assert!(expiry > t0 + Duration::from_secs(3600));
        assert_eq!(table.expired(t0 + Duration::from_secs(3600)).count(), 0);
    }
}
