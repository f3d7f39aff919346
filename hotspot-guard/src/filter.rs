// Packet filter control for banned clients

//! Packet filter adapter
//!
//! This module turns ban and unban intents into packet filter rules. The
//! [`PacketFilter`] trait is the seam to the external mechanism;
//! [`IptablesFilter`] drives `iptables`/`ip6tables`, and [`FilterAdapter`]
//! bounds every call with a timeout so a hung filter never stalls the
//! controller loop.

use crate::error::{GuardError, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;
use tokio::process::Command;

/// Drop rules installed per banned address: (chain, match flag)
/// Inbound traffic is matched by source, outbound by destination.
const DROP_RULES: [(&str, &str); 4] = [
    ("INPUT", "-s"),
    ("OUTPUT", "-d"),
    ("FORWARD", "-s"),
    ("FORWARD", "-d"),
];

/// Upper bound on duplicate rules removed for one (chain, match) pair
const MAX_DUPLICATE_RULES: usize = 8;

/// Idempotent block/unblock primitives on a packet filter
#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Ensure traffic from and to `address` is dropped
    async fn block(&self, address: IpAddr) -> Result<()>;

    /// Ensure no drop rules remain for `address`
    async fn unblock(&self, address: IpAddr) -> Result<()>;
}

/// Timeout-bounded wrapper around a [`PacketFilter`]
pub struct FilterAdapter<F> {
    filter: F,
    call_timeout: Duration,
}

impl<F: PacketFilter> FilterAdapter<F> {
    /// Wrap `filter`, treating calls slower than `call_timeout` as failures
    pub fn new(filter: F, call_timeout: Duration) -> Self {
        Self {
            filter,
            call_timeout,
        }
    }

    /// Ensure inbound and outbound drop rules exist for `address`
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::FilterUnavailable`] if the filter fails or does
    /// not answer within the call timeout. Safe to retry.
    pub async fn apply_block(&self, address: IpAddr) -> Result<()> {
        match tokio::time::timeout(self.call_timeout, self.filter.block(address)).await {
            Ok(result) => result,
            Err(_) => Err(GuardError::FilterUnavailable(format!(
                "block {} timed out after {}ms",
                address,
                self.call_timeout.as_millis()
            ))),
        }
    }

    /// Ensure drop rules for `address` are absent
    ///
    /// # Errors
    ///
    /// Returns [`GuardError::FilterUnavailable`] if the filter fails or does
    /// not answer within the call timeout. Safe to retry.
    pub async fn apply_unblock(&self, address: IpAddr) -> Result<()> {
        match tokio::time::timeout(self.call_timeout, self.filter.unblock(address)).await {
            Ok(result) => result,
            Err(_) => Err(GuardError::FilterUnavailable(format!(
                "unblock {} timed out after {}ms",
                address,
                self.call_timeout.as_millis()
            ))),
        }
    }
}

/// Packet filter backed by the `iptables` / `ip6tables` binaries
#[derive(Debug, Default, Clone)]
pub struct IptablesFilter;

impl IptablesFilter {
    /// Create a new iptables filter
    pub fn new() -> Self {
        Self
    }

    fn binary_for(address: &IpAddr) -> &'static str {
        match address {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        }
    }

    /// Build the argument list for one drop rule operation (-C, -I or -D)
    #[doc(hidden)]
    pub fn rule_args(op: &str, chain: &str, flag: &str, address: &IpAddr) -> Vec<String> {
        let mut args = vec!["-w".to_string(), op.to_string(), chain.to_string()];
        if op == "-I" {
            // Insert at the top so an ACCEPT earlier in the chain can't shadow it
            args.push("1".to_string());
        }
        args.extend([
            flag.to_string(),
            address.to_string(),
            "-j".to_string(),
            "DROP".to_string(),
        ]);
        args
    }

    /// Interpret the result of `iptables -C`
    /// Exit status 0 means present; status 1 with a "Bad rule" message means absent.
    #[doc(hidden)]
    pub fn parse_check_result(code: Option<i32>, stderr: &str) -> Result<bool> {
        match code {
            Some(0) => Ok(true),
            Some(1)
                if stderr.contains("Bad rule")
                    || stderr.contains("does a matching rule exist")
                    || stderr.contains("No chain/target/match") =>
            {
                Ok(false)
            }
            _ => Err(GuardError::FilterUnavailable(format!(
                "rule check failed (status {:?}): {}",
                code,
                stderr.trim()
            ))),
        }
    }

    async fn run(&self, address: &IpAddr, args: &[String]) -> Result<std::process::Output> {
        let binary = Self::binary_for(address);
        Command::new(binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| GuardError::FilterUnavailable(format!("failed to execute {}: {}", binary, e)))
    }

    async fn rule_exists(&self, chain: &str, flag: &str, address: &IpAddr) -> Result<bool> {
        let output = self
            .run(address, &Self::rule_args("-C", chain, flag, address))
            .await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        Self::parse_check_result(output.status.code(), &stderr)
    }

    async fn modify_rule(&self, op: &str, chain: &str, flag: &str, address: &IpAddr) -> Result<()> {
        let output = self
            .run(address, &Self::rule_args(op, chain, flag, address))
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GuardError::FilterUnavailable(format!(
                "{} {} {} {} failed: {}",
                Self::binary_for(address),
                op,
                chain,
                address,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl PacketFilter for IptablesFilter {
    async fn block(&self, address: IpAddr) -> Result<()> {
        for (chain, flag) in DROP_RULES {
            if self.rule_exists(chain, flag, &address).await? {
                log::debug!("Drop rule {} {} {} already present", chain, flag, address);
                continue;
            }
            self.modify_rule("-I", chain, flag, &address).await?;
        }
        log::info!("Blocked traffic for {}", address);
        Ok(())
    }

    async fn unblock(&self, address: IpAddr) -> Result<()> {
        for (chain, flag) in DROP_RULES {
            let mut removed = 0;
            while self.rule_exists(chain, flag, &address).await? {
                if removed >= MAX_DUPLICATE_RULES {
                    return Err(GuardError::FilterUnavailable(format!(
                        "drop rule {} {} {} still present after {} deletions",
                        chain, flag, address, removed
                    )));
                }
                self.modify_rule("-D", chain, flag, &address).await?;
                removed += 1;
            }
        }
        log::info!("Unblocked traffic for {}", address);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording filter used by controller tests

    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FilterCall {
        Block(IpAddr),
        Unblock(IpAddr),
    }

    #[derive(Debug, Default)]
    struct Recorded {
        calls: Vec<FilterCall>,
        failed: Vec<FilterCall>,
        block_failures_left: usize,
        unblock_failures_left: usize,
        // Failing unblocks still remove the rules
        partial_unblocks: bool,
        blocked: HashSet<IpAddr>,
    }

    /// In-memory filter that records successful calls and can fail on demand
    #[derive(Debug, Clone, Default)]
    pub struct RecordingFilter {
        inner: Arc<Mutex<Recorded>>,
        delay: Option<Duration>,
    }

    impl RecordingFilter {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fail the next `n` block calls with FilterUnavailable
        pub fn fail_blocks(&self, n: usize) {
            self.inner.lock().unwrap().block_failures_left = n;
        }

        /// Fail the next `n` unblock calls with FilterUnavailable
        pub fn fail_unblocks(&self, n: usize) {
            let mut recorded = self.inner.lock().unwrap();
            recorded.unblock_failures_left = n;
            recorded.partial_unblocks = false;
        }

        /// Fail the next `n` unblock calls after their rules are already gone,
        /// like an iptables run killed halfway through
        pub fn fail_unblocks_partway(&self, n: usize) {
            let mut recorded = self.inner.lock().unwrap();
            recorded.unblock_failures_left = n;
            recorded.partial_unblocks = true;
        }

        /// Sleep this long inside every call
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Successful calls, in order
        pub fn calls(&self) -> Vec<FilterCall> {
            self.inner.lock().unwrap().calls.clone()
        }

        /// Failed calls, in order
        pub fn failed(&self) -> Vec<FilterCall> {
            self.inner.lock().unwrap().failed.clone()
        }

        pub fn successful_blocks(&self, address: IpAddr) -> usize {
            self.calls()
                .iter()
                .filter(|call| **call == FilterCall::Block(address))
                .count()
        }

        pub fn is_blocked(&self, address: IpAddr) -> bool {
            self.inner.lock().unwrap().blocked.contains(&address)
        }
    }

    #[async_trait]
    impl PacketFilter for RecordingFilter {
        async fn block(&self, address: IpAddr) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut recorded = self.inner.lock().unwrap();
            if recorded.block_failures_left > 0 {
                recorded.block_failures_left -= 1;
                recorded.failed.push(FilterCall::Block(address));
                return Err(GuardError::FilterUnavailable("simulated outage".to_string()));
            }
            recorded.calls.push(FilterCall::Block(address));
            recorded.blocked.insert(address);
            Ok(())
        }

        async fn unblock(&self, address: IpAddr) -> Result<()> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut recorded = self.inner.lock().unwrap();
            if recorded.unblock_failures_left > 0 {
                recorded.unblock_failures_left -= 1;
                recorded.failed.push(FilterCall::Unblock(address));
                if recorded.partial_unblocks {
                    recorded.blocked.remove(&address);
                }
                return Err(GuardError::FilterUnavailable("simulated outage".to_string()));
            }
            recorded.calls.push(FilterCall::Unblock(address));
            recorded.blocked.remove(&address);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FilterCall, RecordingFilter};
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 4, 23))
    }

    #[test]
    fn test_binary_selection() {
        assert_eq!(IptablesFilter::binary_for(&ip()), "iptables");
        assert_eq!(
            IptablesFilter::binary_for(&IpAddr::V6(Ipv6Addr::LOCALHOST)),
            "ip6tables"
        );
    }

    #[test]
    fn test_rule_args_check() {
        let args = IptablesFilter::rule_args("-C", "INPUT", "-s", &ip());
        assert_eq!(
            args,
            vec!["-w", "-C", "INPUT", "-s", "192.168.4.23", "-j", "DROP"]
        );
    }

    #[test]
    fn test_rule_args_insert_at_top() {
        let args = IptablesFilter::rule_args("-I", "FORWARD", "-d", &ip());
        assert_eq!(
            args,
            vec!["-w", "-I", "FORWARD", "1", "-d", "192.168.4.23", "-j", "DROP"]
        );
    }

    #[test]
    fn test_drop_rules_cover_both_directions() {
        assert!(DROP_RULES.contains(&("INPUT", "-s")));
        assert!(DROP_RULES.contains(&("OUTPUT", "-d")));
        assert!(DROP_RULES.contains(&("FORWARD", "-s")));
        assert!(DROP_RULES.contains(&("FORWARD", "-d")));
    }

    #[test]
    fn test_parse_check_result() {
        assert_eq!(IptablesFilter::parse_check_result(Some(0), ""), Ok(true));
        assert_eq!(
            IptablesFilter::parse_check_result(
                Some(1),
                "iptables: Bad rule (does a matching rule exist in that chain?).\n"
            ),
            Ok(false)
        );
    }

    #[test]
    fn test_parse_check_result_errors() {
        // Permission problems are not "rule absent"
        assert!(matches!(
            IptablesFilter::parse_check_result(
                Some(4),
                "iptables v1.8.9: Permission denied (you must be root)"
            ),
            Err(GuardError::FilterUnavailable(_))
        ));
        assert!(matches!(
            IptablesFilter::parse_check_result(Some(1), "Another app is currently holding the xtables lock"),
            Err(GuardError::FilterUnavailable(_))
        ));
        assert!(IptablesFilter::parse_check_result(None, "").is_err());
    }

    #[tokio::test]
    async fn test_adapter_passes_through() {
        let filter = RecordingFilter::new();
        let adapter = FilterAdapter::new(filter.clone(), Duration::from_secs(2));

        adapter.apply_block(ip()).await.unwrap();
        assert!(filter.is_blocked(ip()));
        adapter.apply_unblock(ip()).await.unwrap();
        assert!(!filter.is_blocked(ip()));

        assert_eq!(
            filter.calls(),
            vec![FilterCall::Block(ip()), FilterCall::Unblock(ip())]
        );
    }

    #[tokio::test]
    async fn test_adapter_reports_failures() {
        let filter = RecordingFilter::new();
        filter.fail_blocks(1);
        let adapter = FilterAdapter::new(filter.clone(), Duration::from_secs(2));

        let err = adapter.apply_block(ip()).await.unwrap_err();
        assert!(matches!(err, GuardError::FilterUnavailable(_)));
        assert!(adapter.apply_block(ip()).await.is_ok());
    }

    #[tokio::test]
    async fn test_adapter_times_out_slow_filter() {
        let filter = RecordingFilter::new().with_delay(Duration::from_millis(500));
        let adapter = FilterAdapter::new(filter.clone(), Duration::from_millis(20));

        let err = adapter.apply_block(ip()).await.unwrap_err();
        match err {
            GuardError::FilterUnavailable(msg) => assert!(msg.contains("timed out")),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!filter.is_blocked(ip()));

        let err = adapter.apply_unblock(ip()).await.unwrap_err();
        assert!(matches!(err, GuardError::FilterUnavailable(_)));
    }
}
