// Session controller for hotspot clients

//! Client session controller
//!
//! This module implements the state machine that ties the station registry,
//! the ban table and the packet filter together. Each address cycles through
//! `Free -> Banned -> Free`. A single task owns all of the mutable state and
//! processes station events, administrative requests and reconciliation ticks
//! one at a time, so no locking is needed.
//!
//! Filter failures never escape the controller: a block that fails is retried
//! on every tick until it succeeds or the ban expires, and an unblock that
//! fails keeps the ban entry around until the rule is confirmed gone. A failed
//! unblock also drops the enforced mark, so banning the address again before
//! the retry re-issues the block.

use crate::ban_table::BanTable;
use crate::error::{GuardError, Result};
use crate::event_log::{EventLog, SessionAction};
use crate::filter::{FilterAdapter, PacketFilter};
use crate::registry::StationRegistry;
use crate::station_monitor::StationEvent;
use crate::types::{BanReason, Config, Station};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, MissedTickBehavior};

/// Size of the channel buffer for administrative requests
pub const REQUEST_CHANNEL_SIZE: usize = 32;

/// Size of the channel buffer for station events
pub const STATION_EVENT_CHANNEL_SIZE: usize = 64;

/// Timing policy for the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    /// How long a kick blocks a client
    pub manual_kick_grace: Duration,
    /// Standing auto-disconnect policy (None = off)
    pub auto_disconnect: Option<Duration>,
    /// How often bans are expired and the filter reconciled
    pub reconciliation_interval: Duration,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            manual_kick_grace: config.policy.manual_kick_grace(),
            auto_disconnect: config.policy.auto_disconnect_timeout(),
            reconciliation_interval: config.policy.reconciliation_interval(),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            manual_kick_grace: Duration::from_secs(30),
            auto_disconnect: None,
            reconciliation_interval: Duration::from_secs(5),
        }
    }
}

/// One row of `list` output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationStatus {
    pub address: IpAddr,
    pub associated_at: Instant,
    pub banned_until: Option<Instant>,
}

/// Administrative requests handled by the controller loop
#[derive(Debug)]
pub enum Request {
    /// Ordered station snapshot
    List(oneshot::Sender<Vec<StationStatus>>),
    /// Number of associated stations
    Count(oneshot::Sender<usize>),
    /// Block a client for the manual kick grace period
    Kick(IpAddr),
    /// Lift a block immediately
    Unban(IpAddr),
    /// Install, update or remove the auto-disconnect policy
    AutoDisconnect(Option<Duration>),
}

/// Session controller state machine
pub struct SessionController<F> {
    registry: StationRegistry,
    bans: BanTable,
    filter: FilterAdapter<F>,
    settings: ControllerSettings,
    // When a still-associated station was last released from a ban
    released: HashMap<IpAddr, Instant>,
    event_log: Option<EventLog>,
}

impl<F: PacketFilter> SessionController<F> {
    /// Create a new controller
    pub fn new(filter: FilterAdapter<F>, settings: ControllerSettings) -> Self {
        Self {
            registry: StationRegistry::new(),
            bans: BanTable::new(),
            filter,
            settings,
            released: HashMap::new(),
            event_log: None,
        }
    }

    /// Record session transitions to `event_log`
    pub fn with_event_log(mut self, event_log: EventLog) -> Self {
        self.event_log = Some(event_log);
        self
    }

    pub fn registry(&self) -> &StationRegistry {
        &self.registry
    }

    pub fn bans(&self) -> &BanTable {
        &self.bans
    }

    /// Apply an association/disassociation event to the registry
    pub fn handle_station_event(&mut self, event: StationEvent) {
        match event {
            StationEvent::Associated { address, at } => {
                if self.registry.record_association(address, at) {
                    log::debug!("Station {} associated", address);
                } else {
                    log::debug!("Station {} already associated, ignoring", address);
                }
            }
            StationEvent::Disassociated { address, .. } => {
                match self.registry.record_disassociation(address) {
                    Ok(_) => {
                        self.released.remove(&address);
                        log::debug!("Station {} disassociated", address);
                    }
                    Err(e) => log::debug!("Ignoring disassociation: {}", e),
                }
            }
        }
    }

    /// Handle an administrative request
    pub async fn handle_request(&mut self, request: Request, now: Instant) {
        match request {
            Request::List(reply) => {
                // Caller may have given up waiting
                let _ = reply.send(self.list());
            }
            Request::Count(reply) => {
                let _ = reply.send(self.count());
            }
            Request::Kick(address) => {
                self.kick(address, now).await;
            }
            Request::Unban(address) => {
                self.unban(address, now).await;
            }
            Request::AutoDisconnect(timeout) => self.set_auto_disconnect(timeout),
        }
    }

    /// Associated stations, oldest first, with their ban status
    pub fn list(&self) -> Vec<StationStatus> {
        self.registry
            .snapshot()
            .map(|station| StationStatus {
                address: station.address,
                associated_at: station.associated_at,
                banned_until: self.bans.get(&station.address).map(|ban| ban.expires_at),
            })
            .collect()
    }

    /// Number of associated stations
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Block `address` for the manual kick grace period
    pub async fn kick(&mut self, address: IpAddr, now: Instant) -> Instant {
        self.ban(address, BanReason::ManualKick, now).await
    }

    /// Lift the block on `address` immediately
    ///
    /// The filter is asked to unblock even if no ban is tracked, which clears
    /// rules left behind by a previous run.
    pub async fn unban(&mut self, address: IpAddr, now: Instant) {
        match self.filter.apply_unblock(address).await {
            Ok(()) => {
                if self.bans.unban(&address).is_some() {
                    log::info!("Unbanned {}", address);
                    self.record(address, SessionAction::Unbanned, None);
                } else {
                    log::debug!("No active ban for {}, filter rules cleared", address);
                }
                self.mark_released(address, now);
            }
            Err(e) => {
                log::warn!("Failed to unban {}: {} (will retry)", address, e);
                // Rules may be partly gone; let the next sweep retry the unblock
                self.bans.mark_unenforced(&address);
                self.bans.expire_now(&address, now);
            }
        }
    }

    /// Install, update or remove the auto-disconnect policy
    pub fn set_auto_disconnect(&mut self, timeout: Option<Duration>) {
        match timeout {
            Some(timeout) => log::info!(
                "Auto-disconnect policy: clients connected longer than {}m",
                timeout.as_secs() / 60
            ),
            None => log::info!("Auto-disconnect policy disabled"),
        }
        self.settings.auto_disconnect = timeout;
    }

    /// Reconciliation tick
    ///
    /// Lifts expired bans, retries blocks the filter has not confirmed, then
    /// applies the auto-disconnect policy.
    pub async fn reconcile(&mut self, now: Instant) {
        let due: Vec<IpAddr> = self.bans.expired(now).collect();
        for address in due {
            match self.filter.apply_unblock(address).await {
                Ok(()) => {
                    self.bans.evict(&address);
                    self.mark_released(address, now);
                    log::info!("Ban on {} expired", address);
                    self.record(address, SessionAction::Expired, None);
                }
                Err(e) => {
                    log::warn!("Failed to lift expired ban on {}: {} (will retry)", address, e);
                    self.bans.mark_unenforced(&address);
                }
            }
        }

        let pending: Vec<IpAddr> = self.bans.unenforced(now).collect();
        for address in pending {
            log::debug!("Retrying block for {}", address);
            self.enforce(address).await;
        }

        if let Some(timeout) = self.settings.auto_disconnect {
            let overdue: Vec<IpAddr> = self
                .registry
                .snapshot()
                .filter(|station| !self.bans.contains(&station.address))
                .filter(|station| now.saturating_duration_since(self.session_start(station)) >= timeout)
                .map(|station| station.address)
                .collect();

            for address in overdue {
                log::info!(
                    "Station {} exceeded auto-disconnect timeout ({}m)",
                    address,
                    timeout.as_secs() / 60
                );
                self.ban(address, BanReason::AutoDisconnectTimeout, now).await;
            }
        }
    }

    async fn ban(&mut self, address: IpAddr, reason: BanReason, now: Instant) -> Instant {
        let grace = self.settings.manual_kick_grace;
        let expires_at = self.bans.ban(address, grace, reason, now);
        log::info!(
            "Banned {} for {}s ({})",
            address,
            grace.as_secs(),
            reason.as_str()
        );

        let action = match reason {
            BanReason::ManualKick => SessionAction::Kicked,
            BanReason::AutoDisconnectTimeout => SessionAction::AutoDisconnected,
        };
        self.record(address, action, Some(reason.as_str()));

        let enforced = self
            .bans
            .get(&address)
            .map(|ban| ban.is_enforced())
            .unwrap_or(false);
        if !enforced {
            self.enforce(address).await;
        }
        expires_at
    }

    async fn enforce(&mut self, address: IpAddr) -> bool {
        match self.filter.apply_block(address).await {
            Ok(()) => {
                self.bans.mark_enforced(&address);
                true
            }
            Err(e) => {
                log::warn!("Failed to block {}: {} (will retry)", address, e);
                false
            }
        }
    }

    fn session_start(&self, station: &Station) -> Instant {
        match self.released.get(&station.address) {
            Some(&released) if released > station.associated_at => released,
            _ => station.associated_at,
        }
    }

    fn mark_released(&mut self, address: IpAddr, now: Instant) {
        if self.registry.contains(&address) {
            self.released.insert(address, now);
        }
    }

    fn record(&self, address: IpAddr, action: SessionAction, details: Option<&str>) {
        if let Some(event_log) = &self.event_log {
            if let Err(e) = event_log.record(address, action, details) {
                log::warn!("Failed to write event log: {}", e);
            }
        }
    }
}

/// Run the controller loop until `shutdown` changes or its sender is dropped
///
/// Returns the controller so callers can inspect its final state.
pub async fn run<F: PacketFilter>(
    mut controller: SessionController<F>,
    mut stations: mpsc::Receiver<StationEvent>,
    mut requests: mpsc::Receiver<Request>,
    mut shutdown: watch::Receiver<bool>,
) -> SessionController<F> {
    let mut reconcile_timer = interval(controller.settings.reconciliation_interval);
    reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log::info!(
        "Session controller started (kick grace {}s, reconcile every {}s)",
        controller.settings.manual_kick_grace.as_secs(),
        controller.settings.reconciliation_interval.as_secs()
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                log::info!("Session controller shutting down");
                break;
            }

            Some(event) = stations.recv() => {
                controller.handle_station_event(event);
            }

            Some(request) = requests.recv() => {
                controller.handle_request(request, Instant::now()).await;
            }

            _ = reconcile_timer.tick() => {
                controller.reconcile(Instant::now()).await;
            }
        }
    }

    if !controller.bans.is_empty() {
        log::info!(
            "{} ban(s) still active at shutdown; filter rules left in place",
            controller.bans.len()
        );
    }

    controller
}

/// Cloneable request side of the controller loop
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    requests: mpsc::Sender<Request>,
}

impl ControllerHandle {
    /// Create a handle and the receiver to pass to [`run`]
    pub fn channel() -> (Self, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        (Self { requests: tx }, rx)
    }

    pub async fn list(&self) -> Result<Vec<StationStatus>> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::List(tx)).await?;
        rx.await.map_err(|_| GuardError::ControllerStopped)
    }

    pub async fn count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Request::Count(tx)).await?;
        rx.await.map_err(|_| GuardError::ControllerStopped)
    }

    /// Queue a kick; the outcome is not waited on
    pub async fn kick(&self, address: IpAddr) -> Result<()> {
        self.send(Request::Kick(address)).await
    }

    pub async fn unban(&self, address: IpAddr) -> Result<()> {
        self.send(Request::Unban(address)).await
    }

    pub async fn set_auto_disconnect(&self, timeout: Option<Duration>) -> Result<()> {
        self.send(Request::AutoDisconnect(timeout)).await
    }

    async fn send(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| GuardError::ControllerStopped)
    }
}
