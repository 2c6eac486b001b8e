//! CARP state machine.
//!
//! Implements the instance state transitions:
//! - Init → Backup (bound, administratively up and vhid configured)
//! - Backup → Master (master-down timer expiry, bow-out or preemption)
//! - Master → Backup (advertisement from a more preferred peer)
//! - Master/Backup → Init (administratively down or unbound, with bow-out)
//!
//! [`InstanceCore`] holds every mutable field of an instance and is only
//! touched with the instance lock held. Its methods decide and return
//! [`Effect`]s; the caller performs them after releasing the lock, so no
//! network I/O happens under the lock.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{InstanceConfig, InstanceParams};
use crate::error::{PacketError, TransmitFailure};
use crate::failover::Announcement;
use crate::packet::CarpAdvertisement;
use crate::port::{AnnounceReport, NetworkPort};
use crate::timer::{TimerEngine, TimerKind, TimerToken};
use crate::types::{CARP_BOW_OUT_DEMOTE, CARP_DELAYED_ARP, CarpState, CarpStats};

/// Future run when a timer expires
pub type ExpiryFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Builds the expiry future for a fired timer
pub type ExpiryHandler = Arc<dyn Fn(TimerToken) -> ExpiryFuture + Send + Sync>;

/// Typed handle of an instance within its registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Election rank carried by an advertisement. Lower is more preferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Preference {
    pub demote: u8,
    pub advbase: u8,
    pub advskew: u8,
}

impl Preference {
    pub fn of(adv: &CarpAdvertisement) -> Self {
        Self {
            demote: adv.demote,
            advbase: adv.advbase,
            advskew: adv.advskew,
        }
    }
}

/// Check `counter` from `source` against the last accepted advertisement.
///
/// Counters from the same source must move strictly forward in wrapping
/// order; a new source starts a new window.
pub fn is_fresh(
    last_seen: Option<(Ipv4Addr, u64)>,
    source: Ipv4Addr,
    counter: u64,
) -> Result<(), PacketError> {
    match last_seen {
        Some((from, last)) if from == source && (counter.wrapping_sub(last) as i64) <= 0 => {
            Err(PacketError::Replay { counter, last })
        }
        _ => Ok(()),
    }
}

/// An advertisement ready to be signed and sent
pub struct Outbound {
    pub port: Arc<dyn NetworkPort>,
    pub config: Arc<InstanceConfig>,
    pub advertisement: CarpAdvertisement,
    pub source: Ipv4Addr,
}

impl Outbound {
    /// Sign, checksum and send
    pub async fn transmit(&self) -> io::Result<usize> {
        let mut adv = self.advertisement.clone();
        self.config.auth.sign(&mut adv, self.source);
        adv.set_checksum();

        trace!(
            vhid = adv.vhid,
            counter = adv.counter,
            demote = adv.demote,
            interface = self.port.name(),
            "sending advertisement"
        );
        self.port.send(adv.to_bytes()).await
    }

    pub fn is_bow_out(&self) -> bool {
        self.advertisement.demote == CARP_BOW_OUT_DEMOTE
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("interface", &self.port.name())
            .field("advertisement", &self.advertisement)
            .field("source", &self.source)
            .finish()
    }
}

/// Work decided under the instance lock and performed after releasing it
pub enum Effect {
    Advertise(Outbound),
    Announce {
        port: Arc<dyn NetworkPort>,
        announcement: Announcement,
    },
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Effect::Advertise(outbound) => f.debug_tuple("Advertise").field(outbound).finish(),
            Effect::Announce { announcement, .. } => {
                f.debug_tuple("Announce").field(announcement).finish()
            }
        }
    }
}

/// Mutable state of one instance, guarded by the instance lock
pub struct InstanceCore {
    id: InstanceId,
    name: String,
    state: CarpState,
    config: Arc<InstanceConfig>,
    port: Option<Weak<dyn NetworkPort>>,
    admin_up: bool,
    preempt: bool,
    counter: u64,
    last_seen: Option<(Ipv4Addr, u64)>,
    delayed_arp: Option<u8>,
    timers: TimerEngine,
    on_expiry: ExpiryHandler,
    stats: CarpStats,
    retired: bool,
}

impl InstanceCore {
    /// Create an unconfigured instance in INIT. `counter` seeds the
    /// anti-replay counter.
    pub fn new(
        id: InstanceId,
        name: impl Into<String>,
        counter: u64,
        preempt: bool,
        on_expiry: ExpiryHandler,
    ) -> Self {
        let config = InstanceConfig::default();
        Self {
            id,
            name: name.into(),
            state: CarpState::Init,
            timers: TimerEngine::new(config.timeouts()),
            config: Arc::new(config),
            port: None,
            admin_up: false,
            preempt,
            counter,
            last_seen: None,
            delayed_arp: None,
            on_expiry,
            stats: CarpStats::default(),
            retired: false,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CarpState {
        self.state
    }

    pub fn config(&self) -> &Arc<InstanceConfig> {
        &self.config
    }

    pub fn stats(&self) -> &CarpStats {
        &self.stats
    }

    pub fn is_admin_up(&self) -> bool {
        self.admin_up
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.timers.is_armed(kind)
    }

    pub fn params(&self) -> InstanceParams {
        let timeouts = self.timers.timeouts();
        InstanceParams {
            name: self.name.clone(),
            state: self.state,
            vhid: self.config.vhid,
            advbase: self.config.advbase,
            advskew: self.config.advskew,
            demote: self.config.demote,
            interface: self.config.interface.clone(),
            addresses: self.config.addresses.clone(),
            virtual_mac: self.config.virtual_mac(),
            master_down_timeout: timeouts.master_down,
            advertisement_timeout: timeouts.advertisement,
            admin_up: self.admin_up,
        }
    }

    fn bound_port(&self) -> Option<Arc<dyn NetworkPort>> {
        self.port.as_ref().and_then(Weak::upgrade)
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.bound_port().and_then(|port| port.primary_address())
    }

    fn arm(&mut self, kind: TimerKind) {
        let handler = self.on_expiry.clone();
        self.timers.arm(kind, move |token| handler(token));
    }

    fn set_state(&mut self, state: CarpState) {
        if self.state == state {
            return;
        }

        info!(
            instance = %self.name,
            vhid = self.config.vhid,
            from = %self.state,
            to = %state,
            "state transition"
        );
        self.state = state;

        match state {
            CarpState::Master => {
                self.timers.disarm(TimerKind::MasterDown);
                if !self.timers.is_armed(TimerKind::Advertisement) {
                    self.arm(TimerKind::Advertisement);
                }
                self.stats.master_transitions += 1;
            }
            CarpState::Backup => {
                self.timers.disarm(TimerKind::Advertisement);
                if !self.timers.is_armed(TimerKind::MasterDown) {
                    self.arm(TimerKind::MasterDown);
                }
                self.delayed_arp = None;
                self.stats.backup_transitions += 1;
            }
            CarpState::Init => {
                self.timers.disarm_all();
                self.delayed_arp = None;
            }
        }
    }

    /// Re-evaluate whether the instance should be running and enter the
    /// matching state.
    pub fn set_run(&mut self) -> Vec<Effect> {
        // Destroyed instances never rejoin
        if self.retired {
            return Vec::new();
        }

        if self.bound_port().is_none() || !self.admin_up || self.config.vhid == 0 {
            return self.leave();
        }

        match self.state {
            CarpState::Init => self.set_state(CarpState::Backup),
            CarpState::Backup => {
                self.timers.disarm(TimerKind::Advertisement);
                self.arm(TimerKind::MasterDown);
            }
            CarpState::Master => {
                if !self.timers.is_armed(TimerKind::Advertisement) {
                    self.arm(TimerKind::Advertisement);
                }
            }
        }

        Vec::new()
    }

    /// Leave the protocol: bow out if master, disarm both timers, enter INIT
    pub fn leave(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();

        if self.state == CarpState::Master
            && let Some(outbound) = self.advertisement(true)
        {
            debug!(instance = %self.name, vhid = self.config.vhid, "bowing out");
            effects.push(Effect::Advertise(outbound));
        }

        self.set_state(CarpState::Init);
        self.timers.disarm_all();
        effects
    }

    /// Master-down event: take over if currently backup
    pub fn master_down(&mut self) -> Vec<Effect> {
        if self.state != CarpState::Backup {
            return Vec::new();
        }

        self.set_state(CarpState::Master);
        self.last_seen = None;

        let mut effects = Vec::new();
        if let Some(outbound) = self.advertisement(false) {
            effects.push(Effect::Advertise(outbound));
        }
        if let Some(announce) = self.announcement() {
            effects.push(announce);
        }
        self.delayed_arp = Some(CARP_DELAYED_ARP);
        effects
    }

    fn advertisement_due(&mut self) -> Vec<Effect> {
        if self.state != CarpState::Master {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if let Some(outbound) = self.advertisement(false) {
            effects.push(Effect::Advertise(outbound));
        }
        self.arm(TimerKind::Advertisement);

        match self.delayed_arp {
            Some(remaining) if remaining <= 1 => {
                self.delayed_arp = None;
                if let Some(announce) = self.announcement() {
                    effects.push(announce);
                }
            }
            Some(remaining) => self.delayed_arp = Some(remaining - 1),
            None => {}
        }

        effects
    }

    /// Handle a timer expiry. Stale tokens are ignored.
    pub fn on_timer(&mut self, token: TimerToken) -> Vec<Effect> {
        if self.retired || !self.timers.expire(token) {
            trace!(instance = %self.name, timer = %token.kind(), "ignoring stale timer");
            return Vec::new();
        }

        debug!(
            instance = %self.name,
            vhid = self.config.vhid,
            timer = %token.kind(),
            state = %self.state,
            "timer expired"
        );

        match token.kind() {
            TimerKind::MasterDown => self.master_down(),
            TimerKind::Advertisement => self.advertisement_due(),
        }
    }

    /// Build the next advertisement. Consumes a counter value.
    fn advertisement(&mut self, bow_out: bool) -> Option<Outbound> {
        let port = self.bound_port()?;

        let Some(source) = port.primary_address() else {
            warn!(
                instance = %self.name,
                interface = port.name(),
                "no IPv4 address to advertise from"
            );
            self.stats.xmit_errors += 1;
            return None;
        };

        self.counter = self.counter.wrapping_add(1);
        let demote = if bow_out {
            CARP_BOW_OUT_DEMOTE
        } else {
            self.config.demote
        };

        Some(Outbound {
            port,
            config: self.config.clone(),
            advertisement: CarpAdvertisement::new(
                self.config.vhid,
                self.config.advskew,
                self.config.advbase,
                demote,
                self.counter,
            ),
            source,
        })
    }

    fn announcement(&self) -> Option<Effect> {
        let port = self.bound_port()?;
        Some(Effect::Announce {
            port,
            announcement: Announcement {
                vhid: self.config.vhid,
                mac: self.config.virtual_mac(),
                addresses: self.config.addresses.clone(),
            },
        })
    }

    fn preference(&self) -> Preference {
        Preference {
            demote: self.config.demote,
            advbase: self.config.advbase,
            advskew: self.config.advskew,
        }
    }

    fn validate(&self, adv: &CarpAdvertisement, source: Ipv4Addr) -> Result<(), PacketError> {
        if adv.vhid != self.config.vhid {
            return Err(PacketError::UnknownVhid(adv.vhid));
        }

        self.config.auth.verify(adv, source)?;
        is_fresh(self.last_seen, source, adv.counter)
    }

    /// Apply an advertisement that passed codec and checksum screening.
    /// Drops are counted in this instance's statistics.
    pub fn on_advertisement(&mut self, adv: &CarpAdvertisement, source: Ipv4Addr) -> Vec<Effect> {
        if self.retired {
            return Vec::new();
        }

        let local = self.local_address();
        if local == Some(source) {
            trace!(instance = %self.name, "ignoring own advertisement");
            return Vec::new();
        }

        if let Err(err) = self.validate(adv, source) {
            debug!(
                instance = %self.name,
                vhid = self.config.vhid,
                from = %source,
                error = %err,
                "dropping advertisement"
            );
            err.record(&mut self.stats);
            return Vec::new();
        }

        self.last_seen = Some((source, adv.counter));
        self.stats.adverts_received += 1;

        let theirs = Preference::of(adv);
        let ours = self.preference();

        match self.state {
            CarpState::Init => Vec::new(),
            CarpState::Master => {
                let tie_lost = theirs == ours
                    && self.preempt
                    && local.is_none_or(|address| source > address);

                if theirs < ours || tie_lost {
                    info!(
                        instance = %self.name,
                        vhid = self.config.vhid,
                        from = %source,
                        their_advskew = adv.advskew,
                        our_advskew = self.config.advskew,
                        "more preferred master detected"
                    );
                    self.set_state(CarpState::Backup);
                }
                Vec::new()
            }
            CarpState::Backup => {
                if adv.demote == CARP_BOW_OUT_DEMOTE {
                    debug!(instance = %self.name, from = %source, "master bowed out");
                    return self.master_down();
                }

                if self.preempt && theirs > ours {
                    info!(
                        instance = %self.name,
                        vhid = self.config.vhid,
                        from = %source,
                        "preempting less preferred master"
                    );
                    return self.master_down();
                }

                self.arm(TimerKind::MasterDown);
                Vec::new()
            }
        }
    }

    /// Administrative state request
    pub fn request_state(&mut self, state: CarpState) -> Vec<Effect> {
        if state == self.state {
            return Vec::new();
        }

        match state {
            CarpState::Master => self.master_down(),
            CarpState::Backup => {
                self.set_state(CarpState::Backup);
                self.set_run()
            }
            CarpState::Init => self.leave(),
        }
    }

    /// Swap in a validated configuration. `port` is the port of the new
    /// interface when the binding changes.
    pub fn reconfigure(
        &mut self,
        next: InstanceConfig,
        port: Option<Weak<dyn NetworkPort>>,
        state: Option<CarpState>,
    ) -> Vec<Effect> {
        let rebinding = next.interface != self.config.interface;
        let vhid_changed = next.vhid != self.config.vhid;
        let mut effects = Vec::new();

        if rebinding {
            effects.extend(self.leave());
            self.port = port;
        }

        if vhid_changed {
            self.last_seen = None;
        }

        self.timers.set_timeouts(next.timeouts());
        self.config = Arc::new(next);

        if rebinding || vhid_changed {
            effects.extend(self.set_run());
        }

        if let Some(state) = state {
            effects.extend(self.request_state(state));
        }

        effects
    }

    /// Administratively bring the instance up
    pub fn up(&mut self) -> Vec<Effect> {
        self.admin_up = true;
        self.set_run()
    }

    /// Administratively bring the instance down
    pub fn down(&mut self) -> Vec<Effect> {
        self.admin_up = false;
        self.leave()
    }

    /// The bound interface is going away
    pub fn unbind(&mut self) -> Vec<Effect> {
        let effects = self.leave();
        self.port = None;
        effects
    }

    /// The bound interface (re)appeared
    pub fn bind(&mut self, port: Weak<dyn NetworkPort>) -> Vec<Effect> {
        self.port = Some(port);
        self.set_run()
    }

    /// Final teardown before deregistration. Timers are disarmed before
    /// this returns and later callbacks are ignored.
    pub fn retire(&mut self) -> Vec<Effect> {
        let effects = self.leave();
        self.retired = true;
        effects
    }

    pub fn record_transmit(&mut self, result: &io::Result<usize>) {
        match result {
            Ok(sent) => {
                self.stats.adverts_sent += 1;
                self.stats.bytes_sent += *sent as u64;
            }
            Err(err) => {
                warn!(
                    instance = %self.name,
                    vhid = self.config.vhid,
                    error = %err,
                    "failed to send advertisement"
                );
                TransmitFailure::classify(err).record(&mut self.stats);
            }
        }
    }

    pub fn record_announce(&mut self, report: &AnnounceReport) {
        report.record(&mut self.stats);
    }
}

impl fmt::Debug for InstanceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("config", &self.config)
            .field("admin_up", &self.admin_up)
            .field("timers", &self.timers)
            .finish()
    }
}

/// A registered instance: its identity plus the lock over its state
#[derive(Debug)]
pub struct CarpInstance {
    id: InstanceId,
    name: String,
    core: Mutex<InstanceCore>,
}

impl CarpInstance {
    pub fn new(core: InstanceCore) -> Self {
        Self {
            id: core.id(),
            name: core.name().to_string(),
            core: Mutex::new(core),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, InstanceCore> {
        self.core.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthKey;
    use crate::config::ConfigUpdate;
    use crate::port::MockNetworkPort;
    use crate::types::MacAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
    const LOWER_PEER: Ipv4Addr = Ipv4Addr::new(9, 0, 0, 2);

    struct Harness {
        core: InstanceCore,
        expired: mpsc::UnboundedReceiver<TimerToken>,
        _port: Arc<dyn NetworkPort>,
    }

    fn port() -> Arc<dyn NetworkPort> {
        let mut port = MockNetworkPort::new();
        port.expect_name().return_const("eth0".to_string());
        port.expect_primary_address().return_const(Some(LOCAL));
        Arc::new(port)
    }

    fn channel_handler() -> (ExpiryHandler, mpsc::UnboundedReceiver<TimerToken>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: ExpiryHandler = Arc::new(move |token: TimerToken| -> ExpiryFuture {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(token);
            })
        });
        (handler, rx)
    }

    fn harness(advskew: u8, preempt: bool) -> Harness {
        let (handler, expired) = channel_handler();
        let port = port();
        let mut core = InstanceCore::new(InstanceId(1), "carp0", 100, preempt, handler);
        let config = core
            .config()
            .apply(
                &ConfigUpdate::new()
                    .vhid(5)
                    .advskew(advskew)
                    .interface("eth0")
                    .addresses(vec![Ipv4Addr::new(10, 0, 0, 100)]),
            )
            .unwrap();
        core.reconfigure(config, Some(Arc::downgrade(&port)), None);

        Harness {
            core,
            expired,
            _port: port,
        }
    }

    fn advert(advskew: u8, demote: u8, counter: u64, source: Ipv4Addr) -> CarpAdvertisement {
        let mut adv = CarpAdvertisement::new(5, advskew, 1, demote, counter);
        AuthKey::default().sign(&mut adv, source);
        adv.set_checksum();
        adv
    }

    async fn become_master(h: &mut Harness) -> Vec<Effect> {
        h.core.up();
        let token = h.expired.recv().await.unwrap();
        assert_eq!(token.kind(), TimerKind::MasterDown);
        let effects = h.core.on_timer(token);
        assert_eq!(h.core.state(), CarpState::Master);
        effects
    }

    #[tokio::test(start_paused = true)]
    async fn test_up_enters_backup_with_md_armed() {
        let mut h = harness(0, false);
        assert_eq!(h.core.state(), CarpState::Init);

        h.core.up();
        assert_eq!(h.core.state(), CarpState::Backup);
        assert!(h.core.is_armed(TimerKind::MasterDown));
        assert!(!h.core.is_armed(TimerKind::Advertisement));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbound_or_unconfigured_stays_init() {
        let (handler, _expired) = channel_handler();
        let mut core = InstanceCore::new(InstanceId(2), "carp1", 0, false, handler);

        core.up();
        assert_eq!(core.state(), CarpState::Init);
        assert!(!core.is_armed(TimerKind::MasterDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_down_takes_over() {
        let mut h = harness(0, false);
        let start = tokio::time::Instant::now();
        let effects = become_master(&mut h).await;

        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert!(h.core.is_armed(TimerKind::Advertisement));
        assert!(!h.core.is_armed(TimerKind::MasterDown));
        assert_eq!(h.core.stats().master_transitions, 1);

        assert_eq!(effects.len(), 2);
        match &effects[0] {
            Effect::Advertise(outbound) => {
                assert_eq!(outbound.source, LOCAL);
                assert_eq!(outbound.advertisement.counter, 101);
                assert!(!outbound.is_bow_out());
            }
            other => panic!("unexpected effect {other:?}"),
        }
        match &effects[1] {
            Effect::Announce { announcement, .. } => {
                assert_eq!(announcement.mac, MacAddr::virtual_router(5));
                assert_eq!(announcement.addresses, vec![Ipv4Addr::new(10, 0, 0, 100)]);
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_advert_rearms_backup() {
        let mut h = harness(50, false);
        h.core.up();

        let effects = h.core.on_advertisement(&advert(0, 0, 1, PEER), PEER);
        assert!(effects.is_empty());
        assert_eq!(h.core.state(), CarpState::Backup);
        assert_eq!(h.core.stats().adverts_received, 1);
        assert!(h.core.is_armed(TimerKind::MasterDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_yields_to_lower_skew() {
        let mut h = harness(50, false);
        become_master(&mut h).await;

        h.core.on_advertisement(&advert(0, 0, 1, PEER), PEER);
        assert_eq!(h.core.state(), CarpState::Backup);
        assert!(h.core.is_armed(TimerKind::MasterDown));
        assert!(!h.core.is_armed(TimerKind::Advertisement));
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_holds_against_equal_or_worse() {
        let mut h = harness(50, false);
        become_master(&mut h).await;

        h.core.on_advertisement(&advert(50, 0, 1, PEER), PEER);
        h.core.on_advertisement(&advert(100, 0, 2, PEER), PEER);
        assert_eq!(h.core.state(), CarpState::Master);
        assert_eq!(h.core.stats().adverts_received, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_preempt_tie_broken_by_address() {
        let mut h = harness(50, true);
        become_master(&mut h).await;

        // Lower address loses the tie
        h.core.on_advertisement(&advert(50, 0, 1, LOWER_PEER), LOWER_PEER);
        assert_eq!(h.core.state(), CarpState::Master);

        // Higher address wins it
        h.core.on_advertisement(&advert(50, 0, 1, PEER), PEER);
        assert_eq!(h.core.state(), CarpState::Backup);
    }

    #[tokio::test(start_paused = true)]
    async fn test_demotion_outranks_skew() {
        let mut h = harness(50, false);
        become_master(&mut h).await;

        h.core.on_advertisement(&advert(0, 1, 1, PEER), PEER);
        assert_eq!(h.core.state(), CarpState::Master);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backup_preempts_worse_master() {
        let mut h = harness(0, true);
        h.core.up();

        let effects = h.core.on_advertisement(&advert(100, 0, 1, PEER), PEER);
        assert_eq!(h.core.state(), CarpState::Master);
        assert!(!effects.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bow_out_triggers_takeover() {
        let mut h = harness(100, false);
        h.core.up();

        h.core
            .on_advertisement(&advert(0, CARP_BOW_OUT_DEMOTE, 1, PEER), PEER);
        assert_eq!(h.core.state(), CarpState::Master);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_is_dropped() {
        let mut h = harness(50, false);
        h.core.up();

        let adv = advert(0, 0, 7, PEER);
        h.core.on_advertisement(&adv, PEER);
        h.core.on_advertisement(&adv, PEER);
        h.core.on_advertisement(&advert(0, 0, 6, PEER), PEER);

        assert_eq!(h.core.stats().adverts_received, 1);
        assert_eq!(h.core.stats().counter_errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_digest_and_vhid_are_counted() {
        let mut h = harness(50, false);
        h.core.up();

        let mut forged = advert(0, 0, 1, PEER);
        forged.digest[0] ^= 0xff;
        h.core.on_advertisement(&forged, PEER);

        let mut other = CarpAdvertisement::new(6, 0, 1, 0, 1);
        AuthKey::default().sign(&mut other, PEER);
        h.core.on_advertisement(&other, PEER);

        assert_eq!(h.core.stats().hmac_errors, 1);
        assert_eq!(h.core.stats().vhid_errors, 1);
        assert_eq!(h.core.stats().adverts_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_advertisement_ignored() {
        let mut h = harness(50, false);
        h.core.up();

        h.core.on_advertisement(&advert(0, 0, 1, LOCAL), LOCAL);
        assert_eq!(h.core.stats().adverts_received, 0);
        assert_eq!(h.core.stats().dropped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_from_master_bows_out() {
        let mut h = harness(0, false);
        become_master(&mut h).await;

        let effects = h.core.down();
        assert_eq!(h.core.state(), CarpState::Init);
        assert!(!h.core.is_armed(TimerKind::MasterDown));
        assert!(!h.core.is_armed(TimerKind::Advertisement));

        match effects.as_slice() {
            [Effect::Advertise(outbound)] => assert!(outbound.is_bow_out()),
            other => panic!("unexpected effects {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_arp_on_second_advertisement() {
        let mut h = harness(0, false);
        become_master(&mut h).await;

        let announces = |effects: &[Effect]| {
            effects
                .iter()
                .filter(|e| matches!(e, Effect::Announce { .. }))
                .count()
        };

        let token = h.expired.recv().await.unwrap();
        let first = h.core.on_timer(token);
        assert_eq!(announces(&first), 0);

        let token = h.expired.recv().await.unwrap();
        let second = h.core.on_timer(token);
        assert_eq!(announces(&second), 1);

        let token = h.expired.recv().await.unwrap();
        let third = h.core.on_timer(token);
        assert_eq!(announces(&third), 0);
        assert!(h.core.is_armed(TimerKind::Advertisement));
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_requests() {
        let mut h = harness(0, false);
        h.core.up();

        assert!(h.core.request_state(CarpState::Backup).is_empty());
        assert_eq!(h.core.stats().backup_transitions, 1);

        h.core.request_state(CarpState::Master);
        assert_eq!(h.core.state(), CarpState::Master);

        h.core.request_state(CarpState::Backup);
        assert_eq!(h.core.state(), CarpState::Backup);
        assert!(h.core.is_armed(TimerKind::MasterDown));

        h.core.request_state(CarpState::Init);
        assert_eq!(h.core.state(), CarpState::Init);

        // MASTER only takes effect from BACKUP
        h.core.request_state(CarpState::Master);
        assert_eq!(h.core.state(), CarpState::Init);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_ignores_timers() {
        let mut h = harness(0, false);
        h.core.up();
        h.core.retire();

        assert!(h.core.is_retired());
        assert_eq!(h.core.state(), CarpState::Init);
        assert!(!h.core.is_armed(TimerKind::MasterDown));

        // An up() racing the destroy cannot bring it back
        assert!(h.core.up().is_empty());
        assert!(h.core.set_run().is_empty());
        assert_eq!(h.core.state(), CarpState::Init);
        assert!(!h.core.is_armed(TimerKind::MasterDown));
        assert!(!h.core.is_armed(TimerKind::Advertisement));
    }

    #[test]
    fn test_replay_window() {
        assert!(is_fresh(None, PEER, 0).is_ok());
        assert!(is_fresh(Some((PEER, 5)), PEER, 6).is_ok());
        assert!(is_fresh(Some((PEER, 5)), PEER, 5).is_err());
        assert!(is_fresh(Some((PEER, 5)), PEER, 4).is_err());

        // Wraparound moves forward
        assert!(is_fresh(Some((PEER, u64::MAX)), PEER, 0).is_ok());

        // A different source starts over
        assert!(is_fresh(Some((PEER, 5)), LOWER_PEER, 1).is_ok());
    }

    #[test]
    fn test_preference_order() {
        let base = Preference {
            demote: 0,
            advbase: 1,
            advskew: 50,
        };
        assert!(Preference { advskew: 0, ..base } < base);
        assert!(Preference { demote: 1, advskew: 0, ..base } > base);
        assert!(Preference { advbase: 2, advskew: 0, ..base } > base);
    }

    #[tokio::test]
    async fn test_record_transmit() {
        let mut h = harness(0, false);
        h.core.record_transmit(&Ok(36));
        h.core
            .record_transmit(&Err(io::Error::from_raw_os_error(libc::ENOBUFS)));
        h.core
            .record_transmit(&Err(io::Error::from_raw_os_error(libc::ENETDOWN)));

        let stats = h.core.stats();
        assert_eq!(stats.adverts_sent, 1);
        assert_eq!(stats.bytes_sent, 36);
        assert_eq!(stats.mem_errors, 1);
        assert_eq!(stats.xmit_errors, 1);
    }
}
