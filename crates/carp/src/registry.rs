//! Instance registry.
//!
//! Owns every CARP instance of one host context. There is no process-wide
//! list: a registry is created explicitly and passed to whoever needs it,
//! so independent registries (one per network namespace, one per test) can
//! coexist.
//!
//! Lookups go through concurrent maps and are safe from the receive path
//! while an administrative writer creates, destroys or reconfigures
//! instances. Writers are serialized by a registry-wide lock; each
//! instance's protocol state is serialized by its own lock. Lock order is
//! writer, then instance. No lock is held across network I/O.
//!
//! Timer callbacks carry a weak registry reference and an [`InstanceId`]
//! and resolve the instance when they fire, so a destroyed instance is
//! simply not found.

use dashmap::DashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{ConfigUpdate, InstanceParams};
use crate::error::{ConfigError, PacketError};
use crate::failover;
use crate::packet::CarpAdvertisement;
use crate::port::{InterfaceTable, NetworkPort, Received};
use crate::state_machine::{
    CarpInstance, Effect, ExpiryFuture, ExpiryHandler, InstanceCore, InstanceId,
};
use crate::timer::TimerToken;
use crate::types::{CARP_HEADER_LEN, CARP_TTL, CarpState, CarpStats, GlobalParams};

/// Checks that need no instance: TTL, length, checksum and codec
pub fn screen(received: &Received) -> Result<CarpAdvertisement, PacketError> {
    if received.ttl != CARP_TTL {
        return Err(PacketError::Ttl(received.ttl));
    }

    if received.payload.len() < CARP_HEADER_LEN {
        return Err(PacketError::Malformed("packet too short"));
    }

    if !CarpAdvertisement::verify_checksum(&received.payload) {
        return Err(PacketError::Checksum);
    }

    CarpAdvertisement::parse(&received.payload)
}

/// The set of CARP instances of one host context
pub struct InstanceRegistry {
    me: Weak<InstanceRegistry>,
    params: GlobalParams,
    interfaces: InterfaceTable,
    instances: DashMap<InstanceId, Arc<CarpInstance>>,
    names: DashMap<String, InstanceId>,
    bindings: DashMap<(String, u8), InstanceId>,
    next_id: AtomicU64,
    writer: Mutex<()>,
    /// Drops that happened before an instance was identified
    stats: RwLock<CarpStats>,
    tx_permits: Semaphore,
}

impl InstanceRegistry {
    /// Create a registry. `params` are fixed for its lifetime.
    pub fn new(params: GlobalParams) -> Result<Arc<Self>, ConfigError> {
        params.validate()?;

        info!(
            preempt = params.preempt,
            max_instances = params.max_instances,
            tx_queues = params.tx_queues,
            "creating CARP registry"
        );

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            tx_permits: Semaphore::new(params.tx_queues),
            params,
            interfaces: InterfaceTable::new(),
            instances: DashMap::new(),
            names: DashMap::new(),
            bindings: DashMap::new(),
            next_id: AtomicU64::new(1),
            writer: Mutex::new(()),
            stats: RwLock::new(CarpStats::default()),
        }))
    }

    pub fn global_params(&self) -> &GlobalParams {
        &self.params
    }

    pub fn interfaces(&self) -> &InterfaceTable {
        &self.interfaces
    }

    /// Registry-level drop counters
    pub async fn registry_stats(&self) -> CarpStats {
        self.stats.read().await.clone()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Instance names, sorted
    pub fn instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.names.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn instance(&self, name: &str) -> Result<Arc<CarpInstance>, ConfigError> {
        self.names
            .get(name)
            .and_then(|id| self.instances.get(id.value()).map(|entry| entry.value().clone()))
            .ok_or_else(|| ConfigError::UnknownInstance(name.to_string()))
    }

    /// Instance answering for `vhid` on `interface`
    pub fn lookup(&self, interface: &str, vhid: u8) -> Option<Arc<CarpInstance>> {
        let id = *self.bindings.get(&(interface.to_string(), vhid))?;
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    fn expiry_handler(&self, id: InstanceId) -> ExpiryHandler {
        let registry = self.me.clone();
        Arc::new(move |token: TimerToken| -> ExpiryFuture {
            Box::pin(Self::on_timer(registry.clone(), id, token))
        })
    }

    async fn on_timer(registry: Weak<InstanceRegistry>, id: InstanceId, token: TimerToken) {
        let Some(registry) = registry.upgrade() else {
            return;
        };

        let Some(instance) = registry.instances.get(&id).map(|entry| entry.value().clone()) else {
            trace!(instance = %id, "timer fired for destroyed instance");
            return;
        };

        let effects = instance.lock().await.on_timer(token);
        registry.execute(&instance, effects).await;
    }

    /// Perform effects decided under an instance lock
    async fn execute(&self, instance: &CarpInstance, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Advertise(outbound) => {
                    let Ok(permit) = self.tx_permits.acquire().await else {
                        return;
                    };
                    let result = outbound.transmit().await;
                    drop(permit);

                    instance.lock().await.record_transmit(&result);
                }
                Effect::Announce { port, announcement } => {
                    let report = failover::announce(port.as_ref(), &announcement).await;
                    instance.lock().await.record_announce(&report);
                }
            }
        }
    }

    /// Register a physical interface. Instances configured for it are
    /// bound and re-evaluated.
    pub async fn add_interface(&self, port: Arc<dyn NetworkPort>) {
        let _writer = self.writer.lock().await;
        let name = port.name().to_string();
        self.interfaces.insert(port.clone());
        info!(interface = %name, "interface added");

        let bound: Vec<Arc<CarpInstance>> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for instance in bound {
            let effects = {
                let mut core = instance.lock().await;
                if core.config().interface.as_deref() != Some(name.as_str()) {
                    continue;
                }
                core.bind(Arc::downgrade(&port))
            };
            self.execute(&instance, effects).await;
        }
    }

    /// Unregister a physical interface. Instances bound to it leave the
    /// protocol (bowing out if master) and drop to INIT.
    pub async fn remove_interface(&self, name: &str) -> Result<(), ConfigError> {
        let _writer = self.writer.lock().await;

        // Held until the bow-outs are sent
        let _port = self
            .interfaces
            .remove(name)
            .ok_or_else(|| ConfigError::UnknownInterface(name.to_string()))?;
        info!(interface = %name, "interface removed");

        let bound: Vec<Arc<CarpInstance>> = self
            .instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for instance in bound {
            let effects = {
                let mut core = instance.lock().await;
                if core.config().interface.as_deref() != Some(name) {
                    continue;
                }
                core.unbind()
            };
            self.execute(&instance, effects).await;
        }

        Ok(())
    }

    /// Create an unconfigured instance in INIT
    pub async fn create(&self, name: &str) -> Result<InstanceId, ConfigError> {
        let _writer = self.writer.lock().await;

        if name.is_empty() {
            return Err(ConfigError::InvalidParams("instance name must not be empty"));
        }

        if self.names.contains_key(name) {
            return Err(ConfigError::InstanceExists(name.to_string()));
        }

        if self.instances.len() >= self.params.max_instances {
            return Err(ConfigError::TooManyInstances(self.params.max_instances));
        }

        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let core = InstanceCore::new(
            id,
            name,
            rand::random::<u64>(),
            self.params.preempt,
            self.expiry_handler(id),
        );

        self.instances.insert(id, Arc::new(CarpInstance::new(core)));
        self.names.insert(name.to_string(), id);

        info!(instance = %name, id = %id, "created instance");
        Ok(id)
    }

    /// Destroy an instance. Its timers are disarmed before it is
    /// deregistered; a master bows out.
    pub async fn destroy(&self, name: &str) -> Result<(), ConfigError> {
        let (instance, effects) = {
            let _writer = self.writer.lock().await;
            let instance = self.instance(name)?;

            let effects = {
                let mut core = instance.lock().await;
                let effects = core.retire();
                if let Some(binding) = core.config().binding() {
                    self.bindings.remove_if(&binding, |_, id| *id == instance.id());
                }
                effects
            };

            self.names.remove(name);
            self.instances.remove(&instance.id());
            (instance, effects)
        };

        info!(instance = %name, "destroyed instance");
        self.execute(&instance, effects).await;
        Ok(())
    }

    /// Destroy every instance
    pub async fn destroy_all(&self) {
        for name in self.instance_names() {
            if let Err(err) = self.destroy(&name).await {
                warn!(instance = %name, error = %err, "failed to destroy instance");
            }
        }
    }

    /// Apply an administrative change all-or-nothing
    pub async fn configure(&self, name: &str, update: ConfigUpdate) -> Result<(), ConfigError> {
        let (instance, effects) = {
            let _writer = self.writer.lock().await;
            let instance = self.instance(name)?;
            let mut core = instance.lock().await;

            let next = core.config().apply(&update)?;

            let port = match &update.interface {
                Some(interface) => Some(
                    self.interfaces
                        .get(interface)
                        .ok_or_else(|| ConfigError::UnknownInterface(interface.clone()))?,
                ),
                None => None,
            };

            let old_binding = core.config().binding();
            let new_binding = next.binding();

            if let Some((interface, vhid)) = &new_binding
                && new_binding != old_binding
                && self
                    .bindings
                    .get(&(interface.clone(), *vhid))
                    .is_some_and(|owner| *owner != instance.id())
            {
                return Err(ConfigError::DuplicateVhid {
                    interface: interface.clone(),
                    vhid: *vhid,
                });
            }

            debug!(instance = %name, update = ?update, "applying configuration");
            let effects = core.reconfigure(
                next,
                port.as_ref().map(Arc::downgrade),
                update.state,
            );

            if old_binding != new_binding {
                if let Some(binding) = &old_binding {
                    self.bindings.remove_if(binding, |_, id| *id == instance.id());
                }
                if let Some(binding) = new_binding {
                    self.bindings.insert(binding, instance.id());
                }
            }

            drop(core);
            (instance, effects)
        };

        self.execute(&instance, effects).await;
        Ok(())
    }

    /// Set the state from administrative input such as `"backup"`
    pub async fn set_state(&self, name: &str, state: &str) -> Result<(), ConfigError> {
        let state: CarpState = state.parse()?;
        self.configure(name, ConfigUpdate::new().state(state)).await
    }

    /// Administratively bring an instance up
    pub async fn up(&self, name: &str) -> Result<(), ConfigError> {
        let instance = self.instance(name)?;
        let effects = instance.lock().await.up();
        self.execute(&instance, effects).await;
        Ok(())
    }

    /// Administratively bring an instance down
    pub async fn down(&self, name: &str) -> Result<(), ConfigError> {
        let instance = self.instance(name)?;
        let effects = instance.lock().await.down();
        self.execute(&instance, effects).await;
        Ok(())
    }

    pub async fn params(&self, name: &str) -> Result<InstanceParams, ConfigError> {
        Ok(self.instance(name)?.lock().await.params())
    }

    pub async fn state(&self, name: &str) -> Result<CarpState, ConfigError> {
        Ok(self.instance(name)?.lock().await.state())
    }

    pub async fn stats(&self, name: &str) -> Result<CarpStats, ConfigError> {
        Ok(self.instance(name)?.lock().await.stats().clone())
    }

    /// Validate and apply one inbound advertisement received on `interface`
    pub async fn dispatch(&self, interface: &str, received: Received) {
        let adv = match screen(&received) {
            Ok(adv) => adv,
            Err(err) => {
                debug!(
                    interface = %interface,
                    from = %received.source,
                    error = %err,
                    "dropping advertisement"
                );
                err.record(&mut *self.stats.write().await);
                return;
            }
        };

        let Some(instance) = self.lookup(interface, adv.vhid) else {
            debug!(
                interface = %interface,
                vhid = adv.vhid,
                from = %received.source,
                "advertisement for unknown vhid"
            );
            PacketError::UnknownVhid(adv.vhid).record(&mut *self.stats.write().await);
            return;
        };

        let effects = instance
            .lock()
            .await
            .on_advertisement(&adv, received.source);
        self.execute(&instance, effects).await;
    }

    /// Run a receive loop for `port` until it closes or the registry is
    /// dropped.
    pub fn spawn_receiver(&self, port: Arc<dyn NetworkPort>) -> JoinHandle<()> {
        let registry = self.me.clone();

        tokio::spawn(async move {
            let interface = port.name().to_string();
            debug!(interface = %interface, "receiver started");

            loop {
                let received = match port.receive().await {
                    Ok(Some(received)) => received,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(interface = %interface, error = %err, "receive failed");
                        continue;
                    }
                };

                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.dispatch(&interface, received).await;
            }

            debug!(interface = %interface, "receiver stopped");
        })
    }

    /// Local addresses of registered interfaces, for diagnostics
    pub fn interface_addresses(&self) -> Vec<(String, Option<Ipv4Addr>)> {
        self.interfaces
            .names()
            .into_iter()
            .map(|name| {
                let address = self.interfaces.get(&name).and_then(|p| p.primary_address());
                (name, address)
            })
            .collect()
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("params", &self.params)
            .field("interfaces", &self.interfaces)
            .field("instances", &self.instance_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthKey;
    use crate::port::{AnnounceReport, MockNetworkPort};
    use bytes::Bytes;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn quiet_port(name: &'static str) -> Arc<dyn NetworkPort> {
        let mut port = MockNetworkPort::new();
        port.expect_name().return_const(name.to_string());
        port.expect_primary_address().return_const(Some(LOCAL));
        port.expect_send().returning(|payload| Ok(payload.len()));
        port.expect_announce().returning(|_, addrs| AnnounceReport {
            sent: addrs.len(),
            ..Default::default()
        });
        Arc::new(port)
    }

    fn registry(max_instances: usize) -> Arc<InstanceRegistry> {
        InstanceRegistry::new(GlobalParams {
            max_instances,
            ..Default::default()
        })
        .unwrap()
    }

    fn wire(vhid: u8, counter: u64, ttl: u8) -> Received {
        let mut adv = CarpAdvertisement::new(vhid, 0, 1, 0, counter);
        AuthKey::default().sign(&mut adv, PEER);
        adv.set_checksum();
        Received {
            payload: adv.to_bytes(),
            source: PEER,
            ttl,
        }
    }

    #[test]
    fn test_screen() {
        assert!(screen(&wire(5, 1, CARP_TTL)).is_ok());
        assert_eq!(screen(&wire(5, 1, 64)), Err(PacketError::Ttl(64)));

        let mut short = wire(5, 1, CARP_TTL);
        short.payload = short.payload.slice(..20);
        assert!(matches!(screen(&short), Err(PacketError::Malformed(_))));

        let mut corrupt = wire(5, 1, CARP_TTL).payload.to_vec();
        corrupt[20] ^= 0x01;
        let corrupt = Received {
            payload: Bytes::from(corrupt),
            source: PEER,
            ttl: CARP_TTL,
        };
        assert_eq!(screen(&corrupt), Err(PacketError::Checksum));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = GlobalParams {
            tx_queues: 0,
            ..Default::default()
        };
        assert!(InstanceRegistry::new(params).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_and_destroy() {
        let registry = registry(2);
        registry.create("carp0").await.unwrap();
        assert_eq!(
            registry.create("carp0").await,
            Err(ConfigError::InstanceExists("carp0".to_string()))
        );

        registry.create("carp1").await.unwrap();
        assert_eq!(
            registry.create("carp2").await,
            Err(ConfigError::TooManyInstances(2))
        );

        registry.destroy("carp0").await.unwrap();
        assert_eq!(registry.instance_names(), vec!["carp1"]);
        assert!(matches!(
            registry.destroy("carp0").await,
            Err(ConfigError::UnknownInstance(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configure_binds_and_indexes() {
        let registry = registry(2);
        registry.add_interface(quiet_port("eth0")).await;
        registry.create("carp0").await.unwrap();

        assert!(matches!(
            registry
                .configure("carp0", ConfigUpdate::new().vhid(5).interface("eth9"))
                .await,
            Err(ConfigError::UnknownInterface(_))
        ));
        assert!(registry.lookup("eth0", 5).is_none());

        registry
            .configure("carp0", ConfigUpdate::new().vhid(5).interface("eth0"))
            .await
            .unwrap();
        assert!(registry.lookup("eth0", 5).is_some());

        registry
            .configure("carp0", ConfigUpdate::new().vhid(6))
            .await
            .unwrap();
        assert!(registry.lookup("eth0", 5).is_none());
        assert!(registry.lookup("eth0", 6).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_vhid_rejected() {
        let registry = registry(2);
        registry.add_interface(quiet_port("eth0")).await;
        registry.create("carp0").await.unwrap();
        registry.create("carp1").await.unwrap();

        let update = ConfigUpdate::new().vhid(5).interface("eth0");
        registry.configure("carp0", update.clone()).await.unwrap();
        assert_eq!(
            registry.configure("carp1", update).await,
            Err(ConfigError::DuplicateVhid {
                interface: "eth0".to_string(),
                vhid: 5
            })
        );

        // Reapplying to the owner is fine
        registry
            .configure("carp0", ConfigUpdate::new().vhid(5))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_counts_unidentified_drops() {
        let registry = registry(1);
        registry.dispatch("eth0", wire(5, 1, 64)).await;
        registry.dispatch("eth0", wire(9, 1, CARP_TTL)).await;

        let stats = registry.registry_stats().await;
        assert_eq!(stats.ver_errors, 1);
        assert_eq!(stats.vhid_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_interface_drops_to_init() {
        let registry = registry(1);
        registry.add_interface(quiet_port("eth0")).await;
        registry.create("carp0").await.unwrap();
        registry
            .configure("carp0", ConfigUpdate::new().vhid(5).interface("eth0"))
            .await
            .unwrap();
        registry.up("carp0").await.unwrap();
        assert_eq!(registry.state("carp0").await.unwrap(), CarpState::Backup);

        registry.remove_interface("eth0").await.unwrap();
        assert_eq!(registry.state("carp0").await.unwrap(), CarpState::Init);

        // The instance rejoins when the interface comes back
        registry.add_interface(quiet_port("eth0")).await;
        assert_eq!(registry.state("carp0").await.unwrap(), CarpState::Backup);
    }

    #[tokio::test]
    async fn test_interface_addresses() {
        let registry = registry(1);
        registry.add_interface(quiet_port("eth1")).await;

        let mut bare = MockNetworkPort::new();
        bare.expect_name().return_const("eth0".to_string());
        bare.expect_primary_address().return_const(None);
        registry.add_interface(Arc::new(bare)).await;

        assert_eq!(
            registry.interface_addresses(),
            vec![("eth0".to_string(), None), ("eth1".to_string(), Some(LOCAL))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_state_parses_names() {
        let registry = registry(1);
        registry.create("carp0").await.unwrap();

        assert!(matches!(
            registry.set_state("carp0", "standby").await,
            Err(ConfigError::InvalidState(_))
        ));
        registry.set_state("carp0", "init").await.unwrap();
    }
}
