//! Daemon runtime: one registry, one port per interface, configured
//! instances until shutdown.

use crate::config::Config;
use carp::{InstanceRegistry, NetworkPort, RawPort};
use common::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// A running CARP daemon
pub struct Daemon {
    config: Config,
    registry: Arc<InstanceRegistry>,
    receivers: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Build the registry. No ports are opened yet.
    pub fn new(config: Config) -> Result<Self> {
        let registry = InstanceRegistry::new(config.global_params()).map_err(Error::carp)?;

        Ok(Self {
            config,
            registry,
            receivers: Vec::new(),
        })
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Register `port` and start receiving on it
    pub async fn attach(&mut self, port: Arc<dyn NetworkPort>) {
        debug!(interface = %port.name(), "attaching interface");
        self.registry.add_interface(port.clone()).await;
        self.receivers.push(self.registry.spawn_receiver(port));
    }

    /// Open a raw socket port for every configured interface
    pub async fn open_interfaces(&mut self) -> Result<()> {
        for name in self.config.interfaces() {
            let port = RawPort::open(&name)
                .map_err(|e| Error::config(format!("cannot open interface {name}: {e}")))?;
            self.attach(Arc::new(port)).await;
        }
        Ok(())
    }

    /// Create, configure and bring up every configured instance
    pub async fn start(&self) -> Result<()> {
        for settings in &self.config.instances {
            let name = settings.name.as_str();
            let context = |e: carp::ConfigError| Error::carp(format!("{name}: {e}"));

            self.registry.create(name).await.map_err(context)?;
            self.registry
                .configure(name, settings.to_update())
                .await
                .map_err(context)?;

            if settings.up {
                self.registry.up(name).await.map_err(context)?;
            }

            if let Some(state) = &settings.state {
                self.registry.set_state(name, state).await.map_err(context)?;
            }

            info!(
                instance = %name,
                vhid = settings.vhid,
                interface = %settings.interface,
                up = settings.up,
                "instance started"
            );
        }
        Ok(())
    }

    /// Log one line of counters per instance, plus the registry-level drops
    pub async fn log_stats(&self) {
        for name in self.registry.instance_names() {
            let (state, stats) = match (
                self.registry.state(&name).await,
                self.registry.stats(&name).await,
            ) {
                (Ok(state), Ok(stats)) => (state, stats),
                // Destroyed between listing and lookup
                _ => continue,
            };

            info!(
                instance = %name,
                state = %state,
                adverts_sent = stats.adverts_sent,
                adverts_received = stats.adverts_received,
                bytes_sent = stats.bytes_sent,
                master_transitions = stats.master_transitions,
                backup_transitions = stats.backup_transitions,
                hmac_errors = stats.hmac_errors,
                counter_errors = stats.counter_errors,
                vhid_errors = stats.vhid_errors,
                xmit_errors = stats.xmit_errors,
                mem_errors = stats.mem_errors,
                "instance statistics"
            );
        }

        let unidentified = self.registry.registry_stats().await;
        if unidentified.dropped() > 0 {
            info!(
                crc_errors = unidentified.crc_errors,
                ver_errors = unidentified.ver_errors,
                len_errors = unidentified.len_errors,
                vhid_errors = unidentified.vhid_errors,
                "unidentified advertisement drops"
            );
        }
    }

    /// Run until `shutdown` resolves, logging statistics periodically
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.config.daemon.stats_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.log_stats().await,
            }
        }
    }

    /// Tear every instance down (masters bow out) and stop receiving
    pub async fn shutdown(mut self) {
        info!(instances = self.registry.len(), "shutting down");
        self.registry.destroy_all().await;

        for receiver in self.receivers.drain(..) {
            receiver.abort();
        }
    }

    pub fn stats_interval(&self) -> Duration {
        self.config.daemon.stats_interval
    }
}

/// Run the daemon on raw sockets until SIGINT
pub async fn run(config: Config) -> Result<()> {
    let mut daemon = Daemon::new(config)?;

    if daemon.config.instances.is_empty() {
        warn!("no instances configured");
    }

    daemon.open_interfaces().await?;
    for (interface, address) in daemon.registry.interface_addresses() {
        match address {
            Some(address) => info!(interface = %interface, %address, "interface ready"),
            None => warn!(
                interface = %interface,
                "interface has no IPv4 address, cannot advertise"
            ),
        }
    }

    if let Err(e) = daemon.start().await {
        daemon.shutdown().await;
        return Err(e);
    }

    info!(
        instances = daemon.registry.len(),
        stats_interval = ?daemon.stats_interval(),
        "carpd running"
    );

    daemon
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await;

    daemon.shutdown().await;
    Ok(())
}
