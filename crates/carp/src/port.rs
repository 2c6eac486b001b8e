//! Network seam between the protocol engine and an interface.
//!
//! The engine never touches sockets directly. Each bound interface is a
//! [`NetworkPort`]; the raw socket backend lives in [`crate::socket`] and
//! tests substitute in-memory or mock ports.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::TransmitFailure;
use crate::types::{CarpStats, MacAddr};

/// An inbound advertisement with the IP-layer facts needed to validate it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    /// CARP payload, starting at the version/type byte
    pub payload: Bytes,

    /// IPv4 source address
    pub source: Ipv4Addr,

    /// TTL from the IP header
    pub ttl: u8,
}

/// Outcome of announcing a set of addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnounceReport {
    pub sent: usize,
    pub resource_errors: usize,
    pub transmit_errors: usize,
}

impl AnnounceReport {
    /// Count one failed announcement
    pub fn fail(&mut self, err: &io::Error) {
        match TransmitFailure::classify(err) {
            TransmitFailure::Resource => self.resource_errors += 1,
            TransmitFailure::Transmit => self.transmit_errors += 1,
        }
    }

    /// Fold this report into an instance's statistics
    pub fn record(&self, stats: &mut CarpStats) {
        stats.mem_errors += self.resource_errors as u64;
        stats.xmit_errors += self.transmit_errors as u64;
    }
}

/// One physical interface as seen by the protocol engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NetworkPort: Send + Sync {
    /// Interface name
    fn name(&self) -> &str;

    /// Source address for advertisements, if the interface has one
    fn primary_address(&self) -> Option<Ipv4Addr>;

    /// Send one advertisement payload to the CARP multicast group with TTL 255
    async fn send(&self, payload: Bytes) -> io::Result<usize>;

    /// Announce that `addresses` are now reachable at `mac`
    async fn announce(&self, mac: MacAddr, addresses: &[Ipv4Addr]) -> AnnounceReport;

    /// Wait for the next inbound advertisement. `None` means the port closed.
    async fn receive(&self) -> io::Result<Option<Received>>;
}

/// Interfaces known to a registry, by name
#[derive(Default)]
pub struct InterfaceTable {
    ports: DashMap<String, Arc<dyn NetworkPort>>,
}

impl InterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a port; returns the port it replaced
    pub fn insert(&self, port: Arc<dyn NetworkPort>) -> Option<Arc<dyn NetworkPort>> {
        self.ports.insert(port.name().to_string(), port)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NetworkPort>> {
        self.ports.get(name).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn NetworkPort>> {
        self.ports.remove(name).map(|(_, port)| port)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ports.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ports.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for InterfaceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterfaceTable")
            .field("interfaces", &self.names())
            .finish()
    }
}
