//! Shared helpers for CARP integration tests.
//!
//! A [`Segment`] is an in-memory broadcast domain. Every [`MemoryPort`]
//! attached to it sees every advertisement sent by the others, the way
//! hosts on one LAN see 224.0.0.18.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use carp::{AnnounceReport, AuthKey, CarpAdvertisement, MacAddr, NetworkPort, Received};
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};

const INJECTED: usize = usize::MAX;

#[derive(Debug, Clone)]
struct Frame {
    from: usize,
    received: Received,
}

/// An in-memory LAN
#[derive(Clone)]
pub struct Segment {
    tx: broadcast::Sender<Frame>,
    next_port: Arc<AtomicUsize>,
}

impl Segment {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            next_port: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Attach a host with `address` through an interface called `name`
    pub fn attach(&self, name: &str, address: Ipv4Addr) -> Arc<MemoryPort> {
        Arc::new(MemoryPort {
            id: self.next_port.fetch_add(1, Ordering::Relaxed),
            name: name.to_string(),
            address,
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
            announcements: StdMutex::new(Vec::new()),
        })
    }

    /// Put a datagram on the wire as if from an outside host
    pub fn inject(&self, payload: Bytes, source: Ipv4Addr, ttl: u8) {
        let _ = self.tx.send(Frame {
            from: INJECTED,
            received: Received {
                payload,
                source,
                ttl,
            },
        });
    }
}

/// A host's interface on a [`Segment`]
pub struct MemoryPort {
    id: usize,
    name: String,
    address: Ipv4Addr,
    tx: broadcast::Sender<Frame>,
    rx: Mutex<broadcast::Receiver<Frame>>,
    announcements: StdMutex<Vec<(MacAddr, Vec<Ipv4Addr>)>>,
}

impl MemoryPort {
    pub fn announcements(&self) -> Vec<(MacAddr, Vec<Ipv4Addr>)> {
        self.announcements.lock().unwrap().clone()
    }

    /// Next advertisement seen on the segment, if one arrives in time
    pub async fn next_advertisement(&self, within: Duration) -> Option<CarpAdvertisement> {
        let received = tokio::time::timeout(within, self.receive())
            .await
            .ok()?
            .ok()??;
        CarpAdvertisement::parse(&received.payload).ok()
    }
}

#[async_trait]
impl NetworkPort for MemoryPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn primary_address(&self) -> Option<Ipv4Addr> {
        Some(self.address)
    }

    async fn send(&self, payload: Bytes) -> io::Result<usize> {
        let len = payload.len();
        let frame = Frame {
            from: self.id,
            received: Received {
                payload,
                source: self.address,
                ttl: carp::CARP_TTL,
            },
        };
        // No subscribers is not an error on a real LAN either
        let _ = self.tx.send(frame);
        Ok(len)
    }

    async fn announce(&self, mac: MacAddr, addresses: &[Ipv4Addr]) -> AnnounceReport {
        self.announcements
            .lock()
            .unwrap()
            .push((mac, addresses.to_vec()));
        AnnounceReport {
            sent: addresses.len(),
            ..Default::default()
        }
    }

    async fn receive(&self) -> io::Result<Option<Received>> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(frame) if frame.from == self.id => continue,
                Ok(frame) => return Ok(Some(frame.received)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

/// A signed, checksummed advertisement as `source` would send it
pub fn advertisement(
    key: &AuthKey,
    vhid: u8,
    advskew: u8,
    demote: u8,
    counter: u64,
    source: Ipv4Addr,
) -> Bytes {
    let mut adv = CarpAdvertisement::new(vhid, advskew, 1, demote, counter);
    key.sign(&mut adv, source);
    adv.set_checksum();
    adv.to_bytes()
}

/// Route library logs to the test harness; `RUST_LOG=carp=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Let spawned tasks run without moving the clock meaningfully
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
