//! Common Address Redundancy Protocol (CARP)
//!
//! Pure Rust implementation of the CARP version 2 failover engine: a group
//! of hosts shares a virtual IPv4 address and MAC, one host (MASTER)
//! answers for it, and the others (BACKUP) take over when its
//! advertisements stop.
//!
//! # Features
//!
//! - 36-byte advertisement codec with ones' complement checksum
//! - HMAC-SHA1 authentication over pad, header, counter and source
//! - Anti-replay counter with wraparound-aware window
//! - Master-down and advertisement timers with synchronous cancellation
//! - Preemption, demotion and bow-out for fast failover
//! - Gratuitous ARP announcements for the virtual MAC on takeover
//! - Explicit [`InstanceRegistry`], no process-wide state
//!
//! # Example
//!
//! ```no_run
//! use carp::{ConfigUpdate, GlobalParams, InstanceRegistry, RawPort};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = InstanceRegistry::new(GlobalParams::default())?;
//!
//! // Requires CAP_NET_RAW
//! let port = Arc::new(RawPort::open("eth0")?);
//! registry.add_interface(port.clone()).await;
//! registry.spawn_receiver(port);
//!
//! registry.create("carp0").await?;
//! registry
//!     .configure(
//!         "carp0",
//!         ConfigUpdate::new()
//!             .vhid(1)
//!             .advskew(100)
//!             .key("secret")
//!             .interface("eth0")
//!             .addresses(vec!["192.168.1.1".parse()?]),
//!     )
//!     .await?;
//! registry.up("carp0").await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod failover;
pub mod packet;
pub mod port;
pub mod registry;
pub mod socket;
pub mod state_machine;
pub mod timer;
pub mod types;

pub use auth::AuthKey;
pub use config::{ConfigUpdate, InstanceConfig, InstanceParams};
pub use error::{ConfigError, PacketError, TransmitFailure};
pub use packet::CarpAdvertisement;
pub use port::{AnnounceReport, InterfaceTable, NetworkPort, Received};
pub use registry::InstanceRegistry;
pub use socket::RawPort;
pub use state_machine::{CarpInstance, InstanceId};
pub use timer::{TimerKind, Timeouts};
pub use types::{
    CARP_MULTICAST_ADDR_V4, CARP_PROTOCOL, CARP_TTL, CARP_VERSION, CarpState, CarpStats,
    GlobalParams, MacAddr,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_types() {
        let params = GlobalParams::default();
        assert_eq!(params.max_instances, 1);

        let state = CarpState::Init;
        assert_eq!(state.to_string(), "INIT");
    }
}
