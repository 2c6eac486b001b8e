//! CARP data types and protocol constants.
//!
//! Wire constants follow the CARP version 2 advertisement format as
//! deployed by the BSD implementations.

use crate::error::ConfigError;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

/// CARP protocol version carried in every advertisement
pub const CARP_VERSION: u8 = 2;

/// Advertisement packet type (the only type defined)
pub const CARP_ADVERTISEMENT: u8 = 0x01;

/// IP protocol number CARP advertisements are carried in
pub const CARP_PROTOCOL: u8 = 112;

/// TTL required on every advertisement, sent and received
pub const CARP_TTL: u8 = 255;

/// Length of the HMAC-SHA1 digest in bytes
pub const CARP_SIG_LEN: usize = 20;

/// Digest length as carried in the header, in 32-bit words
pub const CARP_AUTH_LEN: u8 = (CARP_SIG_LEN / 4) as u8;

/// Fixed length of an advertisement on the wire
pub const CARP_HEADER_LEN: usize = 16 + CARP_SIG_LEN;

/// Multicast group advertisements are sent to
pub const CARP_MULTICAST_ADDR_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 18);

/// Default advertisement base interval (seconds)
pub const CARP_DEFAULT_ADVBASE: u8 = 1;

/// Default number of concurrently in-flight transmits per registry
pub const CARP_DEFAULT_TX_QUEUES: usize = 16;

/// Maximum shared key length (the HMAC-SHA1 block size)
pub const CARP_KEY_LEN: usize = 64;

/// Maximum length of the fixed pad prefixed to the digest input
pub const CARP_HMAC_PAD_LEN: usize = 64;

/// Demotion value carried by a bow-out advertisement
pub const CARP_BOW_OUT_DEMOTE: u8 = 255;

/// Advertisements sent after a takeover before the ARP announcement repeats
pub const CARP_DELAYED_ARP: u8 = 2;

/// Upper bound on the derived advertisement timeout
pub const MAX_ADV_TIMEOUT: Duration = Duration::from_secs(255);

/// Upper bound on the derived master-down timeout
pub const MAX_MD_TIMEOUT: Duration = Duration::from_secs(3 * 255);

/// CARP state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CarpState {
    /// Not bound, administratively down, or unconfigured
    #[default]
    Init,
    /// Monitoring for master failure
    Backup,
    /// Advertising and answering for the virtual address
    Master,
}

impl fmt::Display for CarpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CarpState::Init => write!(f, "INIT"),
            CarpState::Backup => write!(f, "BACKUP"),
            CarpState::Master => write!(f, "MASTER"),
        }
    }
}

impl FromStr for CarpState {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("INIT") => Ok(CarpState::Init),
            s if s.eq_ignore_ascii_case("BACKUP") => Ok(CarpState::Backup),
            s if s.eq_ignore_ascii_case("MASTER") => Ok(CarpState::Master),
            other => Err(ConfigError::InvalidState(other.to_string())),
        }
    }
}

/// Ethernet hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Broadcast address (ff:ff:ff:ff:ff:ff)
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// Virtual router MAC for a vhid: 00:00:5e:00:01:<vhid>
    pub fn virtual_router(vhid: u8) -> Self {
        MacAddr([0x00, 0x00, 0x5e, 0x00, 0x01, vhid])
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Process-wide parameters, fixed when a registry is constructed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalParams {
    /// Whether a more preferred host takes mastership from a less preferred one
    pub preempt: bool,

    /// Maximum number of instances a registry will hold
    pub max_instances: usize,

    /// Maximum number of transmits in flight at once
    pub tx_queues: usize,
}

impl Default for GlobalParams {
    fn default() -> Self {
        Self {
            preempt: false,
            max_instances: 1,
            tx_queues: CARP_DEFAULT_TX_QUEUES,
        }
    }
}

impl GlobalParams {
    /// Validate parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instances == 0 {
            return Err(ConfigError::InvalidParams("max_instances must be at least 1"));
        }

        if self.tx_queues == 0 {
            return Err(ConfigError::InvalidParams("tx_queues must be at least 1"));
        }

        Ok(())
    }
}

/// CARP statistics
///
/// Counters only ever increase; they are reset only by destroying the
/// instance (or registry) that owns them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CarpStats {
    /// Checksum failures
    pub crc_errors: u64,

    /// Wrong version, or a TTL other than 255
    pub ver_errors: u64,

    /// Advertisements for a vhid with no local instance
    pub vhid_errors: u64,

    /// Digest verification failures
    pub hmac_errors: u64,

    /// Replayed or stale counters
    pub counter_errors: u64,

    /// Resource exhaustion while building or sending
    pub mem_errors: u64,

    /// Transmit failures
    pub xmit_errors: u64,

    /// Truncated or structurally invalid advertisements
    pub len_errors: u64,

    /// Bytes of advertisement payload sent
    pub bytes_sent: u64,

    /// Advertisements sent
    pub adverts_sent: u64,

    /// Valid advertisements accepted
    pub adverts_received: u64,

    /// Number of transitions to Master state
    pub master_transitions: u64,

    /// Number of transitions to Backup state
    pub backup_transitions: u64,
}

impl CarpStats {
    /// Total of all drop counters
    pub fn dropped(&self) -> u64 {
        self.crc_errors
            + self.ver_errors
            + self.vhid_errors
            + self.hmac_errors
            + self.counter_errors
            + self.len_errors
    }
}
