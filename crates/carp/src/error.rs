//! Error types for advertisement processing and administration.

use crate::types::CarpStats;
use std::io;
use thiserror::Error;

/// Reasons an inbound advertisement is dropped.
///
/// None of these propagate past the receive path; each is counted in
/// exactly one [`CarpStats`] field and the packet is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("malformed advertisement: {0}")]
    Malformed(&'static str),

    #[error("unsupported CARP version {0}")]
    Version(u8),

    #[error("TTL {0} is not 255")]
    Ttl(u8),

    #[error("checksum mismatch")]
    Checksum,

    #[error("no instance for vhid {0}")]
    UnknownVhid(u8),

    #[error("authentication failed")]
    Auth,

    #[error("replayed counter {counter:#018x} (last accepted {last:#018x})")]
    Replay { counter: u64, last: u64 },
}

impl PacketError {
    /// Count this drop in `stats`
    pub fn record(&self, stats: &mut CarpStats) {
        match self {
            PacketError::Malformed(_) => stats.len_errors += 1,
            PacketError::Version(_) | PacketError::Ttl(_) => stats.ver_errors += 1,
            PacketError::Checksum => stats.crc_errors += 1,
            PacketError::UnknownVhid(_) => stats.vhid_errors += 1,
            PacketError::Auth => stats.hmac_errors += 1,
            PacketError::Replay { .. } => stats.counter_errors += 1,
        }
    }
}

/// Administrative rejections. A rejected change is never partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid state {0:?}, expected INIT, BACKUP or MASTER")]
    InvalidState(String),

    #[error("invalid vhid {0}, must be between 1 and 255")]
    InvalidVhid(u8),

    #[error("vhid {vhid} is already in use on {interface}")]
    DuplicateVhid { interface: String, vhid: u8 },

    #[error("no such interface {0}")]
    UnknownInterface(String),

    #[error("invalid timing advbase={advbase} advskew={advskew}: {reason}")]
    InvalidTimeout {
        advbase: u8,
        advskew: u8,
        reason: &'static str,
    },

    #[error("demote {0} is reserved for bow-out")]
    InvalidDemote(u8),

    #[error("invalid authentication material: {0}")]
    InvalidKey(&'static str),

    #[error("instance limit of {0} reached")]
    TooManyInstances(usize),

    #[error("no such instance {0}")]
    UnknownInstance(String),

    #[error("instance {0} already exists")]
    InstanceExists(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),
}

/// Classification of a failed send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmitFailure {
    /// Buffers or memory unavailable; the next cycle retries
    Resource,
    /// The send itself failed
    Transmit,
}

impl TransmitFailure {
    pub fn classify(err: &io::Error) -> Self {
        if err.kind() == io::ErrorKind::OutOfMemory {
            return TransmitFailure::Resource;
        }

        match err.raw_os_error() {
            Some(libc::ENOMEM) | Some(libc::ENOBUFS) => TransmitFailure::Resource,
            _ => TransmitFailure::Transmit,
        }
    }

    pub fn record(self, stats: &mut CarpStats) {
        match self {
            TransmitFailure::Resource => stats.mem_errors += 1,
            TransmitFailure::Transmit => stats.xmit_errors += 1,
        }
    }
}
