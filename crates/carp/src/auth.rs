//! Advertisement authentication.
//!
//! The digest is HMAC-SHA1 keyed with the shared key over
//! `pad || header fields || counter || source address`, where the header
//! fields are the six bytes preceding the checksum. The checksum itself is
//! excluded since it is computed after the digest is filled in.

use crate::error::{ConfigError, PacketError};
use crate::packet::CarpAdvertisement;
use crate::types::{CARP_HMAC_PAD_LEN, CARP_KEY_LEN, CARP_SIG_LEN};
use hmac::digest::Key;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::fmt;
use std::net::Ipv4Addr;

type HmacSha1 = Hmac<Sha1>;

/// Default key byte, matching an unconfigured kernel instance
const DEFAULT_KEY_BYTE: u8 = 1;

/// Length of the key an unconfigured instance uses
const DEFAULT_KEY_LEN: usize = 20;

/// Shared authentication material for one instance.
///
/// Immutable once built. `Debug` never prints the key or pad.
#[derive(Clone)]
pub struct AuthKey {
    key: Vec<u8>,
    pad: Vec<u8>,
    /// HMAC state with the key and pad already absorbed
    prepared: HmacSha1,
}

impl AuthKey {
    /// Build authentication material from a shared key and pad
    pub fn new(key: &[u8], pad: &[u8]) -> Result<Self, ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::InvalidKey("key must not be empty"));
        }

        if key.len() > CARP_KEY_LEN {
            return Err(ConfigError::InvalidKey("key longer than 64 bytes"));
        }

        if pad.len() > CARP_HMAC_PAD_LEN {
            return Err(ConfigError::InvalidKey("pad longer than 64 bytes"));
        }

        Ok(Self {
            prepared: prepare(key, pad),
            key: key.to_vec(),
            pad: pad.to_vec(),
        })
    }

    /// Same key, different pad
    pub fn with_pad(&self, pad: &[u8]) -> Result<Self, ConfigError> {
        Self::new(&self.key, pad)
    }

    /// Same pad, different key
    pub fn with_key(&self, key: &[u8]) -> Result<Self, ConfigError> {
        Self::new(key, &self.pad)
    }

    fn mac(&self, adv: &CarpAdvertisement, source: Ipv4Addr) -> HmacSha1 {
        let mut mac = self.prepared.clone();
        mac.update(&adv.authenticated_fields());
        mac.update(&adv.counter.to_be_bytes());
        mac.update(&source.octets());
        mac
    }

    /// Compute the digest for `adv` as sent from `source`
    pub fn digest(&self, adv: &CarpAdvertisement, source: Ipv4Addr) -> [u8; CARP_SIG_LEN] {
        let code = self.mac(adv, source).finalize().into_bytes();
        let mut digest = [0u8; CARP_SIG_LEN];
        digest.copy_from_slice(&code);
        digest
    }

    /// Fill in the digest field of `adv`
    pub fn sign(&self, adv: &mut CarpAdvertisement, source: Ipv4Addr) {
        adv.digest = self.digest(adv, source);
    }

    /// Verify the digest carried by `adv` (constant time)
    pub fn verify(&self, adv: &CarpAdvertisement, source: Ipv4Addr) -> Result<(), PacketError> {
        self.mac(adv, source)
            .verify_slice(&adv.digest)
            .map_err(|_| PacketError::Auth)
    }
}

impl Default for AuthKey {
    fn default() -> Self {
        let key = [DEFAULT_KEY_BYTE; DEFAULT_KEY_LEN];
        let pad = [0u8; CARP_HMAC_PAD_LEN];

        Self {
            prepared: prepare(&key, &pad),
            key: key.to_vec(),
            pad: pad.to_vec(),
        }
    }
}

/// HMAC state with `key` and `pad` absorbed. `key` is at most one SHA-1
/// block; HMAC zero-pads shorter keys, so padding it here gives the same MAC.
fn prepare(key: &[u8], pad: &[u8]) -> HmacSha1 {
    let mut block = [0u8; CARP_KEY_LEN];
    block[..key.len()].copy_from_slice(key);

    let mut prepared = <HmacSha1 as Mac>::new(Key::<HmacSha1>::from_slice(&block));
    prepared.update(pad);
    prepared
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.pad == other.pad
    }
}

impl Eq for AuthKey {}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthKey")
            .field("key", &"<redacted>")
            .field("pad", &"<redacted>")
            .finish()
    }
}
