//! Per-instance administrative configuration.
//!
//! An instance's configuration is an immutable [`InstanceConfig`] snapshot.
//! Administrative changes arrive as a [`ConfigUpdate`], are applied to a
//! copy of the current snapshot, validated as a whole, and only then swapped
//! in. A rejected update leaves the instance untouched.

use crate::auth::AuthKey;
use crate::error::ConfigError;
use crate::timer::Timeouts;
use crate::types::{
    CARP_BOW_OUT_DEMOTE, CARP_DEFAULT_ADVBASE, CarpState, MAX_ADV_TIMEOUT, MAX_MD_TIMEOUT, MacAddr,
};
use std::net::Ipv4Addr;
use std::time::Duration;

/// Configuration snapshot of one instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    /// Virtual host ID; 0 means not yet configured
    pub vhid: u8,

    /// Advertisement base interval in seconds
    pub advbase: u8,

    /// Advertisement skew in 1/256 s
    pub advskew: u8,

    /// Administrative demotion; 0 is fully eligible
    pub demote: u8,

    /// Shared key and pad
    pub auth: AuthKey,

    /// Physical interface advertisements are sent and received on
    pub interface: Option<String>,

    /// Addresses announced on takeover
    pub addresses: Vec<Ipv4Addr>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            vhid: 0,
            advbase: CARP_DEFAULT_ADVBASE,
            advskew: 0,
            demote: 0,
            auth: AuthKey::default(),
            interface: None,
            addresses: Vec::new(),
        }
    }
}

impl InstanceConfig {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts::new(self.advbase, self.advskew)
    }

    pub fn virtual_mac(&self) -> MacAddr {
        MacAddr::virtual_router(self.vhid)
    }

    /// `(interface, vhid)` this instance answers for, once both are set
    pub fn binding(&self) -> Option<(String, u8)> {
        match &self.interface {
            Some(interface) if self.vhid > 0 => Some((interface.clone(), self.vhid)),
            _ => None,
        }
    }

    /// Apply `update` to a copy of this snapshot and validate the result
    pub fn apply(&self, update: &ConfigUpdate) -> Result<InstanceConfig, ConfigError> {
        let mut next = self.clone();

        if let Some(vhid) = update.vhid {
            if vhid == 0 {
                return Err(ConfigError::InvalidVhid(vhid));
            }
            next.vhid = vhid;
        }

        if let Some(advbase) = update.advbase {
            next.advbase = advbase;
        }

        if let Some(advskew) = update.advskew {
            next.advskew = advskew;
        }

        if let Some(demote) = update.demote {
            if demote == CARP_BOW_OUT_DEMOTE {
                return Err(ConfigError::InvalidDemote(demote));
            }
            next.demote = demote;
        }

        match (&update.key, &update.pad) {
            (Some(key), Some(pad)) => next.auth = AuthKey::new(key, pad)?,
            (Some(key), None) => next.auth = next.auth.with_key(key)?,
            (None, Some(pad)) => next.auth = next.auth.with_pad(pad)?,
            (None, None) => {}
        }

        if let Some(interface) = &update.interface {
            if interface.is_empty() {
                return Err(ConfigError::UnknownInterface(interface.clone()));
            }
            next.interface = Some(interface.clone());
        }

        if let Some(addresses) = &update.addresses {
            next.addresses = addresses.clone();
        }

        validate_timing(next.advbase, next.advskew)?;
        Ok(next)
    }
}

/// Check that advbase/advskew derive usable timeouts
pub fn validate_timing(advbase: u8, advskew: u8) -> Result<Timeouts, ConfigError> {
    let invalid = |reason| ConfigError::InvalidTimeout {
        advbase,
        advskew,
        reason,
    };

    if advbase == 0 && advskew != 0 {
        return Err(invalid("advskew requires a non-zero advbase"));
    }

    let timeouts = Timeouts::new(advbase, advskew);

    if timeouts.master_down == Duration::ZERO || timeouts.advertisement == Duration::ZERO {
        return Err(invalid("zero timeout"));
    }

    if timeouts.advertisement > MAX_ADV_TIMEOUT {
        return Err(invalid("advertisement timeout too long"));
    }

    if timeouts.master_down > MAX_MD_TIMEOUT {
        return Err(invalid("master-down timeout too long"));
    }

    Ok(timeouts)
}

/// An administrative change. Unset fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub state: Option<CarpState>,
    pub vhid: Option<u8>,
    pub advbase: Option<u8>,
    pub advskew: Option<u8>,
    pub demote: Option<u8>,
    pub key: Option<Vec<u8>>,
    pub pad: Option<Vec<u8>>,
    pub interface: Option<String>,
    pub addresses: Option<Vec<Ipv4Addr>>,
}

impl ConfigUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: CarpState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn vhid(mut self, vhid: u8) -> Self {
        self.vhid = Some(vhid);
        self
    }

    pub fn advbase(mut self, advbase: u8) -> Self {
        self.advbase = Some(advbase);
        self
    }

    pub fn advskew(mut self, advskew: u8) -> Self {
        self.advskew = Some(advskew);
        self
    }

    pub fn demote(mut self, demote: u8) -> Self {
        self.demote = Some(demote);
        self
    }

    pub fn key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn pad(mut self, pad: impl Into<Vec<u8>>) -> Self {
        self.pad = Some(pad.into());
        self
    }

    pub fn interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    pub fn addresses(mut self, addresses: Vec<Ipv4Addr>) -> Self {
        self.addresses = Some(addresses);
        self
    }
}

/// Snapshot returned by administrative get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceParams {
    pub name: String,
    pub state: CarpState,
    pub vhid: u8,
    pub advbase: u8,
    pub advskew: u8,
    pub demote: u8,
    pub interface: Option<String>,
    pub addresses: Vec<Ipv4Addr>,
    pub virtual_mac: MacAddr,
    pub master_down_timeout: Duration,
    pub advertisement_timeout: Duration,
    pub admin_up: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InstanceConfig::default();
        assert_eq!(config.vhid, 0);
        assert_eq!(config.advbase, 1);
        assert!(config.binding().is_none());
        assert_eq!(config.timeouts(), Timeouts::new(1, 0));
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let config = InstanceConfig::default();

        // Valid vhid but bad timing: nothing applies
        let update = ConfigUpdate::new().vhid(7).advbase(0).advskew(10);
        assert!(matches!(
            config.apply(&update),
            Err(ConfigError::InvalidTimeout { .. })
        ));
        assert_eq!(config, InstanceConfig::default());

        let next = config
            .apply(&ConfigUpdate::new().vhid(7).advskew(10).interface("eth0"))
            .unwrap();
        assert_eq!(next.vhid, 7);
        assert_eq!(next.advskew, 10);
        assert_eq!(next.binding(), Some(("eth0".to_string(), 7)));
    }

    #[test]
    fn test_vhid_zero_rejected() {
        let result = InstanceConfig::default().apply(&ConfigUpdate::new().vhid(0));
        assert_eq!(result, Err(ConfigError::InvalidVhid(0)));
    }

    #[test]
    fn test_key_and_pad_update() {
        let config = InstanceConfig::default();

        let next = config.apply(&ConfigUpdate::new().key("secret")).unwrap();
        assert_eq!(next.auth, AuthKey::new(b"secret", &[0; 64]).unwrap());

        let next = config
            .apply(&ConfigUpdate::new().key("secret").pad("pad"))
            .unwrap();
        assert_eq!(next.auth, AuthKey::new(b"secret", b"pad").unwrap());

        assert!(config.apply(&ConfigUpdate::new().key("")).is_err());
    }

    #[test]
    fn test_timing_bounds() {
        assert!(validate_timing(1, 0).is_ok());
        assert!(validate_timing(0, 0).is_ok());
        assert!(validate_timing(254, 255).is_ok());

        // Would make master-down equal to the advertisement interval
        assert!(validate_timing(0, 1).is_err());

        // 255 s plus skew exceeds the advertisement bound
        assert!(validate_timing(255, 1).is_err());
        assert!(validate_timing(255, 0).is_ok());
    }

    #[test]
    fn test_bow_out_demote_reserved() {
        let config = InstanceConfig::default();
        let result = config.apply(&ConfigUpdate::new().vhid(3).demote(255));
        assert_eq!(result, Err(ConfigError::InvalidDemote(255)));

        let next = config.apply(&ConfigUpdate::new().demote(254)).unwrap();
        assert_eq!(next.demote, 254);
    }

    #[test]
    fn test_empty_interface_rejected() {
        let result = InstanceConfig::default().apply(&ConfigUpdate::new().interface(""));
        assert!(matches!(result, Err(ConfigError::UnknownInterface(_))));
    }
}
