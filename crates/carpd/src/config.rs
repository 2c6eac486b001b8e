//! Configuration loading and validation for carpd

use carp::{CarpState, ConfigUpdate, GlobalParams};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError, ValidationErrors};

/// Interface name limit, IFNAMSIZ less the trailing NUL
const MAX_IFNAME_LEN: usize = 15;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub carp: CarpSettings,

    #[serde(default)]
    pub instances: Vec<InstanceSettings>,

    #[serde(default)]
    pub daemon: DaemonSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        self.carp.validate()?;
        self.daemon.validate()?;

        for instance in &self.instances {
            instance.validate()?;
        }

        let mut errors = ValidationErrors::new();

        if self.instances.len() > self.carp.max_instances {
            errors.add("instances", ValidationError::new("more_instances_than_max_instances"));
        }

        let mut names = HashSet::new();
        let mut bindings = HashSet::new();
        for instance in &self.instances {
            if !names.insert(instance.name.as_str()) {
                errors.add("instances", ValidationError::new("duplicate_instance_name"));
            }
            if !bindings.insert((instance.interface.as_str(), instance.vhid)) {
                errors.add("instances", ValidationError::new("duplicate_vhid_on_interface"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Registry-wide protocol settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CarpSettings {
    /// Take over from a less preferred master
    pub preempt: bool,

    #[validate(range(min = 1, max = 4096))]
    pub max_instances: usize,

    #[validate(range(min = 1, max = 1024))]
    pub tx_queues: usize,
}

/// One virtual host
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_timing"))]
pub struct InstanceSettings {
    #[validate(length(min = 1, max = 64))]
    pub name: String,

    #[validate(length(min = 1), custom = "validate_interface_name")]
    pub interface: String,

    #[validate(range(min = 1, max = 255))]
    pub vhid: u8,

    #[serde(default = "default_advbase")]
    pub advbase: u8,

    #[serde(default)]
    pub advskew: u8,

    /// 255 is reserved for bow-out
    #[serde(default)]
    #[validate(range(max = 254))]
    pub demote: u8,

    #[serde(default)]
    #[validate(custom = "validate_key")]
    pub key: Option<String>,

    #[serde(default)]
    #[validate(custom = "validate_pad")]
    pub pad: Option<String>,

    #[serde(default)]
    pub addresses: Vec<Ipv4Addr>,

    /// Requested state once running
    #[serde(default)]
    #[validate(custom = "validate_state")]
    pub state: Option<String>,

    /// Bring the instance administratively up at start
    #[serde(default = "default_up")]
    pub up: bool,
}

/// Daemon runtime settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DaemonSettings {
    /// How often per-instance counters are logged
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_stats_interval")]
    pub stats_interval: Duration,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<String>,
}

// Default implementations

impl Default for CarpSettings {
    fn default() -> Self {
        let params = GlobalParams::default();
        Self {
            preempt: params.preempt,
            max_instances: params.max_instances,
            tx_queues: params.tx_queues,
        }
    }
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            stats_interval: Duration::from_secs(60),
        }
    }
}

fn default_advbase() -> u8 {
    1
}

fn default_up() -> bool {
    true
}

// Custom validators

fn validate_interface_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > MAX_IFNAME_LEN || name.contains(['/', ' ', '\0']) {
        return Err(ValidationError::new("interface_name_invalid"));
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.len() > carp::types::CARP_KEY_LEN {
        return Err(ValidationError::new("key_too_long"));
    }
    Ok(())
}

fn validate_pad(pad: &str) -> Result<(), ValidationError> {
    if pad.len() > carp::types::CARP_HMAC_PAD_LEN {
        return Err(ValidationError::new("pad_too_long"));
    }
    Ok(())
}

fn validate_state(state: &str) -> Result<(), ValidationError> {
    state
        .parse::<CarpState>()
        .map(|_| ())
        .map_err(|_| ValidationError::new("state_unknown"))
}

fn validate_timing(instance: &InstanceSettings) -> Result<(), ValidationError> {
    carp::config::validate_timing(instance.advbase, instance.advskew)
        .map(|_| ())
        .map_err(|_| ValidationError::new("timing_out_of_range"))
}

fn validate_stats_interval(interval: &Duration) -> Result<(), ValidationError> {
    let secs = interval.as_secs();
    if !(1..=86_400).contains(&secs) {
        return Err(ValidationError::new("stats_interval_out_of_range"));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::FileNotFound);
        }

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/carp/carpd.yaml")];

        if let Some(user_path) = Self::user_config_path() {
            paths.push(user_path);
        }

        paths.push(PathBuf::from("./carpd.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.is_file())
    }

    /// Per-user config path (~/.config/carp/carpd.yaml on Linux)
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("carp").join("carpd.yaml"))
    }

    /// Registry parameters
    pub fn global_params(&self) -> GlobalParams {
        GlobalParams {
            preempt: self.carp.preempt,
            max_instances: self.carp.max_instances,
            tx_queues: self.carp.tx_queues,
        }
    }

    /// Distinct interfaces named by the configured instances, in first-seen order
    pub fn interfaces(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.instances
            .iter()
            .filter(|i| seen.insert(i.interface.as_str()))
            .map(|i| i.interface.clone())
            .collect()
    }
}

impl InstanceSettings {
    /// Administrative update applied when the instance is created
    pub fn to_update(&self) -> ConfigUpdate {
        let mut update = ConfigUpdate::new()
            .vhid(self.vhid)
            .advbase(self.advbase)
            .advskew(self.advskew)
            .demote(self.demote)
            .interface(self.interface.clone())
            .addresses(self.addresses.clone());

        if let Some(key) = &self.key {
            update = update.key(key.as_bytes().to_vec());
        }
        if let Some(pad) = &self.pad {
            update = update.pad(pad.as_bytes().to_vec());
        }

        update
    }
}
