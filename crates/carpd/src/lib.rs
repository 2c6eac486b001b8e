//! CARP daemon
//!
//! Loads a YAML configuration, opens a raw socket port on each interface it
//! names, runs the configured virtual hosts and bows out cleanly on SIGINT.

pub mod config;
pub mod daemon;

pub use config::{Config, ConfigError};
pub use daemon::{Daemon, run};
