//! Common utilities and types shared across CARP Rust components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::LogFormat;
