//! Zero Common - Shared configuration, logging and error types for the Zero portfolio services.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation errors
//! - Logging setup

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, ObservabilityConfig, PortfolioServiceConfig};
pub use error::{Error, Result};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{Config, PortfolioServiceConfig};
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
}
