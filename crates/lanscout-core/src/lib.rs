//! # lanscout core
//!
//! Shared error taxonomy and configuration for the lanscout discovery engine.
//!
//! - **Errors**: [`ErrorCode`] mirrors the numeric codes of the classic DNS-SD
//!   API so callers of the public surface get the integers they expect, while
//!   [`DiscoveryError`] and friends carry the details.
//! - **Configuration**: [`AppConfig`] loads from YAML or through the `config`
//!   crate with `LANSCOUT__*` environment overrides, and validates every value.
//!
//! ## Example
//!
//! ```
//! use lanscout_core::config::{AppConfig, RemovalPolicy};
//!
//! let config = AppConfig::from_yaml("discovery:\n  removal_policy: emit\n").unwrap();
//! assert_eq!(config.discovery.removal_policy, RemovalPolicy::Emit);
//! assert!(config.validate().is_ok());
//! ```

pub mod config;
pub mod error;

pub use config::{AddressFamily, AppConfig, DiscoveryConfig, LogFormat, LoggingConfig, RemovalPolicy};
pub use error::{ConfigError, DiscoveryError, ErrorCode, ProviderError, Result, TxtError};
