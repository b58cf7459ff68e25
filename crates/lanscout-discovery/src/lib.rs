//! Local network service discovery and advertisement.
//!
//! This crate browses DNS-SD service types, resolves every discovered
//! instance to host, port, address and TXT metadata, and hands subscribers
//! one JSON object per device update. It also advertises the local device
//! under any number of service types.
//!
//! # Architecture
//!
//! - [`SessionRegistry`] is the public surface: register/unregister,
//!   start/stop browse, shutdown. One [`BrowseSession`] per service type,
//!   one registration per (name, service type).
//! - A [`BrowseSession`] owns the provider browse subscription, a pump task
//!   draining provider completions, the resolve pipelines of its instances
//!   and the records it has produced.
//! - A resolve pipeline chains name resolution and address lookup, then
//!   merges the result into the instance's TXT object.
//! - The protocol engine sits behind [`DiscoveryProvider`]. [`MdnsProvider`]
//!   drives the `mdns-sd` daemon; [`mock::ScriptedProvider`] drives tests.
//!
//! Provider handles are owned by [`ProviderHandle`] values that release on
//! drop, so each handle is released exactly once.
//!
//! # Example
//!
//! ```no_run
//! use lanscout_core::DiscoveryConfig;
//! use lanscout_discovery::{MdnsProvider, SessionRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = Arc::new(MdnsProvider::new()?);
//!     let registry = SessionRegistry::new(provider, DiscoveryConfig::default())?;
//!
//!     registry
//!         .start_browse("_googlecast._tcp", Arc::new(|json: &str| println!("{json}")))
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod fanout;
pub mod mdns;
pub mod mock;
pub mod names;
pub mod provider;
pub mod record;
pub mod registry;
pub mod resolve;
pub mod session;
pub mod txt;

pub use fanout::{DeviceCallback, SubscriberId};
pub use lanscout_core::{DiscoveryError, ErrorCode, ProviderError, Result, TxtError};
pub use mdns::MdnsProvider;
pub use names::{extract_instance_name, ServiceType};
pub use provider::{
    BrowseAction, Completion, DiscoveryProvider, DispatchMode, EventSink, HandleId, OpId,
    ProviderEvent, ProviderHandle,
};
pub use record::{Action, DeviceRecord};
pub use registry::SessionRegistry;
pub use session::{BrowseSession, SessionState};
pub use txt::{decode_to_json, encode_json, TxtRecord};
