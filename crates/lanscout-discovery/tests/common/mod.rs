//! Common helpers for the registry integration tests

#![allow(dead_code)]

use lanscout_core::DiscoveryConfig;
use lanscout_discovery::mock::ScriptedProvider;
use lanscout_discovery::{DeviceCallback, SessionRegistry};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub const SVC: &str = "_svc._tcp";

/// Installs a test-friendly tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lanscout_discovery=debug")
        .with_test_writer()
        .try_init();
}

/// Config with a short poll interval so stop is observed quickly.
pub fn fast_config() -> DiscoveryConfig {
    DiscoveryConfig {
        poll_interval_ms: 5,
        ..Default::default()
    }
}

pub fn setup() -> (Arc<ScriptedProvider>, SessionRegistry) {
    setup_with(ScriptedProvider::new(), fast_config())
}

pub fn setup_with(
    provider: ScriptedProvider,
    config: DiscoveryConfig,
) -> (Arc<ScriptedProvider>, SessionRegistry) {
    init_tracing();
    let provider = Arc::new(provider);
    let registry =
        SessionRegistry::new(provider.clone(), config).expect("Failed to create registry");
    (provider, registry)
}

/// Subscriber that records every payload it receives.
#[derive(Clone, Default)]
pub struct Collector {
    events: Arc<Mutex<Vec<Value>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> DeviceCallback {
        let events = self.events.clone();
        Arc::new(move |json: &str| {
            let value = serde_json::from_str(json).expect("Subscriber got invalid JSON");
            events.lock().push(value);
        })
    }

    pub fn events(&self) -> Vec<Value> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "Timed out waiting for {what}");
}

/// Gives the pump a few poll intervals to act on anything queued.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
