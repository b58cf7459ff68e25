//! Session registry: the public register/browse surface.
//!
//! Holds at most one [`BrowseSession`] per service type and at most one
//! registration per (name, service type).

use crate::fanout::DeviceCallback;
use crate::names::ServiceType;
use crate::provider::{DiscoveryProvider, HandleId, ProviderHandle};
use crate::record::DeviceRecord;
use crate::session::{BrowseSession, SessionState};
use crate::txt::TxtRecord;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lanscout_core::{DiscoveryConfig, DiscoveryError, ErrorCode, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A live advertisement of the local device.
pub struct Registration {
    pub name: String,
    pub service_type: ServiceType,
    pub port: u16,
    pub txt: TxtRecord,
    handle: ProviderHandle,
}

impl Registration {
    pub fn handle_id(&self) -> HandleId {
        self.handle.id()
    }
}

type RegistrationKey = (String, String);

/// Owner of every browse session and registration.
///
/// # Examples
///
/// ```no_run
/// use lanscout_core::DiscoveryConfig;
/// use lanscout_discovery::{MdnsProvider, SessionRegistry};
/// use std::sync::Arc;
///
/// # async fn run() -> anyhow::Result<()> {
/// let provider = Arc::new(MdnsProvider::new()?);
/// let registry = SessionRegistry::new(provider, DiscoveryConfig::default())?;
///
/// registry.start_browse("_airplay._tcp", Arc::new(|json: &str| println!("{json}"))).await?;
/// registry.register_service("Living Room", "_airplay._tcp", 7000, r#"{"model":"TV"}"#)?;
///
/// registry.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SessionRegistry {
    provider: Arc<dyn DiscoveryProvider>,
    config: DiscoveryConfig,
    registrations: DashMap<RegistrationKey, Registration>,
    sessions: DashMap<String, Arc<BrowseSession>>,
    shut_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(provider: Arc<dyn DiscoveryProvider>, config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;

        info!(
            poll_interval_ms = config.poll_interval_ms,
            removal_policy = ?config.removal_policy,
            "Session registry created"
        );

        Ok(Self {
            provider,
            config,
            registrations: DashMap::new(),
            sessions: DashMap::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DiscoveryError::ShutDown);
        }
        Ok(())
    }

    /// Advertises `name` under `service_type`.
    ///
    /// `txt_json` must be a flat object of string values; each pair becomes
    /// one TXT entry.
    pub fn register_service(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        txt_json: &str,
    ) -> Result<()> {
        self.ensure_open()?;
        let service_type = ServiceType::parse(service_type)?;
        let txt = TxtRecord::from_json_str(txt_json)?;
        let wire = txt.encode()?;

        let key = (name.to_string(), service_type.as_str().to_string());
        if self.registrations.contains_key(&key) {
            return Err(already_registered(name, &service_type));
        }

        let id = self
            .provider
            .register(name, service_type.as_str(), port, &wire)
            .map_err(|e| DiscoveryError::provider("register", name, e))?;
        let handle = ProviderHandle::new(id, self.provider.clone());

        let rejected = match self.registrations.entry(key.clone()) {
            Entry::Occupied(_) => Some(handle),
            Entry::Vacant(slot) => {
                slot.insert(Registration {
                    name: name.to_string(),
                    service_type: service_type.clone(),
                    port,
                    txt,
                    handle,
                });
                None
            }
        };
        if let Some(handle) = rejected {
            warn!(name = %name, service_type = %service_type, "Concurrent duplicate registration");
            drop(handle);
            return Err(already_registered(name, &service_type));
        }

        // Shutdown clears the map after setting its flag; anything inserted
        // after that clear is withdrawn here.
        if self.shut_down.load(Ordering::SeqCst) {
            let withdrawn = self
                .registrations
                .remove_if(&key, |_, registration| registration.handle_id() == id);
            debug!(name = %name, service_type = %service_type, "Registered during shutdown, withdrawing");
            drop(withdrawn);
            return Err(DiscoveryError::ShutDown);
        }

        info!(
            name = %name,
            service_type = %service_type,
            port,
            handle = %id,
            "Service registered"
        );
        Ok(())
    }

    /// [`register_service`](Self::register_service) reporting the numeric
    /// error code instead (`0` on success).
    pub fn register_service_code(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        txt_json: &str,
    ) -> i32 {
        match self.register_service(name, service_type, port, txt_json) {
            Ok(()) => ErrorCode::NoError.as_i32(),
            Err(e) => {
                warn!(name = %name, service_type = %service_type, error = %e, "Registration failed");
                e.code().as_i32()
            }
        }
    }

    /// Withdraws a registration. Returns `false` when there was none.
    pub fn unregister_service(&self, name: &str, service_type: &str) -> bool {
        match self.take_registration(name, service_type) {
            Ok(registration) => {
                let handle = registration.handle_id();
                let service_type = registration.service_type.clone();
                drop(registration);
                info!(name = %name, service_type = %service_type, %handle, "Service unregistered");
                true
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Unregister ignored");
                false
            }
        }
    }

    /// Removes the registration of (name, service type) from the map. The
    /// caller releases it by dropping it.
    fn take_registration(&self, name: &str, service_type: &str) -> Result<Registration> {
        let service_type = ServiceType::parse(service_type)?;
        let key = (name.to_string(), service_type.as_str().to_string());
        self.registrations
            .remove(&key)
            .map(|(_, registration)| registration)
            .ok_or_else(|| DiscoveryError::NotFound(format!("registration {name} ({service_type})")))
    }

    /// Subscribes `callback` to device updates of `service_type`, starting a
    /// browse session if none is running.
    ///
    /// A caller that finds a session still starting waits for the outcome.
    /// If that start failed, the failed session is cleaned up and a fresh one
    /// is created.
    pub async fn start_browse(&self, service_type: &str, callback: DeviceCallback) -> Result<()> {
        self.ensure_open()?;
        let service_type = ServiceType::parse(service_type)?;
        let key = service_type.as_str().to_string();

        loop {
            let existing = self.sessions.get(&key).map(|entry| entry.value().clone());
            if let Some(existing) = existing {
                match existing.settled_state().await {
                    SessionState::Running if !existing.is_faulted() => {
                        existing.add_subscriber(callback);
                        debug!(
                            service_type = %service_type,
                            subscribers = existing.subscriber_count(),
                            "Joined running browse session"
                        );
                        return self.confirm_open(&key, &existing).await;
                    }
                    SessionState::Created | SessionState::Subscribing => {
                        // The creator has not taken the lifecycle lock yet
                        tokio::task::yield_now().await;
                    }
                    _ => {
                        if self
                            .sessions
                            .remove_if(&key, |_, session| Arc::ptr_eq(session, &existing))
                            .is_some()
                        {
                            info!(service_type = %service_type, "Cleaning up failed browse session");
                            existing.stop().await;
                        }
                    }
                }
                continue;
            }

            let session = BrowseSession::new(
                service_type.clone(),
                self.provider.clone(),
                self.config.clone(),
            );
            session.add_subscriber(callback.clone());

            let inserted = match self.sessions.entry(key.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(session.clone());
                    true
                }
            };
            if !inserted {
                continue;
            }

            if let Err(e) = session.start().await {
                self.sessions
                    .remove_if(&key, |_, s| Arc::ptr_eq(s, &session));
                session.stop().await;
                return Err(e);
            }
            return self.confirm_open(&key, &session).await;
        }
    }

    /// Undoes a session start or join that raced with [`shutdown`](Self::shutdown).
    ///
    /// Shutdown sets its flag before draining the map, so a session inserted
    /// before this check is either drained there or stopped here.
    async fn confirm_open(&self, key: &str, session: &Arc<BrowseSession>) -> Result<()> {
        if !self.shut_down.load(Ordering::SeqCst) {
            return Ok(());
        }
        debug!(service_type = %key, "Browse started during shutdown, rolling back");
        self.sessions.remove_if(key, |_, s| Arc::ptr_eq(s, session));
        session.stop().await;
        Err(DiscoveryError::ShutDown)
    }

    /// Stops the session of `service_type` and waits for it to quiesce.
    /// Returns `false` when no session existed.
    pub async fn stop_browse(&self, service_type: &str) -> bool {
        let key = match ServiceType::parse(service_type) {
            Ok(ty) => ty.as_str().to_string(),
            Err(e) => {
                warn!(error = %e, "Stop browse with invalid service type");
                return false;
            }
        };

        let session = self.sessions.remove(&key).map(|(_, session)| session);
        match session {
            Some(session) => {
                session.stop().await;
                true
            }
            None => {
                debug!(service_type = %key, "No browse session to stop");
                false
            }
        }
    }

    /// Stops every session and withdraws every registration. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            sessions = self.sessions.len(),
            registrations = self.registrations.len(),
            "Shutting down session registry"
        );

        let keys: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let session = self.sessions.remove(&key).map(|(_, session)| session);
            if let Some(session) = session {
                session.stop().await;
            }
        }

        self.registrations.clear();
        info!("Session registry shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Device records retained by the session of `service_type`.
    pub fn devices(&self, service_type: &str) -> Vec<DeviceRecord> {
        let Ok(ty) = ServiceType::parse(service_type) else {
            return Vec::new();
        };
        let session = self.sessions.get(ty.as_str()).map(|e| e.value().clone());
        session.map(|s| s.device_records()).unwrap_or_default()
    }

    pub fn is_registered(&self, name: &str, service_type: &str) -> bool {
        ServiceType::parse(service_type)
            .map(|ty| {
                self.registrations
                    .contains_key(&(name.to_string(), ty.as_str().to_string()))
            })
            .unwrap_or(false)
    }

    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, service_type: &str) -> Option<Arc<BrowseSession>> {
        let ty = ServiceType::parse(service_type).ok()?;
        self.sessions.get(ty.as_str()).map(|e| e.value().clone())
    }

    pub fn subscriber_count(&self, service_type: &str) -> usize {
        self.session(service_type)
            .map(|s| s.subscriber_count())
            .unwrap_or(0)
    }

    pub fn is_browsing(&self, service_type: &str) -> bool {
        self.session(service_type)
            .map(|s| s.is_running())
            .unwrap_or(false)
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::SeqCst) && !self.sessions.is_empty() {
            warn!("Session registry dropped without shutdown");
            for entry in self.sessions.iter() {
                entry.value().request_stop();
            }
        }
    }
}

fn already_registered(name: &str, service_type: &ServiceType) -> DiscoveryError {
    DiscoveryError::AlreadyRegistered {
        name: name.to_string(),
        service_type: service_type.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Primitive, ScriptedProvider};

    fn registry(provider: &Arc<ScriptedProvider>) -> SessionRegistry {
        SessionRegistry::new(provider.clone(), DiscoveryConfig::default()).unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let provider = Arc::new(ScriptedProvider::new());
        let config = DiscoveryConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(SessionRegistry::new(provider, config).is_err());
    }

    #[test]
    fn test_invalid_txt_makes_no_registration() {
        let provider = Arc::new(ScriptedProvider::new());
        let registry = registry(&provider);

        let err = registry
            .register_service("Dev1", "_svc._tcp", 1234, r#"{"width":100}"#)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invalid);
        assert_eq!(
            registry.register_service_code("Dev1", "_svc._tcp", 1234, "{broken"),
            ErrorCode::Invalid.as_i32()
        );

        assert_eq!(registry.registration_count(), 0);
        assert_eq!(provider.calls(Primitive::Register), 0);
    }

    #[test]
    fn test_provider_register_failure() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.fail_next_register(ErrorCode::ServiceNotRunning);
        let registry = registry(&provider);

        let code = registry.register_service_code("Dev1", "_svc._tcp", 1234, "{}");
        assert_eq!(code, ErrorCode::ServiceNotRunning.as_i32());
        assert!(!registry.is_registered("Dev1", "_svc._tcp"));
    }

    #[test]
    fn test_service_type_forms_share_registration() {
        let provider = Arc::new(ScriptedProvider::new());
        let registry = registry(&provider);

        registry
            .register_service("Dev1", "_svc._tcp.local.", 1234, "{}")
            .unwrap();
        assert!(registry.is_registered("Dev1", "_svc._tcp"));
        assert!(matches!(
            registry.register_service("Dev1", "_svc._tcp", 1234, "{}"),
            Err(DiscoveryError::AlreadyRegistered { .. })
        ));
    }

    #[test]
    fn test_unknown_registration_is_not_found() {
        let provider = Arc::new(ScriptedProvider::new());
        let registry = registry(&provider);

        assert!(matches!(
            registry.take_registration("Ghost", "_svc._tcp"),
            Err(DiscoveryError::NotFound(_))
        ));
        assert!(matches!(
            registry.take_registration("Ghost", "bogus"),
            Err(DiscoveryError::InvalidServiceType(_))
        ));
        assert!(!registry.unregister_service("Ghost", "_svc._tcp"));
    }

    #[tokio::test]
    async fn test_operations_after_shutdown() {
        let provider = Arc::new(ScriptedProvider::new());
        let registry = registry(&provider);
        registry.shutdown().await;

        assert!(matches!(
            registry.register_service("Dev1", "_svc._tcp", 1, "{}"),
            Err(DiscoveryError::ShutDown)
        ));
        assert!(matches!(
            registry.start_browse("_svc._tcp", Arc::new(|_: &str| {})).await,
            Err(DiscoveryError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_invalid_service_type() {
        let provider = Arc::new(ScriptedProvider::new());
        let registry = registry(&provider);

        let err = registry
            .start_browse("not-a-type", Arc::new(|_: &str| {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadParam);
        assert!(!registry.stop_browse("not-a-type").await);
        assert_eq!(provider.browse_count(), 0);
    }
}
