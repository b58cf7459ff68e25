//! [`DiscoveryProvider`] backed by the `mdns-sd` daemon.
//!
//! `mdns-sd` resolves instances itself and reports complete `ServiceInfo`s,
//! so resolve and address lookups are answered from a cache of resolved
//! infos. An operation that starts before the daemon has resolved its target
//! waits for the resolution. Hosts outside `.local` go through the system
//! resolver.

use crate::names::{instance_label, ServiceType};
use crate::provider::{BrowseAction, Completion, DiscoveryProvider, EventSink, HandleId};
use crate::txt::TxtRecord;
use lanscout_core::config::AddressFamily;
use lanscout_core::{ErrorCode, ProviderError};
use mdns_sd::{ServiceDaemon, ServiceEvent as MdnsEvent, ServiceInfo};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How often browse listener threads check whether they were released.
const LISTENER_POLL: Duration = Duration::from_millis(200);

/// TTL reported for addresses from the system resolver.
const SYSTEM_RESOLVER_TTL: u32 = 60;

/// What the daemon told us about one instance.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedInstance {
    host: String,
    port: u16,
    txt: Vec<u8>,
}

struct BrowseEntry {
    fqdn: String,
    stopped: Arc<AtomicBool>,
}

#[derive(Default)]
struct MdnsState {
    /// Registration handle -> full instance name
    registrations: HashMap<HandleId, String>,
    browses: HashMap<HandleId, BrowseEntry>,
    /// Full instance name -> resolution
    resolved: HashMap<String, ResolvedInstance>,
    /// Host name -> (addresses, ttl)
    hosts: HashMap<String, (Vec<IpAddr>, u32)>,
    resolve_waiters: HashMap<HandleId, (String, EventSink)>,
    address_waiters: HashMap<HandleId, (String, AddressFamily, EventSink)>,
}

/// mDNS provider over [`ServiceDaemon`].
pub struct MdnsProvider {
    daemon: ServiceDaemon,
    host: String,
    next_handle: AtomicU64,
    state: Arc<Mutex<MdnsState>>,
}

impl MdnsProvider {
    /// Starts the mDNS daemon.
    pub fn new() -> Result<Self, ProviderError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| ProviderError::failed(format!("Failed to create mDNS daemon: {e}")))?;

        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());

        debug!(host = %hostname, "mDNS provider started");

        Ok(Self {
            daemon,
            host: local_host_name(&hostname),
            next_handle: AtomicU64::new(1),
            state: Arc::new(Mutex::new(MdnsState::default())),
        })
    }

    fn allocate(&self) -> HandleId {
        HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn spawn_listener(
        &self,
        receiver: mdns_sd::Receiver<MdnsEvent>,
        fqdn: String,
        domain: String,
        sink: EventSink,
        stopped: Arc<AtomicBool>,
    ) -> Result<(), ProviderError> {
        let state = self.state.clone();
        std::thread::Builder::new()
            .name("lanscout-mdns-browse".into())
            .spawn(move || {
                debug!(service_type = %fqdn, "Browse listener started");
                while !stopped.load(Ordering::SeqCst) && !sink.is_closed() {
                    match receiver.recv_timeout(LISTENER_POLL) {
                        Ok(event) => handle_event(&state, &fqdn, &domain, &sink, event),
                        Err(_) if receiver.is_disconnected() => break,
                        Err(_) => continue,
                    }
                }
                debug!(service_type = %fqdn, "Browse listener stopped");
            })
            .map(|_| ())
            .map_err(|e| ProviderError::failed(format!("Failed to spawn browse listener: {e}")))
    }
}

impl DiscoveryProvider for MdnsProvider {
    fn register(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        txt: &[u8],
    ) -> Result<HandleId, ProviderError> {
        let fqdn = fqdn_for(service_type, "local.")?;
        let properties: HashMap<String, String> = TxtRecord::decode(txt)
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let info = ServiceInfo::new(&fqdn, name, &self.host, "", port, properties)
            .map_err(|e| ProviderError::new(ErrorCode::BadParam, e.to_string()))?
            .enable_addr_auto();
        let full_name = info.get_fullname().to_string();

        self.daemon
            .register(info)
            .map_err(|e| ProviderError::failed(format!("mDNS register failed: {e}")))?;

        let id = self.allocate();
        self.state.lock().registrations.insert(id, full_name.clone());
        debug!(full_name = %full_name, port, handle = %id, "mDNS service registered");
        Ok(id)
    }

    fn browse(
        &self,
        service_type: &str,
        domain: &str,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError> {
        let fqdn = fqdn_for(service_type, domain)?;
        let receiver = self
            .daemon
            .browse(&fqdn)
            .map_err(|e| ProviderError::failed(format!("mDNS browse failed: {e}")))?;

        let id = self.allocate();
        let stopped = Arc::new(AtomicBool::new(false));
        self.state.lock().browses.insert(
            id,
            BrowseEntry {
                fqdn: fqdn.clone(),
                stopped: stopped.clone(),
            },
        );

        if let Err(e) = self.spawn_listener(receiver, fqdn.clone(), domain.to_string(), sink, stopped) {
            self.state.lock().browses.remove(&id);
            if let Err(stop_err) = self.daemon.stop_browse(&fqdn) {
                debug!(service_type = %fqdn, error = %stop_err, "mDNS stop_browse failed");
            }
            return Err(e);
        }

        debug!(service_type = %fqdn, handle = %id, "mDNS browse started");
        Ok(id)
    }

    fn resolve(
        &self,
        name: &str,
        service_type: &str,
        domain: &str,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError> {
        let full_name = format!("{}.{}", name, fqdn_for(service_type, domain)?);
        let id = self.allocate();

        let cached = {
            let mut state = self.state.lock();
            match state.resolved.get(&full_name).cloned() {
                Some(resolved) => Some(resolved),
                None => {
                    state
                        .resolve_waiters
                        .insert(id, (full_name.clone(), sink.clone()));
                    None
                }
            }
        };

        match cached {
            Some(resolved) => {
                sink.resolved(full_name, resolved.host, resolved.port, resolved.txt);
            }
            None => trace!(full_name = %full_name, handle = %id, "Waiting for mDNS resolution"),
        }
        Ok(id)
    }

    fn lookup_address(
        &self,
        host: &str,
        family: AddressFamily,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError> {
        let id = self.allocate();

        let cached = {
            let mut state = self.state.lock();
            let hit = state
                .hosts
                .get(host)
                .and_then(|(addrs, ttl)| pick_address(addrs, family).map(|ip| (ip, *ttl)));
            if hit.is_none() && is_local_host(host) {
                state
                    .address_waiters
                    .insert(id, (host.to_string(), family, sink.clone()));
            }
            hit
        };

        if let Some((ip, ttl)) = cached {
            sink.address(host, ip, ttl);
        } else if !is_local_host(host) {
            spawn_system_lookup(host.to_string(), family, sink)?;
        }
        Ok(id)
    }

    fn release(&self, handle: HandleId) {
        let (registration, browse) = {
            let mut state = self.state.lock();
            state.resolve_waiters.remove(&handle);
            state.address_waiters.remove(&handle);
            (
                state.registrations.remove(&handle),
                state.browses.remove(&handle),
            )
        };

        if let Some(full_name) = registration {
            if let Err(e) = self.daemon.unregister(&full_name) {
                warn!(full_name = %full_name, error = %e, "mDNS unregister failed");
            }
        }
        if let Some(entry) = browse {
            entry.stopped.store(true, Ordering::SeqCst);
            if let Err(e) = self.daemon.stop_browse(&entry.fqdn) {
                debug!(service_type = %entry.fqdn, error = %e, "mDNS stop_browse failed");
            }
        }
    }
}

impl Drop for MdnsProvider {
    fn drop(&mut self) {
        for entry in self.state.lock().browses.values() {
            entry.stopped.store(true, Ordering::SeqCst);
        }
        if let Err(e) = self.daemon.shutdown() {
            debug!(error = %e, "mDNS daemon shutdown failed");
        }
    }
}

fn handle_event(
    state: &Mutex<MdnsState>,
    fqdn: &str,
    domain: &str,
    sink: &EventSink,
    event: MdnsEvent,
) {
    match event {
        MdnsEvent::ServiceFound(ty, full_name) => {
            trace!(full_name = %full_name, "mDNS service found");
            sink.browse(BrowseAction::Add, instance_label(&full_name, fqdn), ty, domain);
        }

        MdnsEvent::ServiceResolved(info) => {
            let full_name = info.get_fullname().to_string();
            let resolved = ResolvedInstance {
                host: info.get_hostname().to_string(),
                port: info.get_port(),
                txt: txt_bytes(&info),
            };
            let addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
            trace!(full_name = %full_name, host = %resolved.host, "mDNS service resolved");

            let (changed, ready) = {
                let mut state = state.lock();
                let previous = state.resolved.insert(full_name.clone(), resolved.clone());
                if let Some(moved_from) = previous.as_ref().filter(|p| p.host != resolved.host) {
                    prune_host(&mut state, &moved_from.host);
                }

                let entry = state
                    .hosts
                    .entry(resolved.host.clone())
                    .or_insert_with(|| (Vec::new(), info.get_host_ttl()));
                for ip in addresses {
                    if !entry.0.contains(&ip) {
                        entry.0.push(ip);
                    }
                }
                entry.1 = info.get_host_ttl();

                let ready = take_ready(&mut state, &full_name, &resolved);
                (previous.is_some_and(|p| p != resolved), ready)
            };

            for (sink, completion) in ready {
                sink.deliver(completion);
            }

            // The daemon re-resolves on TXT or port changes; re-announce so
            // the session refreshes the record.
            if changed {
                sink.browse(
                    BrowseAction::Add,
                    instance_label(&full_name, fqdn),
                    info.get_type(),
                    domain,
                );
            }
        }

        MdnsEvent::ServiceRemoved(ty, full_name) => {
            trace!(full_name = %full_name, "mDNS service removed");
            forget_instance(&mut state.lock(), &full_name);
            sink.browse(BrowseAction::Remove, instance_label(&full_name, fqdn), ty, domain);
        }

        MdnsEvent::SearchStopped(ty) => debug!(service_type = %ty, "mDNS search stopped"),
        other => trace!(event = ?other, "mDNS event"),
    }
}

/// Drops the resolution of `full_name` and, with it, the addresses of its
/// host once no other instance lives there.
fn forget_instance(state: &mut MdnsState, full_name: &str) {
    if let Some(gone) = state.resolved.remove(full_name) {
        prune_host(state, &gone.host);
    }
}

fn prune_host(state: &mut MdnsState, host: &str) {
    if !state.resolved.values().any(|r| r.host == host) && state.hosts.remove(host).is_some() {
        trace!(host = %host, "mDNS host forgotten");
    }
}

/// Waiters satisfied by a new resolution of `full_name`.
fn take_ready(
    state: &mut MdnsState,
    full_name: &str,
    resolved: &ResolvedInstance,
) -> Vec<(EventSink, Completion)> {
    let mut ready = Vec::new();

    let resolve_ids: Vec<HandleId> = state
        .resolve_waiters
        .iter()
        .filter(|(_, (name, _))| name == full_name)
        .map(|(id, _)| *id)
        .collect();
    for id in resolve_ids {
        if let Some((name, sink)) = state.resolve_waiters.remove(&id) {
            ready.push((
                sink,
                Completion::Resolved {
                    full_name: name,
                    host: resolved.host.clone(),
                    port: resolved.port,
                    txt: resolved.txt.clone(),
                },
            ));
        }
    }

    let Some((addrs, ttl)) = state.hosts.get(&resolved.host).cloned() else {
        return ready;
    };
    let address_ids: Vec<HandleId> = state
        .address_waiters
        .iter()
        .filter(|(_, (host, family, _))| {
            *host == resolved.host && pick_address(&addrs, *family).is_some()
        })
        .map(|(id, _)| *id)
        .collect();
    for id in address_ids {
        if let Some((host, family, sink)) = state.address_waiters.remove(&id) {
            if let Some(ip) = pick_address(&addrs, family) {
                ready.push((sink, Completion::Address { host, ip, ttl }));
            }
        }
    }

    ready
}

fn spawn_system_lookup(
    host: String,
    family: AddressFamily,
    sink: EventSink,
) -> Result<(), ProviderError> {
    std::thread::Builder::new()
        .name("lanscout-resolve".into())
        .spawn(move || {
            let target = host.trim_end_matches('.');
            let found = (target, 0)
                .to_socket_addrs()
                .map(|addrs| addrs.map(|a| a.ip()).collect::<Vec<_>>());

            match found.ok().and_then(|addrs| pick_address(&addrs, family)) {
                Some(ip) => {
                    sink.address(host, ip, SYSTEM_RESOLVER_TTL);
                }
                None => {
                    debug!(host = %host, "System resolver found no usable address");
                    sink.failed(ErrorCode::Unknown);
                }
            }
        })
        .map(|_| ())
        .map_err(|e| ProviderError::failed(format!("Failed to spawn resolver: {e}")))
}

fn fqdn_for(service_type: &str, domain: &str) -> Result<String, ProviderError> {
    ServiceType::parse(service_type)
        .map(|ty| ty.to_fqdn(domain))
        .map_err(|e| ProviderError::new(ErrorCode::BadParam, e.to_string()))
}

/// Wire-format TXT data of a resolved info.
fn txt_bytes(info: &ServiceInfo) -> Vec<u8> {
    let record: TxtRecord = info
        .get_properties()
        .iter()
        .map(|p| (p.key().to_string(), p.val_str().to_string()))
        .collect();

    record.encode().unwrap_or_else(|e| {
        warn!(full_name = %info.get_fullname(), error = %e, "Dropping unencodable TXT data");
        Vec::new()
    })
}

fn pick_address(addrs: &[IpAddr], family: AddressFamily) -> Option<IpAddr> {
    match family {
        // Prefer IPv4 when any family is acceptable
        AddressFamily::Any => addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied(),
        family => addrs.iter().find(|ip| family.accepts(ip)).copied(),
    }
}

fn is_local_host(host: &str) -> bool {
    host.trim_end_matches('.').ends_with(".local")
}

fn local_host_name(hostname: &str) -> String {
    let base = hostname.trim_end_matches('.');
    let base = base.strip_suffix(".local").unwrap_or(base);
    format!("{base}.local.")
}
