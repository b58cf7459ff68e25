//! In-memory discovery provider for tests.
//!
//! [`ScriptedProvider`] hands out handles, records every release and lets a
//! test drive completions by hand (`emit_browse`, `complete_resolve`, ...)
//! or pre-script them (`script_resolve`, `script_address`) so that they are
//! delivered as soon as the operation starts.

use crate::provider::{
    BrowseAction, Completion, DiscoveryProvider, DispatchMode, EventSink, HandleId,
};
use lanscout_core::config::AddressFamily;
use lanscout_core::{ErrorCode, ProviderError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// TTL reported for scripted addresses.
pub const SCRIPTED_TTL: u32 = 120;

/// Provider primitive, for one-shot failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    Register,
    Browse,
    Resolve,
    LookupAddress,
}

#[derive(Debug, Clone)]
enum Issued {
    Registration {
        name: String,
        service_type: String,
        port: u16,
        txt: Vec<u8>,
    },
    Browse {
        service_type: String,
        domain: String,
        sink: EventSink,
    },
    Resolve {
        name: String,
        service_type: String,
        domain: String,
        sink: EventSink,
    },
    Address {
        host: String,
        sink: EventSink,
    },
}

impl Issued {
    fn sink(&self) -> Option<&EventSink> {
        match self {
            Issued::Registration { .. } => None,
            Issued::Browse { sink, .. }
            | Issued::Resolve { sink, .. }
            | Issued::Address { sink, .. } => Some(sink),
        }
    }
}

#[derive(Default)]
struct ScriptState {
    live: HashMap<HandleId, Issued>,
    releases: HashMap<HandleId, u32>,
    issued_total: usize,
    calls: HashMap<Primitive, usize>,
    failures: HashMap<Primitive, ErrorCode>,
    resolve_script: HashMap<String, (String, u16, Vec<u8>)>,
    address_script: HashMap<String, IpAddr>,
    /// Completions waiting for `process_ready` in poll mode
    queued: Vec<(HandleId, Completion)>,
}

/// Scripted [`DiscoveryProvider`].
pub struct ScriptedProvider {
    state: Mutex<ScriptState>,
    next_handle: AtomicU64,
    mode: DispatchMode,
    final_callback: bool,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// Callback-mode provider delivering on the calling thread.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScriptState::default()),
            next_handle: AtomicU64::new(1),
            mode: DispatchMode::Callback,
            final_callback: false,
        }
    }

    pub fn with_dispatch_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    /// Released resolve and address handles deliver one final
    /// [`Completion::Cancelled`].
    pub fn with_final_callback(mut self) -> Self {
        self.final_callback = true;
        self
    }

    // ── Scripting ────────────────────────────────────────────────

    /// The next call of `primitive` fails synchronously with `code`.
    pub fn fail_next(&self, primitive: Primitive, code: ErrorCode) {
        self.state.lock().failures.insert(primitive, code);
    }

    pub fn fail_next_browse(&self, code: ErrorCode) {
        self.fail_next(Primitive::Browse, code);
    }

    pub fn fail_next_register(&self, code: ErrorCode) {
        self.fail_next(Primitive::Register, code);
    }

    /// Resolving instance `name` succeeds as soon as it starts.
    pub fn script_resolve(&self, name: &str, host: &str, port: u16, txt: Vec<u8>) {
        self.state
            .lock()
            .resolve_script
            .insert(name.to_string(), (host.to_string(), port, txt));
    }

    /// Looking up `host` succeeds as soon as it starts.
    pub fn script_address(&self, host: &str, ip: IpAddr) {
        self.state
            .lock()
            .address_script
            .insert(host.to_string(), ip);
    }

    // ── Injection ────────────────────────────────────────────────

    /// Reports an instance on every live browse of `service_type`. Returns
    /// how many browses got the event.
    pub fn emit_browse(&self, service_type: &str, action: BrowseAction, name: &str) -> usize {
        let targets: Vec<(HandleId, String)> = {
            let state = self.state.lock();
            state
                .live
                .iter()
                .filter_map(|(id, issued)| match issued {
                    Issued::Browse {
                        service_type: ty,
                        domain,
                        ..
                    } if same_type(ty, service_type) => Some((*id, domain.clone())),
                    _ => None,
                })
                .collect()
        };

        for (id, domain) in &targets {
            self.deliver(
                *id,
                Completion::Browse {
                    action,
                    name: name.to_string(),
                    service_type: format!("{}.", service_type.trim_end_matches('.')),
                    domain: domain.clone(),
                },
            );
        }
        targets.len()
    }

    /// Fails every live browse of `service_type` asynchronously.
    pub fn fail_browse(&self, service_type: &str, code: ErrorCode) -> usize {
        let targets: Vec<HandleId> = {
            let state = self.state.lock();
            state
                .live
                .iter()
                .filter_map(|(id, issued)| match issued {
                    Issued::Browse {
                        service_type: ty, ..
                    } if same_type(ty, service_type) => Some(*id),
                    _ => None,
                })
                .collect()
        };

        for id in &targets {
            self.deliver(*id, Completion::Failed { code });
        }
        targets.len()
    }

    /// Completes the outstanding resolve of `name`.
    pub fn complete_resolve(&self, name: &str, host: &str, port: u16, txt: Vec<u8>) -> bool {
        let Some((id, full_name)) = self.find_resolve(name) else {
            return false;
        };
        self.deliver(
            id,
            Completion::Resolved {
                full_name,
                host: host.to_string(),
                port,
                txt,
            },
        );
        true
    }

    /// Fails the outstanding resolve of `name` asynchronously.
    pub fn fail_resolve(&self, name: &str, code: ErrorCode) -> bool {
        let Some((id, _)) = self.find_resolve(name) else {
            return false;
        };
        self.deliver(id, Completion::Failed { code });
        true
    }

    /// Completes the outstanding address lookup of `host`.
    pub fn complete_address(&self, host: &str, ip: IpAddr) -> bool {
        let Some(id) = self.find_lookup(host) else {
            return false;
        };
        self.deliver(
            id,
            Completion::Address {
                host: host.to_string(),
                ip,
                ttl: SCRIPTED_TTL,
            },
        );
        true
    }

    /// Fails the outstanding address lookup of `host` asynchronously.
    pub fn fail_address(&self, host: &str, code: ErrorCode) -> bool {
        let Some(id) = self.find_lookup(host) else {
            return false;
        };
        self.deliver(id, Completion::Failed { code });
        true
    }

    // ── Inspection ───────────────────────────────────────────────

    /// Number of times `primitive` was called, failed calls included.
    pub fn calls(&self, primitive: Primitive) -> usize {
        self.state.lock().calls.get(&primitive).copied().unwrap_or(0)
    }

    pub fn browse_count(&self) -> usize {
        self.calls(Primitive::Browse)
    }

    pub fn active_browses(&self) -> usize {
        self.count_live(|issued| matches!(issued, Issued::Browse { .. }))
    }

    pub fn active_registrations(&self) -> usize {
        self.count_live(|issued| matches!(issued, Issued::Registration { .. }))
    }

    /// Names of instances with a live resolve handle.
    pub fn pending_resolves(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut names: Vec<String> = state
            .live
            .values()
            .filter_map(|issued| match issued {
                Issued::Resolve { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect();
        names.sort();
        names
    }

    pub fn pending_lookups(&self) -> usize {
        self.count_live(|issued| matches!(issued, Issued::Address { .. }))
    }

    /// Handles issued and not yet released.
    pub fn live_handles(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn issued_handles(&self) -> usize {
        self.state.lock().issued_total
    }

    pub fn release_count(&self, id: HandleId) -> u32 {
        self.state.lock().releases.get(&id).copied().unwrap_or(0)
    }

    /// Handles released more than once.
    pub fn double_releases(&self) -> Vec<HandleId> {
        let state = self.state.lock();
        let mut ids: Vec<HandleId> = state
            .releases
            .iter()
            .filter(|(_, count)| **count > 1)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Wire-format TXT data of a live registration.
    pub fn registered_txt(&self, name: &str, service_type: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        state.live.values().find_map(|issued| match issued {
            Issued::Registration {
                name: n,
                service_type: ty,
                txt,
                ..
            } if n == name && same_type(ty, service_type) => Some(txt.clone()),
            _ => None,
        })
    }

    /// Port of a live registration.
    pub fn registered_port(&self, name: &str, service_type: &str) -> Option<u16> {
        let state = self.state.lock();
        state.live.values().find_map(|issued| match issued {
            Issued::Registration {
                name: n,
                service_type: ty,
                port,
                ..
            } if n == name && same_type(ty, service_type) => Some(*port),
            _ => None,
        })
    }

    // ── Internals ────────────────────────────────────────────────

    fn count_live(&self, filter: impl Fn(&Issued) -> bool) -> usize {
        self.state.lock().live.values().filter(|i| filter(i)).count()
    }

    fn find_resolve(&self, name: &str) -> Option<(HandleId, String)> {
        let state = self.state.lock();
        state.live.iter().find_map(|(id, issued)| match issued {
            Issued::Resolve {
                name: n,
                service_type,
                domain,
                ..
            } if n == name => Some((*id, full_name(n, service_type, domain))),
            _ => None,
        })
    }

    fn find_lookup(&self, host: &str) -> Option<HandleId> {
        let state = self.state.lock();
        state.live.iter().find_map(|(id, issued)| match issued {
            Issued::Address { host: h, .. } if h == host => Some(*id),
            _ => None,
        })
    }

    /// Counts the call and consumes a scripted failure, if any.
    fn begin(&self, primitive: Primitive) -> Result<HandleId, ProviderError> {
        let mut state = self.state.lock();
        *state.calls.entry(primitive).or_default() += 1;
        if let Some(code) = state.failures.remove(&primitive) {
            return Err(ProviderError::new(
                code,
                format!("scripted {primitive:?} failure"),
            ));
        }
        state.issued_total += 1;
        Ok(HandleId(self.next_handle.fetch_add(1, Ordering::Relaxed)))
    }

    fn issue(&self, id: HandleId, issued: Issued) {
        self.state.lock().live.insert(id, issued);
    }

    /// Delivers now in callback mode, queues for `process_ready` otherwise.
    fn deliver(&self, id: HandleId, completion: Completion) {
        let sink = {
            let mut state = self.state.lock();
            if self.mode == DispatchMode::Poll {
                state.queued.push((id, completion));
                return;
            }
            state.live.get(&id).and_then(Issued::sink).cloned()
        };
        if let Some(sink) = sink {
            sink.deliver(completion);
        }
    }
}

impl DiscoveryProvider for ScriptedProvider {
    fn dispatch_mode(&self) -> DispatchMode {
        self.mode
    }

    fn delivers_after_release(&self) -> bool {
        self.final_callback
    }

    fn register(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        txt: &[u8],
    ) -> Result<HandleId, ProviderError> {
        let id = self.begin(Primitive::Register)?;
        self.issue(
            id,
            Issued::Registration {
                name: name.to_string(),
                service_type: service_type.to_string(),
                port,
                txt: txt.to_vec(),
            },
        );
        Ok(id)
    }

    fn browse(
        &self,
        service_type: &str,
        domain: &str,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError> {
        let id = self.begin(Primitive::Browse)?;
        self.issue(
            id,
            Issued::Browse {
                service_type: service_type.to_string(),
                domain: domain.to_string(),
                sink,
            },
        );
        Ok(id)
    }

    fn resolve(
        &self,
        name: &str,
        service_type: &str,
        domain: &str,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError> {
        let id = self.begin(Primitive::Resolve)?;
        self.issue(
            id,
            Issued::Resolve {
                name: name.to_string(),
                service_type: service_type.to_string(),
                domain: domain.to_string(),
                sink,
            },
        );

        let scripted = self.state.lock().resolve_script.get(name).cloned();
        if let Some((host, port, txt)) = scripted {
            self.deliver(
                id,
                Completion::Resolved {
                    full_name: full_name(name, service_type, domain),
                    host,
                    port,
                    txt,
                },
            );
        }
        Ok(id)
    }

    fn lookup_address(
        &self,
        host: &str,
        _family: AddressFamily,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError> {
        let id = self.begin(Primitive::LookupAddress)?;
        self.issue(
            id,
            Issued::Address {
                host: host.to_string(),
                sink,
            },
        );

        let scripted = self.state.lock().address_script.get(host).copied();
        if let Some(ip) = scripted {
            self.deliver(
                id,
                Completion::Address {
                    host: host.to_string(),
                    ip,
                    ttl: SCRIPTED_TTL,
                },
            );
        }
        Ok(id)
    }

    fn release(&self, handle: HandleId) {
        let final_sink = {
            let mut state = self.state.lock();
            *state.releases.entry(handle).or_default() += 1;
            state.queued.retain(|(id, _)| *id != handle);

            match state.live.remove(&handle) {
                Some(Issued::Resolve { sink, .. }) | Some(Issued::Address { sink, .. })
                    if self.final_callback =>
                {
                    Some(sink)
                }
                _ => None,
            }
        };

        if let Some(sink) = final_sink {
            sink.deliver(Completion::Cancelled);
        }
    }

    fn process_ready(&self, handles: &[HandleId]) {
        let ready: Vec<(EventSink, Completion)> = {
            let mut state = self.state.lock();
            let queued = std::mem::take(&mut state.queued);
            let mut ready = Vec::new();
            for (id, completion) in queued {
                if !handles.contains(&id) {
                    state.queued.push((id, completion));
                    continue;
                }
                if let Some(sink) = state.live.get(&id).and_then(Issued::sink) {
                    ready.push((sink.clone(), completion));
                }
            }
            ready
        };

        for (sink, completion) in ready {
            sink.deliver(completion);
        }
    }
}

fn same_type(a: &str, b: &str) -> bool {
    a.trim_end_matches('.') == b.trim_end_matches('.')
}

fn full_name(name: &str, service_type: &str, domain: &str) -> String {
    format!(
        "{}.{}.{}.",
        name,
        service_type.trim_end_matches('.'),
        domain.trim_end_matches('.')
    )
}
