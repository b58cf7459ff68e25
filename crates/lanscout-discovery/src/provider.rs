//! Discovery provider contract.
//!
//! A provider is the protocol engine underneath the sessions. Every primitive
//! returns a [`HandleId`] for a long-lived association and reports results by
//! pushing typed [`Completion`]s into the [`EventSink`] it was given. Sinks
//! feed a channel drained by the owning session's pump, so a provider may
//! deliver from any thread without touching session state.

use lanscout_core::config::AddressFamily;
use lanscout_core::{ErrorCode, ProviderError};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

/// Identifier of a provider association (registration, browse, resolve,
/// address lookup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Session-unique tag attached to every operation a session starts.
/// Completions carrying an op the session no longer tracks are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Browse event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowseAction {
    Add,
    Remove,
}

/// Result delivered by a provider for one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// An instance appeared or disappeared
    Browse {
        action: BrowseAction,
        name: String,
        service_type: String,
        domain: String,
    },
    /// Name resolution finished
    Resolved {
        full_name: String,
        host: String,
        port: u16,
        txt: Vec<u8>,
    },
    /// Address lookup produced an address
    Address { host: String, ip: IpAddr, ttl: u32 },
    /// The operation failed asynchronously
    Failed { code: ErrorCode },
    /// Final callback after release, for providers that send one
    Cancelled,
}

/// Completion tagged with the op it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderEvent {
    pub op: OpId,
    pub completion: Completion,
}

/// Where a provider pushes completions for one operation.
#[derive(Debug, Clone)]
pub struct EventSink {
    op: OpId,
    tx: flume::Sender<ProviderEvent>,
}

impl EventSink {
    pub fn new(op: OpId, tx: flume::Sender<ProviderEvent>) -> Self {
        Self { op, tx }
    }

    pub fn op(&self) -> OpId {
        self.op
    }

    /// Pushes a completion. Returns `false` once the owning session has gone
    /// away; the completion is dropped in that case.
    pub fn deliver(&self, completion: Completion) -> bool {
        let delivered = self
            .tx
            .send(ProviderEvent {
                op: self.op,
                completion,
            })
            .is_ok();
        if !delivered {
            trace!(op = %self.op, "Dropping completion for closed session");
        }
        delivered
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_disconnected()
    }

    pub fn browse(
        &self,
        action: BrowseAction,
        name: impl Into<String>,
        service_type: impl Into<String>,
        domain: impl Into<String>,
    ) -> bool {
        self.deliver(Completion::Browse {
            action,
            name: name.into(),
            service_type: service_type.into(),
            domain: domain.into(),
        })
    }

    pub fn resolved(
        &self,
        full_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        txt: Vec<u8>,
    ) -> bool {
        self.deliver(Completion::Resolved {
            full_name: full_name.into(),
            host: host.into(),
            port,
            txt,
        })
    }

    pub fn address(&self, host: impl Into<String>, ip: IpAddr, ttl: u32) -> bool {
        self.deliver(Completion::Address {
            host: host.into(),
            ip,
            ttl,
        })
    }

    pub fn failed(&self, code: ErrorCode) -> bool {
        self.deliver(Completion::Failed { code })
    }
}

/// How a provider gets its completions delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// The provider calls the sinks itself from its own threads
    #[default]
    Callback,
    /// The session must call [`DiscoveryProvider::process_ready`] for its
    /// handles on every pump iteration
    Poll,
}

/// The protocol engine consumed by sessions and the registry.
pub trait DiscoveryProvider: Send + Sync + 'static {
    fn dispatch_mode(&self) -> DispatchMode {
        DispatchMode::Callback
    }

    /// Whether a released resolve or address handle may still deliver one
    /// final completion (usually [`Completion::Cancelled`]).
    fn delivers_after_release(&self) -> bool {
        false
    }

    /// Advertises `name` under `service_type`. `txt` is wire-format TXT data.
    fn register(
        &self,
        name: &str,
        service_type: &str,
        port: u16,
        txt: &[u8],
    ) -> Result<HandleId, ProviderError>;

    /// Starts a browse. Add/remove events go to `sink`.
    fn browse(
        &self,
        service_type: &str,
        domain: &str,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError>;

    /// Resolves an instance to host, port and TXT data.
    fn resolve(
        &self,
        name: &str,
        service_type: &str,
        domain: &str,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError>;

    /// Looks up addresses of `host`.
    fn lookup_address(
        &self,
        host: &str,
        family: AddressFamily,
        sink: EventSink,
    ) -> Result<HandleId, ProviderError>;

    /// Ends an association. Called exactly once per handle, by
    /// [`ProviderHandle`]'s drop.
    fn release(&self, handle: HandleId);

    /// Poll-driven providers deliver whatever is ready for `handles` without
    /// blocking.
    fn process_ready(&self, _handles: &[HandleId]) {}
}

/// Owned provider association; releases the handle when dropped.
///
/// Every handle a provider returns is wrapped in one of these immediately, so
/// a handle can only be released once.
pub struct ProviderHandle {
    id: HandleId,
    provider: Arc<dyn DiscoveryProvider>,
}

impl ProviderHandle {
    pub fn new(id: HandleId, provider: Arc<dyn DiscoveryProvider>) -> Self {
        Self { id, provider }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ProviderHandle").field(&self.id).finish()
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        trace!(handle = %self.id, "Releasing provider handle");
        self.provider.release(self.id);
    }
}
