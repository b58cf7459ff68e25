//! Browse sessions.
//!
//! A [`BrowseSession`] owns one browse subscription for one service type,
//! the resolve pipelines of the instances it is resolving, and the device
//! records it has produced. Provider completions arrive on a channel drained
//! by the session's pump task; resulting device payloads go through the
//! session's fan-out queue to its subscribers.
//!
//! The session lock is never held across a provider call or an await.
//! Handles released under the lock are moved out and dropped afterwards.

use crate::fanout::{DeviceCallback, Fanout, SubscriberId, Subscribers};
use crate::names::{display_name, instance_key, ServiceType};
use crate::provider::{
    BrowseAction, Completion, DiscoveryProvider, DispatchMode, EventSink, HandleId, OpId,
    ProviderEvent, ProviderHandle,
};
use crate::record::{Action, DeviceRecord};
use crate::resolve::{OpOwner, PipelineSet, ResolvePipeline, Stage};
use crate::txt::TxtRecord;
use lanscout_core::{DiscoveryConfig, DiscoveryError, ErrorCode, RemovalPolicy, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Lifecycle of a browse session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Subscribing,
    Running,
    Stopping,
    Terminated,
}

struct SessionInner {
    phase: SessionState,
    faulted: bool,
    browse_op: Option<OpId>,
    browse: Option<ProviderHandle>,
    pipelines: PipelineSet,
    /// Keyed by fully qualified instance name
    records: HashMap<String, DeviceRecord>,
}

/// Browse subscription for one service type.
pub struct BrowseSession {
    service_type: ServiceType,
    provider: Arc<dyn DiscoveryProvider>,
    config: DiscoveryConfig,
    running: Arc<AtomicBool>,
    next_op: AtomicU64,
    inner: Mutex<SessionInner>,
    subscribers: Arc<Subscribers>,
    events_tx: flume::Sender<ProviderEvent>,
    events_rx: flume::Receiver<ProviderEvent>,
    /// Serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BrowseSession {
    pub fn new(
        service_type: ServiceType,
        provider: Arc<dyn DiscoveryProvider>,
        config: DiscoveryConfig,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = flume::unbounded();

        Arc::new(Self {
            service_type,
            provider,
            config,
            running: Arc::new(AtomicBool::new(false)),
            next_op: AtomicU64::new(1),
            inner: Mutex::new(SessionInner {
                phase: SessionState::Created,
                faulted: false,
                browse_op: None,
                browse: None,
                pipelines: PipelineSet::new(),
                records: HashMap::new(),
            }),
            subscribers: Arc::new(Subscribers::new()),
            events_tx,
            events_rx,
            lifecycle: tokio::sync::Mutex::new(()),
            pump: Mutex::new(None),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn service_type(&self) -> &ServiceType {
        &self.service_type
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Waits for an in-flight [`start`](Self::start) or [`stop`](Self::stop)
    /// and returns the state it left behind.
    pub async fn settled_state(&self) -> SessionState {
        let _lifecycle = self.lifecycle.lock().await;
        self.state()
    }

    /// The browse subscription failed; the session must be torn down before
    /// the service type can be browsed again.
    pub fn is_faulted(&self) -> bool {
        self.inner.lock().faulted
    }

    pub fn active_pipelines(&self) -> usize {
        self.inner.lock().pipelines.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn device_records(&self) -> Vec<DeviceRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    pub fn add_subscriber(&self, callback: DeviceCallback) -> SubscriberId {
        let id = self.subscribers.push(callback);
        debug!(
            service_type = %self.service_type,
            subscriber = id.0,
            "Subscriber added"
        );
        id
    }

    /// Subscribes to the provider and starts the pump and fan-out tasks.
    ///
    /// On a provider error the session is marked faulted and goes straight
    /// to [`SessionState::Terminated`].
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        {
            let mut inner = self.inner.lock();
            if inner.phase != SessionState::Created {
                debug!(service_type = %self.service_type, state = ?inner.phase, "Session already started");
                return Ok(());
            }
            inner.phase = SessionState::Subscribing;
        }

        let op = self.allocate_op();
        let id = match self.provider.browse(
            self.service_type.as_str(),
            &self.config.domain,
            self.sink(op),
        ) {
            Ok(id) => id,
            Err(e) => {
                error!(service_type = %self.service_type, error = %e, "Failed to start browse");
                let mut inner = self.inner.lock();
                inner.faulted = true;
                inner.phase = SessionState::Terminated;
                return Err(DiscoveryError::provider(
                    "browse",
                    self.service_type.as_str(),
                    e,
                ));
            }
        };
        let handle = ProviderHandle::new(id, self.provider.clone());

        {
            let mut inner = self.inner.lock();
            inner.browse_op = Some(op);
            inner.browse = Some(handle);
            inner.phase = SessionState::Running;
            self.running.store(true, Ordering::SeqCst);
        }

        let (fanout, dispatcher) = Fanout::spawn(
            self.service_type.as_str(),
            self.subscribers.clone(),
            self.running.clone(),
            self.config.fanout_queue_capacity,
            self.config.fanout_grace(),
        );
        *self.dispatcher.lock() = Some(dispatcher);

        let pump = tokio::spawn(self.clone().pump(self.events_rx.clone(), fanout));
        *self.pump.lock() = Some(pump);

        info!(
            service_type = %self.service_type,
            handle = %id,
            "Browse session started"
        );
        Ok(())
    }

    /// Stops the session and waits until its tasks have exited.
    ///
    /// Every provider handle is released exactly once; device records and
    /// subscribers are dropped last.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let released = {
            let mut inner = self.inner.lock();
            self.running.store(false, Ordering::SeqCst);
            if inner.phase == SessionState::Terminated {
                return;
            }
            inner.phase = SessionState::Stopping;

            let mut handles = inner.pipelines.drain();
            handles.extend(inner.browse.take());
            inner.browse_op = None;
            handles
        };
        let released_count = released.len();
        drop(released);

        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!(service_type = %self.service_type, error = %e, "Session pump ended abnormally");
            }
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                warn!(service_type = %self.service_type, error = %e, "Fan-out dispatcher ended abnormally");
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.phase = SessionState::Terminated;
            inner.records.clear();
        }
        self.subscribers.clear();

        info!(
            service_type = %self.service_type,
            released = released_count,
            "Browse session stopped"
        );
    }

    /// Asks the pump to exit without waiting for it.
    pub fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn pump(self: Arc<Self>, events: flume::Receiver<ProviderEvent>, fanout: Fanout) {
        let poll_interval = self.config.poll_interval();
        let polled = self.provider.dispatch_mode() == DispatchMode::Poll;
        debug!(service_type = %self.service_type, polled, "Session pump started");

        while self.running.load(Ordering::SeqCst) {
            if polled {
                let handles = self.live_handles();
                if !handles.is_empty() {
                    self.provider.process_ready(&handles);
                }
            }

            let event = match tokio::time::timeout(poll_interval, events.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) => break,
                Err(_) => continue,
            };

            for payload in self.handle_event(event) {
                fanout.publish(payload).await;
            }
        }

        fanout.close();
        debug!(service_type = %self.service_type, "Session pump stopped");
    }

    fn allocate_op(&self) -> OpId {
        OpId(self.next_op.fetch_add(1, Ordering::Relaxed))
    }

    fn sink(&self, op: OpId) -> EventSink {
        EventSink::new(op, self.events_tx.clone())
    }

    fn live_handles(&self) -> Vec<HandleId> {
        let inner = self.inner.lock();
        let mut handles = inner.pipelines.handle_ids();
        handles.extend(inner.browse.as_ref().map(ProviderHandle::id));
        handles
    }

    /// Applies one completion and returns the payloads to fan out.
    fn handle_event(&self, event: ProviderEvent) -> Vec<String> {
        let ProviderEvent { op, completion } = event;

        let owner = {
            let inner = self.inner.lock();
            if inner.phase != SessionState::Running {
                trace!(service_type = %self.service_type, %op, "Ignoring completion outside running state");
                return Vec::new();
            }
            if inner.browse_op == Some(op) {
                None
            } else {
                Some(inner.pipelines.owner_of(op))
            }
        };

        match owner {
            None => self.on_browse_event(completion),
            Some(OpOwner::Active { key, stage }) => self.on_pipeline_event(op, &key, stage, completion),
            Some(OpOwner::Retired) => {
                trace!(service_type = %self.service_type, %op, "Final callback for cancelled pipeline");
                self.inner.lock().pipelines.settle(op);
                Vec::new()
            }
            Some(OpOwner::Stale) => {
                match completion {
                    Completion::Cancelled => {
                        trace!(service_type = %self.service_type, %op, "Cancellation for finished operation");
                    }
                    _ => {
                        debug!(service_type = %self.service_type, %op, "Discarding stale completion");
                    }
                }
                Vec::new()
            }
        }
    }

    fn on_browse_event(&self, completion: Completion) -> Vec<String> {
        match completion {
            Completion::Browse {
                action: BrowseAction::Add,
                name,
                domain,
                ..
            } => {
                self.on_instance_added(&name, &domain);
                Vec::new()
            }
            Completion::Browse {
                action: BrowseAction::Remove,
                name,
                ..
            } => self.on_instance_removed(&name),
            Completion::Failed { code } => {
                self.on_browse_failed(code);
                Vec::new()
            }
            Completion::Cancelled => {
                debug!(service_type = %self.service_type, "Browse cancelled by provider");
                Vec::new()
            }
            other => {
                warn!(service_type = %self.service_type, completion = ?other, "Unexpected completion on browse");
                Vec::new()
            }
        }
    }

    fn on_browse_failed(&self, code: ErrorCode) {
        error!(service_type = %self.service_type, %code, "Browse failed");
        let mut inner = self.inner.lock();
        inner.faulted = true;
        self.running.store(false, Ordering::SeqCst);
    }

    fn on_instance_added(&self, name: &str, domain: &str) {
        let key = instance_key(name);
        let domain = if domain.is_empty() {
            self.config.domain.as_str()
        } else {
            domain
        };
        let op = self.allocate_op();

        let superseded = {
            let mut inner = self.inner.lock();
            if inner.phase != SessionState::Running {
                return;
            }
            let pipeline = ResolvePipeline::new(&key, name, domain, Action::Add, op);
            inner
                .pipelines
                .supersede(pipeline, self.provider.delivers_after_release())
        };
        if let Some(handle) = superseded {
            debug!(instance = %key, handle = %handle.id(), "Superseding in-flight resolve");
            drop(handle);
        }

        debug!(service_type = %self.service_type, instance = %key, %op, "Instance added, resolving");

        match self
            .provider
            .resolve(name, self.service_type.as_str(), domain, self.sink(op))
        {
            Ok(id) => self.attach(&key, op, id),
            Err(e) => {
                warn!(instance = %key, error = %e, "Failed to start resolve");
                let handle = self.inner.lock().pipelines.abort(&key, op);
                drop(handle);
            }
        }
    }

    fn on_instance_removed(&self, name: &str) -> Vec<String> {
        let key = instance_key(name);
        let emit = self.config.removal_policy == RemovalPolicy::Emit;

        let (released, payload) = {
            let mut inner = self.inner.lock();
            if inner.phase != SessionState::Running {
                return Vec::new();
            }
            let released = inner
                .pipelines
                .cancel(&key, self.provider.delivers_after_release());

            let mut payload = None;
            if let Some(record) = inner.records.values_mut().find(|r| r.instance_key == key) {
                record.set_action(Action::Remove);
                if emit && record.ip.is_some() {
                    payload = Some(record.to_json());
                }
            }
            (released, payload)
        };

        debug!(
            service_type = %self.service_type,
            instance = %key,
            cancelled_resolve = released.is_some(),
            "Instance removed"
        );
        drop(released);

        payload.into_iter().collect()
    }

    fn on_pipeline_event(
        &self,
        op: OpId,
        key: &str,
        stage: Stage,
        completion: Completion,
    ) -> Vec<String> {
        match (stage, completion) {
            (
                Stage::Resolving,
                Completion::Resolved {
                    full_name,
                    host,
                    port,
                    txt,
                },
            ) => {
                self.on_resolved(op, &full_name, &host, port, &txt);
                Vec::new()
            }
            (Stage::LookingUpAddress, Completion::Address { host, ip, ttl }) => {
                self.on_address(op, &host, ip, ttl).into_iter().collect()
            }
            (stage, Completion::Failed { code }) => {
                warn!(instance = %key, ?stage, %code, "Resolve pipeline failed");
                self.finish_pipeline(op);
                Vec::new()
            }
            (stage, Completion::Cancelled) => {
                debug!(instance = %key, ?stage, "Resolve pipeline cancelled by provider");
                self.finish_pipeline(op);
                Vec::new()
            }
            (stage, other) => {
                debug!(instance = %key, ?stage, completion = ?other, "Ignoring completion for stage");
                Vec::new()
            }
        }
    }

    fn on_resolved(&self, op: OpId, full_name: &str, host: &str, port: u16, txt: &[u8]) {
        let txt = TxtRecord::decode(txt);
        let name = display_name(full_name, &self.service_type);
        let next_op = self.allocate_op();

        let (key, released) = {
            let mut inner = self.inner.lock();
            if inner.phase != SessionState::Running {
                return;
            }
            let Some((key, released)) = inner.pipelines.advance(op, full_name, next_op) else {
                return;
            };
            let action = inner
                .pipelines
                .get(&key)
                .map(ResolvePipeline::action)
                .unwrap_or_default();

            let record = DeviceRecord::resolved(
                full_name,
                key.as_str(),
                name,
                self.service_type.clone(),
                host,
                port,
                txt,
                action,
            );
            inner.records.insert(full_name.to_string(), record);
            (key, released)
        };
        drop(released);

        debug!(
            instance = %key,
            host = %host,
            port,
            "Instance resolved, looking up address"
        );

        match self
            .provider
            .lookup_address(host, self.config.address_family, self.sink(next_op))
        {
            Ok(id) => self.attach(&key, next_op, id),
            Err(e) => {
                warn!(instance = %key, host = %host, error = %e, "Failed to start address lookup");
                let handle = self.inner.lock().pipelines.abort(&key, next_op);
                drop(handle);
            }
        }
    }

    fn on_address(&self, op: OpId, host: &str, ip: IpAddr, ttl: u32) -> Option<String> {
        if !self.config.address_family.accepts(&ip) {
            trace!(host = %host, %ip, "Skipping address of another family");
            return None;
        }

        let (released, payload) = {
            let mut inner = self.inner.lock();
            if inner.phase != SessionState::Running {
                return None;
            }
            let (pipeline, released) = inner.pipelines.complete(op)?;

            let payload = match pipeline
                .full_name()
                .and_then(|full_name| inner.records.get_mut(full_name))
            {
                Some(record) => {
                    record.set_address(ip);
                    record.set_action(pipeline.action());
                    Some(record.to_json())
                }
                None => {
                    warn!(instance = %pipeline.instance_key(), "Resolved record missing for address");
                    None
                }
            };
            (released, payload)
        };
        drop(released);

        debug!(host = %host, %ip, ttl, "Address resolved");
        payload
    }

    fn finish_pipeline(&self, op: OpId) {
        let finished = self.inner.lock().pipelines.complete(op);
        drop(finished);
    }

    /// Takes the provider handle returned for `op`, or releases it when the
    /// pipeline moved on while the provider call was running.
    fn attach(&self, key: &str, op: OpId, id: HandleId) {
        let handle = ProviderHandle::new(id, self.provider.clone());
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.phase != SessionState::Running {
                Some(handle)
            } else {
                inner.pipelines.attach(key, op, handle)
            }
        };
        if let Some(handle) = rejected {
            debug!(instance = %key, handle = %handle.id(), "Operation outlived its pipeline");
            drop(handle);
        }
    }
}

impl Drop for BrowseSession {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!(service_type = %self.service_type, "Browse session dropped while running");
        }
    }
}
