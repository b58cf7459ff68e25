//! Resolve pipelines: name resolve followed by address lookup, one per
//! discovered instance.
//!
//! A session owns a single [`PipelineSet`]. Pipelines are indexed both by
//! instance key (at most one live pipeline per instance) and by the [`OpId`]
//! of the provider operation they are waiting on, so a completion can be
//! routed back or recognised as stale. Provider handles are moved out of the
//! set and dropped by the caller once the session lock is released.

use crate::provider::{HandleId, OpId, ProviderHandle};
use crate::record::Action;
use std::collections::HashMap;
use tracing::trace;

/// Where a pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Waiting for host, port and TXT data
    Resolving,
    /// Waiting for an address of the resolved host
    LookingUpAddress,
}

/// State of one instance being resolved.
#[derive(Debug)]
pub struct ResolvePipeline {
    instance_key: String,
    instance_name: String,
    domain: String,
    action: Action,
    stage: Stage,
    op: OpId,
    full_name: Option<String>,
    handle: Option<ProviderHandle>,
    /// Provider completions still expected for this pipeline
    outstanding: u32,
}

impl ResolvePipeline {
    /// A pipeline about to start name resolution under `op`.
    pub fn new(
        instance_key: impl Into<String>,
        instance_name: impl Into<String>,
        domain: impl Into<String>,
        action: Action,
        op: OpId,
    ) -> Self {
        Self {
            instance_key: instance_key.into(),
            instance_name: instance_name.into(),
            domain: domain.into(),
            action,
            stage: Stage::Resolving,
            op,
            full_name: None,
            handle: None,
            outstanding: 1,
        }
    }

    pub fn instance_key(&self) -> &str {
        &self.instance_key
    }

    /// Instance label as the provider reported it (still escaped)
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn op(&self) -> OpId {
        self.op
    }

    pub fn full_name(&self) -> Option<&str> {
        self.full_name.as_deref()
    }

    pub fn handle_id(&self) -> Option<HandleId> {
        self.handle.as_ref().map(ProviderHandle::id)
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    /// Name resolution finished: hands back the resolve handle and waits on
    /// `next_op` for the address.
    fn advance(&mut self, full_name: String, next_op: OpId) -> Option<ProviderHandle> {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.full_name = Some(full_name);
        self.stage = Stage::LookingUpAddress;
        self.op = next_op;
        self.outstanding += 1;
        self.handle.take()
    }

    /// Terminal completion for the current op.
    fn finish(mut self) -> Option<ProviderHandle> {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.handle.take()
    }
}

/// How a completion's op relates to the pipelines of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOwner {
    /// A live pipeline is waiting on this op
    Active { key: String, stage: Stage },
    /// A cancelled pipeline kept until its final callback
    Retired,
    /// Nobody is waiting on this op
    Stale,
}

/// Arena of the resolve pipelines of one session.
#[derive(Debug, Default)]
pub struct PipelineSet {
    active: HashMap<String, ResolvePipeline>,
    by_op: HashMap<OpId, String>,
    retired: HashMap<OpId, ResolvePipeline>,
}

impl PipelineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live pipelines.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Cancelled pipelines still waiting for a final provider callback.
    pub fn retired_len(&self) -> usize {
        self.retired.len()
    }

    pub fn get(&self, key: &str) -> Option<&ResolvePipeline> {
        self.active.get(key)
    }

    pub fn owner_of(&self, op: OpId) -> OpOwner {
        if let Some(key) = self.by_op.get(&op) {
            if let Some(pipeline) = self.active.get(key) {
                return OpOwner::Active {
                    key: key.clone(),
                    stage: pipeline.stage,
                };
            }
        }
        if self.retired.contains_key(&op) {
            OpOwner::Retired
        } else {
            OpOwner::Stale
        }
    }

    /// Installs `pipeline`, cancelling any live pipeline for the same
    /// instance first. Returns the superseded pipeline's handle.
    pub fn supersede(
        &mut self,
        pipeline: ResolvePipeline,
        defer_destroy: bool,
    ) -> Option<ProviderHandle> {
        let released = self.cancel(&pipeline.instance_key, defer_destroy);
        self.by_op
            .insert(pipeline.op, pipeline.instance_key.clone());
        self.active.insert(pipeline.instance_key.clone(), pipeline);
        released
    }

    /// Removes the live pipeline for `key` and returns its handle.
    ///
    /// With `defer_destroy`, a pipeline that may still get a callback for the
    /// released handle is parked until that callback arrives.
    pub fn cancel(&mut self, key: &str, defer_destroy: bool) -> Option<ProviderHandle> {
        let mut pipeline = self.active.remove(key)?;
        self.by_op.remove(&pipeline.op);
        let handle = pipeline.handle.take();

        if defer_destroy && handle.is_some() && pipeline.outstanding > 0 {
            trace!(instance = %key, op = %pipeline.op, "Deferring pipeline destruction");
            self.retired.insert(pipeline.op, pipeline);
        }
        handle
    }

    /// Stores the handle of the op `op` started for `key`.
    ///
    /// Hands the handle back when the pipeline was cancelled or superseded
    /// while the provider call was in progress; the caller must drop it.
    pub fn attach(&mut self, key: &str, op: OpId, handle: ProviderHandle) -> Option<ProviderHandle> {
        match self.active.get_mut(key) {
            Some(pipeline) if pipeline.op == op && pipeline.handle.is_none() => {
                pipeline.handle = Some(handle);
                None
            }
            _ => Some(handle),
        }
    }

    /// Moves the pipeline waiting on `op` to the address stage under
    /// `next_op`. Returns the instance key and the resolve handle.
    pub fn advance(
        &mut self,
        op: OpId,
        full_name: impl Into<String>,
        next_op: OpId,
    ) -> Option<(String, Option<ProviderHandle>)> {
        let key = self.by_op.remove(&op)?;
        let pipeline = self.active.get_mut(&key)?;
        let handle = pipeline.advance(full_name.into(), next_op);
        self.by_op.insert(next_op, key.clone());
        Some((key, handle))
    }

    /// Ends the pipeline waiting on `op`, returning it with its handle
    /// already taken out.
    pub fn complete(&mut self, op: OpId) -> Option<(ResolvePipeline, Option<ProviderHandle>)> {
        let key = self.by_op.remove(&op)?;
        let mut pipeline = self.active.remove(&key)?;
        let handle = pipeline.handle.take();
        pipeline.outstanding = pipeline.outstanding.saturating_sub(1);
        Some((pipeline, handle))
    }

    /// Ends the pipeline waiting on `op` because its start call failed.
    pub fn abort(&mut self, key: &str, op: OpId) -> Option<ProviderHandle> {
        match self.active.get(key) {
            Some(pipeline) if pipeline.op == op => {
                self.by_op.remove(&op);
                self.active.remove(key).and_then(ResolvePipeline::finish)
            }
            _ => None,
        }
    }

    /// Final callback of a retired pipeline arrived; destroys it.
    pub fn settle(&mut self, op: OpId) -> bool {
        match self.retired.get_mut(&op) {
            Some(pipeline) => {
                pipeline.outstanding = pipeline.outstanding.saturating_sub(1);
                if pipeline.outstanding == 0 {
                    self.retired.remove(&op);
                }
                true
            }
            None => false,
        }
    }

    /// Handle ids of every live pipeline.
    pub fn handle_ids(&self) -> Vec<HandleId> {
        self.active
            .values()
            .filter_map(ResolvePipeline::handle_id)
            .collect()
    }

    /// Empties the set, returning every live handle for release.
    pub fn drain(&mut self) -> Vec<ProviderHandle> {
        self.by_op.clear();
        self.retired.clear();
        self.active
            .drain()
            .filter_map(|(_, pipeline)| pipeline.finish())
            .collect()
    }
}
