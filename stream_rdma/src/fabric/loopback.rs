/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! In-process fabric provider.
//!
//! Every endpoint opened on one [`LoopbackFabric`] shares a network: posted
//! reads and writes are validated against the target's registrations and
//! executed with plain memory copies. Completions land on the initiator's
//! queue, and writes carrying immediate data additionally raise a
//! [`CqEvent::RemoteData`] on the target's queue.
//!
//! With manual progress enabled, posted operations are queued until
//! [`LoopbackFabric::progress_one`] or [`LoopbackFabric::progress_all`] runs
//! them, which lets callers choose the order in which pushes and consumer
//! requests meet.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use crate::RdmaOpType;
use crate::fabric::AccessFlags;
use crate::fabric::CqEvent;
use crate::fabric::FabricAddr;
use crate::fabric::FabricEndpoint;
use crate::fabric::FabricError;
use crate::fabric::FabricProvider;
use crate::fabric::ProviderInfo;
use crate::fabric::RmaOp;
use crate::utils::copy_memory;
use crate::utils::lock;

const FIRST_KEY: u64 = 0x100;

/// A write as it was posted, recorded for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedWrite {
    pub initiator: u64,
    pub target: u64,
    pub remote_addr: u64,
    pub len: usize,
    pub imm: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct PendingOp {
    op_type: RdmaOpType,
    initiator: u64,
    target: u64,
    op: RmaOp,
    imm: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    addr: usize,
    len: usize,
    access: AccessFlags,
}

#[derive(Debug, Default)]
struct CompletionQueue {
    events: VecDeque<CqEvent>,
    closed: bool,
}

#[derive(Debug)]
struct EndpointInner {
    id: u64,
    local_mr_required: bool,
    av_size: usize,
    regions: Mutex<HashMap<u64, Region>>,
    av: Mutex<Vec<u64>>,
    cq: Mutex<CompletionQueue>,
    cq_ready: Condvar,
    closed: AtomicBool,
}

impl EndpointInner {
    fn push_event(&self, event: CqEvent) {
        let mut cq = lock(&self.cq);
        if cq.closed {
            tracing::debug!("endpoint {} dropping {event:?} after close", self.id);
            return;
        }
        cq.events.push_back(event);
        self.cq_ready.notify_all();
    }

    fn check(&self, key: u64, addr: u64, len: usize, access: AccessFlags) -> Result<(), FabricError> {
        let regions = lock(&self.regions);
        let region = regions.get(&key).ok_or(FabricError::InvalidKey(key))?;
        if !region.access.contains(access) {
            return Err(FabricError::AccessDenied {
                key,
                requested: access,
            });
        }
        let start = region.addr as u64;
        let end = start + region.len as u64;
        let in_bounds = addr >= start && addr.checked_add(len as u64).is_some_and(|e| e <= end);
        if !in_bounds {
            return Err(FabricError::OutOfBounds { key, addr, len });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashMap<u64, Arc<EndpointInner>>,
    next_endpoint: u64,
    next_key: u64,
    manual_progress: bool,
    pending: VecDeque<PendingOp>,
    inject_again: usize,
    inject_close_busy: usize,
    posted_writes: Vec<PostedWrite>,
}

#[derive(Debug)]
struct Network {
    infos: Vec<ProviderInfo>,
    state: Mutex<NetworkState>,
}

impl Network {
    fn execute(&self, pending: PendingOp) {
        let (initiator, target) = {
            let state = lock(&self.state);
            (
                state.endpoints.get(&pending.initiator).cloned(),
                state.endpoints.get(&pending.target).cloned(),
            )
        };
        let Some(initiator) = initiator else {
            tracing::debug!("dropping operation from closed endpoint {}", pending.initiator);
            return;
        };
        let context = pending.op.context;
        let result = target
            .ok_or(FabricError::UnknownAddress(pending.op.peer))
            .and_then(|target| Self::transfer(&initiator, &target, &pending).map(|()| target));
        match result {
            Ok(target) => {
                initiator.push_event(CqEvent::Completed {
                    context,
                    len: pending.op.len,
                });
                if let Some(data) = pending.imm {
                    target.push_event(CqEvent::RemoteData {
                        data,
                        len: pending.op.len,
                    });
                }
            }
            Err(err) => {
                tracing::debug!("loopback operation {context} failed: {err}");
                initiator.push_event(CqEvent::Failed {
                    context,
                    error: err.to_string(),
                });
            }
        }
    }

    fn transfer(
        initiator: &EndpointInner,
        target: &EndpointInner,
        pending: &PendingOp,
    ) -> Result<(), FabricError> {
        let op = &pending.op;
        let (local_access, remote_access) = match pending.op_type {
            RdmaOpType::ReadIntoLocal => (AccessFlags::READ, AccessFlags::REMOTE_READ),
            RdmaOpType::WriteFromLocal => (AccessFlags::WRITE, AccessFlags::REMOTE_WRITE),
        };
        if initiator.local_mr_required {
            let key = op.local_key.ok_or(FabricError::InvalidKey(0))?;
            initiator.check(key, op.local_addr as u64, op.len, local_access)?;
        }
        target.check(op.remote_key, op.remote_addr, op.len, remote_access)?;
        let (src, dst) = match pending.op_type {
            RdmaOpType::ReadIntoLocal => (op.remote_addr as usize, op.local_addr),
            RdmaOpType::WriteFromLocal => (op.local_addr, op.remote_addr as usize),
        };
        // Both ranges were validated against live registrations above.
        unsafe { copy_memory(src, dst, op.len) };
        Ok(())
    }
}

/// In-process provider whose endpoints all share one network.
#[derive(Debug, Clone)]
pub struct LoopbackFabric {
    network: Arc<Network>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    /// A fabric advertising a single verbs provider that needs local
    /// registrations.
    pub fn new() -> Self {
        Self::with_providers(vec![
            ProviderInfo::new("verbs", "lo")
                .with_src_addr(true)
                .with_local_mr(true),
        ])
    }

    pub fn with_providers(infos: Vec<ProviderInfo>) -> Self {
        Self {
            network: Arc::new(Network {
                infos,
                state: Mutex::new(NetworkState {
                    next_endpoint: 1,
                    next_key: FIRST_KEY,
                    ..Default::default()
                }),
            }),
        }
    }

    /// Queue posted operations until progressed explicitly.
    pub fn set_manual_progress(&self, manual: bool) {
        lock(&self.network.state).manual_progress = manual;
    }

    /// Executes the oldest queued operation. Returns false when none is queued.
    pub fn progress_one(&self) -> bool {
        let next = lock(&self.network.state).pending.pop_front();
        match next {
            Some(pending) => {
                self.network.execute(pending);
                true
            }
            None => false,
        }
    }

    /// Executes every queued operation and returns how many ran.
    pub fn progress_all(&self) -> usize {
        let mut count = 0;
        while self.progress_one() {
            count += 1;
        }
        count
    }

    pub fn pending_operations(&self) -> usize {
        lock(&self.network.state).pending.len()
    }

    /// Makes the next `count` posts answer [`FabricError::Again`].
    pub fn inject_again(&self, count: usize) {
        lock(&self.network.state).inject_again = count;
    }

    /// Makes the next `count` completion-queue closes answer [`FabricError::Busy`].
    pub fn inject_close_busy(&self, count: usize) {
        lock(&self.network.state).inject_close_busy = count;
    }

    /// Every write posted so far, in posting order.
    pub fn posted_writes(&self) -> Vec<PostedWrite> {
        lock(&self.network.state).posted_writes.clone()
    }

    pub fn clear_posted_writes(&self) {
        lock(&self.network.state).posted_writes.clear();
    }

    /// Number of endpoints still open.
    pub fn open_endpoints(&self) -> usize {
        lock(&self.network.state).endpoints.len()
    }

    /// Registrations held across every open endpoint.
    pub fn live_registrations(&self) -> usize {
        let endpoints: Vec<_> = lock(&self.network.state)
            .endpoints
            .values()
            .cloned()
            .collect();
        endpoints.iter().map(|ep| lock(&ep.regions).len()).sum()
    }
}

impl FabricProvider for LoopbackFabric {
    fn get_info(&self) -> Vec<ProviderInfo> {
        self.network.infos.clone()
    }

    fn open(
        &self,
        info: &ProviderInfo,
        av_size: usize,
    ) -> Result<Arc<dyn FabricEndpoint>, FabricError> {
        if !self.network.infos.contains(info) {
            return Err(FabricError::Provider(format!(
                "provider {} on {} is not offered by this fabric",
                info.provider_name, info.domain_name
            )));
        }
        let mut state = lock(&self.network.state);
        let id = state.next_endpoint;
        state.next_endpoint += 1;
        let inner = Arc::new(EndpointInner {
            id,
            local_mr_required: info.local_mr_required,
            av_size,
            regions: Mutex::new(HashMap::new()),
            av: Mutex::new(Vec::new()),
            cq: Mutex::new(CompletionQueue::default()),
            cq_ready: Condvar::new(),
            closed: AtomicBool::new(false),
        });
        state.endpoints.insert(id, inner.clone());
        tracing::debug!("opened loopback endpoint {id} on {}", info.domain_name);
        Ok(Arc::new(LoopbackEndpoint {
            inner,
            network: self.network.clone(),
        }))
    }
}

/// Endpoint handed out by [`LoopbackFabric`].
#[derive(Debug)]
pub struct LoopbackEndpoint {
    inner: Arc<EndpointInner>,
    network: Arc<Network>,
}

impl LoopbackEndpoint {
    fn ensure_open(&self) -> Result<(), FabricError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(FabricError::Closed);
        }
        Ok(())
    }

    fn post(&self, op_type: RdmaOpType, op: RmaOp, imm: Option<u32>) -> Result<(), FabricError> {
        self.ensure_open()?;
        let target = *lock(&self.inner.av)
            .get(op.peer as usize)
            .ok_or(FabricError::UnknownAddress(op.peer))?;
        let pending = PendingOp {
            op_type,
            initiator: self.inner.id,
            target,
            op,
            imm,
        };
        let mut state = lock(&self.network.state);
        if state.inject_again > 0 {
            state.inject_again -= 1;
            return Err(FabricError::Again);
        }
        if op_type == RdmaOpType::WriteFromLocal {
            state.posted_writes.push(PostedWrite {
                initiator: self.inner.id,
                target,
                remote_addr: op.remote_addr,
                len: op.len,
                imm,
            });
        }
        if state.manual_progress {
            state.pending.push_back(pending);
            return Ok(());
        }
        drop(state);
        self.network.execute(pending);
        Ok(())
    }
}

impl FabricEndpoint for LoopbackEndpoint {
    fn address(&self) -> Vec<u8> {
        self.inner.id.to_le_bytes().to_vec()
    }

    fn insert_address(&self, address: &[u8]) -> Result<FabricAddr, FabricError> {
        self.ensure_open()?;
        let id = u64::from_le_bytes(address.try_into().map_err(|_| FabricError::BadAddress)?);
        let mut av = lock(&self.inner.av);
        if av.len() >= self.inner.av_size {
            return Err(FabricError::Provider(format!(
                "address vector full at {} entries",
                self.inner.av_size
            )));
        }
        av.push(id);
        Ok((av.len() - 1) as FabricAddr)
    }

    fn register(&self, addr: usize, len: usize, access: AccessFlags) -> Result<u64, FabricError> {
        self.ensure_open()?;
        let key = {
            let mut state = lock(&self.network.state);
            let key = state.next_key;
            state.next_key += 1;
            key
        };
        lock(&self.inner.regions).insert(key, Region { addr, len, access });
        Ok(key)
    }

    fn deregister(&self, key: u64) -> Result<(), FabricError> {
        lock(&self.inner.regions)
            .remove(&key)
            .map(|_| ())
            .ok_or(FabricError::InvalidKey(key))
    }

    fn post_read(&self, op: RmaOp) -> Result<(), FabricError> {
        self.post(RdmaOpType::ReadIntoLocal, op, None)
    }

    fn post_write(&self, op: RmaOp, imm: Option<u32>) -> Result<(), FabricError> {
        self.post(RdmaOpType::WriteFromLocal, op, imm)
    }

    fn read_completion(&self, timeout: Duration) -> Result<Option<CqEvent>, FabricError> {
        let deadline = Instant::now() + timeout;
        let mut cq = lock(&self.inner.cq);
        loop {
            if cq.closed {
                return Err(FabricError::Closed);
            }
            if let Some(event) = cq.events.pop_front() {
                return Ok(Some(event));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            cq = match self.inner.cq_ready.wait_timeout(cq, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn close_completion_queue(&self) -> Result<(), FabricError> {
        {
            let mut state = lock(&self.network.state);
            if state.inject_close_busy > 0 {
                state.inject_close_busy -= 1;
                return Err(FabricError::Busy);
            }
        }
        lock(&self.inner.cq).closed = true;
        self.inner.cq_ready.notify_all();
        Ok(())
    }

    fn close(&self) -> Result<(), FabricError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(FabricError::Closed);
        }
        lock(&self.network.state).endpoints.remove(&self.inner.id);
        lock(&self.inner.regions).clear();
        lock(&self.inner.cq).closed = true;
        self.inner.cq_ready.notify_all();
        tracing::debug!("closed loopback endpoint {}", self.inner.id);
        Ok(())
    }
}
