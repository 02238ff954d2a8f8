/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Pull path: one-sided reads issued by the reader and the handles callers
//! wait on.

use std::sync::Arc;
use std::sync::Mutex;

use slab::Slab;

use crate::LocalMemory;
use crate::error::Failure;
use crate::error::Result;
use crate::fabric::OpContext;
use crate::push::PreloadTicket;
use crate::reader::ReaderShared;
use crate::registry::MemoryRegion;
use crate::utils::lock;

#[derive(Debug)]
struct OpStatus {
    pending: i32,
    failure: Option<Failure>,
    local_region: Option<MemoryRegion>,
}

/// A posted operation awaiting its completion.
#[derive(Debug)]
pub(crate) struct RemoteOp {
    pub rank: usize,
    pub length: usize,
    // Local buffer the fabric reads from or writes into, held until the op
    // is dropped.
    _local: Option<Arc<dyn LocalMemory>>,
    status: Mutex<OpStatus>,
}

impl RemoteOp {
    pub fn new(
        rank: usize,
        length: usize,
        local: Option<Arc<dyn LocalMemory>>,
        local_region: Option<MemoryRegion>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rank,
            length,
            _local: local,
            status: Mutex::new(OpStatus {
                pending: 1,
                failure: None,
                local_region,
            }),
        })
    }

    /// Records one completion. Returns the local registration once the op is
    /// finished so the caller can release it.
    pub fn complete(&self) -> Option<MemoryRegion> {
        let mut status = lock(&self.status);
        status.pending -= 1;
        if status.pending <= 0 {
            status.local_region.take()
        } else {
            None
        }
    }

    /// The fabric reported the op failed, or it was never posted.
    pub fn fail(&self, failure: Failure) -> Option<MemoryRegion> {
        let mut status = lock(&self.status);
        status.pending = 0;
        status.failure.get_or_insert(failure);
        status.local_region.take()
    }

    /// Fails the op for its waiters while the fabric may still be moving
    /// data. The local registration stays until the completion arrives.
    pub fn abandon(&self, failure: Failure) {
        lock(&self.status).failure.get_or_insert(failure);
    }

    /// `None` while the op is still in flight.
    pub fn outcome(&self) -> Option<std::result::Result<(), Failure>> {
        let status = lock(&self.status);
        match &status.failure {
            Some(failure) => Some(Err(failure.clone())),
            None if status.pending <= 0 => Some(Ok(())),
            None => None,
        }
    }
}

/// Posted operations keyed by the context their completion will carry.
///
/// An op leaves the table only when its own completion is dispatched, so a
/// context is never reused while the fabric can still report it.
#[derive(Debug, Default)]
pub(crate) struct OutstandingOps {
    ops: Slab<Arc<RemoteOp>>,
}

impl OutstandingOps {
    pub fn insert(&mut self, op: Arc<RemoteOp>) -> OpContext {
        self.ops.insert(op) as OpContext
    }

    pub fn remove(&mut self, context: OpContext) -> Option<Arc<RemoteOp>> {
        self.ops.try_remove(context as usize)
    }

    /// Abandons every op targeting `rank` and returns how many there were.
    pub fn abandon_rank(&self, rank: usize, failure: &Failure) -> usize {
        let mut count = 0;
        for (_, op) in self.ops.iter().filter(|(_, op)| op.rank == rank) {
            op.abandon(failure.clone());
            count += 1;
        }
        count
    }

    pub fn abandon_all(&self, failure: &Failure) {
        for (_, op) in self.ops.iter() {
            op.abandon(failure.clone());
        }
    }

    /// Empties the table. Only safe once the fabric can no longer complete
    /// anything in it.
    pub fn drain(&mut self) -> Vec<Arc<RemoteOp>> {
        self.ops.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Pull(Arc<RemoteOp>),
    Preload(PreloadTicket),
}

/// Returned by a remote read; resolves once the bytes are in the caller's
/// buffer.
#[derive(Debug, Clone)]
pub struct CompletionHandle {
    pub(crate) reader: Arc<ReaderShared>,
    pub(crate) completion: Completion,
}

impl CompletionHandle {
    /// Blocks until the read finished, driving the reader's completion queue.
    pub fn wait(self) -> Result<()> {
        self.reader.wait(&self.completion)
    }

    /// Non-blocking check. Does not drive progress.
    pub fn is_complete(&self) -> bool {
        self.reader.outcome(&self.completion).is_some()
    }

    /// Whether the data is being delivered by the push path.
    pub fn is_preloaded(&self) -> bool {
        matches!(self.completion, Completion::Preload(_))
    }
}
