/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Memory region bookkeeping.
//!
//! - `BufferHandle`: the (address, key) pair a peer needs to reach a region.
//! - `MemoryRegion`: one live registration, owned by whoever registered it and
//!   handed back to the registry to deregister.
//! - `MemoryRegionRegistry`: tracks live registrations per endpoint so that
//!   closing a session can release anything still outstanding.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::fabric::AccessFlags;
use crate::fabric::FabricEndpoint;
use crate::fabric::FabricError;
use crate::utils::lock;

/// Remote-accessible address of a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferHandle {
    pub block: u64,
    pub key: u64,
}

impl BufferHandle {
    pub fn new(block: u64, key: u64) -> Self {
        Self { block, key }
    }

    /// Handle to the byte `by` bytes past the start of this one.
    pub fn offset(&self, by: u64) -> Self {
        Self {
            block: self.block + by,
            key: self.key,
        }
    }
}

/// A live registration.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    addr: usize,
    len: usize,
    key: u64,
    access: AccessFlags,
}

impl MemoryRegion {
    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn access(&self) -> AccessFlags {
        self.access
    }

    /// Local descriptor passed alongside operations that use this region.
    pub fn desc(&self) -> Option<u64> {
        Some(self.key)
    }

    pub fn handle(&self) -> BufferHandle {
        BufferHandle::new(self.addr as u64, self.key)
    }
}

/// Registers and deregisters memory on one endpoint.
#[derive(Debug)]
pub struct MemoryRegionRegistry {
    endpoint: Arc<dyn FabricEndpoint>,
    // key -> (addr, len)
    live: Mutex<HashMap<u64, (usize, usize)>>,
}

impl MemoryRegionRegistry {
    pub fn new(endpoint: Arc<dyn FabricEndpoint>) -> Self {
        Self {
            endpoint,
            live: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        addr: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<MemoryRegion, FabricError> {
        let key = self.endpoint.register(addr, len, access)?;
        lock(&self.live).insert(key, (addr, len));
        tracing::debug!("registered {addr:#x}+{len} as key {key:#x} ({access:?})");
        Ok(MemoryRegion {
            addr,
            len,
            key,
            access,
        })
    }

    pub fn deregister(&self, region: MemoryRegion) -> Result<(), FabricError> {
        if lock(&self.live).remove(&region.key).is_none() {
            // Already released by deregister_all during close.
            tracing::debug!("key {:#x} was already deregistered", region.key);
            return Ok(());
        }
        self.endpoint.deregister(region.key)
    }

    pub fn live_regions(&self) -> usize {
        lock(&self.live).len()
    }

    /// Deregisters everything still live and returns how many were released.
    pub fn deregister_all(&self) -> Result<usize, FabricError> {
        let keys: Vec<u64> = lock(&self.live).drain().map(|(key, _)| key).collect();
        for key in &keys {
            tracing::warn!("deregistering leaked memory region {key:#x}");
            self.endpoint.deregister(*key)?;
        }
        Ok(keys.len())
    }
}
