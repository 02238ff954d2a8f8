/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! One opened fabric per stream.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::DataPlaneParams;
use crate::config::RetryPolicy;
use crate::error::DataPlaneError;
use crate::error::Result;
use crate::fabric::AccessFlags;
use crate::fabric::CqEvent;
use crate::fabric::FabricAddr;
use crate::fabric::FabricEndpoint;
use crate::fabric::FabricError;
use crate::fabric::FabricProvider;
use crate::fabric::ProviderInfo;
use crate::fabric::RmaOp;
use crate::fabric::select_provider;
use crate::registry::MemoryRegion;
use crate::registry::MemoryRegionRegistry;
use crate::utils::lock;

/// The endpoint bundle a reader or writer stream works through.
#[derive(Debug)]
pub struct FabricSession {
    info: ProviderInfo,
    endpoint: Arc<dyn FabricEndpoint>,
    registry: MemoryRegionRegistry,
    retry: RetryPolicy,
    poll_interval: Duration,
    // Guards open/close transitions.
    open: Mutex<bool>,
}

impl FabricSession {
    /// Selects a provider and opens its endpoint bundle.
    pub fn open(provider: &dyn FabricProvider, params: &DataPlaneParams) -> Result<Self> {
        let infos = provider.get_info();
        if infos.is_empty() {
            return Err(DataPlaneError::FabricUnavailable(
                "no fabric providers discovered".into(),
            ));
        }
        let requested = params.requested_interface();
        let info = select_provider(&infos, requested.as_deref())
            .ok_or_else(|| {
                DataPlaneError::FabricUnavailable(
                    "no provider matched verbs, gni or psm2".into(),
                )
            })?
            .clone();
        tracing::info!(
            "opening fabric provider {} on domain {}",
            info.provider_name,
            info.domain_name
        );
        let endpoint = provider.open(&info, params.av_size).map_err(|err| {
            DataPlaneError::FabricUnavailable(format!(
                "failed to open {} on {}: {err}",
                info.provider_name, info.domain_name
            ))
        })?;
        Ok(Self {
            info,
            registry: MemoryRegionRegistry::new(endpoint.clone()),
            endpoint,
            retry: params.retry.clone(),
            poll_interval: params.cq_poll_interval,
            open: Mutex::new(true),
        })
    }

    pub fn info(&self) -> &ProviderInfo {
        &self.info
    }

    pub fn local_mr_required(&self) -> bool {
        self.info.local_mr_required
    }

    pub fn address(&self) -> Vec<u8> {
        self.endpoint.address()
    }

    pub fn insert_address(&self, address: &[u8]) -> Result<FabricAddr> {
        Ok(self.endpoint.insert_address(address)?)
    }

    pub fn register(&self, addr: usize, len: usize, access: AccessFlags) -> Result<MemoryRegion> {
        self.ensure_open()?;
        Ok(self.registry.register(addr, len, access)?)
    }

    /// Registers a local operation buffer when the provider requires it.
    pub fn register_local(
        &self,
        addr: usize,
        len: usize,
        access: AccessFlags,
    ) -> Result<Option<MemoryRegion>> {
        if !self.local_mr_required() {
            return Ok(None);
        }
        self.register(addr, len, access).map(Some)
    }

    pub fn deregister(&self, region: MemoryRegion) -> Result<()> {
        Ok(self.registry.deregister(region)?)
    }

    pub fn live_regions(&self) -> usize {
        self.registry.live_regions()
    }

    pub fn post_read(&self, op: RmaOp) -> Result<()> {
        self.with_retry(|| self.endpoint.post_read(op))
    }

    pub fn post_write(&self, op: RmaOp, imm: Option<u32>) -> Result<()> {
        self.with_retry(|| self.endpoint.post_write(op, imm))
    }

    /// Waits up to the configured poll interval for one completion.
    pub fn read_completion(&self) -> Result<Option<CqEvent>> {
        self.ensure_open()?;
        Ok(self.endpoint.read_completion(self.poll_interval)?)
    }

    /// Takes one completion if one is already queued.
    pub fn try_read_completion(&self) -> Result<Option<CqEvent>> {
        self.ensure_open()?;
        Ok(self.endpoint.read_completion(Duration::ZERO)?)
    }

    /// Tears the bundle down: completion queue first (retrying while busy),
    /// then any leftover registrations, then the endpoint.
    pub fn close(&self) -> Result<()> {
        let mut open = lock(&self.open);
        if !*open {
            return Ok(());
        }
        loop {
            match self.endpoint.close_completion_queue() {
                Ok(()) => break,
                Err(FabricError::Busy) => {
                    tracing::debug!("completion queue busy during close, retrying");
                    std::thread::yield_now();
                }
                Err(err) => return Err(err.into()),
            }
        }
        let leaked = self.registry.deregister_all()?;
        if leaked > 0 {
            tracing::warn!("released {leaked} memory regions still registered at close");
        }
        self.endpoint.close()?;
        *open = false;
        tracing::debug!("closed fabric on {}", self.info.domain_name);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.open)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(FabricError::Closed.into())
        }
    }

    fn with_retry<F>(&self, mut post: F) -> Result<()>
    where
        F: FnMut() -> Result<(), FabricError>,
    {
        self.ensure_open()?;
        let mut attempts = 0;
        loop {
            match post() {
                Ok(()) => return Ok(()),
                Err(FabricError::Again) => {
                    attempts += 1;
                    if self.retry.exhausted(attempts) {
                        tracing::warn!("fabric still busy after {attempts} attempts");
                        return Err(DataPlaneError::TransientBusy { attempts });
                    }
                    self.retry.pause();
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}
