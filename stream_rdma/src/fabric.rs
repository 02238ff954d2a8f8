/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fabric provider abstraction.
//!
//! A [`FabricProvider`] enumerates candidate providers and opens an
//! endpoint bundle (domain, endpoint, completion queue, address vector) on
//! the chosen one. [`session::FabricSession`] wraps that bundle for the
//! streams; [`loopback::LoopbackFabric`] is the in-process provider used
//! when no NIC is present and in tests.

pub mod loopback;
pub mod session;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::config::DataPlaneParams;

/// Priority reported when no provider can be used.
pub const PRIORITY_UNAVAILABLE: i32 = -1;
/// Priority reported when a qualifying provider exists.
pub const PRIORITY_AVAILABLE: i32 = 10;
/// Priority reported when a provider's domain matches the requested interface.
pub const PRIORITY_REQUESTED: i32 = 100;

/// Index of a peer in the endpoint's address vector.
pub type FabricAddr = u64;

/// Token attached to a posted operation and echoed by its completion.
pub type OpContext = u64;

bitflags::bitflags! {
    /// Access rights requested when registering memory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct AccessFlags: u32 {
        /// Local buffer may receive the data of a locally posted read.
        const READ = 1 << 0;
        /// Local buffer may be the source of a locally posted write.
        const WRITE = 1 << 1;
        /// Peers may read from the region.
        const REMOTE_READ = 1 << 2;
        /// Peers may write into the region.
        const REMOTE_WRITE = 1 << 3;
    }
}

/// Description of one discovered provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub provider_name: String,
    pub domain_name: String,
    /// Whether the provider reported a source address.
    pub has_src_addr: bool,
    /// Whether local buffers must be registered before use in an operation.
    pub local_mr_required: bool,
}

impl ProviderInfo {
    pub fn new(provider_name: impl Into<String>, domain_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            domain_name: domain_name.into(),
            has_src_addr: false,
            local_mr_required: false,
        }
    }

    pub fn with_src_addr(mut self, has_src_addr: bool) -> Self {
        self.has_src_addr = has_src_addr;
        self
    }

    pub fn with_local_mr(mut self, required: bool) -> Self {
        self.local_mr_required = required;
        self
    }

    /// Provider kinds taken first during selection.
    fn is_preferred(&self) -> bool {
        let name = self.provider_name.as_str();
        (name == "verbs" && self.has_src_addr) || name == "gni" || name == "psm2"
    }

    /// Provider kinds that qualify at all. Layered names such as
    /// `verbs;ofi_rxm` count.
    fn is_compatible(&self) -> bool {
        let name = self.provider_name.as_str();
        (name.contains("verbs") && self.has_src_addr)
            || name.contains("gni")
            || name.contains("psm2")
    }
}

/// Errors returned by fabric primitives.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("resource temporarily unavailable, try again")]
    Again,
    #[error("resource busy")]
    Busy,
    #[error("no memory region registered under key {0:#x}")]
    InvalidKey(u64),
    #[error("memory region {key:#x} does not permit {requested:?}")]
    AccessDenied { key: u64, requested: AccessFlags },
    #[error("range {addr:#x}+{len} lies outside memory region {key:#x}")]
    OutOfBounds { key: u64, addr: u64, len: usize },
    #[error("unknown fabric address {0}")]
    UnknownAddress(FabricAddr),
    #[error("malformed endpoint address")]
    BadAddress,
    #[error("fabric object closed")]
    Closed,
    #[error("provider error: {0}")]
    Provider(String),
}

/// One one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmaOp {
    pub local_addr: usize,
    pub len: usize,
    /// Descriptor of the local registration, when the provider needs one.
    pub local_key: Option<u64>,
    pub peer: FabricAddr,
    pub remote_addr: u64,
    pub remote_key: u64,
    pub context: OpContext,
}

/// Entry read from a completion queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqEvent {
    /// A locally posted operation finished.
    Completed { context: OpContext, len: usize },
    /// A peer wrote into local memory and attached immediate data.
    RemoteData { data: u32, len: usize },
    /// A locally posted operation failed.
    Failed { context: OpContext, error: String },
}

/// Provider discovery and endpoint creation.
pub trait FabricProvider: Send + Sync + Debug {
    /// Lists the providers available on this host.
    fn get_info(&self) -> Vec<ProviderInfo>;

    /// Opens a domain, endpoint, completion queue and address vector of
    /// `av_size` entries on `info`.
    fn open(
        &self,
        info: &ProviderInfo,
        av_size: usize,
    ) -> Result<Arc<dyn FabricEndpoint>, FabricError>;
}

/// An opened endpoint bundle.
pub trait FabricEndpoint: Send + Sync + Debug {
    /// Opaque endpoint name to hand to peers.
    fn address(&self) -> Vec<u8>;
    /// Inserts a peer name into the address vector.
    fn insert_address(&self, address: &[u8]) -> Result<FabricAddr, FabricError>;
    /// Registers `[addr, addr + len)` and returns its key.
    fn register(&self, addr: usize, len: usize, access: AccessFlags) -> Result<u64, FabricError>;
    fn deregister(&self, key: u64) -> Result<(), FabricError>;
    fn post_read(&self, op: RmaOp) -> Result<(), FabricError>;
    fn post_write(&self, op: RmaOp, imm: Option<u32>) -> Result<(), FabricError>;
    /// Blocks up to `timeout` for the next completion.
    fn read_completion(&self, timeout: Duration) -> Result<Option<CqEvent>, FabricError>;
    /// May answer [`FabricError::Busy`] while operations drain.
    fn close_completion_queue(&self) -> Result<(), FabricError>;
    fn close(&self) -> Result<(), FabricError>;
}

/// Picks the provider to open.
///
/// A provider whose domain matches `requested` wins outright. Otherwise the
/// last preferred provider is used, and when there is none the first
/// compatible one.
pub fn select_provider<'a>(
    infos: &'a [ProviderInfo],
    requested: Option<&str>,
) -> Option<&'a ProviderInfo> {
    let mut chosen: Option<&ProviderInfo> = None;
    for info in infos {
        if requested.is_some_and(|ifname| ifname == info.domain_name) {
            return Some(info);
        }
        if info.is_preferred() {
            chosen = Some(info);
        } else if chosen.is_none() && info.is_compatible() {
            chosen = Some(info);
        }
    }
    chosen
}

/// Reports how strongly the RDMA plane should be chosen on this host.
pub fn get_priority(provider: &dyn FabricProvider, params: &DataPlaneParams) -> i32 {
    let infos = provider.get_info();
    if infos.is_empty() {
        tracing::debug!("no fabric providers discovered");
        return PRIORITY_UNAVAILABLE;
    }
    let requested = params.requested_interface();
    let mut priority = PRIORITY_UNAVAILABLE;
    for info in &infos {
        if requested.as_deref() == Some(info.domain_name.as_str()) {
            tracing::debug!(
                "found the requested interface {}, provider {}",
                info.domain_name,
                info.provider_name
            );
            return PRIORITY_REQUESTED;
        }
        if info.is_compatible() {
            tracing::debug!(
                "interface {} with provider {} should work",
                info.domain_name,
                info.provider_name
            );
            priority = PRIORITY_AVAILABLE;
        }
    }
    if priority == PRIORITY_UNAVAILABLE {
        tracing::debug!("no RDMA-compatible fabric found");
    }
    priority
}
