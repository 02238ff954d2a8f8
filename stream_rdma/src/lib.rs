/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! RDMA data plane for staged streaming between a writer cohort and a
//! reader cohort.
//!
//! Writers publish timesteps of registered memory. Readers either pull the
//! ranges they need with one-sided RDMA reads, or, once the read pattern has
//! been locked, receive those ranges pushed into preload buffers with RDMA
//! writes carrying immediate data.

// RDMA requires frequent unsafe code blocks
#![allow(clippy::undocumented_unsafe_blocks)]

use std::fmt::Debug;

use serde::Deserialize;
use serde::Serialize;

pub mod config;
pub mod dummy;
pub mod error;
pub mod fabric;
pub mod imm;
pub mod ledger;
pub mod plane;
pub mod pull;
pub mod push;
pub mod reader;
pub mod registry;
pub mod services;
pub mod step_log;
pub mod utils;
pub mod writer;

pub mod test_utils;

pub use config::DataPlaneParams;
pub use config::PreloadMode;
pub use config::RetryPolicy;
pub use error::DataPlaneError;
pub use error::Result;
pub use plane::DataPlane;
pub use plane::DataPlaneKind;
pub use plane::RdmaDataPlane;
pub use plane::load_data_plane;
pub use plane::select_data_plane;
pub use pull::CompletionHandle;
pub use reader::ReadRequest;
pub use reader::ReaderContactInfo;
pub use reader::ReaderStream;
pub use registry::BufferHandle;
pub use services::ControlPlaneServices;
pub use utils::HostBuffer;
pub use writer::WriterContactInfo;
pub use writer::WriterPerReader;
pub use writer::WriterStream;

/// Handle to a contiguous region of local memory.
///
/// Implementations must guarantee the underlying allocation is valid for the
/// lifetime of the implementor.
pub trait LocalMemory: Send + Sync + Debug {
    /// Starting virtual address of the memory region.
    fn addr(&self) -> usize;
    /// Size of the memory region in bytes.
    fn size(&self) -> usize;
}

/// Raw pointer-based local memory handle.
///
/// Wraps a virtual address and size. The caller is responsible for
/// ensuring the underlying allocation outlives this handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLocalMemory {
    pub addr: usize,
    pub size: usize,
}

impl RawLocalMemory {
    pub fn new(addr: usize, size: usize) -> Self {
        Self { addr, size }
    }
}

impl LocalMemory for RawLocalMemory {
    fn addr(&self) -> usize {
        self.addr
    }
    fn size(&self) -> usize {
        self.size
    }
}

/// Kind of one-sided operation posted to the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RdmaOpType {
    ReadIntoLocal,
    WriteFromLocal,
}
