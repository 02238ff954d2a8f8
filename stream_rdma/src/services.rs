/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! What the control plane provides to a data plane.

use std::fmt::Debug;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::error::DataPlaneError;
use crate::error::Result;

/// A read forwarded over the control plane instead of the fabric.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardedRead {
    /// Stream id of the writer stream that owns the step.
    pub writer_stream: u64,
    pub sequence: i64,
    pub offset: u64,
    pub length: u64,
}

/// Services a stream needs from its control plane.
pub trait ControlPlaneServices: Send + Sync + Debug {
    /// Rank of this process within its cohort.
    fn rank(&self) -> usize;

    fn cohort_size(&self) -> usize;

    /// Delivers `request` to writer `writer_rank` and returns the bytes it
    /// served. Only planes without a fabric path use this.
    fn forward_read(&self, writer_rank: usize, request: &ForwardedRead) -> Result<Bytes> {
        let _ = request;
        Err(DataPlaneError::UsageViolation(format!(
            "control plane cannot forward reads to writer rank {writer_rank}"
        )))
    }
}

/// Fixed rank and cohort size with no forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticServices {
    pub rank: usize,
    pub cohort_size: usize,
}

impl ControlPlaneServices for StaticServices {
    fn rank(&self) -> usize {
        self.rank
    }

    fn cohort_size(&self) -> usize {
        self.cohort_size
    }
}
