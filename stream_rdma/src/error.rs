/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Error types surfaced by the data plane.

use crate::fabric::FabricError;

/// Errors reported by data plane operations.
#[derive(thiserror::Error, Debug)]
pub enum DataPlaneError {
    /// No provider matched the selection rules, or the fabric could not be
    /// brought up.
    #[error("no usable RDMA fabric: {0}")]
    FabricUnavailable(String),

    /// The transport kept answering try-again past the configured retry bound.
    #[error("transport still busy after {attempts} attempts")]
    TransientBusy { attempts: u32 },

    /// A posted one-sided operation completed with an error.
    #[error("remote operation failed: {0}")]
    RemoteOperation(String),

    /// The caller broke a calling contract (unknown sequence, double lock, ...).
    #[error("usage violation: {0}")]
    UsageViolation(String),

    /// A writer rank was reported failed while a request against it was live.
    #[error("writer rank {rank} failed")]
    PeerFailure { rank: usize },

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error("wire codec error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = DataPlaneError> = std::result::Result<T, E>;

/// Logs and builds a [`DataPlaneError::UsageViolation`].
pub(crate) fn usage_violation(message: impl Into<String>) -> DataPlaneError {
    let message = message.into();
    tracing::error!("{message}");
    DataPlaneError::UsageViolation(message)
}

/// Why a single completion handle failed. Kept separate from
/// [`DataPlaneError`] so it can be cloned into every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Failure {
    Remote(String),
    Peer(usize),
    Protocol(String),
}

impl From<Failure> for DataPlaneError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Remote(message) => DataPlaneError::RemoteOperation(message),
            Failure::Peer(rank) => DataPlaneError::PeerFailure { rank },
            Failure::Protocol(message) => DataPlaneError::UsageViolation(message),
        }
    }
}
