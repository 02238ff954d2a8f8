/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Data plane configuration.

use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

/// Environment variable naming the preferred network interface when
/// [`DataPlaneParams::data_interface`] is unset.
pub const FABRIC_IFACE_ENV: &str = "FABRIC_IFACE";

/// Default address-vector capacity requested when opening an endpoint.
pub const DEFAULT_AV_SIZE: usize = 512;

/// Default bound on a single blocking completion-queue read.
pub const DEFAULT_CQ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Whether a stream may switch to the push path once the read pattern locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreloadMode {
    #[default]
    Off,
    On,
    Auto,
}

impl PreloadMode {
    pub fn is_enabled(self) -> bool {
        self != PreloadMode::Off
    }
}

/// How try-again answers from the fabric are handled when posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// `None` keeps retrying until the transport accepts the operation.
    pub max_attempts: Option<u32>,
    /// Pause between attempts. Zero spins.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            backoff: Duration::ZERO,
        }
    }

    pub fn bounded(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff,
        }
    }

    pub(crate) fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    pub(crate) fn pause(&self) {
        if self.backoff.is_zero() {
            std::hint::spin_loop();
        } else {
            std::thread::sleep(self.backoff);
        }
    }
}

/// Parameters handed to the data plane by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPlaneParams {
    /// Interface name a provider's domain must match to be preferred.
    pub data_interface: Option<String>,
    /// Explicit data plane name. When unset the highest priority plane wins.
    pub data_transport: Option<String>,
    pub preload_mode: PreloadMode,
    pub retry: RetryPolicy,
    /// Upper bound on each blocking completion-queue read.
    pub cq_poll_interval: Duration,
    pub av_size: usize,
}

impl Default for DataPlaneParams {
    fn default() -> Self {
        Self {
            data_interface: None,
            data_transport: None,
            preload_mode: PreloadMode::default(),
            retry: RetryPolicy::default(),
            cq_poll_interval: DEFAULT_CQ_POLL_INTERVAL,
            av_size: DEFAULT_AV_SIZE,
        }
    }
}

impl DataPlaneParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data_interface(mut self, ifname: impl Into<String>) -> Self {
        self.data_interface = Some(ifname.into());
        self
    }

    pub fn with_data_transport(mut self, name: impl Into<String>) -> Self {
        self.data_transport = Some(name.into());
        self
    }

    pub fn with_preload_mode(mut self, mode: PreloadMode) -> Self {
        self.preload_mode = mode;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cq_poll_interval(mut self, interval: Duration) -> Self {
        self.cq_poll_interval = interval;
        self
    }

    pub fn with_av_size(mut self, av_size: usize) -> Self {
        self.av_size = av_size;
        self
    }

    /// Fills unset fields from the process environment.
    pub fn from_env(mut self) -> Self {
        if self.data_interface.is_none() {
            self.data_interface = std::env::var(FABRIC_IFACE_ENV).ok();
        }
        self
    }

    /// The interface name used for provider matching: the explicit parameter
    /// first, then [`FABRIC_IFACE_ENV`].
    pub fn requested_interface(&self) -> Option<String> {
        self.data_interface
            .clone()
            .or_else(|| std::env::var(FABRIC_IFACE_ENV).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = DataPlaneParams::default();
        assert_eq!(params.av_size, DEFAULT_AV_SIZE);
        assert_eq!(params.preload_mode, PreloadMode::Off);
        assert_eq!(params.retry.max_attempts, None);
        assert!(params.data_transport.is_none());
    }

    #[test]
    fn test_explicit_interface_wins() {
        let params = DataPlaneParams::new().with_data_interface("ib0");
        assert_eq!(params.requested_interface().as_deref(), Some("ib0"));
    }

    #[test]
    fn test_retry_policy_bounds() {
        let unbounded = RetryPolicy::unbounded();
        assert!(!unbounded.exhausted(u32::MAX));
        let bounded = RetryPolicy::bounded(3, Duration::ZERO);
        assert!(!bounded.exhausted(2));
        assert!(bounded.exhausted(3));
    }

    #[test]
    fn test_params_serde() -> anyhow::Result<()> {
        let params = DataPlaneParams::new()
            .with_preload_mode(PreloadMode::Auto)
            .with_retry(RetryPolicy::bounded(5, Duration::from_micros(50)));
        let bytes = bincode::serialize(&params)?;
        let back: DataPlaneParams = bincode::deserialize(&bytes)?;
        assert_eq!(back, params);
        Ok(())
    }
}
