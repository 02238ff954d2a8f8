/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Data plane interface and selection between the available planes.

use std::fmt;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::LocalMemory;
use crate::config::DataPlaneParams;
use crate::config::PreloadMode;
use crate::error::DataPlaneError;
use crate::error::Result;
use crate::fabric;
use crate::fabric::FabricProvider;
use crate::fabric::PRIORITY_UNAVAILABLE;
use crate::pull::CompletionHandle;
use crate::reader::ReadRequest;
use crate::reader::ReaderContactInfo;
use crate::reader::ReaderStream;
use crate::registry::BufferHandle;
use crate::services::ControlPlaneServices;
use crate::writer::WriterContactInfo;
use crate::writer::WriterPerReader;
use crate::writer::WriterStream;

/// The data planes this crate provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataPlaneKind {
    /// Reads forwarded over the control plane.
    Dummy,
    Rdma,
}

impl DataPlaneKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Dummy => "dummy",
            Self::Rdma => "rdma",
        }
    }
}

impl fmt::Display for DataPlaneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataPlaneKind {
    type Err = DataPlaneError;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "dummy" => Ok(Self::Dummy),
            "rdma" => Ok(Self::Rdma),
            other => Err(DataPlaneError::UsageViolation(format!(
                "unknown data plane {other}"
            ))),
        }
    }
}

/// Resolves a data plane by name.
pub fn load_data_plane(name: &str) -> Result<DataPlaneKind> {
    name.parse().inspect_err(|_| {
        tracing::error!("unknown data plane interface {name}, load failed");
    })
}

/// The part of a data plane consulted before any stream exists.
pub trait PlaneProbe: Send + Sync + Debug {
    fn kind(&self) -> DataPlaneKind;

    /// How strongly this plane should be chosen here;
    /// [`PRIORITY_UNAVAILABLE`] when it cannot work at all.
    fn get_priority(&self, params: &DataPlaneParams) -> i32;

    /// Releases whatever `get_priority` set up.
    fn un_get_priority(&self) {}
}

/// Picks the plane to use: an explicitly named transport if the params carry
/// one, else the candidate with the highest priority. Candidates that were
/// probed but not chosen are released.
pub fn select_data_plane(
    params: &DataPlaneParams,
    candidates: &[&dyn PlaneProbe],
) -> Result<DataPlaneKind> {
    if let Some(name) = &params.data_transport {
        let kind = load_data_plane(name)?;
        if !candidates.iter().any(|c| c.kind() == kind) {
            return Err(DataPlaneError::UsageViolation(format!(
                "requested data plane {kind} is not available"
            )));
        }
        tracing::info!("using requested data plane {kind}");
        return Ok(kind);
    }
    let mut best: Option<(usize, i32)> = None;
    for (i, candidate) in candidates.iter().enumerate() {
        let priority = candidate.get_priority(params);
        tracing::debug!("data plane {} reports priority {priority}", candidate.kind());
        if priority > PRIORITY_UNAVAILABLE && !best.is_some_and(|(_, top)| top >= priority) {
            best = Some((i, priority));
        }
    }
    let Some((chosen, priority)) = best else {
        for candidate in candidates {
            candidate.un_get_priority();
        }
        return Err(DataPlaneError::FabricUnavailable(
            "no data plane is usable".into(),
        ));
    };
    for (i, candidate) in candidates.iter().enumerate() {
        if i != chosen {
            candidate.un_get_priority();
        }
    }
    let kind = candidates[chosen].kind();
    tracing::info!("selected data plane {kind} with priority {priority}");
    Ok(kind)
}

/// Operations a data plane offers to the control plane.
pub trait DataPlane: PlaneProbe {
    type Reader: Send + Sync + Debug;
    type Writer: Send + Sync + Debug;
    type WriterPerReader: Send + Sync + Debug;
    type Completion: Send + Debug;

    fn init_reader(
        &self,
        services: Arc<dyn ControlPlaneServices>,
        params: &DataPlaneParams,
    ) -> Result<(Self::Reader, ReaderContactInfo)>;

    fn init_writer(
        &self,
        services: Arc<dyn ControlPlaneServices>,
        params: &DataPlaneParams,
    ) -> Result<Self::Writer>;

    fn init_writer_per_reader(
        &self,
        writer: &Self::Writer,
        reader_cohort_size: usize,
        readers: &[ReaderContactInfo],
    ) -> Result<(Self::WriterPerReader, WriterContactInfo)>;

    fn provide_writer_data_to_reader(
        &self,
        reader: &Self::Reader,
        writer_cohort_size: usize,
        writers: &[WriterContactInfo],
    ) -> Result<()>;

    fn provide_timestep(
        &self,
        writer: &Self::Writer,
        data: Arc<dyn LocalMemory>,
        sequence: i64,
    ) -> Result<BufferHandle>;

    fn release_timestep(&self, writer: &Self::Writer, sequence: i64) -> Result<()>;

    fn release_timestep_per_reader(&self, wsr: &Self::WriterPerReader, sequence: i64) -> Result<()>;

    fn reader_release_timestep(&self, reader: &Self::Reader, sequence: i64) -> Result<()>;

    fn read_remote_memory(
        &self,
        reader: &Self::Reader,
        request: ReadRequest,
        buffer: Arc<dyn LocalMemory>,
        info: &BufferHandle,
    ) -> Result<Self::Completion>;

    fn wait_for_completion(&self, reader: &Self::Reader, completion: Self::Completion) -> Result<()>;

    fn reader_register_timestep(
        &self,
        wsr: &Self::WriterPerReader,
        sequence: i64,
        mode: PreloadMode,
    ) -> Result<()>;

    fn wsr_read_pattern_locked(&self, wsr: &Self::WriterPerReader, effective: i64) -> Result<()>;

    fn rs_read_pattern_locked(&self, reader: &Self::Reader, effective: i64) -> Result<()>;

    fn notify_conn_failure(&self, reader: &Self::Reader, rank: usize);

    fn destroy_reader(&self, reader: Self::Reader) -> Result<()>;

    fn destroy_writer(&self, writer: Self::Writer) -> Result<()>;

    fn destroy_writer_per_reader(&self, wsr: Self::WriterPerReader) -> Result<()>;
}

/// The RDMA data plane over a fabric provider.
#[derive(Debug, Clone)]
pub struct RdmaDataPlane {
    provider: Arc<dyn FabricProvider>,
}

impl RdmaDataPlane {
    pub fn new(provider: Arc<dyn FabricProvider>) -> Self {
        Self { provider }
    }
}

impl PlaneProbe for RdmaDataPlane {
    fn kind(&self) -> DataPlaneKind {
        DataPlaneKind::Rdma
    }

    fn get_priority(&self, params: &DataPlaneParams) -> i32 {
        fabric::get_priority(self.provider.as_ref(), params)
    }

    fn un_get_priority(&self) {
        tracing::debug!("rdma data plane not chosen, releasing probe state");
    }
}

impl DataPlane for RdmaDataPlane {
    type Reader = ReaderStream;
    type Writer = WriterStream;
    type WriterPerReader = WriterPerReader;
    type Completion = CompletionHandle;

    fn init_reader(
        &self,
        services: Arc<dyn ControlPlaneServices>,
        params: &DataPlaneParams,
    ) -> Result<(ReaderStream, ReaderContactInfo)> {
        ReaderStream::init(self.provider.as_ref(), services, params)
    }

    fn init_writer(
        &self,
        services: Arc<dyn ControlPlaneServices>,
        params: &DataPlaneParams,
    ) -> Result<WriterStream> {
        WriterStream::init(self.provider.as_ref(), services, params)
    }

    fn init_writer_per_reader(
        &self,
        writer: &WriterStream,
        reader_cohort_size: usize,
        readers: &[ReaderContactInfo],
    ) -> Result<(WriterPerReader, WriterContactInfo)> {
        writer.init_writer_per_reader(reader_cohort_size, readers)
    }

    fn provide_writer_data_to_reader(
        &self,
        reader: &ReaderStream,
        writer_cohort_size: usize,
        writers: &[WriterContactInfo],
    ) -> Result<()> {
        reader.provide_writer_data(writer_cohort_size, writers)
    }

    fn provide_timestep(
        &self,
        writer: &WriterStream,
        data: Arc<dyn LocalMemory>,
        sequence: i64,
    ) -> Result<BufferHandle> {
        writer.provide_timestep(data, sequence)
    }

    fn release_timestep(&self, writer: &WriterStream, sequence: i64) -> Result<()> {
        writer.release_timestep(sequence)
    }

    fn release_timestep_per_reader(&self, wsr: &WriterPerReader, sequence: i64) -> Result<()> {
        wsr.release_timestep(sequence)
    }

    fn reader_release_timestep(&self, reader: &ReaderStream, sequence: i64) -> Result<()> {
        reader.release_timestep(sequence)
    }

    fn read_remote_memory(
        &self,
        reader: &ReaderStream,
        request: ReadRequest,
        buffer: Arc<dyn LocalMemory>,
        info: &BufferHandle,
    ) -> Result<CompletionHandle> {
        reader.read_remote_memory(request, buffer, info)
    }

    fn wait_for_completion(&self, reader: &ReaderStream, completion: CompletionHandle) -> Result<()> {
        reader.wait_for_completion(completion)
    }

    fn reader_register_timestep(
        &self,
        wsr: &WriterPerReader,
        sequence: i64,
        mode: PreloadMode,
    ) -> Result<()> {
        wsr.reader_register_timestep(sequence, mode)
    }

    fn wsr_read_pattern_locked(&self, wsr: &WriterPerReader, effective: i64) -> Result<()> {
        wsr.read_pattern_locked(effective)
    }

    fn rs_read_pattern_locked(&self, reader: &ReaderStream, effective: i64) -> Result<()> {
        reader.lock_pattern(effective)
    }

    fn notify_conn_failure(&self, reader: &ReaderStream, rank: usize) {
        reader.notify_conn_failure(rank)
    }

    fn destroy_reader(&self, reader: ReaderStream) -> Result<()> {
        reader.destroy()
    }

    fn destroy_writer(&self, writer: WriterStream) -> Result<()> {
        writer.destroy()
    }

    fn destroy_writer_per_reader(&self, wsr: WriterPerReader) -> Result<()> {
        wsr.destroy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dummy::DummyDataPlane;
    use crate::fabric::ProviderInfo;
    use crate::fabric::loopback::LoopbackFabric;

    #[test]
    fn test_load_data_plane() {
        assert_eq!(load_data_plane("rdma").unwrap(), DataPlaneKind::Rdma);
        assert_eq!(load_data_plane("dummy").unwrap(), DataPlaneKind::Dummy);
        assert!(load_data_plane("evpath").is_err());
        assert_eq!(DataPlaneKind::Rdma.to_string(), "rdma");
    }

    #[test]
    fn test_rdma_wins_when_a_fabric_exists() {
        let rdma = RdmaDataPlane::new(Arc::new(LoopbackFabric::new()));
        let dummy = DummyDataPlane::new();
        let kind = select_data_plane(&DataPlaneParams::default(), &[&dummy, &rdma]).unwrap();
        assert_eq!(kind, DataPlaneKind::Rdma);
    }

    #[test]
    fn test_dummy_is_the_fallback() {
        let rdma = RdmaDataPlane::new(Arc::new(LoopbackFabric::with_providers(vec![
            ProviderInfo::new("tcp", "eth0"),
        ])));
        let dummy = DummyDataPlane::new();
        let kind = select_data_plane(&DataPlaneParams::default(), &[&rdma, &dummy]).unwrap();
        assert_eq!(kind, DataPlaneKind::Dummy);

        let empty = RdmaDataPlane::new(Arc::new(LoopbackFabric::with_providers(Vec::new())));
        assert!(matches!(
            select_data_plane(&DataPlaneParams::default(), &[&empty]),
            Err(DataPlaneError::FabricUnavailable(_))
        ));
    }

    #[test]
    fn test_requested_transport_overrides_priority() {
        let rdma = RdmaDataPlane::new(Arc::new(LoopbackFabric::new()));
        let dummy = DummyDataPlane::new();
        let params = DataPlaneParams::default().with_data_transport("dummy");
        assert_eq!(
            select_data_plane(&params, &[&rdma, &dummy]).unwrap(),
            DataPlaneKind::Dummy
        );
        let params = DataPlaneParams::default().with_data_transport("rdma");
        assert!(select_data_plane(&params, &[&dummy]).is_err());
        let params = DataPlaneParams::default().with_data_transport("bogus");
        assert!(select_data_plane(&params, &[&rdma]).is_err());
    }
}
