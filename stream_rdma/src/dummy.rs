/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A data plane without a fabric. Reads travel over the control plane and
//! the writer serves them from its published steps.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;

use crate::LocalMemory;
use crate::config::DataPlaneParams;
use crate::config::PreloadMode;
use crate::error::DataPlaneError;
use crate::error::Result;
use crate::error::usage_violation;
use crate::plane::DataPlane;
use crate::plane::DataPlaneKind;
use crate::plane::PlaneProbe;
use crate::reader::ReadRequest;
use crate::reader::ReaderContactInfo;
use crate::registry::BufferHandle;
use crate::services::ControlPlaneServices;
use crate::services::ForwardedRead;
use crate::utils::copy_memory;
use crate::utils::lock;
use crate::writer::WriterContactInfo;

/// Usable everywhere, but below any working fabric.
pub const DUMMY_PRIORITY: i32 = 1;

/// Streams created through one plane (or its clones) get distinct ids.
#[derive(Debug, Clone, Default)]
pub struct DummyDataPlane {
    next_stream_id: Arc<AtomicU64>,
}

impl DummyDataPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug)]
pub struct DummyReader {
    id: u64,
    services: Arc<dyn ControlPlaneServices>,
    writers: OnceLock<Vec<WriterContactInfo>>,
    failed_ranks: Mutex<HashSet<usize>>,
}

impl DummyReader {
    pub fn stream_id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
pub struct DummyWriter {
    id: u64,
    services: Arc<dyn ControlPlaneServices>,
    timesteps: Mutex<HashMap<i64, Arc<dyn LocalMemory>>>,
}

impl DummyWriter {
    pub fn stream_id(&self) -> u64 {
        self.id
    }

    /// Answers a read a reader forwarded over the control plane.
    pub fn serve_read_request(&self, request: &ForwardedRead) -> Result<Bytes> {
        let timesteps = lock(&self.timesteps);
        let data = timesteps.get(&request.sequence).ok_or_else(|| {
            usage_violation(format!(
                "writer {}: read for unpublished step {}",
                self.services.rank(),
                request.sequence
            ))
        })?;
        let end = request.offset.checked_add(request.length);
        if !end.is_some_and(|end| end <= data.size() as u64) {
            return Err(usage_violation(format!(
                "read of {}+{} exceeds the {} bytes of step {}",
                request.offset,
                request.length,
                data.size(),
                request.sequence
            )));
        }
        let start = data.addr() + request.offset as usize;
        // The range was checked against the published block, which stays
        // alive while the map holds it.
        let bytes = unsafe { std::slice::from_raw_parts(start as *const u8, request.length as usize) };
        Ok(Bytes::copy_from_slice(bytes))
    }

    pub fn published_timesteps(&self) -> usize {
        lock(&self.timesteps).len()
    }
}

#[derive(Debug)]
pub struct DummyWriterPerReader {
    reader_cohort_size: usize,
}

impl DummyWriterPerReader {
    pub fn reader_cohort_size(&self) -> usize {
        self.reader_cohort_size
    }
}

/// Reads complete before they are handed back.
#[derive(Debug)]
pub struct DummyCompletion {
    pub rank: usize,
    pub length: usize,
}

impl PlaneProbe for DummyDataPlane {
    fn kind(&self) -> DataPlaneKind {
        DataPlaneKind::Dummy
    }

    fn get_priority(&self, _params: &DataPlaneParams) -> i32 {
        DUMMY_PRIORITY
    }
}

impl DataPlane for DummyDataPlane {
    type Reader = DummyReader;
    type Writer = DummyWriter;
    type WriterPerReader = DummyWriterPerReader;
    type Completion = DummyCompletion;

    fn init_reader(
        &self,
        services: Arc<dyn ControlPlaneServices>,
        _params: &DataPlaneParams,
    ) -> Result<(DummyReader, ReaderContactInfo)> {
        let reader = DummyReader {
            id: self.next_stream_id(),
            services,
            writers: OnceLock::new(),
            failed_ranks: Mutex::new(HashSet::new()),
        };
        let contact = ReaderContactInfo {
            stream_id: reader.id,
            address: Vec::new(),
        };
        tracing::debug!("dummy reader {} initialized", reader.services.rank());
        Ok((reader, contact))
    }

    fn init_writer(
        &self,
        services: Arc<dyn ControlPlaneServices>,
        _params: &DataPlaneParams,
    ) -> Result<DummyWriter> {
        tracing::debug!("dummy writer {} initialized", services.rank());
        Ok(DummyWriter {
            id: self.next_stream_id(),
            services,
            timesteps: Mutex::new(HashMap::new()),
        })
    }

    fn init_writer_per_reader(
        &self,
        writer: &DummyWriter,
        reader_cohort_size: usize,
        readers: &[ReaderContactInfo],
    ) -> Result<(DummyWriterPerReader, WriterContactInfo)> {
        if readers.len() != reader_cohort_size {
            return Err(usage_violation(format!(
                "{} reader contacts for a cohort of {reader_cohort_size}",
                readers.len()
            )));
        }
        let contact = WriterContactInfo {
            stream_id: writer.stream_id(),
            address: Vec::new(),
            reader_roll: BufferHandle::default(),
        };
        Ok((DummyWriterPerReader { reader_cohort_size }, contact))
    }

    fn provide_writer_data_to_reader(
        &self,
        reader: &DummyReader,
        writer_cohort_size: usize,
        writers: &[WriterContactInfo],
    ) -> Result<()> {
        if writers.len() != writer_cohort_size {
            return Err(usage_violation(format!(
                "{} writer contacts for a cohort of {writer_cohort_size}",
                writers.len()
            )));
        }
        reader
            .writers
            .set(writers.to_vec())
            .map_err(|_| usage_violation("writer contact information already provided"))
    }

    fn provide_timestep(
        &self,
        writer: &DummyWriter,
        data: Arc<dyn LocalMemory>,
        sequence: i64,
    ) -> Result<BufferHandle> {
        let mut timesteps = lock(&writer.timesteps);
        if timesteps.contains_key(&sequence) {
            return Err(usage_violation(format!(
                "timestep {sequence} is already published"
            )));
        }
        let handle = BufferHandle::new(data.addr() as u64, 0);
        timesteps.insert(sequence, data);
        Ok(handle)
    }

    fn release_timestep(&self, writer: &DummyWriter, sequence: i64) -> Result<()> {
        lock(&writer.timesteps)
            .remove(&sequence)
            .map(|_| ())
            .ok_or_else(|| usage_violation(format!("timestep {sequence} is not published")))
    }

    fn release_timestep_per_reader(&self, _wsr: &DummyWriterPerReader, _sequence: i64) -> Result<()> {
        Ok(())
    }

    fn reader_release_timestep(&self, _reader: &DummyReader, _sequence: i64) -> Result<()> {
        Ok(())
    }

    fn read_remote_memory(
        &self,
        reader: &DummyReader,
        request: ReadRequest,
        buffer: Arc<dyn LocalMemory>,
        _info: &BufferHandle,
    ) -> Result<DummyCompletion> {
        let ReadRequest {
            rank,
            sequence,
            offset,
            length,
        } = request;
        if (buffer.size() as u64) < length {
            return Err(usage_violation(format!(
                "buffer of {} bytes cannot hold {length} bytes",
                buffer.size()
            )));
        }
        let writers = reader
            .writers
            .get()
            .ok_or_else(|| usage_violation("writer contact information has not been provided"))?;
        let writer = writers.get(rank).ok_or_else(|| {
            usage_violation(format!(
                "writer rank {rank} outside a cohort of {}",
                writers.len()
            ))
        })?;
        if lock(&reader.failed_ranks).contains(&rank) {
            return Err(DataPlaneError::PeerFailure { rank });
        }
        let forwarded = ForwardedRead {
            writer_stream: writer.stream_id,
            sequence,
            offset,
            length,
        };
        let bytes = reader.services.forward_read(rank, &forwarded)?;
        if bytes.len() as u64 != length {
            return Err(DataPlaneError::RemoteOperation(format!(
                "writer rank {rank} answered {} bytes for a {length} byte read",
                bytes.len()
            )));
        }
        // Both ranges hold `length` bytes.
        unsafe { copy_memory(bytes.as_ptr() as usize, buffer.addr(), bytes.len()) };
        tracing::trace!(
            "dummy reader {}: read {length} bytes of step {sequence} from rank {rank}",
            reader.services.rank()
        );
        Ok(DummyCompletion {
            rank,
            length: bytes.len(),
        })
    }

    fn wait_for_completion(&self, _reader: &DummyReader, _completion: DummyCompletion) -> Result<()> {
        Ok(())
    }

    fn reader_register_timestep(
        &self,
        _wsr: &DummyWriterPerReader,
        _sequence: i64,
        _mode: PreloadMode,
    ) -> Result<()> {
        Ok(())
    }

    fn wsr_read_pattern_locked(&self, _wsr: &DummyWriterPerReader, effective: i64) -> Result<()> {
        tracing::debug!("dummy plane ignores a pattern locked at step {effective}");
        Ok(())
    }

    fn rs_read_pattern_locked(&self, _reader: &DummyReader, effective: i64) -> Result<()> {
        tracing::debug!("dummy plane ignores a pattern locked at step {effective}");
        Ok(())
    }

    fn notify_conn_failure(&self, reader: &DummyReader, rank: usize) {
        tracing::warn!("dummy reader {}: writer rank {rank} failed", reader.services.rank());
        lock(&reader.failed_ranks).insert(rank);
    }

    fn destroy_reader(&self, _reader: DummyReader) -> Result<()> {
        Ok(())
    }

    fn destroy_writer(&self, writer: DummyWriter) -> Result<()> {
        let left = writer.published_timesteps();
        if left > 0 {
            tracing::debug!("dummy writer destroyed with {left} steps still published");
        }
        Ok(())
    }

    fn destroy_writer_per_reader(&self, _wsr: DummyWriterPerReader) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::StaticServices;
    use crate::utils::HostBuffer;

    fn services() -> Arc<dyn ControlPlaneServices> {
        Arc::new(StaticServices {
            rank: 0,
            cohort_size: 1,
        })
    }

    #[test]
    fn test_serve_read_request() -> anyhow::Result<()> {
        let plane = DummyDataPlane::new();
        let writer = plane.init_writer(services(), &DataPlaneParams::default())?;
        let data: Arc<dyn LocalMemory> = Arc::new(HostBuffer::from_slice(b"0123456789"));
        plane.provide_timestep(&writer, data.clone(), 3)?;
        assert!(plane.provide_timestep(&writer, data, 3).is_err());

        let mut request = ForwardedRead {
            writer_stream: writer.stream_id(),
            sequence: 3,
            offset: 2,
            length: 4,
        };
        assert_eq!(writer.serve_read_request(&request)?, Bytes::from_static(b"2345"));
        request.offset = 8;
        assert!(writer.serve_read_request(&request).is_err());
        request.sequence = 4;
        assert!(writer.serve_read_request(&request).is_err());

        plane.release_timestep(&writer, 3)?;
        assert!(plane.release_timestep(&writer, 3).is_err());
        plane.destroy_writer(writer)?;
        Ok(())
    }

    #[test]
    fn test_stream_ids_are_per_plane() -> anyhow::Result<()> {
        let plane = DummyDataPlane::new();
        let params = DataPlaneParams::default();
        let (reader, contact) = plane.init_reader(services(), &params)?;
        let writer = plane.clone().init_writer(services(), &params)?;
        assert_eq!(contact.stream_id, reader.stream_id());
        assert_eq!(reader.stream_id(), 1);
        assert_eq!(writer.stream_id(), 2);

        // Another plane numbers its own streams.
        let other = DummyDataPlane::new().init_writer(services(), &params)?;
        assert_eq!(other.stream_id(), 1);
        Ok(())
    }

    #[test]
    fn test_read_without_forwarding_fails() -> anyhow::Result<()> {
        let plane = DummyDataPlane::new();
        let (reader, _) = plane.init_reader(services(), &DataPlaneParams::default())?;
        plane.provide_writer_data_to_reader(
            &reader,
            1,
            &[WriterContactInfo {
                stream_id: 1,
                address: Vec::new(),
                reader_roll: BufferHandle::default(),
            }],
        )?;
        let buffer: Arc<dyn LocalMemory> = Arc::new(HostBuffer::zeroed(4));
        let read = plane.read_remote_memory(
            &reader,
            ReadRequest::new(0, 0, 0, 4),
            buffer.clone(),
            &BufferHandle::default(),
        );
        assert!(matches!(read, Err(DataPlaneError::UsageViolation(_))));

        plane.notify_conn_failure(&reader, 0);
        let read = plane.read_remote_memory(
            &reader,
            ReadRequest::new(0, 0, 0, 4),
            buffer,
            &BufferHandle::default(),
        );
        assert!(matches!(read, Err(DataPlaneError::PeerFailure { rank: 0 })));
        Ok(())
    }
}
