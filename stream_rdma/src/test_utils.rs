/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test harnesses: writer and reader cohorts wired together over a loopback
//! fabric, and control-plane services that forward reads in-process.

use std::sync::Arc;
use std::sync::Mutex;

use bytes::Bytes;

use crate::LocalMemory;
use crate::config::DataPlaneParams;
use crate::dummy::DummyWriter;
use crate::error::Result;
use crate::error::usage_violation;
use crate::fabric::loopback::LoopbackFabric;
use crate::reader::ReadRequest;
use crate::reader::ReaderContactInfo;
use crate::reader::ReaderStream;
use crate::registry::BufferHandle;
use crate::services::ControlPlaneServices;
use crate::services::ForwardedRead;
use crate::services::StaticServices;
use crate::utils::HostBuffer;
use crate::utils::from_wire;
use crate::utils::lock;
use crate::utils::to_wire;
use crate::writer::WriterContactInfo;
use crate::writer::WriterPerReader;
use crate::writer::WriterStream;

/// Byte `i` of writer `writer_rank`'s step `sequence`.
pub fn pattern_byte(writer_rank: usize, sequence: i64, i: usize) -> u8 {
    ((writer_rank as u64 * 31 + sequence as u64 * 7 + i as u64) % 251) as u8
}

pub fn step_pattern(writer_rank: usize, sequence: i64, len: usize) -> Vec<u8> {
    (0..len).map(|i| pattern_byte(writer_rank, sequence, i)).collect()
}

pub fn step_data(writer_rank: usize, sequence: i64, len: usize) -> Arc<HostBuffer> {
    Arc::new(HostBuffer::from_slice(&step_pattern(writer_rank, sequence, len)))
}

/// Writer and reader cohorts connected the way a control plane would
/// connect them, with contact information passed through the wire format.
#[derive(Debug)]
pub struct LoopbackCohort {
    pub fabric: LoopbackFabric,
    pub writers: Vec<WriterStream>,
    /// One per writer rank.
    pub wsrs: Vec<WriterPerReader>,
    pub readers: Vec<ReaderStream>,
}

impl LoopbackCohort {
    pub fn new(writer_count: usize, reader_count: usize, params: &DataPlaneParams) -> Result<Self> {
        let fabric = LoopbackFabric::new();
        let mut readers = Vec::with_capacity(reader_count);
        let mut reader_wire = Vec::with_capacity(reader_count);
        for rank in 0..reader_count {
            let services = Arc::new(StaticServices {
                rank,
                cohort_size: reader_count,
            });
            let (reader, contact) = ReaderStream::init(&fabric, services, params)?;
            readers.push(reader);
            reader_wire.push(to_wire(&contact)?);
        }
        let reader_contacts = reader_wire
            .iter()
            .map(|bytes| from_wire::<ReaderContactInfo>(bytes))
            .collect::<Result<Vec<_>>>()?;

        let mut writers = Vec::with_capacity(writer_count);
        let mut wsrs = Vec::with_capacity(writer_count);
        let mut writer_wire = Vec::with_capacity(writer_count);
        for rank in 0..writer_count {
            let services = Arc::new(StaticServices {
                rank,
                cohort_size: writer_count,
            });
            let writer = WriterStream::init(&fabric, services, params)?;
            let (wsr, contact) = writer.init_writer_per_reader(reader_count, &reader_contacts)?;
            writers.push(writer);
            wsrs.push(wsr);
            writer_wire.push(to_wire(&contact)?);
        }
        let writer_contacts = writer_wire
            .iter()
            .map(|bytes| from_wire::<WriterContactInfo>(bytes))
            .collect::<Result<Vec<_>>>()?;
        for reader in &readers {
            reader.provide_writer_data(writer_count, &writer_contacts)?;
        }
        Ok(Self {
            fabric,
            writers,
            wsrs,
            readers,
        })
    }

    /// Every writer publishes step `sequence` of `len` pattern bytes.
    pub fn publish(&self, sequence: i64, len: usize) -> Result<Vec<BufferHandle>> {
        self.writers
            .iter()
            .enumerate()
            .map(|(rank, writer)| writer.provide_timestep(step_data(rank, sequence, len), sequence))
            .collect()
    }

    /// Reads a range through `reader` and waits for it.
    pub fn read(
        &self,
        reader: usize,
        request: ReadRequest,
        handle: &BufferHandle,
    ) -> Result<Vec<u8>> {
        let buffer = Arc::new(HostBuffer::zeroed(request.length as usize));
        let memory: Arc<dyn LocalMemory> = buffer.clone();
        let completion = self.readers[reader].read_remote_memory(request, memory, handle)?;
        completion.wait()?;
        Ok(buffer.to_vec())
    }

    /// Locks every reader's pattern at `effective`, then tells the writers.
    pub fn lock_pattern(&self, effective: i64) -> Result<()> {
        for reader in &self.readers {
            reader.lock_pattern(effective)?;
        }
        for wsr in &self.wsrs {
            wsr.read_pattern_locked(effective)?;
        }
        Ok(())
    }

    /// Releases `sequence` on the readers, then per reader cohort, then on
    /// the writers.
    pub fn release(&self, sequence: i64) -> Result<()> {
        for reader in &self.readers {
            reader.release_timestep(sequence)?;
        }
        for wsr in &self.wsrs {
            wsr.release_timestep(sequence)?;
        }
        for writer in &self.writers {
            writer.release_timestep(sequence)?;
        }
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        for reader in &self.readers {
            reader.destroy()?;
        }
        for writer in &self.writers {
            writer.destroy()?;
        }
        Ok(())
    }
}

/// Dummy-plane writers reachable by rank.
#[derive(Debug, Clone, Default)]
pub struct WriterDirectory {
    writers: Arc<Mutex<Vec<Arc<DummyWriter>>>>,
}

impl WriterDirectory {
    pub fn add(&self, writer: Arc<DummyWriter>) {
        lock(&self.writers).push(writer);
    }

    pub fn take_all(&self) -> Vec<Arc<DummyWriter>> {
        std::mem::take(&mut *lock(&self.writers))
    }
}

/// Services that deliver forwarded reads straight to the writer in the
/// directory.
#[derive(Debug, Clone)]
pub struct ForwardingServices {
    pub rank: usize,
    pub cohort_size: usize,
    pub directory: WriterDirectory,
}

impl ControlPlaneServices for ForwardingServices {
    fn rank(&self) -> usize {
        self.rank
    }

    fn cohort_size(&self) -> usize {
        self.cohort_size
    }

    fn forward_read(&self, writer_rank: usize, request: &ForwardedRead) -> Result<Bytes> {
        let writer = lock(&self.directory.writers)
            .get(writer_rank)
            .cloned()
            .ok_or_else(|| usage_violation(format!("no writer at rank {writer_rank}")))?;
        writer.serve_read_request(request)
    }
}
