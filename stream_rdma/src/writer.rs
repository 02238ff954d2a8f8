/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Writer stream: publishes timesteps for readers to pull and, for reader
//! cohorts that locked their read pattern, pushes later timesteps into their
//! preload buffers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::LocalMemory;
use crate::config::DataPlaneParams;
use crate::config::PreloadMode;
use crate::error::DataPlaneError;
use crate::error::Result;
use crate::error::usage_violation;
use crate::fabric::AccessFlags;
use crate::fabric::CqEvent;
use crate::fabric::FabricAddr;
use crate::fabric::FabricProvider;
use crate::fabric::OpContext;
use crate::fabric::RmaOp;
use crate::fabric::session::FabricSession;
use crate::imm::slot_for;
use crate::ledger::TimestepLedger;
use crate::push::PushPhase;
use crate::push::RankSelection;
use crate::push::SelectionRead;
use crate::push::WsrPushState;
use crate::push::build_push_ops;
use crate::reader::ReaderContactInfo;
use crate::registry::BufferHandle;
use crate::registry::MemoryRegion;
use crate::services::ControlPlaneServices;
use crate::step_log::DESCRIPTOR_LEN;
use crate::step_log::RollDescriptor;
use crate::step_log::decode_request_log;
use crate::utils::HostBuffer;
use crate::utils::lock;

/// What a writer rank tells one reader cohort about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterContactInfo {
    /// Identifies the writer-per-reader state on the writer.
    pub stream_id: u64,
    /// Fabric endpoint name.
    pub address: Vec<u8>,
    /// Array with one descriptor slot per reader rank, written by readers
    /// when they lock their pattern.
    pub reader_roll: BufferHandle,
}

#[derive(Debug)]
struct WriterState {
    ledger: TimestepLedger,
    pushes: HashMap<u64, WsrPushState>,
    /// First step a reader cohort registered with preload requested.
    def_locked: Option<i64>,
    next_context: OpContext,
    next_wsr: u64,
}

/// Per reader cohort connection state.
#[derive(Debug)]
struct WsrShared {
    id: u64,
    reader_cohort_size: usize,
    reader_addrs: Vec<FabricAddr>,
    reader_roll: HostBuffer,
    roll_region: Mutex<Option<MemoryRegion>>,
}

/// Tagged writes delivering one step to one reader cohort.
#[derive(Debug)]
struct PushBatch {
    sequence: i64,
    ops: Vec<(RmaOp, u32)>,
}

#[derive(Debug)]
struct WriterShared {
    services: Arc<dyn ControlPlaneServices>,
    session: FabricSession,
    wsrs: Mutex<Vec<Arc<WsrShared>>>,
    state: Mutex<WriterState>,
}

impl WriterShared {
    fn rank(&self) -> usize {
        self.services.rank()
    }

    fn release_region(&self, region: MemoryRegion) {
        if let Err(err) = self.session.deregister(region) {
            tracing::warn!("writer {}: failed to deregister: {err}", self.rank());
        }
    }

    fn release_buffers(&self, buffers: Vec<Option<(HostBuffer, Option<MemoryRegion>)>>) {
        for region in buffers.into_iter().flatten().filter_map(|(_, region)| region) {
            self.release_region(region);
        }
    }

    fn dispatch(&self, event: CqEvent) {
        let (context, error) = match event {
            CqEvent::Completed { context, .. } => (context, None),
            CqEvent::Failed { context, error } => (context, Some(error)),
            CqEvent::RemoteData { data, .. } => {
                tracing::warn!(
                    "writer {}: unexpected remote data {data:#x}",
                    self.rank()
                );
                return;
            }
        };
        let mut state = lock(&self.state);
        if let Some(entry) = state.ledger.entry_for_context(context) {
            entry.outstanding_writes = entry.outstanding_writes.saturating_sub(1);
            if let Some(error) = error {
                entry.failed_writes += 1;
                tracing::warn!(
                    "writer {}: push of step {} failed: {error}",
                    self.rank(),
                    entry.sequence
                );
            }
            return;
        }
        let read = state
            .pushes
            .values_mut()
            .filter_map(|push| push.selection_read.as_mut())
            .find(|read| read.contexts.contains(&context));
        match read {
            Some(read) => read.record(context, error),
            None => tracing::debug!(
                "writer {}: completion for unknown context {context}",
                self.rank()
            ),
        }
    }

    fn poll(&self) -> Result<()> {
        if let Some(event) = self.session.read_completion()? {
            self.dispatch(event);
        }
        Ok(())
    }

    /// Waits until every push posted for `sequence` has completed.
    fn complete_push(&self, sequence: i64) -> Result<()> {
        loop {
            {
                let state = lock(&self.state);
                let entry = state.ledger.get(sequence).ok_or_else(|| {
                    usage_violation(format!("timestep {sequence} is not published"))
                })?;
                if entry.outstanding_writes == 0 {
                    if entry.failed_writes > 0 {
                        tracing::warn!(
                            "writer {}: step {sequence} finished with {} failed pushes",
                            self.rank(),
                            entry.failed_writes
                        );
                    }
                    return Ok(());
                }
            }
            self.poll()?;
        }
    }

    fn advance_all(&self) -> Result<()> {
        let wsrs = lock(&self.wsrs).clone();
        for wsr in wsrs {
            self.advance(&wsr)?;
        }
        Ok(())
    }

    /// Moves one reader cohort's push state as far as it can go.
    fn advance(&self, wsr: &WsrShared) -> Result<()> {
        self.pull_selection(wsr)?;
        while let Some(batch) = self.plan_push(wsr)? {
            self.post_push(batch)?;
        }
        Ok(())
    }

    /// Pulls the readers' request logs once the pattern is locked on both
    /// sides. Returns whether the selection is available.
    fn pull_selection(&self, wsr: &WsrShared) -> Result<bool> {
        {
            let state = lock(&self.state);
            let Some(push) = state.pushes.get(&wsr.id) else {
                return Ok(false);
            };
            if push.phase != PushPhase::Unlocked {
                return Ok(true);
            }
            if push.locked_sequence.is_none() || push.selection_read.is_some() {
                return Ok(false);
            }
        }

        let mut descriptors = Vec::with_capacity(wsr.reader_cohort_size);
        for reader_rank in 0..wsr.reader_cohort_size {
            let raw = wsr
                .reader_roll
                .read_at(reader_rank * DESCRIPTOR_LEN, DESCRIPTOR_LEN);
            match RollDescriptor::decode(&raw)? {
                Some(descriptor) => descriptors.push(descriptor),
                None => {
                    tracing::trace!(
                        "writer {}: reader {reader_rank} has not posted its selection",
                        self.rank()
                    );
                    return Ok(false);
                }
            }
        }

        let mut reads = Vec::new();
        let mut buffers = Vec::with_capacity(descriptors.len());
        let strides = descriptors.iter().map(|d| d.slot_stride).collect();
        for (reader_rank, descriptor) in descriptors.iter().enumerate() {
            if descriptor.log_len == 0 {
                buffers.push(None);
                continue;
            }
            let buffer = HostBuffer::zeroed(descriptor.log_len as usize);
            let local = match self.session.register_local(
                buffer.addr(),
                buffer.size(),
                AccessFlags::READ,
            ) {
                Ok(local) => local,
                Err(err) => {
                    self.release_buffers(buffers);
                    return Err(err);
                }
            };
            reads.push(RmaOp {
                local_addr: buffer.addr(),
                len: buffer.size(),
                local_key: local.as_ref().and_then(MemoryRegion::desc),
                peer: wsr.reader_addrs[reader_rank],
                remote_addr: descriptor.log.block,
                remote_key: descriptor.log.key,
                context: 0,
            });
            buffers.push(Some((buffer, local)));
        }

        let first = {
            let mut state = lock(&self.state);
            let WriterState {
                pushes,
                next_context,
                ..
            } = &mut *state;
            match pushes.get_mut(&wsr.id) {
                Some(push) if push.phase == PushPhase::Unlocked && push.selection_read.is_none() => {
                    let first = *next_context;
                    *next_context += reads.len() as OpContext;
                    push.selection_read = Some(SelectionRead::new(
                        first..*next_context,
                        buffers,
                        strides,
                    ));
                    first
                }
                // Another caller claimed the pull.
                _ => {
                    self.release_buffers(buffers);
                    return Ok(false);
                }
            }
        };

        let mut post_error = None;
        for (i, read) in reads.into_iter().enumerate() {
            let context = first + i as OpContext;
            if post_error.is_none() {
                match self.session.post_read(RmaOp { context, ..read }) {
                    Ok(()) => continue,
                    Err(err) => post_error = Some(err),
                }
            }
            let mut state = lock(&self.state);
            if let Some(read) = state
                .pushes
                .get_mut(&wsr.id)
                .and_then(|push| push.selection_read.as_mut())
            {
                read.record(context, Some("selection read was not posted".into()));
            }
        }

        // Posted reads land in the buffers, so they stay alive until every
        // read has finished.
        loop {
            {
                let state = lock(&self.state);
                match state
                    .pushes
                    .get(&wsr.id)
                    .and_then(|push| push.selection_read.as_ref())
                {
                    Some(read) if !read.finished() => {}
                    _ => break,
                }
            }
            self.poll()?;
        }
        let read = lock(&self.state)
            .pushes
            .get_mut(&wsr.id)
            .and_then(|push| push.selection_read.take());
        let Some(read) = read else {
            return Ok(false);
        };
        if let Some(err) = post_error {
            self.release_buffers(read.buffers);
            return Err(err);
        }
        if let Some(failure) = read.failure {
            self.release_buffers(read.buffers);
            return Err(DataPlaneError::RemoteOperation(format!(
                "pulling reader selections failed: {failure}"
            )));
        }

        let mut selection = Vec::with_capacity(read.buffers.len());
        let mut decode_error = None;
        for (buffer, slot_stride) in read.buffers.into_iter().zip(read.strides) {
            let entries = match buffer {
                None => Vec::new(),
                Some((buffer, region)) => {
                    let decoded = decode_request_log(&buffer.to_vec());
                    if let Some(region) = region {
                        self.release_region(region);
                    }
                    match decoded {
                        Ok(entries) => entries,
                        Err(err) => {
                            decode_error.get_or_insert(err);
                            Vec::new()
                        }
                    }
                }
            };
            selection.push(RankSelection {
                entries,
                slot_stride,
            });
        }
        if let Some(err) = decode_error {
            return Err(err);
        }

        let total: usize = selection.iter().map(|s| s.entries.len()).sum();
        if let Some(push) = lock(&self.state).pushes.get_mut(&wsr.id) {
            push.selection = selection;
            push.phase = PushPhase::SelectionPulled;
        }
        tracing::info!(
            "writer {}: pulled {total} selected ranges from {} readers",
            self.rank(),
            wsr.reader_cohort_size
        );
        Ok(true)
    }

    /// Claims the oldest published step this cohort still wants, if its
    /// preload slot is free.
    fn plan_push(&self, wsr: &WsrShared) -> Result<Option<PushBatch>> {
        let writer_rank = self.rank();
        let local_mr_required = self.session.local_mr_required();
        let mut state = lock(&self.state);
        let WriterState {
            ledger,
            pushes,
            next_context,
            ..
        } = &mut *state;
        let Some(push) = pushes.get_mut(&wsr.id) else {
            return Ok(None);
        };
        if !push.ready_to_push() {
            return Ok(None);
        }
        for sequence in ledger.sequences() {
            if !push.wants(sequence) {
                continue;
            }
            let slot = slot_for(sequence);
            if let Some(occupant) = push.slot_occupant[slot] {
                if push.deferred.insert(sequence) {
                    tracing::debug!(
                        "writer {writer_rank}: deferring step {sequence}, slot {slot} still holds step {occupant}"
                    );
                }
                continue;
            }
            let Some(entry) = ledger.get_mut(sequence) else {
                continue;
            };
            let first = *next_context;
            let ops = build_push_ops(
                entry,
                &push.selection,
                &wsr.reader_addrs,
                writer_rank,
                slot,
                first,
                local_mr_required,
            )?;
            *next_context += ops.len() as OpContext;
            entry.push_contexts.push(first..*next_context);
            entry.outstanding_writes += ops.len();
            entry.slot = Some(slot);
            push.deferred.remove(&sequence);
            push.slot_occupant[slot] = Some(sequence);
            push.pushed.insert(sequence);
            push.phase = PushPhase::Preloading;
            return Ok(Some(PushBatch { sequence, ops }));
        }
        Ok(None)
    }

    fn post_push(&self, batch: PushBatch) -> Result<()> {
        let PushBatch { sequence, ops } = batch;
        let total = ops.len();
        for (i, (op, imm)) in ops.into_iter().enumerate() {
            if let Err(err) = self.session.post_write(op, Some(imm)) {
                if let Some(entry) = lock(&self.state).ledger.get_mut(sequence) {
                    let unposted = (total - i).min(entry.outstanding_writes);
                    entry.outstanding_writes -= unposted;
                    entry.failed_writes += unposted;
                }
                return Err(err);
            }
        }
        tracing::trace!(
            "writer {}: pushed {total} ranges of step {sequence}",
            self.rank()
        );
        Ok(())
    }

    /// Waits out pushes still in flight for a cohort and drops its state.
    fn destroy_wsr(&self, wsr: &WsrShared) -> Result<()> {
        let in_flight: Vec<i64> = {
            let state = lock(&self.state);
            match state.pushes.get(&wsr.id) {
                Some(push) => push
                    .pushed
                    .iter()
                    .copied()
                    .filter(|sequence| state.ledger.get(*sequence).is_some())
                    .collect(),
                None => Vec::new(),
            }
        };
        for sequence in in_flight {
            self.complete_push(sequence)?;
        }
        lock(&self.wsrs).retain(|other| other.id != wsr.id);
        let push = lock(&self.state).pushes.remove(&wsr.id);
        if let Some(read) = push.and_then(|push| push.selection_read) {
            self.release_buffers(read.buffers);
        }
        if let Some(region) = lock(&wsr.roll_region).take() {
            self.session.deregister(region)?;
        }
        tracing::debug!(
            "writer {}: released reader cohort {}",
            self.rank(),
            wsr.id
        );
        Ok(())
    }
}

/// Writer side of one stream.
#[derive(Debug, Clone)]
pub struct WriterStream {
    shared: Arc<WriterShared>,
}

impl WriterStream {
    pub fn init(
        provider: &dyn FabricProvider,
        services: Arc<dyn ControlPlaneServices>,
        params: &DataPlaneParams,
    ) -> Result<Self> {
        let session = FabricSession::open(provider, params)?;
        let shared = Arc::new(WriterShared {
            services,
            session,
            wsrs: Mutex::new(Vec::new()),
            state: Mutex::new(WriterState {
                ledger: TimestepLedger::new(),
                pushes: HashMap::new(),
                def_locked: None,
                next_context: 0,
                next_wsr: 1,
            }),
        });
        tracing::debug!(
            "writer {} initialized on {}",
            shared.rank(),
            shared.session.info().domain_name
        );
        Ok(Self { shared })
    }

    pub fn rank(&self) -> usize {
        self.shared.rank()
    }

    /// Connects a reader cohort: resolves every reader's address and posts
    /// the reader roll they will describe their selections in.
    pub fn init_writer_per_reader(
        &self,
        reader_cohort_size: usize,
        readers: &[ReaderContactInfo],
    ) -> Result<(WriterPerReader, WriterContactInfo)> {
        if readers.len() != reader_cohort_size {
            return Err(usage_violation(format!(
                "{} reader contacts for a cohort of {reader_cohort_size}",
                readers.len()
            )));
        }
        let session = &self.shared.session;
        let reader_addrs = readers
            .iter()
            .map(|reader| session.insert_address(&reader.address))
            .collect::<Result<Vec<_>>>()?;
        let reader_roll = HostBuffer::zeroed(reader_cohort_size * DESCRIPTOR_LEN);
        let roll_region = session.register(
            reader_roll.addr(),
            reader_roll.size(),
            AccessFlags::REMOTE_WRITE,
        )?;
        let roll_handle = roll_region.handle();
        let id = {
            let mut state = lock(&self.shared.state);
            let id = state.next_wsr;
            state.next_wsr += 1;
            state.pushes.insert(id, WsrPushState::new());
            id
        };
        let wsr = Arc::new(WsrShared {
            id,
            reader_cohort_size,
            reader_addrs,
            reader_roll,
            roll_region: Mutex::new(Some(roll_region)),
        });
        lock(&self.shared.wsrs).push(wsr.clone());
        tracing::debug!(
            "writer {}: connected reader cohort {id} of {reader_cohort_size}",
            self.rank()
        );
        let contact = WriterContactInfo {
            stream_id: id,
            address: session.address(),
            reader_roll: roll_handle,
        };
        Ok((
            WriterPerReader {
                writer: self.shared.clone(),
                wsr,
            },
            contact,
        ))
    }

    /// Registers `data` as step `sequence` and pushes it to every cohort
    /// with a locked pattern whose slot is free.
    ///
    /// The step is published even if pushing it fails.
    pub fn provide_timestep(&self, data: Arc<dyn LocalMemory>, sequence: i64) -> Result<BufferHandle> {
        let region = self.shared.session.register(
            data.addr(),
            data.size(),
            AccessFlags::REMOTE_READ | AccessFlags::WRITE,
        )?;
        let published = lock(&self.shared.state)
            .ledger
            .publish(sequence, data, region);
        let handle = match published {
            Ok(handle) => handle,
            Err((region, err)) => {
                self.shared.release_region(region);
                return Err(err);
            }
        };
        tracing::debug!("writer {}: published step {sequence}", self.rank());
        self.shared.advance_all()?;
        Ok(handle)
    }

    /// Waits until every push posted for `sequence` has completed.
    pub fn complete_push(&self, sequence: i64) -> Result<()> {
        self.shared.complete_push(sequence)
    }

    /// Retires step `sequence`: waits out its pushes, deregisters its
    /// memory and lets deferred steps move into the freed slots.
    pub fn release_timestep(&self, sequence: i64) -> Result<()> {
        self.shared.complete_push(sequence).inspect_err(|e| {
            tracing::error!("writer {}: cannot release step {sequence}: {e}", self.rank());
        })?;
        let entry = {
            let mut state = lock(&self.shared.state);
            let entry = state.ledger.take(sequence)?;
            for push in state.pushes.values_mut() {
                push.forget(sequence);
            }
            entry
        };
        self.shared.session.deregister(entry.region)?;
        tracing::debug!("writer {}: released step {sequence}", self.rank());
        self.shared.advance_all()
    }

    /// Steps still published, oldest first.
    pub fn published_timesteps(&self) -> Vec<i64> {
        lock(&self.shared.state).ledger.sequences()
    }

    /// Releases every step and cohort and closes the fabric.
    pub fn destroy(&self) -> Result<()> {
        let wsrs: Vec<_> = lock(&self.shared.wsrs).clone();
        for wsr in wsrs {
            self.shared.destroy_wsr(&wsr)?;
        }
        for sequence in self.published_timesteps() {
            self.shared.complete_push(sequence)?;
        }
        let entries = lock(&self.shared.state).ledger.drain();
        for entry in entries {
            self.shared.release_region(entry.region);
        }
        self.shared.session.close()?;
        tracing::debug!("writer {} destroyed", self.rank());
        Ok(())
    }

    pub fn live_regions(&self) -> usize {
        self.shared.session.live_regions()
    }
}

/// A writer's connection to one reader cohort.
#[derive(Debug, Clone)]
pub struct WriterPerReader {
    writer: Arc<WriterShared>,
    wsr: Arc<WsrShared>,
}

impl WriterPerReader {
    pub fn id(&self) -> u64 {
        self.wsr.id
    }

    pub fn reader_cohort_size(&self) -> usize {
        self.wsr.reader_cohort_size
    }

    /// Records that the reader cohort registered interest in `sequence`.
    /// The first registration with preload requested becomes the writer's
    /// default lock point.
    pub fn reader_register_timestep(&self, sequence: i64, mode: PreloadMode) -> Result<()> {
        {
            let mut state = lock(&self.writer.state);
            if mode.is_enabled() && state.def_locked.is_none() {
                state.def_locked = Some(sequence);
                if let Some(push) = state.pushes.get_mut(&self.wsr.id) {
                    if push.locked_sequence.is_some() && !push.preload_enabled {
                        tracing::info!(
                            "writer {}: enabling preload for reader cohort {}",
                            self.writer.rank(),
                            self.wsr.id
                        );
                        push.preload_enabled = true;
                    }
                }
            }
        }
        self.writer.advance(&self.wsr)
    }

    /// The reader cohort locked its pattern at step `effective`; steps after
    /// it are pushed once the selections have been pulled.
    pub fn read_pattern_locked(&self, effective: i64) -> Result<()> {
        {
            let mut state = lock(&self.writer.state);
            let push = state.pushes.get_mut(&self.wsr.id).ok_or_else(|| {
                usage_violation(format!("reader cohort {} is not connected", self.wsr.id))
            })?;
            if let Some(locked) = push.locked_sequence {
                return Err(usage_violation(format!(
                    "reader cohort {} already locked its pattern at step {locked}",
                    self.wsr.id
                )));
            }
            push.locked_sequence = Some(effective);
            push.preload_enabled = true;
        }
        tracing::info!(
            "writer {}: reader cohort {} locked its pattern at step {effective}",
            self.writer.rank(),
            self.wsr.id
        );
        self.writer.advance(&self.wsr)
    }

    /// Pulls the cohort's selections if every reader has posted one.
    /// Returns whether the selections are available.
    pub fn pull_selection(&self) -> Result<bool> {
        self.writer.pull_selection(&self.wsr)
    }

    /// The reader cohort is done with `sequence`: its slot is freed for the
    /// next step that maps there.
    pub fn release_timestep(&self, sequence: i64) -> Result<()> {
        let in_flight = {
            let state = lock(&self.writer.state);
            state
                .pushes
                .get(&self.wsr.id)
                .is_some_and(|push| push.pushed.contains(&sequence))
                && state.ledger.get(sequence).is_some()
        };
        if in_flight {
            self.writer.complete_push(sequence)?;
        }
        if let Some(push) = lock(&self.writer.state).pushes.get_mut(&self.wsr.id) {
            push.release_slot(sequence);
        }
        self.writer.advance(&self.wsr)
    }

    pub fn phase(&self) -> Option<PushPhase> {
        lock(&self.writer.state)
            .pushes
            .get(&self.wsr.id)
            .map(|push| push.phase)
    }

    /// Whether a pushed step still holds double-buffer `slot`.
    pub fn preload_used(&self, slot: usize) -> bool {
        lock(&self.writer.state)
            .pushes
            .get(&self.wsr.id)
            .is_some_and(|push| push.preload_used(slot))
    }

    /// Steps waiting for their slot to free up.
    pub fn deferred_timesteps(&self) -> Vec<i64> {
        lock(&self.writer.state)
            .pushes
            .get(&self.wsr.id)
            .map(|push| push.deferred.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn destroy(&self) -> Result<()> {
        self.writer.destroy_wsr(&self.wsr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::LoopbackFabric;
    use crate::services::StaticServices;

    fn writer(fabric: &LoopbackFabric) -> anyhow::Result<WriterStream> {
        let services = Arc::new(StaticServices {
            rank: 0,
            cohort_size: 1,
        });
        Ok(WriterStream::init(fabric, services, &DataPlaneParams::default())?)
    }

    #[test]
    fn test_duplicate_publish_is_rejected() -> anyhow::Result<()> {
        let fabric = LoopbackFabric::new();
        let writer = writer(&fabric)?;
        let data: Arc<dyn LocalMemory> = Arc::new(HostBuffer::zeroed(16));
        writer.provide_timestep(data.clone(), 4)?;
        assert!(matches!(
            writer.provide_timestep(data, 4),
            Err(DataPlaneError::UsageViolation(_))
        ));
        assert_eq!(writer.live_regions(), 1);
        assert_eq!(writer.published_timesteps(), vec![4]);
        writer.release_timestep(4)?;
        assert_eq!(writer.live_regions(), 0);
        Ok(())
    }

    #[test]
    fn test_publish_raw_memory() -> anyhow::Result<()> {
        let fabric = LoopbackFabric::new();
        let writer = writer(&fabric)?;
        let bytes = vec![7u8; 32];
        let raw: Arc<dyn LocalMemory> =
            Arc::new(crate::RawLocalMemory::new(bytes.as_ptr() as usize, bytes.len()));
        let handle = writer.provide_timestep(raw, 1)?;
        assert_eq!(handle.block, bytes.as_ptr() as u64);
        writer.release_timestep(1)?;
        writer.destroy()?;
        assert_eq!(fabric.open_endpoints(), 0);
        Ok(())
    }

    #[test]
    fn test_release_unknown_step() -> anyhow::Result<()> {
        let fabric = LoopbackFabric::new();
        let writer = writer(&fabric)?;
        assert!(matches!(
            writer.release_timestep(9),
            Err(DataPlaneError::UsageViolation(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unposted_roll_defers_the_pull() -> anyhow::Result<()> {
        let fabric = LoopbackFabric::new();
        let writer = writer(&fabric)?;
        let readers = vec![ReaderContactInfo {
            stream_id: 1,
            address: 77u64.to_le_bytes().to_vec(),
        }];
        assert!(writer.init_writer_per_reader(2, &readers).is_err());
        let (wsr, contact) = writer.init_writer_per_reader(1, &readers)?;
        assert_eq!(contact.stream_id, wsr.id());
        assert_eq!(contact.address, 1u64.to_le_bytes().to_vec());

        wsr.read_pattern_locked(0)?;
        assert!(wsr.read_pattern_locked(1).is_err());
        assert!(!wsr.pull_selection()?);
        assert_eq!(wsr.phase(), Some(PushPhase::Unlocked));

        wsr.destroy()?;
        assert_eq!(wsr.phase(), None);
        assert_eq!(writer.live_regions(), 0);
        writer.destroy()?;
        Ok(())
    }
}
