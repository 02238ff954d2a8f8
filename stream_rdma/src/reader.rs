/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reader stream: pulls ranges of published steps, records the access
//! pattern, and after the pattern locks receives later steps by push.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use serde::Deserialize;
use serde::Serialize;

use crate::LocalMemory;
use crate::config::DataPlaneParams;
use crate::error::DataPlaneError;
use crate::error::Failure;
use crate::error::Result;
use crate::error::usage_violation;
use crate::fabric::AccessFlags;
use crate::fabric::CqEvent;
use crate::fabric::FabricAddr;
use crate::fabric::FabricProvider;
use crate::fabric::RmaOp;
use crate::fabric::session::FabricSession;
use crate::imm::MAX_REQUESTS_PER_RANK;
use crate::imm::MAX_WRITER_RANKS;
use crate::imm::PushTag;
use crate::imm::slot_for;
use crate::pull::Completion;
use crate::pull::CompletionHandle;
use crate::pull::OutstandingOps;
use crate::pull::RemoteOp;
use crate::push::PreloadTicket;
use crate::push::ReaderPreload;
use crate::push::SlotState;
use crate::registry::BufferHandle;
use crate::registry::MemoryRegion;
use crate::services::ControlPlaneServices;
use crate::step_log::AccessPatternRecorder;
use crate::step_log::DESCRIPTOR_LEN;
use crate::step_log::RollDescriptor;
use crate::step_log::StepLog;
use crate::step_log::encode_request_log;
use crate::utils::HostBuffer;
use crate::utils::lock;
use crate::writer::WriterContactInfo;

/// What a reader rank tells the writer cohort about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderContactInfo {
    pub stream_id: u64,
    /// Fabric endpoint name.
    pub address: Vec<u8>,
}

/// One range of one writer rank's data for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub rank: usize,
    pub sequence: i64,
    pub offset: u64,
    pub length: u64,
}

impl ReadRequest {
    pub fn new(rank: usize, sequence: i64, offset: u64, length: u64) -> Self {
        Self {
            rank,
            sequence,
            offset,
            length,
        }
    }
}

#[derive(Debug)]
struct WriterCohort {
    contacts: Vec<WriterContactInfo>,
    addrs: Vec<FabricAddr>,
}

#[derive(Debug, Default)]
struct ReaderState {
    recorder: Option<AccessPatternRecorder>,
    preload: Option<ReaderPreload>,
}

#[derive(Debug)]
pub(crate) struct ReaderShared {
    services: Arc<dyn ControlPlaneServices>,
    session: FabricSession,
    writers: OnceLock<WriterCohort>,
    outstanding: Mutex<OutstandingOps>,
    failed_ranks: Mutex<HashSet<usize>>,
    state: Mutex<ReaderState>,
}

impl ReaderShared {
    fn rank(&self) -> usize {
        self.services.rank()
    }

    fn release_region(&self, region: MemoryRegion) {
        if let Err(err) = self.session.deregister(region) {
            tracing::warn!("reader {}: failed to deregister: {err}", self.rank());
        }
    }

    pub(crate) fn outcome(
        &self,
        completion: &Completion,
    ) -> Option<std::result::Result<(), Failure>> {
        match completion {
            Completion::Pull(op) => op.outcome(),
            Completion::Preload(ticket) => match &lock(&self.state).preload {
                Some(preload) => preload.outcome(ticket),
                None => Some(Err(Failure::Protocol(
                    "preload state torn down while a consumer was waiting".into(),
                ))),
            },
        }
    }

    pub(crate) fn wait(&self, completion: &Completion) -> Result<()> {
        loop {
            if let Some(outcome) = self.outcome(completion) {
                return outcome.map_err(DataPlaneError::from);
            }
            if let Some(event) = self.session.read_completion()? {
                self.dispatch(event);
            }
        }
    }

    fn dispatch(&self, event: CqEvent) {
        match event {
            CqEvent::Completed { context, len } => {
                let op = lock(&self.outstanding).remove(context);
                match op {
                    Some(op) => {
                        tracing::trace!(
                            "reader {}: op {context} from rank {} done ({len} of {} bytes)",
                            self.rank(),
                            op.rank,
                            op.length
                        );
                        if let Some(region) = op.complete() {
                            self.release_region(region);
                        }
                    }
                    None => tracing::debug!(
                        "reader {}: completion for unknown context {context}",
                        self.rank()
                    ),
                }
            }
            CqEvent::Failed { context, error } => {
                let op = lock(&self.outstanding).remove(context);
                match op {
                    Some(op) => {
                        tracing::warn!(
                            "reader {}: operation against rank {} failed: {error}",
                            self.rank(),
                            op.rank
                        );
                        if let Some(region) = op.fail(Failure::Remote(error)) {
                            self.release_region(region);
                        }
                    }
                    None => tracing::debug!(
                        "reader {}: failure for unknown context {context}: {error}",
                        self.rank()
                    ),
                }
            }
            CqEvent::RemoteData { data, .. } => {
                let tag = PushTag::decode(data);
                match lock(&self.state).preload.as_mut() {
                    Some(preload) => preload.arrive(tag),
                    None => tracing::warn!(
                        "reader {}: push {tag:?} arrived with no preload posted",
                        self.rank()
                    ),
                }
            }
        }
    }

    /// Takes every completion already queued, without blocking.
    fn progress(&self) -> Result<usize> {
        let mut count = 0;
        while let Some(event) = self.session.try_read_completion()? {
            self.dispatch(event);
            count += 1;
        }
        Ok(count)
    }

    /// Posts one operation tracked in the outstanding table.
    fn post(
        &self,
        op: Arc<RemoteOp>,
        mut rma: RmaOp,
        imm: Option<u32>,
        write: bool,
    ) -> Result<()> {
        rma.context = lock(&self.outstanding).insert(op.clone());
        let posted = if write {
            self.session.post_write(rma, imm)
        } else {
            self.session.post_read(rma)
        };
        if let Err(err) = posted {
            lock(&self.outstanding).remove(rma.context);
            if let Some(region) = op.fail(Failure::Remote(err.to_string())) {
                self.release_region(region);
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Reader side of one stream.
#[derive(Debug, Clone)]
pub struct ReaderStream {
    shared: Arc<ReaderShared>,
}

impl ReaderStream {
    /// Opens the fabric and returns the stream with the contact record to
    /// share with the writer cohort.
    pub fn init(
        provider: &dyn FabricProvider,
        services: Arc<dyn ControlPlaneServices>,
        params: &DataPlaneParams,
    ) -> Result<(Self, ReaderContactInfo)> {
        let session = FabricSession::open(provider, params)?;
        let address = session.address();
        let shared = Arc::new(ReaderShared {
            services,
            session,
            writers: OnceLock::new(),
            outstanding: Mutex::new(OutstandingOps::default()),
            failed_ranks: Mutex::new(HashSet::new()),
            state: Mutex::new(ReaderState::default()),
        });
        let stream = Self { shared };
        let contact = ReaderContactInfo {
            stream_id: stream.stream_id(),
            address,
        };
        tracing::debug!(
            "reader {} initialized on {}",
            stream.rank(),
            stream.shared.session.info().domain_name
        );
        Ok((stream, contact))
    }

    pub fn rank(&self) -> usize {
        self.shared.rank()
    }

    pub fn stream_id(&self) -> u64 {
        Arc::as_ptr(&self.shared) as usize as u64
    }

    /// Records the writer cohort's contact information. Must precede reads.
    pub fn provide_writer_data(
        &self,
        writer_cohort_size: usize,
        writers: &[WriterContactInfo],
    ) -> Result<()> {
        if writers.len() != writer_cohort_size {
            return Err(usage_violation(format!(
                "{} writer contacts for a cohort of {writer_cohort_size}",
                writers.len()
            )));
        }
        if self.shared.writers.get().is_some() {
            return Err(usage_violation("writer contact information already provided"));
        }
        let addrs = writers
            .iter()
            .map(|writer| self.shared.session.insert_address(&writer.address))
            .collect::<Result<Vec<_>>>()?;
        self.shared
            .writers
            .set(WriterCohort {
                contacts: writers.to_vec(),
                addrs,
            })
            .map_err(|_| usage_violation("writer contact information already provided"))?;
        lock(&self.shared.state).recorder = Some(AccessPatternRecorder::new(writer_cohort_size));
        tracing::debug!(
            "reader {} connected to {writer_cohort_size} writers",
            self.rank()
        );
        Ok(())
    }

    fn cohort(&self) -> Result<&WriterCohort> {
        self.shared
            .writers
            .get()
            .ok_or_else(|| usage_violation("writer contact information has not been provided"))
    }

    /// Fetches `request.length` bytes at `request.offset` of writer
    /// `request.rank`'s step into the start of `buffer`.
    ///
    /// Steps after a locked pattern are served from the preload buffer when
    /// the range is part of the pattern; everything else is pulled.
    pub fn read_remote_memory(
        &self,
        request: ReadRequest,
        buffer: Arc<dyn LocalMemory>,
        info: &BufferHandle,
    ) -> Result<CompletionHandle> {
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
        let cohort = self.cohort()?;
        let peer = *cohort.addrs.get(rank).ok_or_else(|| {
            usage_violation(format!(
                "writer rank {rank} outside a cohort of {}",
                cohort.addrs.len()
            ))
        })?;
        if lock(&self.shared.failed_ranks).contains(&rank) {
            return Err(DataPlaneError::PeerFailure { rank });
        }

        {
            let mut state = lock(&self.shared.state);
            let ReaderState { recorder, preload } = &mut *state;
            match preload {
                Some(preload) if preload.covers(sequence) => {
                    if let Some(index) = preload.lookup(rank, offset, length) {
                        let ticket = PreloadTicket {
                            sequence,
                            slot: slot_for(sequence),
                            rank,
                            index,
                        };
                        if !preload.already_delivered(&ticket) {
                            return match preload.request(ticket, buffer) {
                                SlotState::Failed(failure) => Err(failure.into()),
                                SlotState::Ready | SlotState::Waiting => Ok(CompletionHandle {
                                    reader: self.shared.clone(),
                                    completion: Completion::Preload(ticket),
                                }),
                            };
                        }
                    }
                    tracing::debug!(
                        "reader {}: step {sequence} range {offset}+{length} of rank {rank} is not preloaded, pulling",
                        self.rank()
                    );
                }
                Some(_) => {}
                None => {
                    if let Some(recorder) = recorder.as_mut() {
                        recorder.log_request(sequence, rank, offset, length)?;
                    }
                }
            }
        }

        let local = self.shared.session.register_local(
            buffer.addr(),
            length as usize,
            AccessFlags::READ,
        )?;
        let rma = RmaOp {
            local_addr: buffer.addr(),
            len: length as usize,
            local_key: local.as_ref().and_then(MemoryRegion::desc),
            peer,
            remote_addr: info.block + offset,
            remote_key: info.key,
            context: 0,
        };
        let op = RemoteOp::new(rank, length as usize, Some(buffer), local);
        self.shared.post(op.clone(), rma, None, false)?;
        tracing::trace!(
            "reader {}: pulling {length} bytes at {offset} of step {sequence} from rank {rank}",
            self.rank()
        );
        Ok(CompletionHandle {
            reader: self.shared.clone(),
            completion: Completion::Pull(op),
        })
    }

    /// Blocks until `handle` resolves.
    pub fn wait_for_completion(&self, handle: CompletionHandle) -> Result<()> {
        handle.wait()
    }

    /// Dispatches every completion already queued and returns how many.
    pub fn progress(&self) -> Result<usize> {
        self.shared.progress()
    }

    pub fn is_preloading(&self) -> bool {
        lock(&self.shared.state).preload.is_some()
    }

    /// Freezes the log of step `effective` as the template for every later
    /// step, posts the preload buffer and publishes one reader-roll
    /// descriptor per writer rank.
    pub fn lock_pattern(&self, effective: i64) -> Result<()> {
        let cohort = self.cohort()?;
        let reader_rank = self.rank();
        let posted;
        {
            let mut state = lock(&self.shared.state);
            if let Some(preload) = &state.preload {
                return Err(usage_violation(format!(
                    "read pattern already locked at step {}",
                    preload.locked_sequence
                )));
            }
            let template = {
                let recorder = state.recorder.as_ref().ok_or_else(|| {
                    usage_violation("read pattern locked before writer contact information")
                })?;
                let log = recorder.step(effective).ok_or_else(|| {
                    usage_violation(format!("no requests were logged for step {effective}"))
                })?;
                check_template(log, cohort.addrs.len())?;
                log.clone()
            };
            let (preload, descriptors) = self.build_preload(effective, template)?;
            match self.post_descriptors(cohort, &descriptors) {
                Ok(ops) => posted = ops,
                Err(err) => {
                    for region in preload.into_regions() {
                        self.shared.release_region(region);
                    }
                    return Err(err);
                }
            }
            if let Some(recorder) = state.recorder.as_mut() {
                recorder.freeze(effective);
            }
            state.preload = Some(preload);
        }
        for op in posted {
            self.shared.wait(&Completion::Pull(op))?;
        }
        tracing::info!(
            "reader {reader_rank}: read pattern locked at step {effective}, preloading later steps"
        );
        Ok(())
    }

    /// Writes descriptor `i` into this rank's slot of writer `i`'s reader roll.
    fn post_descriptors(
        &self,
        cohort: &WriterCohort,
        descriptors: &[RollDescriptor],
    ) -> Result<Vec<Arc<RemoteOp>>> {
        let reader_rank = self.rank();
        let mut posted = Vec::with_capacity(descriptors.len());
        for (writer_rank, descriptor) in descriptors.iter().enumerate() {
            let roll = cohort.contacts[writer_rank].reader_roll;
            let staging = Arc::new(HostBuffer::from_slice(&descriptor.encode()));
            let local = self.shared.session.register_local(
                staging.addr(),
                DESCRIPTOR_LEN,
                AccessFlags::WRITE,
            )?;
            let rma = RmaOp {
                local_addr: staging.addr(),
                len: DESCRIPTOR_LEN,
                local_key: local.as_ref().and_then(MemoryRegion::desc),
                peer: cohort.addrs[writer_rank],
                remote_addr: roll.block + (reader_rank * DESCRIPTOR_LEN) as u64,
                remote_key: roll.key,
                context: 0,
            };
            let op = RemoteOp::new(writer_rank, DESCRIPTOR_LEN, Some(staging), local);
            self.shared.post(op.clone(), rma, None, true)?;
            posted.push(op);
        }
        Ok(posted)
    }

    fn build_preload(
        &self,
        effective: i64,
        mut template: StepLog,
    ) -> Result<(ReaderPreload, Vec<RollDescriptor>)> {
        let session = &self.shared.session;
        let layout = template.preload_layout();
        let buffer = HostBuffer::zeroed(layout.buffer_len() as usize);
        let region = session.register(buffer.addr(), buffer.size(), AccessFlags::REMOTE_WRITE)?;
        template.assign_preload(&layout, region.handle());

        let mut logs = Vec::with_capacity(template.ranks().len());
        let mut descriptors = Vec::with_capacity(template.ranks().len());
        for rank_log in template.ranks() {
            let encoded = encode_request_log(rank_log.entries());
            let log_buffer = HostBuffer::from_slice(&encoded);
            let log_region = if encoded.is_empty() {
                None
            } else {
                match session.register(log_buffer.addr(), log_buffer.size(), AccessFlags::REMOTE_READ) {
                    Ok(log_region) => Some(log_region),
                    Err(err) => {
                        self.shared.release_region(region);
                        for registered in logs.into_iter().filter_map(|(_, r)| r) {
                            self.shared.release_region(registered);
                        }
                        return Err(err);
                    }
                }
            };
            descriptors.push(RollDescriptor {
                log: log_region
                    .as_ref()
                    .map(MemoryRegion::handle)
                    .unwrap_or_default(),
                log_len: encoded.len() as u64,
                slot_stride: layout.slot_stride,
                locked_sequence: effective,
            });
            logs.push((log_buffer, log_region));
        }
        tracing::debug!(
            "reader {}: preload buffer of {} bytes for {} entries",
            self.rank(),
            layout.buffer_len(),
            template.total_entries()
        );
        Ok((
            ReaderPreload::new(effective, buffer, region, template, &layout, logs),
            descriptors,
        ))
    }

    /// Marks step `sequence` consumed and resets the preload slot the step
    /// used.
    ///
    /// Every step after the locked one is pushed, so this first drives the
    /// completion queue until the step's pushes from live writer ranks have
    /// all landed, whether or not they were read.
    pub fn release_timestep(&self, sequence: i64) -> Result<()> {
        self.shared.progress()?;
        let slot = slot_for(sequence);
        loop {
            let failed = lock(&self.shared.failed_ranks).clone();
            let awaiting = match &lock(&self.shared.state).preload {
                Some(preload) if preload.covers(sequence) => {
                    preload.awaiting_pushes(slot, sequence, &failed)
                }
                _ => return Ok(()),
            };
            if awaiting == 0 {
                break;
            }
            tracing::trace!(
                "reader {}: release of step {sequence} waiting on {awaiting} pushes",
                self.rank()
            );
            if let Some(event) = self.shared.session.read_completion()? {
                self.shared.dispatch(event);
            }
        }
        if let Some(preload) = lock(&self.shared.state).preload.as_mut() {
            preload.release_slot(slot, sequence);
        }
        Ok(())
    }

    /// Fails everything outstanding against `rank` and refuses further
    /// reads from it.
    pub fn notify_conn_failure(&self, rank: usize) {
        tracing::warn!("reader {}: writer rank {rank} failed", self.rank());
        lock(&self.shared.failed_ranks).insert(rank);
        let abandoned = lock(&self.shared.outstanding).abandon_rank(rank, &Failure::Peer(rank));
        if abandoned > 0 {
            tracing::debug!(
                "reader {}: {abandoned} operations against rank {rank} stay posted until the fabric reports them",
                self.rank()
            );
        }
        if let Some(preload) = lock(&self.shared.state).preload.as_mut() {
            preload.fail_rank(rank);
        }
    }

    /// Fails anything still outstanding, releases every registration and
    /// closes the fabric.
    pub fn destroy(&self) -> Result<()> {
        let destroyed = Failure::Remote("reader stream destroyed".into());
        lock(&self.shared.outstanding).abandon_all(&destroyed);
        let preload = lock(&self.shared.state).preload.take();
        if let Some(preload) = preload {
            for region in preload.into_regions() {
                self.shared.release_region(region);
            }
        }
        self.shared.session.close()?;
        // Nothing left in the table can complete on a closed fabric.
        let ops = lock(&self.shared.outstanding).drain();
        for op in ops {
            if let Some(region) = op.fail(destroyed.clone()) {
                self.shared.release_region(region);
            }
        }
        tracing::debug!("reader {} destroyed", self.rank());
        Ok(())
    }

    /// Registrations this stream still holds.
    pub fn live_regions(&self) -> usize {
        self.shared.session.live_regions()
    }
}

/// Rejects templates that the push path cannot address.
fn check_template(log: &StepLog, writer_cohort_size: usize) -> Result<()> {
    if log.is_empty() {
        return Err(usage_violation(format!(
            "step {} logged no requests to lock",
            log.sequence()
        )));
    }
    if writer_cohort_size > MAX_WRITER_RANKS {
        return Err(usage_violation(format!(
            "{writer_cohort_size} writer ranks exceed the {MAX_WRITER_RANKS} a push can address"
        )));
    }
    if let Some((rank, rank_log)) = log
        .ranks()
        .iter()
        .enumerate()
        .find(|(_, rank_log)| rank_log.len() > MAX_REQUESTS_PER_RANK)
    {
        return Err(usage_violation(format!(
            "{} requests to writer rank {rank} exceed the {MAX_REQUESTS_PER_RANK} a push can address",
            rank_log.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::loopback::LoopbackFabric;
    use crate::services::StaticServices;

    fn reader(fabric: &LoopbackFabric) -> anyhow::Result<ReaderStream> {
        let services = Arc::new(StaticServices {
            rank: 0,
            cohort_size: 1,
        });
        let (reader, contact) = ReaderStream::init(fabric, services, &DataPlaneParams::default())?;
        assert_eq!(contact.stream_id, reader.stream_id());
        Ok(reader)
    }

    #[test]
    fn test_read_before_writer_data_is_rejected() -> anyhow::Result<()> {
        let fabric = LoopbackFabric::new();
        let reader = reader(&fabric)?;
        let buffer: Arc<dyn LocalMemory> = Arc::new(HostBuffer::zeroed(4));
        let err = reader
            .read_remote_memory(ReadRequest::new(0, 0, 0, 4), buffer, &BufferHandle::default())
            .unwrap_err();
        assert!(matches!(err, DataPlaneError::UsageViolation(_)));
        Ok(())
    }

    #[test]
    fn test_check_template_limits() {
        let empty = StepLog::new(0, 1);
        assert!(check_template(&empty, 1).is_err());

        let mut crowded = StepLog::new(0, 1);
        for i in 0..=MAX_REQUESTS_PER_RANK as u64 {
            crowded.log_request(0, i, 1).unwrap();
        }
        assert!(check_template(&crowded, 1).is_err());

        let mut fine = StepLog::new(0, 2);
        fine.log_request(1, 0, 8).unwrap();
        assert!(check_template(&fine, 2).is_ok());
        assert!(check_template(&fine, MAX_WRITER_RANKS + 1).is_err());
    }

    #[test]
    fn test_lock_without_log_changes_nothing() -> anyhow::Result<()> {
        let fabric = LoopbackFabric::new();
        let reader = reader(&fabric)?;
        reader.provide_writer_data(
            1,
            &[WriterContactInfo {
                stream_id: 1,
                address: 99u64.to_le_bytes().to_vec(),
                reader_roll: BufferHandle::default(),
            }],
        )?;
        assert!(matches!(
            reader.lock_pattern(3),
            Err(DataPlaneError::UsageViolation(_))
        ));
        assert!(!reader.is_preloading());
        assert_eq!(reader.live_regions(), 0);
        reader.destroy()?;
        Ok(())
    }
}
