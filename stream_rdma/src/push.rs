/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Push path.
//!
//! Once a reader has locked its read pattern, writers RDMA-write each later
//! step's requested ranges straight into the reader's double-buffered
//! preload region. Each write carries a [`PushTag`] naming the entry it
//! filled.
//!
//! On the reader, every (slot, writer rank, entry) has a signed counter that
//! starts at zero. A push arrival decrements it and a consumer request
//! increments it, so whichever comes second sees zero and performs the copy
//! into the consumer's buffer:
//!
//! - arrival first: 0 -> -1, then the request takes -1 -> 0 and copies.
//! - request first: 0 -> 1 and the consumer waits, then the arrival takes
//!   1 -> 0 and copies.

use std::collections::BTreeSet;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use crate::LocalMemory;
use crate::error::Failure;
use crate::error::Result;
use crate::error::usage_violation;
use crate::fabric::FabricAddr;
use crate::fabric::OpContext;
use crate::fabric::RmaOp;
use crate::imm::PushTag;
use crate::ledger::TimestepEntry;
use crate::registry::MemoryRegion;
use crate::step_log::PreloadLayout;
use crate::step_log::RequestLogEntry;
use crate::step_log::StepLog;
use crate::utils::HostBuffer;
use crate::utils::copy_memory;

/// Identifies the preload entry a consumer is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreloadTicket {
    pub sequence: i64,
    pub slot: usize,
    pub rank: usize,
    pub index: usize,
}

/// Result of a consumer request against a preload entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SlotState {
    /// Data was already there and has been copied out.
    Ready,
    /// The push has not arrived yet.
    Waiting,
    Failed(Failure),
}

#[derive(Debug, Default)]
struct PreloadSlot {
    pending: i32,
    consumer: Option<(Arc<dyn LocalMemory>, i64)>,
    failure: Option<Failure>,
    delivered: Option<i64>,
}

/// Reader-side receive state for a locked pattern.
#[derive(Debug)]
pub(crate) struct ReaderPreload {
    pub locked_sequence: i64,
    buffer: HostBuffer,
    region: MemoryRegion,
    slot_stride: u64,
    template: StepLog,
    // [rank][index] -> (offset within a slot, length)
    entries: Vec<Vec<(u64, u64)>>,
    // [slot][rank][index]
    slots: [Vec<Vec<PreloadSlot>>; 2],
    // Encoded request logs, one per writer rank, kept registered for the
    // writers to pull.
    logs: Vec<(HostBuffer, Option<MemoryRegion>)>,
}

impl ReaderPreload {
    pub fn new(
        locked_sequence: i64,
        buffer: HostBuffer,
        region: MemoryRegion,
        template: StepLog,
        layout: &PreloadLayout,
        logs: Vec<(HostBuffer, Option<MemoryRegion>)>,
    ) -> Self {
        let entries: Vec<Vec<(u64, u64)>> = template
            .ranks()
            .iter()
            .zip(&layout.offsets)
            .map(|(log, offsets)| {
                log.entries()
                    .iter()
                    .zip(offsets)
                    .map(|(entry, at)| (*at, entry.length))
                    .collect()
            })
            .collect();
        let make_slots = || -> Vec<Vec<PreloadSlot>> {
            entries
                .iter()
                .map(|rank| rank.iter().map(|_| PreloadSlot::default()).collect())
                .collect()
        };
        Self {
            locked_sequence,
            buffer,
            region,
            slot_stride: layout.slot_stride,
            template,
            slots: [make_slots(), make_slots()],
            entries,
            logs,
        }
    }

    /// Entry index of a range inside the template, if it was part of it.
    pub fn lookup(&self, rank: usize, offset: u64, length: u64) -> Option<usize> {
        self.template.rank(rank)?.find(offset, length)
    }

    pub fn covers(&self, sequence: i64) -> bool {
        sequence > self.locked_sequence
    }

    /// Whether the ticket's entry was already handed out for this step.
    pub fn already_delivered(&self, ticket: &PreloadTicket) -> bool {
        self.slot(ticket)
            .is_some_and(|slot| slot.delivered == Some(ticket.sequence))
    }

    fn slot(&self, ticket: &PreloadTicket) -> Option<&PreloadSlot> {
        self.slots[ticket.slot].get(ticket.rank)?.get(ticket.index)
    }

    fn copy_out(&self, slot: usize, rank: usize, index: usize, dst: &dyn LocalMemory) {
        let (offset, length) = self.entries[rank][index];
        let src = self.buffer.addr() + (slot as u64 * self.slot_stride + offset) as usize;
        // dst was checked to hold `length` bytes when the request was made.
        unsafe { copy_memory(src, dst.addr(), length as usize) };
    }

    /// Consumer side: bias the counter up.
    pub fn request(&mut self, ticket: PreloadTicket, dst: Arc<dyn LocalMemory>) -> SlotState {
        let PreloadTicket {
            sequence,
            slot,
            rank,
            index,
        } = ticket;
        let entry = &mut self.slots[slot][rank][index];
        if let Some(failure) = &entry.failure {
            return SlotState::Failed(failure.clone());
        }
        entry.pending += 1;
        match entry.pending {
            0 => {
                entry.delivered = Some(sequence);
                self.copy_out(slot, rank, index, dst.as_ref());
                SlotState::Ready
            }
            1 => {
                entry.consumer = Some((dst, sequence));
                SlotState::Waiting
            }
            n => {
                let failure = Failure::Protocol(format!(
                    "preload entry {index} of rank {rank} slot {slot} reached pending {n} on request"
                ));
                tracing::error!("{failure:?}");
                entry.failure = Some(failure.clone());
                SlotState::Failed(failure)
            }
        }
    }

    /// Arrival side: bias the counter down.
    pub fn arrive(&mut self, tag: PushTag) {
        let PushTag {
            slot,
            index,
            writer_rank: rank,
        } = tag;
        let Some(entry) = self
            .slots
            .get_mut(slot)
            .and_then(|ranks| ranks.get_mut(rank))
            .and_then(|entries| entries.get_mut(index))
        else {
            tracing::warn!("push for unknown preload entry {tag:?}");
            return;
        };
        entry.pending -= 1;
        match entry.pending {
            -1 => {
                tracing::trace!("push {tag:?} arrived ahead of its consumer");
            }
            0 => {
                if let Some((dst, sequence)) = entry.consumer.take() {
                    entry.delivered = Some(sequence);
                    self.copy_out(slot, rank, index, dst.as_ref());
                }
            }
            n => {
                let failure = Failure::Protocol(format!(
                    "preload entry {index} of rank {rank} slot {slot} reached pending {n} on arrival"
                ));
                tracing::error!("{failure:?}");
                entry.consumer = None;
                entry.failure = Some(failure);
            }
        }
    }

    /// `None` while the consumer is still waiting.
    pub fn outcome(&self, ticket: &PreloadTicket) -> Option<std::result::Result<(), Failure>> {
        let Some(entry) = self.slot(ticket) else {
            return Some(Err(Failure::Protocol(format!(
                "no preload entry for {ticket:?}"
            ))));
        };
        if let Some(failure) = &entry.failure {
            return Some(Err(failure.clone()));
        }
        if entry.delivered == Some(ticket.sequence) {
            return Some(Ok(()));
        }
        match &entry.consumer {
            Some((_, sequence)) if *sequence == ticket.sequence => None,
            _ => Some(Err(Failure::Protocol(format!(
                "step {} was released before entry {} of rank {} arrived",
                ticket.sequence, ticket.index, ticket.rank
            )))),
        }
    }

    /// Entries of `slot` whose push for `sequence` has not landed yet,
    /// ignoring writer ranks in `failed`.
    pub fn awaiting_pushes(&self, slot: usize, sequence: i64, failed: &HashSet<usize>) -> usize {
        self.slots[slot]
            .iter()
            .enumerate()
            .filter(|(rank, _)| !failed.contains(rank))
            .flat_map(|(_, entries)| entries)
            .filter(|entry| {
                entry.pending >= 0 && entry.delivered != Some(sequence) && entry.failure.is_none()
            })
            .count()
    }

    /// Resets a slot after the reader released the step that used it. The
    /// caller must first let every push for that step land; a late one
    /// would otherwise be taken for the next step in this slot.
    pub fn release_slot(&mut self, slot: usize, sequence: i64) {
        for (rank, entries) in self.slots[slot].iter_mut().enumerate() {
            for (index, entry) in entries.iter_mut().enumerate() {
                match entry.pending {
                    -1 => tracing::debug!(
                        "step {sequence}: discarding unconsumed push for rank {rank} entry {index}"
                    ),
                    1 => tracing::debug!(
                        "step {sequence}: dropping unfinished request for rank {rank} entry {index}"
                    ),
                    _ => {}
                }
                entry.pending = 0;
                entry.consumer = None;
                entry.failure = None;
            }
        }
    }

    /// Fails every consumer waiting on `rank`.
    pub fn fail_rank(&mut self, rank: usize) {
        for slot in self.slots.iter_mut() {
            let Some(entries) = slot.get_mut(rank) else {
                continue;
            };
            for entry in entries.iter_mut().filter(|e| e.consumer.is_some()) {
                entry.consumer = None;
                entry.pending = 0;
                entry.failure = Some(Failure::Peer(rank));
            }
        }
    }

    /// Releases ownership of the registrations for deregistration.
    pub fn into_regions(self) -> Vec<MemoryRegion> {
        std::iter::once(self.region)
            .chain(self.logs.into_iter().filter_map(|(_, region)| region))
            .collect()
    }
}

/// Where a writer/reader pair stands on the push path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushPhase {
    Unlocked,
    SelectionPulled,
    Preloading,
}

/// One reader rank's locked selection as pulled by the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankSelection {
    pub entries: Vec<RequestLogEntry>,
    pub slot_stride: u64,
}

/// Selection logs being read from the reader cohort.
#[derive(Debug)]
pub(crate) struct SelectionRead {
    pub contexts: Range<OpContext>,
    done: Vec<bool>,
    pub failure: Option<String>,
    // Per reader rank; `None` where the reader logged nothing for this writer.
    pub buffers: Vec<Option<(HostBuffer, Option<MemoryRegion>)>>,
    pub strides: Vec<u64>,
}

impl SelectionRead {
    pub fn new(
        contexts: Range<OpContext>,
        buffers: Vec<Option<(HostBuffer, Option<MemoryRegion>)>>,
        strides: Vec<u64>,
    ) -> Self {
        let done = vec![false; (contexts.end - contexts.start) as usize];
        Self {
            contexts,
            done,
            failure: None,
            buffers,
            strides,
        }
    }

    pub fn record(&mut self, context: OpContext, error: Option<String>) {
        if let Some(done) = self.done.get_mut((context - self.contexts.start) as usize) {
            *done = true;
        }
        if let Some(error) = error {
            self.failure.get_or_insert(error);
        }
    }

    /// Every read has completed, failed, or was never posted.
    pub fn finished(&self) -> bool {
        self.done.iter().all(|d| *d)
    }
}

/// Writer-side push state for one reader cohort.
#[derive(Debug)]
pub(crate) struct WsrPushState {
    pub phase: PushPhase,
    pub locked_sequence: Option<i64>,
    pub preload_enabled: bool,
    pub selection: Vec<RankSelection>,
    pub slot_occupant: [Option<i64>; 2],
    pub deferred: BTreeSet<i64>,
    pub pushed: BTreeSet<i64>,
    // Steps this reader cohort already released.
    pub retired: BTreeSet<i64>,
    pub selection_read: Option<SelectionRead>,
}

impl WsrPushState {
    pub fn new() -> Self {
        Self {
            phase: PushPhase::Unlocked,
            locked_sequence: None,
            preload_enabled: false,
            selection: Vec::new(),
            slot_occupant: [None, None],
            deferred: BTreeSet::new(),
            pushed: BTreeSet::new(),
            retired: BTreeSet::new(),
            selection_read: None,
        }
    }

    pub fn preload_used(&self, slot: usize) -> bool {
        self.slot_occupant[slot].is_some()
    }

    pub fn ready_to_push(&self) -> bool {
        self.preload_enabled && self.phase != PushPhase::Unlocked
    }

    /// Whether `sequence` still needs pushing to this cohort.
    pub fn wants(&self, sequence: i64) -> bool {
        self.locked_sequence.is_some_and(|locked| sequence > locked)
            && !self.pushed.contains(&sequence)
            && !self.retired.contains(&sequence)
    }

    /// The reader cohort released `sequence`: free its slot and never push
    /// it again.
    pub fn release_slot(&mut self, sequence: i64) {
        self.deferred.remove(&sequence);
        self.retired.insert(sequence);
        for occupant in self.slot_occupant.iter_mut() {
            if *occupant == Some(sequence) {
                *occupant = None;
            }
        }
    }

    /// The writer released `sequence` altogether.
    pub fn forget(&mut self, sequence: i64) {
        self.release_slot(sequence);
        self.retired.remove(&sequence);
        self.pushed.remove(&sequence);
    }
}

/// Builds the tagged writes that deliver `entry` to every reader rank.
pub(crate) fn build_push_ops(
    entry: &TimestepEntry,
    selection: &[RankSelection],
    reader_addrs: &[FabricAddr],
    writer_rank: usize,
    slot: usize,
    first_context: OpContext,
    local_mr_required: bool,
) -> Result<Vec<(RmaOp, u32)>> {
    let mut ops = Vec::new();
    for (reader_rank, rank_selection) in selection.iter().enumerate() {
        let peer = *reader_addrs.get(reader_rank).ok_or_else(|| {
            usage_violation(format!("no fabric address for reader rank {reader_rank}"))
        })?;
        for (index, request) in rank_selection.entries.iter().enumerate() {
            let end = request.offset.checked_add(request.length);
            if !end.is_some_and(|end| end <= entry.data.size() as u64) {
                return Err(usage_violation(format!(
                    "step {}: requested range {}+{} exceeds the {} published bytes",
                    entry.sequence,
                    request.offset,
                    request.length,
                    entry.data.size()
                )));
            }
            let imm = PushTag::new(slot, index, writer_rank).encode().ok_or_else(|| {
                usage_violation(format!(
                    "push tag out of range: entry {index}, writer rank {writer_rank}"
                ))
            })?;
            let context = first_context + ops.len() as OpContext;
            ops.push((
                RmaOp {
                    local_addr: entry.data.addr() + request.offset as usize,
                    len: request.length as usize,
                    local_key: if local_mr_required {
                        entry.region.desc()
                    } else {
                        None
                    },
                    peer,
                    remote_addr: request.preload.block + slot as u64 * rank_selection.slot_stride,
                    remote_key: request.preload.key,
                    context,
                },
                imm,
            ));
        }
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::AccessFlags;
    use crate::fabric::FabricProvider;
    use crate::fabric::loopback::LoopbackFabric;
    use crate::registry::BufferHandle;
    use crate::registry::MemoryRegionRegistry;

    fn preload(registry: &MemoryRegionRegistry) -> anyhow::Result<ReaderPreload> {
        let mut log = StepLog::new(2, 2);
        log.log_request(0, 0, 4)?;
        log.log_request(1, 8, 4)?;
        let layout = log.preload_layout();
        let buffer = HostBuffer::zeroed(layout.buffer_len() as usize);
        let region = registry.register(
            buffer.addr(),
            buffer.size(),
            AccessFlags::REMOTE_WRITE,
        )?;
        log.assign_preload(&layout, region.handle());
        Ok(ReaderPreload::new(2, buffer, region, log, &layout, Vec::new()))
    }

    fn registry() -> anyhow::Result<MemoryRegionRegistry> {
        let fabric = LoopbackFabric::new();
        Ok(MemoryRegionRegistry::new(fabric.open(&fabric.get_info()[0], 4)?))
    }

    fn ticket(sequence: i64, rank: usize) -> PreloadTicket {
        PreloadTicket {
            sequence,
            slot: crate::imm::slot_for(sequence),
            rank,
            index: 0,
        }
    }

    #[test]
    fn test_arrival_before_request() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut preload = preload(&registry)?;
        // Step 3 uses slot 1; rank 1's entry sits after rank 0's four bytes.
        preload.buffer.write_at(preload.slot_stride as usize + 4, b"RNK1");
        preload.arrive(PushTag::new(1, 0, 1));
        let dst = Arc::new(HostBuffer::zeroed(4));
        assert_eq!(preload.request(ticket(3, 1), dst.clone()), SlotState::Ready);
        assert_eq!(dst.to_vec(), b"RNK1".to_vec());
        assert!(preload.already_delivered(&ticket(3, 1)));
        Ok(())
    }

    #[test]
    fn test_request_before_arrival() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut preload = preload(&registry)?;
        let dst = Arc::new(HostBuffer::zeroed(4));
        assert_eq!(preload.request(ticket(4, 0), dst.clone()), SlotState::Waiting);
        assert_eq!(preload.outcome(&ticket(4, 0)), None);
        preload.buffer.write_at(0, b"RNK0");
        preload.arrive(PushTag::new(0, 0, 0));
        assert_eq!(preload.outcome(&ticket(4, 0)), Some(Ok(())));
        assert_eq!(dst.to_vec(), b"RNK0".to_vec());
        Ok(())
    }

    #[test]
    fn test_double_arrival_fails_fast() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut preload = preload(&registry)?;
        preload.arrive(PushTag::new(0, 0, 0));
        preload.arrive(PushTag::new(0, 0, 0));
        let dst = Arc::new(HostBuffer::zeroed(4));
        assert!(matches!(
            preload.request(ticket(4, 0), dst),
            SlotState::Failed(Failure::Protocol(_))
        ));
        // Releasing the step clears the slot for reuse.
        preload.release_slot(0, 4);
        preload.arrive(PushTag::new(0, 0, 0));
        let dst = Arc::new(HostBuffer::zeroed(4));
        assert_eq!(preload.request(ticket(6, 0), dst), SlotState::Ready);
        assert_eq!(preload.outcome(&ticket(6, 0)), Some(Ok(())));
        Ok(())
    }

    #[test]
    fn test_awaiting_pushes() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut preload = preload(&registry)?;
        let none = HashSet::new();
        assert_eq!(preload.awaiting_pushes(1, 3, &none), 2);

        // Arrived but unread counts as landed.
        preload.arrive(PushTag::new(1, 0, 0));
        assert_eq!(preload.awaiting_pushes(1, 3, &none), 1);

        // A waiting consumer does not.
        let dst = Arc::new(HostBuffer::zeroed(4));
        assert_eq!(preload.request(ticket(3, 1), dst), SlotState::Waiting);
        assert_eq!(preload.awaiting_pushes(1, 3, &none), 1);
        assert_eq!(preload.awaiting_pushes(1, 3, &HashSet::from([1])), 0);

        preload.arrive(PushTag::new(1, 0, 1));
        assert_eq!(preload.awaiting_pushes(1, 3, &none), 0);
        assert_eq!(preload.awaiting_pushes(0, 4, &none), 2);
        Ok(())
    }

    #[test]
    fn test_release_fails_a_waiting_consumer() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut preload = preload(&registry)?;
        let dst = Arc::new(HostBuffer::zeroed(4));
        assert_eq!(preload.request(ticket(4, 0), dst.clone()), SlotState::Waiting);
        preload.release_slot(0, 4);
        assert!(matches!(
            preload.outcome(&ticket(4, 0)),
            Some(Err(Failure::Protocol(_)))
        ));
        // The next step in the slot starts clean.
        assert_eq!(preload.request(ticket(6, 0), dst), SlotState::Waiting);
        assert_eq!(preload.outcome(&ticket(6, 0)), None);
        Ok(())
    }

    #[test]
    fn test_fail_rank_wakes_waiters() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut preload = preload(&registry)?;
        let dst = Arc::new(HostBuffer::zeroed(4));
        assert_eq!(preload.request(ticket(5, 1), dst), SlotState::Waiting);
        preload.fail_rank(1);
        assert_eq!(
            preload.outcome(&ticket(5, 1)),
            Some(Err(Failure::Peer(1)))
        );
        assert_eq!(preload.into_regions().len(), 1);
        Ok(())
    }

    #[test]
    fn test_build_push_ops() -> anyhow::Result<()> {
        let registry = registry()?;
        let data: Arc<dyn LocalMemory> = Arc::new(HostBuffer::zeroed(32));
        let region = registry.register(data.addr(), 32, AccessFlags::REMOTE_READ | AccessFlags::WRITE)?;
        let entry = TimestepEntry {
            sequence: 7,
            data,
            region,
            outstanding_writes: 0,
            slot: None,
            push_contexts: Vec::new(),
            failed_writes: 0,
        };
        let selection = vec![RankSelection {
            entries: vec![
                RequestLogEntry {
                    offset: 0,
                    length: 8,
                    preload: BufferHandle::new(0x1000, 9),
                },
                RequestLogEntry {
                    offset: 16,
                    length: 16,
                    preload: BufferHandle::new(0x1008, 9),
                },
            ],
            slot_stride: 24,
        }];
        let ops = build_push_ops(&entry, &selection, &[5], 3, 1, 100, true)?;
        assert_eq!(ops.len(), 2);
        let (op, imm) = ops[1];
        assert_eq!(op.remote_addr, 0x1008 + 24);
        assert_eq!(op.local_addr, entry.data.addr() + 16);
        assert_eq!(op.context, 101);
        assert_eq!(op.peer, 5);
        assert_eq!(PushTag::decode(imm), PushTag::new(1, 1, 3));

        let too_far = vec![RankSelection {
            entries: vec![RequestLogEntry {
                offset: 30,
                length: 8,
                preload: BufferHandle::default(),
            }],
            slot_stride: 8,
        }];
        assert!(build_push_ops(&entry, &too_far, &[5], 3, 0, 0, true).is_err());
        Ok(())
    }

    #[test]
    fn test_push_state_slots() {
        let mut state = WsrPushState::new();
        assert!(!state.ready_to_push());
        state.locked_sequence = Some(2);
        assert!(!state.wants(2));
        assert!(state.wants(3));
        state.slot_occupant[1] = Some(3);
        state.pushed.insert(3);
        assert!(state.preload_used(1));
        assert!(!state.wants(3));
        state.deferred.insert(5);
        state.release_slot(3);
        assert!(!state.preload_used(1));
        assert!(!state.wants(3));
        state.release_slot(5);
        assert!(state.deferred.is_empty());
        state.forget(3);
        assert!(state.retired.contains(&5));
        assert!(!state.retired.contains(&3));
    }

    #[test]
    fn test_selection_read_tracking() {
        let mut read = SelectionRead::new(10..12, vec![None, None], vec![0, 0]);
        assert!(!read.finished());
        read.record(10, None);
        read.record(11, Some("gone".into()));
        assert!(read.finished());
        assert_eq!(read.failure.as_deref(), Some("gone"));
    }
}
