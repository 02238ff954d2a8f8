/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Reader-side record of which ranges were requested from which writer rank
//! at each step, and the wire forms exchanged when that record is frozen
//! into a preload template.

use std::collections::BTreeMap;

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::error::Result;
use crate::error::usage_violation;
use crate::registry::BufferHandle;

/// Encoded size of one request record.
pub const REQUEST_RECORD_LEN: usize = 32;
/// Encoded size of one reader-roll descriptor.
pub const DESCRIPTOR_LEN: usize = 40;
/// First allocation of a rank's request log; it doubles from there.
pub const INITIAL_LOG_CAPACITY: usize = 8;
/// Steps whose logs are kept while the pattern is still unlocked.
pub const STEP_LOG_HISTORY: usize = 8;

/// One requested range, plus where it lands in the preload buffer once the
/// pattern is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestLogEntry {
    pub offset: u64,
    pub length: u64,
    pub preload: BufferHandle,
}

impl RequestLogEntry {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.offset);
        buf.put_u64_le(self.length);
        buf.put_u64_le(self.preload.block);
        buf.put_u64_le(self.preload.key);
    }

    fn get(buf: &mut impl Buf) -> Self {
        Self {
            offset: buf.get_u64_le(),
            length: buf.get_u64_le(),
            preload: BufferHandle::new(buf.get_u64_le(), buf.get_u64_le()),
        }
    }
}

/// Encodes a rank's log as consecutive little-endian records.
pub fn encode_request_log(entries: &[RequestLogEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(entries.len() * REQUEST_RECORD_LEN);
    for entry in entries {
        entry.put(&mut buf);
    }
    buf.freeze()
}

pub fn decode_request_log(mut bytes: &[u8]) -> Result<Vec<RequestLogEntry>> {
    if bytes.len() % REQUEST_RECORD_LEN != 0 {
        return Err(usage_violation(format!(
            "request log of {} bytes is not a whole number of records",
            bytes.len()
        )));
    }
    let mut entries = Vec::with_capacity(bytes.len() / REQUEST_RECORD_LEN);
    while bytes.has_remaining() {
        entries.push(RequestLogEntry::get(&mut bytes));
    }
    Ok(entries)
}

/// What a reader rank publishes into a writer's reader-roll slot when it
/// locks its pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollDescriptor {
    /// Where the encoded request log for this writer rank lives.
    pub log: BufferHandle,
    /// Encoded length of that log in bytes.
    pub log_len: u64,
    /// Bytes between the two double-buffer slots of the preload buffer.
    pub slot_stride: u64,
    pub locked_sequence: i64,
}

impl RollDescriptor {
    pub fn encode(&self) -> [u8; DESCRIPTOR_LEN] {
        let mut buf = BytesMut::with_capacity(DESCRIPTOR_LEN);
        buf.put_u64_le(self.log.block);
        buf.put_u64_le(self.log.key);
        buf.put_u64_le(self.log_len);
        buf.put_u64_le(self.slot_stride);
        // Stored biased by one so an all-zero slot reads as "not posted".
        buf.put_u64_le((self.locked_sequence + 1) as u64);
        let mut out = [0u8; DESCRIPTOR_LEN];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes a slot, returning `None` if the reader has not written it.
    pub fn decode(mut bytes: &[u8]) -> Result<Option<Self>> {
        if bytes.len() != DESCRIPTOR_LEN {
            return Err(usage_violation(format!(
                "reader-roll descriptor of {} bytes, expected {DESCRIPTOR_LEN}",
                bytes.len()
            )));
        }
        let log = BufferHandle::new(bytes.get_u64_le(), bytes.get_u64_le());
        let log_len = bytes.get_u64_le();
        let slot_stride = bytes.get_u64_le();
        let locked = bytes.get_u64_le();
        if locked == 0 {
            return Ok(None);
        }
        Ok(Some(Self {
            log,
            log_len,
            slot_stride,
            locked_sequence: locked as i64 - 1,
        }))
    }
}

/// Requests sent to one writer rank during one step.
#[derive(Debug, Clone, Default)]
pub struct RankRequestLog {
    entries: Vec<RequestLogEntry>,
    total_bytes: u64,
}

impl RankRequestLog {
    /// Appends a range unless the identical range is already logged.
    pub fn push(&mut self, offset: u64, length: u64) -> bool {
        if self.find(offset, length).is_some() {
            return false;
        }
        if self.entries.len() == self.entries.capacity() {
            let grow = self.entries.capacity().max(INITIAL_LOG_CAPACITY);
            self.entries.reserve_exact(grow);
        }
        self.entries.push(RequestLogEntry {
            offset,
            length,
            preload: BufferHandle::default(),
        });
        self.total_bytes += length;
        true
    }

    pub fn find(&self, offset: u64, length: u64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.offset == offset && e.length == length)
    }

    pub fn entries(&self) -> &[RequestLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}

/// Placement of every logged range inside one preload slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreloadLayout {
    pub slot_stride: u64,
    /// Offset within a slot, per writer rank per entry.
    pub offsets: Vec<Vec<u64>>,
}

impl PreloadLayout {
    /// Both slots together.
    pub fn buffer_len(&self) -> u64 {
        2 * self.slot_stride
    }
}

/// Everything requested during one step.
#[derive(Debug, Clone)]
pub struct StepLog {
    sequence: i64,
    ranks: Vec<RankRequestLog>,
    total_entries: usize,
    total_bytes: u64,
}

impl StepLog {
    pub fn new(sequence: i64, writer_cohort_size: usize) -> Self {
        Self {
            sequence,
            ranks: vec![RankRequestLog::default(); writer_cohort_size],
            total_entries: 0,
            total_bytes: 0,
        }
    }

    pub fn sequence(&self) -> i64 {
        self.sequence
    }

    pub fn log_request(&mut self, rank: usize, offset: u64, length: u64) -> Result<()> {
        let cohort = self.ranks.len();
        let log = self.ranks.get_mut(rank).ok_or_else(|| {
            usage_violation(format!("writer rank {rank} outside a cohort of {cohort}"))
        })?;
        if log.push(offset, length) {
            self.total_entries += 1;
            self.total_bytes += length;
        }
        Ok(())
    }

    pub fn rank(&self, rank: usize) -> Option<&RankRequestLog> {
        self.ranks.get(rank)
    }

    pub fn ranks(&self) -> &[RankRequestLog] {
        &self.ranks
    }

    pub fn total_entries(&self) -> usize {
        self.total_entries
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.total_entries == 0
    }

    /// Number of writer ranks this step requested anything from.
    pub fn active_ranks(&self) -> usize {
        self.ranks.iter().filter(|log| !log.is_empty()).count()
    }

    /// Packs every range back to back, rank by rank, in logging order.
    pub fn preload_layout(&self) -> PreloadLayout {
        let mut next = 0;
        let offsets = self
            .ranks
            .iter()
            .map(|log| {
                log.entries()
                    .iter()
                    .map(|entry| {
                        let at = next;
                        next += entry.length;
                        at
                    })
                    .collect()
            })
            .collect();
        PreloadLayout {
            slot_stride: next,
            offsets,
        }
    }

    /// Points every entry at its place in the registered preload buffer.
    pub fn assign_preload(&mut self, layout: &PreloadLayout, buffer: BufferHandle) {
        for (log, offsets) in self.ranks.iter_mut().zip(&layout.offsets) {
            for (entry, offset) in log.entries.iter_mut().zip(offsets) {
                entry.preload = buffer.offset(*offset);
            }
        }
    }
}

/// Step logs kept while the read pattern is still unlocked.
#[derive(Debug)]
pub struct AccessPatternRecorder {
    writer_cohort_size: usize,
    steps: BTreeMap<i64, StepLog>,
}

impl AccessPatternRecorder {
    pub fn new(writer_cohort_size: usize) -> Self {
        Self {
            writer_cohort_size,
            steps: BTreeMap::new(),
        }
    }

    pub fn log_request(&mut self, sequence: i64, rank: usize, offset: u64, length: u64) -> Result<()> {
        let cohort = self.writer_cohort_size;
        self.steps
            .entry(sequence)
            .or_insert_with(|| StepLog::new(sequence, cohort))
            .log_request(rank, offset, length)?;
        while self.steps.len() > STEP_LOG_HISTORY {
            self.steps.pop_first();
        }
        Ok(())
    }

    pub fn step(&self, sequence: i64) -> Option<&StepLog> {
        self.steps.get(&sequence)
    }

    /// Removes and returns the log for `sequence`, discarding all others:
    /// once a template is chosen nothing else is recorded.
    pub fn freeze(&mut self, sequence: i64) -> Option<StepLog> {
        let log = self.steps.remove(&sequence);
        if log.is_some() {
            self.steps.clear();
        }
        log
    }

    pub fn retained_steps(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StepLog {
        let mut log = StepLog::new(4, 3);
        log.log_request(0, 0, 100).unwrap();
        log.log_request(0, 200, 50).unwrap();
        log.log_request(2, 8, 30).unwrap();
        log
    }

    #[test]
    fn test_layout_is_contiguous_and_disjoint() {
        let log = sample();
        let layout = log.preload_layout();
        assert_eq!(layout.slot_stride, 180);
        assert_eq!(layout.buffer_len(), 360);
        assert_eq!(layout.offsets, vec![vec![0, 100], vec![], vec![150]]);

        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for (rank, offsets) in layout.offsets.iter().enumerate() {
            for (i, at) in offsets.iter().enumerate() {
                let len = log.rank(rank).unwrap().entries()[i].length;
                for slot in 0..2 {
                    let start = slot * layout.slot_stride + at;
                    ranges.push((start, start + len));
                }
            }
        }
        ranges.sort();
        assert!(ranges.windows(2).all(|w| w[0].1 <= w[1].0));
        assert!(ranges.iter().all(|r| r.1 <= layout.buffer_len()));
    }

    #[test]
    fn test_assign_preload_handles() {
        let mut log = sample();
        let layout = log.preload_layout();
        log.assign_preload(&layout, BufferHandle::new(0x1000, 42));
        let rank0 = log.rank(0).unwrap().entries();
        assert_eq!(rank0[1].preload, BufferHandle::new(0x1000 + 100, 42));
        assert_eq!(log.rank(2).unwrap().entries()[0].preload.block, 0x1000 + 150);
    }

    #[test]
    fn test_log_growth_and_dedup() {
        let mut log = StepLog::new(0, 1);
        for i in 0..INITIAL_LOG_CAPACITY as u64 + 1 {
            log.log_request(0, i * 16, 16).unwrap();
        }
        log.log_request(0, 0, 16).unwrap();
        let rank = log.rank(0).unwrap();
        assert_eq!(rank.len(), INITIAL_LOG_CAPACITY + 1);
        assert!(rank.capacity() >= 2 * INITIAL_LOG_CAPACITY);
        assert_eq!(log.total_entries(), INITIAL_LOG_CAPACITY + 1);
        assert_eq!(rank.total_bytes(), 16 * (INITIAL_LOG_CAPACITY as u64 + 1));
        assert!(log.log_request(1, 0, 1).is_err());
    }

    #[test]
    fn test_request_log_encoding() -> anyhow::Result<()> {
        let mut log = sample();
        let layout = log.preload_layout();
        log.assign_preload(&layout, BufferHandle::new(0x2000, 7));
        let entries = log.rank(0).unwrap().entries();
        let wire = encode_request_log(entries);
        assert_eq!(wire.len(), 2 * REQUEST_RECORD_LEN);
        assert_eq!(&wire[..8], &0u64.to_le_bytes());
        assert_eq!(&wire[8..16], &100u64.to_le_bytes());
        assert_eq!(decode_request_log(&wire)?, entries.to_vec());
        assert!(decode_request_log(&wire[..31]).is_err());
        Ok(())
    }

    #[test]
    fn test_descriptor_encoding() -> anyhow::Result<()> {
        assert_eq!(RollDescriptor::decode(&[0u8; DESCRIPTOR_LEN])?, None);
        let desc = RollDescriptor {
            log: BufferHandle::new(0xdead, 3),
            log_len: 64,
            slot_stride: 180,
            locked_sequence: 0,
        };
        let wire = desc.encode();
        assert_eq!(&wire[32..], &1u64.to_le_bytes());
        assert_eq!(RollDescriptor::decode(&wire)?, Some(desc));
        Ok(())
    }

    #[test]
    fn test_recorder_history_and_freeze() {
        let mut recorder = AccessPatternRecorder::new(2);
        for step in 0..(STEP_LOG_HISTORY as i64 + 3) {
            recorder.log_request(step, 1, 0, 8).unwrap();
        }
        assert_eq!(recorder.retained_steps(), STEP_LOG_HISTORY);
        assert!(recorder.step(0).is_none());
        let frozen = recorder.freeze(5).unwrap();
        assert_eq!(frozen.sequence(), 5);
        assert_eq!(frozen.active_ranks(), 1);
        assert_eq!(recorder.retained_steps(), 0);
        assert!(recorder.freeze(5).is_none());
    }
}
