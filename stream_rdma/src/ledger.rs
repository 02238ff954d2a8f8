/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Writer-side record of published timesteps.

use std::ops::Range;
use std::sync::Arc;

use slab::Slab;

use crate::DataPlaneError;
use crate::LocalMemory;
use crate::error::Result;
use crate::error::usage_violation;
use crate::fabric::OpContext;
use crate::registry::BufferHandle;
use crate::registry::MemoryRegion;

/// One published timestep.
#[derive(Debug)]
pub struct TimestepEntry {
    pub sequence: i64,
    pub data: Arc<dyn LocalMemory>,
    pub region: MemoryRegion,
    /// Pushed writes posted for this step that have not completed yet.
    pub outstanding_writes: usize,
    /// Double-buffer slot the step was pushed into, if any.
    pub slot: Option<usize>,
    /// Completion contexts of pushes posted for this step.
    pub push_contexts: Vec<Range<OpContext>>,
    pub failed_writes: usize,
}

impl TimestepEntry {
    pub fn handle(&self) -> BufferHandle {
        self.region.handle()
    }

    pub fn owns_context(&self, context: OpContext) -> bool {
        self.push_contexts.iter().any(|range| range.contains(&context))
    }
}

/// Published timesteps in publication order.
#[derive(Debug, Default)]
pub struct TimestepLedger {
    entries: Slab<TimestepEntry>,
    // Slab keys, oldest first.
    order: Vec<usize>,
}

impl TimestepLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a published step. A sequence may be live only once; on
    /// rejection the region is handed back for deregistration.
    pub fn publish(
        &mut self,
        sequence: i64,
        data: Arc<dyn LocalMemory>,
        region: MemoryRegion,
    ) -> std::result::Result<BufferHandle, (MemoryRegion, DataPlaneError)> {
        if self.position(sequence).is_some() {
            return Err((
                region,
                usage_violation(format!("timestep {sequence} is already published")),
            ));
        }
        let handle = region.handle();
        let key = self.entries.insert(TimestepEntry {
            sequence,
            data,
            region,
            outstanding_writes: 0,
            slot: None,
            push_contexts: Vec::new(),
            failed_writes: 0,
        });
        self.order.push(key);
        Ok(handle)
    }

    fn position(&self, sequence: i64) -> Option<usize> {
        self.order
            .iter()
            .rposition(|key| self.entries[*key].sequence == sequence)
    }

    /// Removes the entry for `sequence`, searching newest first.
    pub fn take(&mut self, sequence: i64) -> Result<TimestepEntry> {
        let position = self.position(sequence).ok_or_else(|| {
            usage_violation(format!("release of timestep {sequence}, which is not published"))
        })?;
        let key = self.order.remove(position);
        Ok(self.entries.remove(key))
    }

    pub fn get(&self, sequence: i64) -> Option<&TimestepEntry> {
        self.position(sequence).map(|p| &self.entries[self.order[p]])
    }

    pub fn get_mut(&mut self, sequence: i64) -> Option<&mut TimestepEntry> {
        let key = self.order[self.position(sequence)?];
        self.entries.get_mut(key)
    }

    /// Finds the step whose pushes include `context`.
    pub fn entry_for_context(&mut self, context: OpContext) -> Option<&mut TimestepEntry> {
        self.entries
            .iter_mut()
            .map(|(_, entry)| entry)
            .find(|entry| entry.owns_context(context))
    }

    /// Live sequences, oldest first.
    pub fn sequences(&self) -> Vec<i64> {
        self.order.iter().map(|key| self.entries[*key].sequence).collect()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Removes every entry, oldest first.
    pub fn drain(&mut self) -> Vec<TimestepEntry> {
        self.order
            .drain(..)
            .map(|key| self.entries.remove(key))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::AccessFlags;
    use crate::fabric::FabricProvider;
    use crate::fabric::loopback::LoopbackFabric;
    use crate::registry::MemoryRegionRegistry;
    use crate::utils::HostBuffer;

    fn registry() -> anyhow::Result<MemoryRegionRegistry> {
        let fabric = LoopbackFabric::new();
        Ok(MemoryRegionRegistry::new(
            fabric.open(&fabric.get_info()[0], 4)?,
        ))
    }

    fn publish(
        ledger: &mut TimestepLedger,
        registry: &MemoryRegionRegistry,
        sequence: i64,
    ) -> anyhow::Result<BufferHandle> {
        let data: Arc<dyn LocalMemory> = Arc::new(HostBuffer::zeroed(16));
        let region = registry.register(data.addr(), data.size(), AccessFlags::REMOTE_READ)?;
        ledger
            .publish(sequence, data, region)
            .map_err(|(_, err)| anyhow::anyhow!(err))
    }

    #[test]
    fn test_publish_release_set_semantics() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut ledger = TimestepLedger::new();
        for sequence in 0..5 {
            publish(&mut ledger, &registry, sequence)?;
        }
        for sequence in [3, 0, 4] {
            let entry = ledger.take(sequence)?;
            assert_eq!(entry.sequence, sequence);
            registry.deregister(entry.region)?;
        }
        assert_eq!(ledger.sequences(), vec![1, 2]);
        publish(&mut ledger, &registry, 3)?;
        assert_eq!(ledger.sequences(), vec![1, 2, 3]);
        assert!(ledger.get(0).is_none());
        assert_eq!(ledger.len(), 3);
        Ok(())
    }

    #[test]
    fn test_duplicate_and_unknown_sequences() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut ledger = TimestepLedger::new();
        publish(&mut ledger, &registry, 9)?;
        assert!(publish(&mut ledger, &registry, 9).is_err());
        assert!(matches!(
            ledger.take(10),
            Err(DataPlaneError::UsageViolation(_))
        ));
        assert_eq!(ledger.sequences(), vec![9]);
        Ok(())
    }

    #[test]
    fn test_context_lookup() -> anyhow::Result<()> {
        let registry = registry()?;
        let mut ledger = TimestepLedger::new();
        publish(&mut ledger, &registry, 1)?;
        publish(&mut ledger, &registry, 2)?;
        ledger.get_mut(2).unwrap().push_contexts.push(10..14);
        ledger.get_mut(1).unwrap().push_contexts.push(4..10);
        assert_eq!(ledger.entry_for_context(13).map(|e| e.sequence), Some(2));
        assert_eq!(ledger.entry_for_context(4).map(|e| e.sequence), Some(1));
        assert!(ledger.entry_for_context(14).is_none());
        assert_eq!(ledger.drain().len(), 2);
        assert!(ledger.is_empty());
        Ok(())
    }
}
