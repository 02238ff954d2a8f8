/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::cell::UnsafeCell;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::LocalMemory;
use crate::error::Result;

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializes a contact record or control message for the control plane.
pub fn to_wire<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Inverse of [`to_wire`].
pub fn from_wire<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Heap buffer whose contents may be changed by the fabric while shared.
///
/// Registered memory is written by remote peers (or by the loopback provider)
/// through its raw address, so the bytes live behind `UnsafeCell`.
pub struct HostBuffer {
    data: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all access to the bytes goes through raw pointers whose ordering is
// established by completion-queue events, never through references.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl HostBuffer {
    pub fn zeroed(len: usize) -> Self {
        Self {
            data: (0..len).map(|_| UnsafeCell::new(0)).collect(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self {
            data: bytes.iter().map(|b| UnsafeCell::new(*b)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn as_ptr(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.data.as_ptr())
    }

    /// Snapshot of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read_at(0, self.len())
    }

    /// Copies `len` bytes starting at `offset`, clamped to the buffer end.
    pub fn read_at(&self, offset: usize, len: usize) -> Vec<u8> {
        let start = offset.min(self.len());
        let end = offset.saturating_add(len).min(self.len());
        let mut out = vec![0u8; end - start];
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(start), out.as_mut_ptr(), out.len());
        }
        out
    }

    /// Overwrites bytes starting at `offset`, clamped to the buffer end.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let start = offset.min(self.len());
        let len = bytes.len().min(self.len() - start);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.as_ptr().add(start), len);
        }
    }
}

impl std::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

impl LocalMemory for HostBuffer {
    fn addr(&self) -> usize {
        self.as_ptr() as usize
    }
    fn size(&self) -> usize {
        self.len()
    }
}

/// Copies `len` bytes between two raw addresses.
///
/// # Safety
/// Both ranges must be valid for `len` bytes. They may overlap.
pub(crate) unsafe fn copy_memory(src: usize, dst: usize, len: usize) {
    if len > 0 {
        std::ptr::copy(src as *const u8, dst as *mut u8, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_buffer_access() {
        let buf = HostBuffer::from_slice(&[1, 2, 3, 4]);
        assert_eq!(buf.size(), 4);
        buf.write_at(2, &[9, 9, 9]);
        assert_eq!(buf.to_vec(), vec![1, 2, 9, 9]);
        assert_eq!(buf.read_at(1, 2), vec![2, 9]);
        assert!(buf.read_at(10, 2).is_empty());
    }

    #[test]
    fn test_copy_memory() {
        let src = HostBuffer::from_slice(b"hello");
        let dst = HostBuffer::zeroed(5);
        unsafe { copy_memory(src.addr(), dst.addr(), 5) };
        assert_eq!(dst.to_vec(), b"hello".to_vec());
    }

    #[test]
    fn test_wire_round_trip() -> anyhow::Result<()> {
        let value = (7u64, "writer".to_string());
        let bytes = to_wire(&value)?;
        let back: (u64, String) = from_wire(&bytes)?;
        assert_eq!(back, value);
        Ok(())
    }
}
