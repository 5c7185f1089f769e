// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The shared byte region and the three nested locks guarding it.

use crate::error::{Error, Result};
use crate::naming::{object_name, Role};
use crate::platform::{NamedMapping, NamedMutex};

/// Largest region a single identifier may declare: 16 MiB.
pub const MAX_CAPACITY: usize = 16 * 1024 * 1024;

/// A fixed-capacity shared byte buffer.
///
/// Capacity is decided by whichever process creates the region first and
/// never changes afterwards; the registry resolves it before this type is
/// constructed. Lock order is always bulk → read → write and is never
/// reversed anywhere in the crate.
pub struct DataRegion {
    data: NamedMapping,
    capacity: usize,
    read_lock: NamedMutex,
    write_lock: NamedMutex,
    bulk_lock: NamedMutex,
}

impl DataRegion {
    /// Opens the identifier's region, creating the mapping and its mutexes
    /// if this process is first. `capacity` must already be the resolved
    /// value and within (0, 16 MiB].
    pub fn open_or_create(identifier: &str, capacity: usize) -> Result<DataRegion> {
        if capacity == 0 || capacity > MAX_CAPACITY {
            return Err(Error::CapacityOutOfRange(capacity));
        }
        let data = NamedMapping::open_or_create(&object_name(identifier, Role::DataMap, None), capacity)?;
        let read_lock = NamedMutex::open_or_create(&object_name(identifier, Role::ReadMutex, None))?;
        let write_lock = NamedMutex::open_or_create(&object_name(identifier, Role::WriteMutex, None))?;
        let bulk_lock = NamedMutex::open_or_create(&object_name(identifier, Role::BulkMutex, None))?;
        Ok(DataRegion {
            data,
            capacity,
            read_lock,
            write_lock,
            bulk_lock,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copies out the full region, always exactly `capacity` bytes.
    pub fn read(&self) -> Result<Vec<u8>> {
        let _read = self.read_lock.lock()?;
        let mut buf = vec![0u8; self.capacity];
        self.data.read_bytes(0, &mut buf);
        Ok(buf)
    }

    /// Replaces the region contents. Payloads shorter than the capacity are
    /// zero-padded on the right; longer ones are rejected.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > self.capacity {
            return Err(Error::CapacityExceeded {
                len: bytes.len(),
                capacity: self.capacity,
            });
        }
        let _read = self.read_lock.lock()?;
        let _write = self.write_lock.lock()?;
        self.data.write_bytes(0, bytes);
        self.data.fill_bytes(bytes.len(), self.capacity - bytes.len(), 0);
        Ok(())
        // Guards drop in reverse declaration order: write, then read.
    }

    /// Runs `body` while holding the coarse bulk lock, making a multi-step
    /// read/write sequence indivisible against every other process's
    /// bulk-level operations.
    pub fn lock<R>(&self, body: impl FnOnce() -> Result<R>) -> Result<R> {
        let _bulk = self.bulk_lock.lock()?;
        body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn unique_identifier(tag: &str) -> String {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        format!("region-test-{tag}-{}-{seq}", std::process::id())
    }

    #[test]
    fn write_then_read_round_trips_with_zero_padding() {
        let identifier = unique_identifier("pad");
        let region = DataRegion::open_or_create(&identifier, 16).unwrap();
        region.write(&[1, 2, 3, 4]).unwrap();
        let mut expected = vec![0u8; 16];
        expected[..4].copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(region.read().unwrap(), expected);
    }

    #[test]
    fn shorter_write_clears_stale_tail() {
        let identifier = unique_identifier("tail");
        let region = DataRegion::open_or_create(&identifier, 8).unwrap();
        region.write(&[9; 8]).unwrap();
        region.write(&[5]).unwrap();
        assert_eq!(region.read().unwrap(), vec![5, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn empty_write_zeroes_the_region() {
        let identifier = unique_identifier("empty");
        let region = DataRegion::open_or_create(&identifier, 4).unwrap();
        region.write(&[1, 2, 3, 4]).unwrap();
        region.write(&[]).unwrap();
        assert_eq!(region.read().unwrap(), vec![0; 4]);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let identifier = unique_identifier("oversize");
        let region = DataRegion::open_or_create(&identifier, 4).unwrap();
        let err = region.write(&[0; 5]).unwrap_err();
        assert!(err.is_capacity_exceeded());
        assert!(!err.is_validation());
    }

    #[test]
    fn capacity_bounds_are_enforced() {
        let identifier = unique_identifier("bounds");
        let too_small = DataRegion::open_or_create(&identifier, 0).err().unwrap();
        assert!(too_small.is_validation());
        let too_large = DataRegion::open_or_create(&identifier, MAX_CAPACITY + 1).err().unwrap();
        assert!(too_large.is_validation());
    }

    #[test]
    fn two_handles_share_the_same_bytes() {
        let identifier = unique_identifier("shared");
        let a = DataRegion::open_or_create(&identifier, 8).unwrap();
        let b = DataRegion::open_or_create(&identifier, 8).unwrap();
        a.write(&[42, 43]).unwrap();
        assert_eq!(&b.read().unwrap()[..2], &[42, 43]);
    }
}
