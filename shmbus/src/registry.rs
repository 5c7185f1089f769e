// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cross-process instance-id allocation and the shared metadata block.
//!
//! Two small named segments per identifier: the id table, an ordered list of
//! live instance ids, and the metadata block recording which instance
//! triggered the latest notification, the agreed region capacity, and the
//! allocation seed. Lock order on this side is id → meta, and the facade
//! only ever takes them under (or after) the bulk lock, so the global order
//! stays acyclic.

use crate::error::{Error, Result};
use crate::naming::{object_name, Role};
use crate::platform::{NamedMapping, NamedMutex};
use tracing::debug;

/// Most instances that can be live on one identifier at once.
pub const ID_TABLE_CAPACITY: usize = 2048;

const ID_ENTRY_LEN: usize = 4;
const ID_TABLE_LEN: usize = ID_TABLE_CAPACITY * ID_ENTRY_LEN;

const META_MODIFY_ID: usize = 0;
const META_CAPACITY: usize = 4;
const META_ID_SEED: usize = 8;
const META_LEN: usize = 12;

pub struct InstanceRegistry {
    ids: NamedMapping,
    id_lock: NamedMutex,
    meta: NamedMapping,
    meta_lock: NamedMutex,
}

impl InstanceRegistry {
    pub fn open(identifier: &str) -> Result<InstanceRegistry> {
        let ids = NamedMapping::open_or_create(
            &object_name(identifier, Role::IdTableMap, None),
            ID_TABLE_LEN,
        )?;
        let id_lock = NamedMutex::open_or_create(&object_name(identifier, Role::IdMutex, None))?;
        let meta =
            NamedMapping::open_or_create(&object_name(identifier, Role::MetaMap, None), META_LEN)?;
        let meta_lock = NamedMutex::open_or_create(&object_name(identifier, Role::MetaMutex, None))?;
        Ok(InstanceRegistry {
            ids,
            id_lock,
            meta,
            meta_lock,
        })
    }

    /// Joins the table: allocates a fresh id and resolves the region
    /// capacity. The first process to attach persists its requested
    /// capacity; everyone later gets that value back and their own request
    /// is ignored.
    pub fn attach(&self, requested_capacity: usize) -> Result<(i32, usize)> {
        let id = {
            let _table = self.id_lock.lock()?;
            let ids = self.read_table();
            if ids.len() >= ID_TABLE_CAPACITY {
                return Err(Error::InstanceTableFull(ids.len()));
            }
            let id = self.next_id(&ids)?;
            self.ids.write_i32(ids.len() * ID_ENTRY_LEN, id);
            id
        };

        let capacity = {
            let _meta = self.meta_lock.lock()?;
            let persisted = self.meta.read_i32(META_CAPACITY);
            if persisted > 0 {
                persisted as usize
            } else {
                self.meta.write_i32(META_CAPACITY, requested_capacity as i32);
                requested_capacity
            }
        };

        debug!(id, capacity, "attached to shared id table");
        Ok((id, capacity))
    }

    /// Removes `id` from the table, compacting the remaining entries and
    /// zero-filling the tail.
    pub fn detach(&self, id: i32) -> Result<()> {
        self.remove_ids(&[id])
    }

    /// Bulk removal used both by `detach` and by dead-instance eviction
    /// during a broadcast.
    pub fn remove_ids(&self, gone: &[i32]) -> Result<()> {
        let _table = self.id_lock.lock()?;
        let mut ids = self.read_table();
        ids.retain(|id| !gone.contains(id));
        self.write_table(&ids);
        Ok(())
    }

    /// Snapshot of the live ids, in table order.
    pub fn list_live(&self) -> Result<Vec<i32>> {
        let _table = self.id_lock.lock()?;
        Ok(self.read_table())
    }

    pub fn set_modify_id(&self, id: i32) -> Result<()> {
        let _meta = self.meta_lock.lock()?;
        self.meta.write_i32(META_MODIFY_ID, id);
        Ok(())
    }

    pub fn get_modify_id(&self) -> Result<i32> {
        let _meta = self.meta_lock.lock()?;
        Ok(self.meta.read_i32(META_MODIFY_ID))
    }

    /// Next id under the seed counter, falling back to a bounded
    /// smallest-absent scan once the seed saturates. Caller holds the id
    /// lock.
    fn next_id(&self, live: &[i32]) -> Result<i32> {
        let _meta = self.meta_lock.lock()?;
        let seed = self.meta.read_i32(META_ID_SEED);
        if seed == i32::MAX {
            // Seed exhausted: reuse the smallest positive id nobody holds.
            // At most table-capacity candidates can be taken, so the scan
            // never needs to look past capacity + 1.
            for candidate in 1..=(ID_TABLE_CAPACITY as i32 + 1) {
                if !live.contains(&candidate) {
                    return Ok(candidate);
                }
            }
            // Unreachable while the table bound holds; the table was checked
            // for fullness before calling.
            return Err(Error::InstanceTableFull(live.len()));
        }
        let id = seed + 1;
        self.meta.write_i32(META_ID_SEED, id);
        Ok(id)
    }

    fn read_table(&self) -> Vec<i32> {
        let mut ids = Vec::new();
        for slot in 0..ID_TABLE_CAPACITY {
            let id = self.ids.read_i32(slot * ID_ENTRY_LEN);
            if id <= 0 {
                break;
            }
            ids.push(id);
        }
        ids
    }

    fn write_table(&self, ids: &[i32]) {
        for (slot, id) in ids.iter().enumerate() {
            self.ids.write_i32(slot * ID_ENTRY_LEN, *id);
        }
        let used = ids.len() * ID_ENTRY_LEN;
        self.ids.fill_bytes(used, ID_TABLE_LEN - used, 0);
    }

    #[cfg(test)]
    fn force_id_seed(&self, seed: i32) {
        self.meta.write_i32(META_ID_SEED, seed);
    }

    #[cfg(test)]
    fn force_table(&self, ids: &[i32]) {
        self.write_table(ids);
    }
}
