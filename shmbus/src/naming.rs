// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mapping from (identifier, role, optional instance id) to global object
//! names.
//!
//! Every cooperating process computes names independently, so the mapping has
//! to be a pure function of its inputs. Identifiers can be up to 200
//! arbitrary characters while POSIX shm names must be a single short path
//! component, so the identifier is folded into a fixed-width hash instead of
//! being embedded verbatim. `DefaultHasher::new()` uses fixed keys and
//! produces the same digest in every process running the same build.

use std::collections::hash_map::DefaultHasher;
use std::ffi::CString;
use std::hash::{Hash, Hasher};

/// Longest accepted identifier, in characters.
pub const MAX_IDENTIFIER_LEN: usize = 200;

/// Every named kernel object a region family uses.
///
/// The per-identifier roles name the data region, its three mutexes, and the
/// registry segments. The per-instance roles name one instance's inbound
/// signals and their acknowledgment companions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    DataMap,
    ReadMutex,
    WriteMutex,
    BulkMutex,
    IdTableMap,
    IdMutex,
    MetaMap,
    MetaMutex,
    AddedEvent,
    RemovedEvent,
    DataChangedEvent,
    AddedAckEvent,
    DataChangedAckEvent,
}

impl Role {
    fn tag(self) -> &'static str {
        match self {
            Role::DataMap => "data",
            Role::ReadMutex => "rlock",
            Role::WriteMutex => "wlock",
            Role::BulkMutex => "bulk",
            Role::IdTableMap => "ids",
            Role::IdMutex => "idlock",
            Role::MetaMap => "meta",
            Role::MetaMutex => "metalock",
            Role::AddedEvent => "added",
            Role::RemovedEvent => "removed",
            Role::DataChangedEvent => "changed",
            Role::AddedAckEvent => "added-ack",
            Role::DataChangedAckEvent => "changed-ack",
        }
    }

    /// Per-instance roles require an id; per-identifier roles must not get
    /// one.
    pub fn is_per_instance(self) -> bool {
        matches!(
            self,
            Role::AddedEvent
                | Role::RemovedEvent
                | Role::DataChangedEvent
                | Role::AddedAckEvent
                | Role::DataChangedAckEvent
        )
    }
}

fn identifier_digest(identifier: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    identifier.hash(&mut hasher);
    hasher.finish()
}

/// Global name for one synchronization object or memory mapping.
pub fn object_name(identifier: &str, role: Role, id: Option<i32>) -> CString {
    debug_assert_eq!(role.is_per_instance(), id.is_some());
    let digest = identifier_digest(identifier);
    let name = match id {
        Some(id) => format!("/shmbus-{digest:016x}-{}-{id}", role.tag()),
        None => format!("/shmbus-{digest:016x}-{}", role.tag()),
    };
    // The name contains no interior NUL by construction.
    CString::new(name).unwrap()
}
