// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by the bus.
///
/// Abandoned-lock conditions never show up here: recovering from a lock whose
/// owner died counts as a normal acquisition. Any other failure to create or
/// open a named kernel object is fatal to construction and arrives as `Io`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shared identifier must not be empty")]
    EmptyIdentifier,

    #[error("shared identifier exceeds {max} characters", max = crate::naming::MAX_IDENTIFIER_LEN)]
    IdentifierTooLong,

    #[error("capacity {0} is outside the supported range (0, 16 MiB]")]
    CapacityOutOfRange(usize),

    #[error("payload of {len} bytes exceeds the region capacity of {capacity}")]
    CapacityExceeded { len: usize, capacity: usize },

    #[error("the id table already holds {0} live instances")]
    InstanceTableFull(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for construction-argument errors (identifier or capacity bounds).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::EmptyIdentifier | Error::IdentifierTooLong | Error::CapacityOutOfRange(_)
        )
    }

    /// True when a fixed capacity was exhausted: an oversized write payload
    /// or a full id table.
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::InstanceTableFull(_)
        )
    }
}

#[cfg(unix)]
impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(io::Error::from(err))
    }
}
