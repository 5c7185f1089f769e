// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named kernel primitives the protocol is written against: a shared memory
//! mapping, a mutex, and a single-slot auto-reset event, all addressable by
//! global name from unrelated processes.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::*;
