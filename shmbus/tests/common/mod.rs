// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU32, Ordering};

/// Identifier unique per test run so parallel tests and leftover segments
/// from earlier runs never collide.
pub fn unique_identifier(tag: &str) -> String {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    format!("shmbus-it-{tag}-{}-{seq}", std::process::id())
}
