// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod event;
mod mapping;
mod mutex;

pub use event::*;
pub use mapping::*;
pub use mutex::*;
