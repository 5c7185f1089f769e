// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Broker-less shared-memory data bus.
//!
//! Independent processes attach to a named region, read and write it with
//! serialized consistency, and get push notifications when the membership or
//! the data changes. The whole protocol runs over named kernel objects
//! (shared memory segments, mutexes, and auto-reset signals) with no broker
//! process and no sockets.
//!
//! ```no_run
//! # fn main() -> shmbus::Result<()> {
//! let instance = shmbus::SharedInstance::builder("telemetry-frame", 64)
//!     .on_data_changed(|writer, data| println!("{writer} wrote {data:?}"))
//!     .build()?;
//! instance.write(b"hello")?;
//! instance.dispose()?;
//! # Ok(())
//! # }
//! ```

mod bus;
mod error;
mod instance;
mod naming;
pub mod platform;
mod region;
mod registry;

pub use bus::SignalKind;
pub use error::{Error, Result};
pub use instance::{SharedInstance, SharedInstanceBuilder};
pub use naming::MAX_IDENTIFIER_LEN;
pub use region::{DataRegion, MAX_CAPACITY};
pub use registry::{InstanceRegistry, ID_TABLE_CAPACITY};
