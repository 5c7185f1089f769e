// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One process's attachment to an identifier: region access, membership,
//! and the listener loops that turn incoming signals into callbacks.

use crate::bus::{NotificationBus, SignalKind};
use crate::error::{Error, Result};
use crate::naming::{object_name, Role, MAX_IDENTIFIER_LEN};
use crate::platform::{NamedEvent, NamedMutex};
use crate::region::{DataRegion, MAX_CAPACITY};
use crate::registry::InstanceRegistry;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

type InstanceCallback = Arc<dyn Fn(i32) + Send + Sync>;
type DataCallback = Arc<dyn Fn(i32, Vec<u8>) + Send + Sync>;
type DisposingCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default, Clone)]
struct Callbacks {
    added: Option<InstanceCallback>,
    removed: Option<InstanceCallback>,
    data_changed: Option<DataCallback>,
    disposing: Option<DisposingCallback>,
}

struct Shared {
    identifier: String,
    id: i32,
    capacity: usize,
    region: DataRegion,
    registry: InstanceRegistry,
    bus: NotificationBus,
    callbacks: Callbacks,
    terminate: AtomicBool,
    disposed: AtomicBool,
    added_event: NamedEvent,
    removed_event: NamedEvent,
    changed_event: NamedEvent,
    added_ack: NamedEvent,
    changed_ack: NamedEvent,
}

impl Shared {
    fn inbound(&self, kind: SignalKind) -> &NamedEvent {
        match kind {
            SignalKind::Added => &self.added_event,
            SignalKind::Removed => &self.removed_event,
            SignalKind::DataChanged => &self.changed_event,
        }
    }
}

/// Builder carrying the user callbacks registered before the listener loops
/// start, so no early notification can be missed.
pub struct SharedInstanceBuilder {
    identifier: String,
    capacity: usize,
    callbacks: Callbacks,
}

impl SharedInstanceBuilder {
    /// Called with the joining instance's id when another instance attaches
    /// to this identifier.
    pub fn on_instance_added(mut self, f: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.callbacks.added = Some(Arc::new(f));
        self
    }

    /// Called with the departed instance's id, for both orderly leaves and
    /// dead-instance evictions.
    pub fn on_instance_removed(mut self, f: impl Fn(i32) + Send + Sync + 'static) -> Self {
        self.callbacks.removed = Some(Arc::new(f));
        self
    }

    /// Called with the writer's id and a fresh copy of the full region after
    /// another instance wrote it.
    pub fn on_data_changed(mut self, f: impl Fn(i32, Vec<u8>) + Send + Sync + 'static) -> Self {
        self.callbacks.data_changed = Some(Arc::new(f));
        self
    }

    /// Called once, synchronously, while this instance is being disposed.
    pub fn on_disposing(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.disposing = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Result<SharedInstance> {
        SharedInstance::attach(self.identifier, self.capacity, self.callbacks)
    }
}

/// A live attachment to a named shared region.
///
/// Dropping the instance disposes it; `dispose` is also available explicitly
/// and is idempotent. Nothing relies on a finalizer running late: every
/// handle is released on the disposal path itself.
pub struct SharedInstance {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SharedInstance {
    pub fn builder(identifier: impl Into<String>, capacity: usize) -> SharedInstanceBuilder {
        SharedInstanceBuilder {
            identifier: identifier.into(),
            capacity,
            callbacks: Callbacks::default(),
        }
    }

    /// Attaches without callbacks; a plain read/write participant.
    pub fn new(identifier: impl Into<String>, capacity: usize) -> Result<SharedInstance> {
        Self::builder(identifier, capacity).build()
    }

    fn attach(identifier: String, capacity: usize, callbacks: Callbacks) -> Result<SharedInstance> {
        validate(&identifier, capacity)?;

        // A construction-scoped handle to the bulk mutex; the region keeps
        // its own handle to the same named object.
        let bulk = NamedMutex::open_or_create(&object_name(&identifier, Role::BulkMutex, None))?;
        let guard = bulk.lock()?;

        let registry = InstanceRegistry::open(&identifier)?;
        let (id, resolved_capacity) = registry.attach(capacity)?;
        let region = DataRegion::open_or_create(&identifier, resolved_capacity)?;

        let claim = |role: Role| -> Result<NamedEvent> {
            let event = NamedEvent::open_or_create(&object_name(&identifier, role, Some(id)))?;
            event.claim();
            Ok(event)
        };
        let added_event = claim(Role::AddedEvent)?;
        let removed_event = claim(Role::RemovedEvent)?;
        let changed_event = claim(Role::DataChangedEvent)?;
        let added_ack = claim(Role::AddedAckEvent)?;
        let changed_ack = claim(Role::DataChangedAckEvent)?;

        drop(guard);

        let shared = Arc::new(Shared {
            bus: NotificationBus::new(&identifier, id),
            identifier,
            id,
            capacity: resolved_capacity,
            region,
            registry,
            callbacks,
            terminate: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            added_event,
            removed_event,
            changed_event,
            added_ack,
            changed_ack,
        });
        debug!(id, capacity = resolved_capacity, "instance attached");

        let mut workers = Vec::with_capacity(4);
        // Announce the join without blocking the constructor.
        workers.push(spawn_worker(format!("shmbus-announce-{id}"), {
            let shared = shared.clone();
            move || {
                let outcome = shared
                    .region
                    .lock(|| shared.bus.notify(&shared.registry, SignalKind::Added, true));
                if let Err(err) = outcome {
                    warn!(%err, "failed to announce instance");
                }
            }
        })?);
        for kind in [SignalKind::Added, SignalKind::Removed, SignalKind::DataChanged] {
            workers.push(spawn_worker(format!("shmbus-listen-{id}-{kind:?}"), {
                let shared = shared.clone();
                move || listener_loop(&shared, kind)
            })?);
        }

        Ok(SharedInstance {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// This instance's id, unique among live attachments to the identifier.
    pub fn id(&self) -> i32 {
        self.shared.id
    }

    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    /// The resolved region capacity, fixed by whichever instance attached
    /// first.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Copies out the full region, exactly `capacity` bytes.
    pub fn read(&self) -> Result<Vec<u8>> {
        self.shared.region.read()
    }

    /// Writes the region (zero-padded to capacity) and synchronously
    /// broadcasts the change to every other live instance. Both steps happen
    /// under one bulk acquisition.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        let shared = &self.shared;
        shared.region.lock(|| {
            shared.region.write(bytes)?;
            shared
                .bus
                .notify(&shared.registry, SignalKind::DataChanged, true)
        })
    }

    /// Runs `body` under the coarse bulk lock: the only way to make a
    /// multi-step read/write sequence indivisible against other processes.
    /// Calls to `read` and `write` on this instance are legal inside the
    /// body.
    pub fn lock_read_write<R>(&self, body: impl FnOnce() -> Result<R>) -> Result<R> {
        self.shared.region.lock(body)
    }

    /// Snapshot of every live id attached to this identifier.
    pub fn live_instances(&self) -> Result<Vec<i32>> {
        self.shared.registry.list_live()
    }

    pub fn instance_count(&self) -> Result<usize> {
        Ok(self.live_instances()?.len())
    }

    /// Probes whether `id` is a live attachment of `identifier` by checking
    /// whether its inbound join signal exists. Probing an id that never
    /// existed briefly creates the signal object as a side effect, exactly
    /// like the detection done during a broadcast; the probe removes it
    /// again on the way out.
    pub fn is_instance_alive(identifier: &str, id: i32) -> Result<bool> {
        let event = NamedEvent::open_or_create(&object_name(identifier, Role::AddedEvent, Some(id)))?;
        Ok(!event.created_new())
    }

    /// Leaves the identifier: stops the listener loops, tells the owner via
    /// `on_disposing`, broadcasts the departure, and releases the id.
    ///
    /// The `Removed` broadcast runs while this id is still in the table, so
    /// the fan-out still computes the right audience; only afterwards is the
    /// id detached.
    pub fn dispose(&self) -> Result<()> {
        let shared = &self.shared;
        if shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(id = shared.id, "disposing instance");

        shared.terminate.store(true, Ordering::SeqCst);
        for kind in [SignalKind::Added, SignalKind::Removed, SignalKind::DataChanged] {
            // One final set per loop so each wait unblocks and observes the
            // termination flag.
            if let Err(err) = shared.inbound(kind).signal() {
                warn!(%err, ?kind, "failed to release listener loop");
            }
        }
        for worker in self.take_workers() {
            _ = worker.join();
        }
        for event in [
            &shared.added_event,
            &shared.removed_event,
            &shared.changed_event,
            &shared.added_ack,
            &shared.changed_ack,
        ] {
            event.unlink();
        }

        if let Some(disposing) = &shared.callbacks.disposing {
            disposing();
        }

        // The departure broadcast is best-effort; the id is released no
        // matter what, a disposed instance must never stay in the table.
        if let Err(err) = shared
            .region
            .lock(|| shared.bus.notify(&shared.registry, SignalKind::Removed, false))
        {
            warn!(%err, id = shared.id, "failed to broadcast departure");
        }
        shared.registry.detach(shared.id)?;
        debug!(id = shared.id, "instance disposed");
        Ok(())
    }

    fn take_workers(&self) -> Vec<JoinHandle<()>> {
        match self.workers.lock() {
            Ok(mut workers) => mem::take(&mut *workers),
            Err(poisoned) => mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl Drop for SharedInstance {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            warn!(%err, id = self.shared.id, "disposal failed");
        }
    }
}

fn validate(identifier: &str, capacity: usize) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(Error::EmptyIdentifier);
    }
    if identifier.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(Error::IdentifierTooLong);
    }
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(Error::CapacityOutOfRange(capacity));
    }
    Ok(())
}

fn spawn_worker(
    name: String,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    Ok(thread::Builder::new().name(name).spawn(body)?)
}

/// Blocks on one inbound signal kind for the life of the instance. The final
/// set issued by `dispose` is what releases the last wait.
fn listener_loop(shared: &Arc<Shared>, kind: SignalKind) {
    trace!(id = shared.id, ?kind, "listener started");
    let event = shared.inbound(kind);
    loop {
        match event.wait(None) {
            Ok(_) => {}
            Err(err) => {
                warn!(%err, ?kind, "listener wait failed");
                break;
            }
        }
        if shared.terminate.load(Ordering::SeqCst) {
            break;
        }
        if let Err(err) = deliver(shared, kind) {
            warn!(%err, ?kind, "failed to deliver notification");
        }
    }
    trace!(id = shared.id, ?kind, "listener stopped");
}

/// Acknowledges the signal and hands the event to the user callback on a
/// fresh thread, so the loop is back in its wait immediately and re-entrant
/// calls from the callback into the instance cannot block delivery.
fn deliver(shared: &Arc<Shared>, kind: SignalKind) -> Result<()> {
    let modify_id = shared.registry.get_modify_id()?;
    match kind {
        SignalKind::Added => {
            shared.added_ack.signal()?;
            if let Some(added) = shared.callbacks.added.clone() {
                dispatch(move || added(modify_id));
            }
        }
        SignalKind::Removed => {
            if let Some(removed) = shared.callbacks.removed.clone() {
                dispatch(move || removed(modify_id));
            }
        }
        SignalKind::DataChanged => {
            let data = shared.region.read()?;
            shared.changed_ack.signal()?;
            if let Some(data_changed) = shared.callbacks.data_changed.clone() {
                dispatch(move || data_changed(modify_id, data));
            }
        }
    }
    Ok(())
}

fn dispatch(body: impl FnOnce() + Send + 'static) {
    let spawned = thread::Builder::new()
        .name("shmbus-callback".into())
        .spawn(body);
    if let Err(err) = spawned {
        warn!(%err, "failed to spawn callback thread");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_identifier_is_rejected() {
        let err = SharedInstance::new("", 16).err().unwrap();
        assert!(matches!(err, Error::EmptyIdentifier));
        assert!(err.is_validation());
    }

    #[test]
    fn whitespace_identifier_is_rejected() {
        assert!(SharedInstance::new("   ", 16).err().unwrap().is_validation());
    }

    #[test]
    fn over_long_identifier_is_rejected() {
        let identifier = "x".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(matches!(
            SharedInstance::new(identifier, 16),
            Err(Error::IdentifierTooLong)
        ));
    }

    #[test]
    fn capacity_bounds_are_validated_before_any_object_exists() {
        assert!(SharedInstance::new("cap-check", 0).err().unwrap().is_validation());
        assert!(SharedInstance::new("cap-check", MAX_CAPACITY + 1)
            .err()
            .unwrap()
            .is_validation());
    }
}
