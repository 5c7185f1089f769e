// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort fan-out broadcast and liveness detection.
//!
//! There is no registry of listeners: the id table is the membership source
//! and the existence of a target's named event is the liveness proxy. An
//! event that survived since its owner claimed it means a listener is still
//! waiting on it; a name this broadcast had to create means the owner is
//! gone and gets evicted on the spot.

use crate::error::Result;
use crate::naming::{object_name, Role};
use crate::platform::NamedEvent;
use crate::registry::InstanceRegistry;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Bound on the synchronous acknowledgment handshake.
const ACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Breather between fan-out iterations so concurrent broadcasters are not
/// starved.
const FANOUT_YIELD: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    /// A new instance joined. Broadcast synchronously.
    Added,
    /// An instance left. Fire-and-forget, so cleanup and dead-instance
    /// eviction never block on a handshake.
    Removed,
    /// The region contents changed. Broadcast synchronously; listeners
    /// re-read the region themselves, the signal carries no payload.
    DataChanged,
}

impl SignalKind {
    pub(crate) fn event_role(self) -> Role {
        match self {
            SignalKind::Added => Role::AddedEvent,
            SignalKind::Removed => Role::RemovedEvent,
            SignalKind::DataChanged => Role::DataChangedEvent,
        }
    }

    fn ack_role(self) -> Option<Role> {
        match self {
            SignalKind::Added => Some(Role::AddedAckEvent),
            SignalKind::Removed => None,
            SignalKind::DataChanged => Some(Role::DataChangedAckEvent),
        }
    }
}

pub struct NotificationBus {
    identifier: String,
    own_id: i32,
}

impl NotificationBus {
    pub fn new(identifier: &str, own_id: i32) -> NotificationBus {
        NotificationBus {
            identifier: identifier.to_owned(),
            own_id,
        }
    }

    /// Broadcasts `kind` to every live instance except the broadcaster,
    /// then evicts every instance found dead along the way and tells every
    /// survivor, the broadcaster included, about each departure.
    pub fn notify(
        &self,
        registry: &InstanceRegistry,
        kind: SignalKind,
        synchronous: bool,
    ) -> Result<()> {
        registry.set_modify_id(self.own_id)?;
        let dead = self.fan_out(registry, kind, synchronous, false)?;
        if dead.is_empty() {
            return Ok(());
        }

        debug!(?dead, "evicting instances that no longer listen");
        registry.remove_ids(&dead)?;
        for id in dead {
            registry.set_modify_id(id)?;
            // Survivors observe the departure exactly like an orderly leave.
            // The discoverer did not cause it, so its own removed callback
            // fires like everyone else's.
            self.fan_out(registry, SignalKind::Removed, false, true)?;
        }
        Ok(())
    }

    /// One enumeration of the table: signals the living, returns the dead.
    fn fan_out(
        &self,
        registry: &InstanceRegistry,
        kind: SignalKind,
        synchronous: bool,
        include_self: bool,
    ) -> Result<Vec<i32>> {
        let mut dead = Vec::new();
        for id in registry.list_live()? {
            if id == self.own_id && !include_self {
                continue;
            }
            let event =
                NamedEvent::open_or_create(&object_name(&self.identifier, kind.event_role(), Some(id)))?;
            if event.created_new() {
                // Nobody was listening on a name we had to create. The
                // broadcaster's own signals can already be unlinked
                // mid-disposal; only peers are marked dead.
                if id != self.own_id {
                    trace!(id, ?kind, "target instance is dead");
                    dead.push(id);
                }
            } else {
                self.signal_target(&event, kind, synchronous, id)?;
            }
            drop(event);
            thread::sleep(FANOUT_YIELD);
        }
        Ok(dead)
    }

    fn signal_target(
        &self,
        event: &NamedEvent,
        kind: SignalKind,
        synchronous: bool,
        id: i32,
    ) -> Result<()> {
        let ack_role = match kind.ack_role() {
            Some(role) if synchronous => role,
            _ => {
                trace!(id, ?kind, "signaling");
                return event.signal();
            }
        };
        let ack = NamedEvent::open_or_create(&object_name(&self.identifier, ack_role, Some(id)))?;
        event.signal()?;
        if !ack.created_new() {
            // Bounded handshake; a listener that never answers only costs
            // the timeout.
            if !ack.wait(Some(ACK_TIMEOUT))? {
                trace!(id, ?kind, "listener did not acknowledge in time");
            }
        }
        Ok(())
    }
}
