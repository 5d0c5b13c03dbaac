// Shared per-actor position state
//
// Holds the Tracked Position and Last-Sent Marker for each actor. The store is
// created once and passed (as `Arc`) to whoever needs it. Each actor slot has at
// most one live writer: claiming a writer revokes the previous one, and a
// revoked writer's updates are rejected under the same lock that applies them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

/// Stable identifier of a tracked field user
pub type ActorId = String;

/// Latest admitted position for one actor
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TrackedPosition {
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

/// Payload accepted by the location-update sink
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationUpdate {
    pub actor_id: ActorId,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

impl LocationUpdate {
    fn position(&self) -> TrackedPosition {
        TrackedPosition {
            lat: self.lat,
            lng: self.lng,
            accuracy: self.accuracy,
            timestamp: self.timestamp,
        }
    }
}

/// Last position successfully transmitted for an actor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LastSent {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub sent_at: DateTime<Utc>,
}

impl Default for LastSent {
    /// Nothing sent yet: no coordinates, epoch time
    fn default() -> Self {
        LastSent {
            lat: None,
            lng: None,
            sent_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    position: Option<TrackedPosition>,
    last_sent: Option<LastSent>,
    /// Generation of the writer allowed to publish; 0 = nobody
    writer: u64,
}

/// In-memory store keyed by actor id
#[derive(Debug, Default)]
pub struct PositionStore {
    slots: RwLock<HashMap<ActorId, Slot>>,
    next_generation: AtomicU64,
}

impl PositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the single writer for `actor`, revoking any previous writer.
    pub async fn claim_writer(self: &Arc<Self>, actor: &str) -> SlotWriter {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.slots
            .write()
            .await
            .entry(actor.to_string())
            .or_default()
            .writer = generation;
        debug!(actor, generation, "Claimed position writer");
        SlotWriter {
            store: Arc::clone(self),
            actor: actor.to_string(),
            generation,
        }
    }

    /// Apply an update if `generation` still owns the slot and the update is
    /// not older than what is held. Returns whether the slot changed.
    async fn apply(&self, generation: u64, update: LocationUpdate) -> bool {
        let mut slots = self.slots.write().await;
        let slot = match slots.get_mut(&update.actor_id) {
            Some(s) if s.writer == generation && generation != 0 => s,
            _ => {
                debug!(actor = %update.actor_id, generation, "Dropping update from revoked writer");
                return false;
            }
        };
        if let Some(held) = slot.position {
            if update.timestamp < held.timestamp {
                debug!(actor = %update.actor_id, "Dropping stale update");
                return false;
            }
        }
        slot.position = Some(update.position());
        true
    }

    async fn revoke(&self, actor: &str, generation: u64) {
        if let Some(slot) = self.slots.write().await.get_mut(actor) {
            if slot.writer == generation {
                slot.writer = 0;
            }
        }
    }

    /// Current Tracked Position for an actor
    pub async fn position(&self, actor: &str) -> Option<TrackedPosition> {
        self.slots.read().await.get(actor).and_then(|s| s.position)
    }

    /// All actors with a Tracked Position
    pub async fn positions(&self) -> HashMap<ActorId, TrackedPosition> {
        self.slots
            .read()
            .await
            .iter()
            .filter_map(|(id, s)| s.position.map(|p| (id.clone(), p)))
            .collect()
    }

    /// Last-Sent Marker, created on first access
    pub async fn last_sent(&self, actor: &str) -> LastSent {
        *self
            .slots
            .write()
            .await
            .entry(actor.to_string())
            .or_default()
            .last_sent
            .get_or_insert_with(LastSent::default)
    }

    /// Advance the Last-Sent Marker after a successful uplink
    pub async fn mark_sent(&self, actor: &str, marker: LastSent) {
        self.slots
            .write()
            .await
            .entry(actor.to_string())
            .or_default()
            .last_sent = Some(marker);
    }
}

/// Exclusive write access to one actor's Tracked Position
#[derive(Debug)]
pub struct SlotWriter {
    store: Arc<PositionStore>,
    actor: ActorId,
    generation: u64,
}

impl SlotWriter {
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Publish a position for this writer's actor. Returns false if the
    /// writer was revoked or the sample is stale.
    pub async fn publish(&self, lat: f64, lng: f64, accuracy: f64, timestamp: DateTime<Utc>) -> bool {
        let update = LocationUpdate {
            actor_id: self.actor.clone(),
            lat,
            lng,
            accuracy,
            timestamp,
        };
        self.store.apply(self.generation, update).await
    }

    /// Give up the slot; later publishes through this writer are rejected.
    pub async fn revoke(&self) {
        self.store.revoke(&self.actor, self.generation).await;
    }
}
