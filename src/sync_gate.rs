// Sync gate
//
// Periodically decides whether the tracked actor's position is worth sending
// to the backend. A position is skipped only when it is both close to the last
// one sent and the last send is recent. A failed uplink leaves the Last-Sent
// Marker alone so the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::constants::{SYNC_INTERVAL, SYNC_MAX_SILENCE, SYNC_MIN_DISTANCE_M};
use crate::geocode::Geocoder;
use crate::geodesy::distance;
use crate::net::{LocationUplink, Uplink};
use crate::store::{ActorId, LastSent, PositionStore, TrackedPosition};

/// Result of the dual distance/time gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Skip,
    Send,
}

/// What one evaluation did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No actor configured or no position yet
    Inert,
    Skipped,
    Sent,
    Failed,
}

/// Decides and performs position uplinks for one actor
pub struct SyncGate<U, G> {
    uplink: Arc<U>,
    geocoder: Arc<G>,
    store: Arc<PositionStore>,
    actor: Option<ActorId>,
    min_distance: f64,
    max_silence: Duration,
}

impl<U: Uplink, G: Geocoder> SyncGate<U, G> {
    pub fn new(uplink: Arc<U>, geocoder: Arc<G>, store: Arc<PositionStore>, actor: Option<ActorId>) -> Self {
        SyncGate {
            uplink,
            geocoder,
            store,
            actor: actor.filter(|a| !a.is_empty()),
            min_distance: SYNC_MIN_DISTANCE_M,
            max_silence: SYNC_MAX_SILENCE,
        }
    }

    /// Skip iff the position moved less than the minimum distance AND the last
    /// send is younger than the maximum silence.
    pub fn evaluate(&self, last_sent: &LastSent, current: &TrackedPosition, now: DateTime<Utc>) -> GateDecision {
        let moved = distance(last_sent.lat, last_sent.lng, Some(current.lat), Some(current.lng));
        // A send stamped in the future counts as recent
        let recent = now
            .signed_duration_since(last_sent.sent_at)
            .to_std()
            .map_or(true, |elapsed| elapsed < self.max_silence);

        if moved < self.min_distance && recent {
            GateDecision::Skip
        } else {
            GateDecision::Send
        }
    }

    /// Evaluate once against the wall clock
    pub async fn tick(&self) -> TickOutcome {
        self.tick_at(Utc::now()).await
    }

    /// Evaluate once as of `now`
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickOutcome {
        let Some(actor) = self.actor.as_deref() else {
            return TickOutcome::Inert;
        };
        let Some(current) = self.store.position(actor).await else {
            debug!(actor, "No position to sync yet");
            return TickOutcome::Inert;
        };
        let last_sent = self.store.last_sent(actor).await;

        if self.evaluate(&last_sent, &current, now) == GateDecision::Skip {
            debug!(actor, "Position unchanged, skipping uplink");
            return TickOutcome::Skipped;
        }

        let address = self.geocoder.resolve_address(current.lat, current.lng).await;
        let payload = LocationUplink {
            identifier: actor.to_string(),
            lat: current.lat,
            lng: current.lng,
            address,
        };
        match self.uplink.send_location(&payload).await {
            Ok(()) => {
                self.store
                    .mark_sent(
                        actor,
                        LastSent {
                            lat: Some(current.lat),
                            lng: Some(current.lng),
                            sent_at: now,
                        },
                    )
                    .await;
                info!(actor, lat = current.lat, lng = current.lng, "Position synced");
                TickOutcome::Sent
            }
            Err(e) => {
                error!(actor, "Position uplink failed: {}", e);
                TickOutcome::Failed
            }
        }
    }

    /// Run the gate on the default cadence, starting right away
    pub fn spawn(self) -> SyncHandle {
        self.spawn_every(SYNC_INTERVAL)
    }

    pub fn spawn_every(self, period: Duration) -> SyncHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        });
        SyncHandle { task: Some(task) }
    }
}

/// Owner of the periodic sync task; dropping it cancels the interval
pub struct SyncHandle {
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, TrackError};
    use crate::geocode::StaticGeocoder;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingUplink {
        sent: Mutex<Vec<LocationUplink>>,
        failing: AtomicBool,
    }

    impl RecordingUplink {
        fn sent(&self) -> Vec<LocationUplink> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Uplink for RecordingUplink {
        async fn send_location(&self, payload: &LocationUplink) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(TrackError::Status {
                    status: 503,
                    url: "http://backend/api/location/update/".into(),
                });
            }
            self.sent.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn position(lat: f64, lng: f64) -> TrackedPosition {
        TrackedPosition { lat, lng, accuracy: 10.0, timestamp: t0() }
    }

    fn sent_at_t0() -> LastSent {
        LastSent { lat: Some(31.5204), lng: Some(74.3587), sent_at: t0() }
    }

    async fn setup(actor: Option<&str>) -> (Arc<RecordingUplink>, Arc<PositionStore>, SyncGate<RecordingUplink, StaticGeocoder>) {
        let uplink = Arc::new(RecordingUplink::default());
        let store = Arc::new(PositionStore::new());
        let gate = SyncGate::new(
            Arc::clone(&uplink),
            Arc::new(StaticGeocoder::new("Mall Road, Lahore")),
            Arc::clone(&store),
            actor.map(str::to_string),
        );
        (uplink, store, gate)
    }

    async fn place(store: &Arc<PositionStore>, actor: &str, lat: f64, lng: f64) {
        let writer = store.claim_writer(actor).await;
        assert!(writer.publish(lat, lng, 10.0, Utc::now()).await);
    }

    #[tokio::test]
    async fn test_small_move_within_silence_is_skipped() {
        let (_, _, gate) = setup(Some("rider-1")).await;
        let now = t0() + chrono::Duration::seconds(60);
        assert_eq!(gate.evaluate(&sent_at_t0(), &position(31.520420, 74.358710), now), GateDecision::Skip);
    }

    #[tokio::test]
    async fn test_large_move_is_sent() {
        let (_, _, gate) = setup(Some("rider-1")).await;
        let now = t0() + chrono::Duration::seconds(60);
        assert_eq!(gate.evaluate(&sent_at_t0(), &position(31.521400, 74.358700), now), GateDecision::Send);
    }

    #[tokio::test]
    async fn test_long_silence_is_sent() {
        let (_, _, gate) = setup(Some("rider-1")).await;
        let now = t0() + chrono::Duration::minutes(6);
        assert_eq!(gate.evaluate(&sent_at_t0(), &position(31.5204, 74.3587), now), GateDecision::Send);
    }

    #[tokio::test]
    async fn test_tick_skip_does_not_call_uplink() {
        let (uplink, store, gate) = setup(Some("rider-1")).await;
        store.mark_sent("rider-1", sent_at_t0()).await;
        place(&store, "rider-1", 31.520420, 74.358710).await;

        assert_eq!(gate.tick_at(t0() + chrono::Duration::seconds(60)).await, TickOutcome::Skipped);
        assert_eq!(uplink.sent().len(), 0);
        assert_eq!(store.last_sent("rider-1").await, sent_at_t0());
    }

    #[tokio::test]
    async fn test_tick_large_move_calls_uplink() {
        let (uplink, store, gate) = setup(Some("rider-1")).await;
        store.mark_sent("rider-1", sent_at_t0()).await;
        place(&store, "rider-1", 31.521400, 74.358700).await;

        assert_eq!(gate.tick_at(t0() + chrono::Duration::seconds(60)).await, TickOutcome::Sent);
        assert_eq!(uplink.sent().len(), 1);
        assert_eq!(uplink.sent()[0].lat, 31.5214);
    }

    #[tokio::test]
    async fn test_tick_long_silence_calls_uplink() {
        let (uplink, store, gate) = setup(Some("rider-1")).await;
        store.mark_sent("rider-1", sent_at_t0()).await;
        place(&store, "rider-1", 31.5204, 74.3587).await;

        let now = t0() + chrono::Duration::minutes(6);
        assert_eq!(gate.tick_at(now).await, TickOutcome::Sent);
        assert_eq!(uplink.sent().len(), 1);
        assert_eq!(store.last_sent("rider-1").await.sent_at, now);
    }

    #[tokio::test]
    async fn test_never_sent_is_sent() {
        let (_, _, gate) = setup(Some("rider-1")).await;
        assert_eq!(gate.evaluate(&LastSent::default(), &position(31.5204, 74.3587), t0()), GateDecision::Send);
    }

    #[tokio::test]
    async fn test_inert_without_actor_or_position() {
        let (uplink, store, gate) = setup(None).await;
        place(&store, "rider-1", 31.5, 74.3).await;
        assert_eq!(gate.tick().await, TickOutcome::Inert);

        let (_, _, gate) = setup(Some("rider-1")).await;
        assert_eq!(gate.tick().await, TickOutcome::Inert);
        assert!(uplink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_marks_last_sent() {
        let (uplink, store, gate) = setup(Some("rider-1")).await;
        place(&store, "rider-1", 31.5204, 74.3587).await;

        assert_eq!(gate.tick_at(t0()).await, TickOutcome::Sent);
        assert_eq!(
            uplink.sent(),
            vec![LocationUplink {
                identifier: "rider-1".into(),
                lat: 31.5204,
                lng: 74.3587,
                address: "Mall Road, Lahore".into(),
            }]
        );
        assert_eq!(store.last_sent("rider-1").await, sent_at_t0());

        // Back to back: the fresh marker suppresses a second send
        assert_eq!(gate.tick_at(t0()).await, TickOutcome::Skipped);
        assert_eq!(uplink.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_marker() {
        let (uplink, store, gate) = setup(Some("rider-1")).await;
        place(&store, "rider-1", 31.5204, 74.3587).await;
        uplink.failing.store(true, Ordering::SeqCst);

        assert_eq!(gate.tick_at(t0()).await, TickOutcome::Failed);
        assert_eq!(store.last_sent("rider-1").await, LastSent::default());

        uplink.failing.store(false, Ordering::SeqCst);
        assert_eq!(gate.tick_at(t0()).await, TickOutcome::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawn_evaluates_immediately_then_on_cadence() {
        let (uplink, store, gate) = setup(Some("rider-1")).await;
        place(&store, "rider-1", 31.5204, 74.3587).await;

        let handle = gate.spawn();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(uplink.sent().len(), 1);

        // Moved ~111 m; picked up on the next tick
        place(&store, "rider-1", 31.5214, 74.3587).await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(uplink.sent().len(), 1);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(uplink.sent().len(), 2);

        handle.stop().await;
        place(&store, "rider-1", 31.6, 74.4).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(uplink.sent().len(), 2);
    }
}
