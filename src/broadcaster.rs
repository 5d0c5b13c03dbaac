// Throttled broadcaster
//
// Bridges the continuous high-accuracy watch for one actor into the shared
// position store: poor fixes are dropped, coordinates are rounded, and at most
// one update per window reaches the store. Within one session a fix never
// replaces a more accurate one.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::constants::{BROADCAST_THROTTLE, MAX_BROADCAST_ACCURACY_M, WATCH_FIX_TIMEOUT};
use crate::geodesy::Coordinate;
use crate::provider::{Fix, FixRequest, LocationProvider};
use crate::sampler::AdmissionFilter;
use crate::store::{ActorId, PositionStore, SlotWriter};
use crate::throttle::Throttle;

/// One actor's watch: its task and its write access to the store
struct Session {
    actor: ActorId,
    task: JoinHandle<()>,
    writer: Arc<SlotWriter>,
}

/// Forwards throttled positions for the currently tracked actor
pub struct Broadcaster<P: LocationProvider> {
    provider: Arc<P>,
    store: Arc<PositionStore>,
    window: Duration,
    max_accuracy: f64,
    session: Option<Session>,
}

impl<P: LocationProvider> Broadcaster<P> {
    pub fn new(provider: Arc<P>, store: Arc<PositionStore>) -> Self {
        Broadcaster {
            provider,
            store,
            window: BROADCAST_THROTTLE,
            max_accuracy: MAX_BROADCAST_ACCURACY_M,
            session: None,
        }
    }

    /// Actor whose watch is currently running
    pub fn tracked_actor(&self) -> Option<&str> {
        self.session
            .as_ref()
            .filter(|s| !s.task.is_finished())
            .map(|s| s.actor.as_str())
    }

    /// Track `actor`, or nobody when `None`.
    ///
    /// Calling again with the running actor is a no-op. Any other value tears
    /// the previous watch down completely before the new one starts.
    pub async fn track(&mut self, actor: Option<&str>) {
        if actor.is_some() && self.tracked_actor() == actor {
            return;
        }
        self.stop().await;

        let Some(actor) = actor else {
            return;
        };
        let writer = Arc::new(self.store.claim_writer(actor).await);
        let task = tokio::spawn(run_session(
            Arc::clone(&self.provider),
            Arc::clone(&writer),
            self.window,
            self.max_accuracy,
        ));
        info!(actor, "Broadcasting position");
        self.session = Some(Session {
            actor: actor.to_string(),
            task,
            writer,
        });
    }

    /// Cancel the watch, any pending throttled update, and the store writer
    pub async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
            // Wait for the task to be dropped so its subscription is released
            let _ = session.task.await;
            session.writer.revoke().await;
            info!(actor = %session.actor, "Stopped broadcasting position");
        }
    }
}

impl<P: LocationProvider> Drop for Broadcaster<P> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

async fn run_session<P: LocationProvider>(
    provider: Arc<P>,
    writer: Arc<SlotWriter>,
    window: Duration,
    max_accuracy: f64,
) {
    let actor = writer.actor().to_string();
    let mut subscription = match provider.watch_position(FixRequest::precise(WATCH_FIX_TIMEOUT)).await {
        Ok(s) => s,
        Err(e) => {
            error!(actor = %actor, "Unable to start position watch: {}", e);
            return;
        }
    };
    let mut throttle: Throttle<Fix> = Throttle::new(window);
    let mut admission = AdmissionFilter::default();

    loop {
        tokio::select! {
            event = subscription.next() => match event {
                Some(Ok(fix)) => {
                    // Negated so NaN accuracy is rejected too
                    if !(fix.accuracy <= max_accuracy) {
                        debug!(actor = %actor, accuracy = fix.accuracy, "Discarding low accuracy fix");
                        continue;
                    }
                    if !admission.admit(fix.accuracy) {
                        debug!(actor = %actor, accuracy = fix.accuracy, held = ?admission.best(), "Discarding less accurate fix");
                        continue;
                    }
                    let c = Coordinate::new(fix.lat, fix.lng).rounded();
                    throttle.offer(Fix { lat: c.lat, lng: c.lng, ..fix }, Instant::now());
                }
                Some(Err(e)) => warn!(actor = %actor, "Position watch error: {}", e),
                None => {
                    warn!(actor = %actor, "Position watch ended");
                    break;
                }
            },
            _ = sleep_until_opt(throttle.deadline()) => {
                if let Some(fix) = throttle.take_due(Instant::now()) {
                    if writer.publish(fix.lat, fix.lng, fix.accuracy, fix.timestamp).await {
                        debug!(actor = %actor, lat = fix.lat, lng = fix.lng, "Broadcast position");
                    }
                }
            }
        }
    }
    throttle.stop();
}
