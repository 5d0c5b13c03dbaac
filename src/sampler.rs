// Position sampler
//
// Gives a consumer an immediate rough fix and then a continuous,
// accuracy-filtered stream of positions with resolved addresses.
//
// Session flow:
//   Idle -> Capturing (one-shot, low accuracy, short timeout)
//        -> Ready                 (one-shot answered)
//        -> Watching -> Ready...  (one-shot failed, continuous high accuracy watch)
// Any state -> Error when the host has no position source or the watch cannot
// start. `refresh()` starts a new session from Capturing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{QUICK_FIX_TIMEOUT, WATCH_FIX_TIMEOUT};
use crate::geocode::Geocoder;
use crate::geodesy::Coordinate;
use crate::provider::{Fix, FixRequest, LocationProvider, SensorError, Subscription};

/// Accuracy-based admission control for one session
///
/// Accuracy only ever improves (or stays equal) within a session.
#[derive(Debug, Default, Clone)]
pub struct AdmissionFilter {
    best: Option<f64>,
}

impl AdmissionFilter {
    /// Accept when nothing is held yet or `accuracy` is no worse than the held one
    pub fn admit(&mut self, accuracy: f64) -> bool {
        if accuracy.is_nan() {
            return false;
        }
        match self.best {
            Some(best) if accuracy > best => false,
            _ => {
                self.best = Some(accuracy);
                true
            }
        }
    }

    /// Accuracy of the held sample
    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn reset(&mut self) {
        self.best = None;
    }
}

/// Update delivered to the sampler's consumer
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerUpdate {
    Ready {
        lat: f64,
        lng: f64,
        accuracy: f64,
        address: String,
    },
    Error(SensorError),
}

/// Observable sampler state
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerState {
    Idle,
    Capturing,
    Watching,
    Ready {
        lat: f64,
        lng: f64,
        accuracy: f64,
        address: String,
    },
    Error {
        /// No position source on this host; only a refresh can recover
        fatal: bool,
    },
}

impl SamplerState {
    /// Text shown to the user for this state
    pub fn status_text(&self) -> String {
        match self {
            SamplerState::Idle => "Location not captured".to_string(),
            SamplerState::Capturing | SamplerState::Watching => "Capturing location…".to_string(),
            SamplerState::Ready { address, .. } => address.clone(),
            SamplerState::Error { fatal: true } => "Location is not supported on this device".to_string(),
            SamplerState::Error { fatal: false } => {
                "Unable to capture location — allow location access".to_string()
            }
        }
    }
}

/// Builds sampling sessions over a provider and a geocoder
pub struct PositionSampler<P, G> {
    provider: Arc<P>,
    geocoder: Arc<G>,
    quick_timeout: Duration,
    watch_timeout: Duration,
}

impl<P: LocationProvider, G: Geocoder> PositionSampler<P, G> {
    pub fn new(provider: Arc<P>, geocoder: Arc<G>) -> Self {
        PositionSampler {
            provider,
            geocoder,
            quick_timeout: QUICK_FIX_TIMEOUT,
            watch_timeout: WATCH_FIX_TIMEOUT,
        }
    }

    pub fn with_quick_timeout(mut self, timeout: Duration) -> Self {
        self.quick_timeout = timeout;
        self
    }

    /// Start sampling. `on_update` is called for every accepted sample and
    /// every reported error until the returned handle is stopped or dropped.
    pub fn start<F>(&self, on_update: F) -> SamplerHandle
    where
        F: FnMut(SamplerUpdate) + Send + 'static,
    {
        let (state_tx, state_rx) = watch::channel(SamplerState::Idle);
        let (refresh_tx, refresh_rx) = mpsc::channel(1);
        let task = SamplerTask {
            provider: Arc::clone(&self.provider),
            geocoder: Arc::clone(&self.geocoder),
            quick_timeout: self.quick_timeout,
            watch_timeout: self.watch_timeout,
            on_update,
            state_tx,
            admission: AdmissionFilter::default(),
        };
        SamplerHandle {
            state: state_rx,
            refresh_tx,
            task: Some(tokio::spawn(task.run(refresh_rx))),
        }
    }
}

/// Owner of a running sampler; dropping it cancels the watch
pub struct SamplerHandle {
    state: watch::Receiver<SamplerState>,
    refresh_tx: mpsc::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl SamplerHandle {
    /// Current state snapshot
    pub fn state(&self) -> SamplerState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn subscribe(&self) -> watch::Receiver<SamplerState> {
        self.state.clone()
    }

    /// Drop the held sample and capture again from scratch
    pub fn refresh(&self) {
        // A refresh already queued covers this one
        let _ = self.refresh_tx.try_send(());
    }

    /// Stop sampling and wait until the watch is released
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn next_event(subscription: &mut Option<Subscription>) -> Option<Result<Fix, SensorError>> {
    match subscription {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

struct SamplerTask<P, G, F> {
    provider: Arc<P>,
    geocoder: Arc<G>,
    quick_timeout: Duration,
    watch_timeout: Duration,
    on_update: F,
    state_tx: watch::Sender<SamplerState>,
    admission: AdmissionFilter,
}

impl<P, G, F> SamplerTask<P, G, F>
where
    P: LocationProvider,
    G: Geocoder,
    F: FnMut(SamplerUpdate) + Send + 'static,
{
    async fn run(mut self, mut refresh_rx: mpsc::Receiver<()>) {
        loop {
            let mut subscription = self.begin_session().await;

            loop {
                tokio::select! {
                    event = next_event(&mut subscription) => match event {
                        Some(Ok(fix)) => self.accept(fix).await,
                        Some(Err(e)) => self.fail(e, false),
                        None => {
                            warn!("Position watch ended");
                            subscription = None;
                        }
                    },
                    refresh = refresh_rx.recv() => {
                        if refresh.is_none() {
                            return;
                        }
                        info!("Refreshing position");
                        break;
                    }
                }
            }
        }
    }

    /// Capture a quick fix, falling back to a continuous watch. Returns the
    /// watch if one was opened.
    async fn begin_session(&mut self) -> Option<Subscription> {
        self.admission.reset();
        self.state_tx.send_replace(SamplerState::Capturing);

        let quick = tokio::time::timeout(
            self.quick_timeout,
            self.provider.current_position(FixRequest::quick(self.quick_timeout)),
        )
        .await;

        match quick {
            Ok(Ok(fix)) => {
                self.accept(fix).await;
                return None;
            }
            Ok(Err(SensorError::Unavailable)) => {
                self.fail(SensorError::Unavailable, true);
                return None;
            }
            Ok(Err(e)) => debug!("Quick fix failed ({}), watching with high accuracy", e),
            Err(_) => debug!("Quick fix timed out, watching with high accuracy"),
        }

        self.state_tx.send_replace(SamplerState::Watching);
        match self
            .provider
            .watch_position(FixRequest::precise(self.watch_timeout))
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                let fatal = e == SensorError::Unavailable;
                self.fail(e, fatal);
                None
            }
        }
    }

    async fn accept(&mut self, fix: Fix) {
        if !self.admission.admit(fix.accuracy) {
            debug!(
                accuracy = fix.accuracy,
                held = ?self.admission.best(),
                "Dropping less accurate sample"
            );
            return;
        }
        let c = Coordinate::new(fix.lat, fix.lng).rounded();
        let address = self.geocoder.resolve_address(c.lat, c.lng).await;

        self.state_tx.send_replace(SamplerState::Ready {
            lat: c.lat,
            lng: c.lng,
            accuracy: fix.accuracy,
            address: address.clone(),
        });
        (self.on_update)(SamplerUpdate::Ready {
            lat: c.lat,
            lng: c.lng,
            accuracy: fix.accuracy,
            address,
        });
    }

    fn fail(&mut self, error: SensorError, fatal: bool) {
        warn!(fatal, "Unable to capture location: {}", error);
        self.state_tx.send_replace(SamplerState::Error { fatal });
        (self.on_update)(SamplerUpdate::Error(error));
    }
}
