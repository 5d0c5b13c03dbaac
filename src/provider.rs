// Platform position sources
//
// A `LocationProvider` hands out one-shot fixes and continuous watches.
// Watches are `Subscription`s: dropping one (or calling `cancel`) releases the
// sensor and stops any background reader.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the per-watch fix channel
const WATCH_CHANNEL_CAPACITY: usize = 32;

/// Delay before a gpsd watch reconnects after losing the daemon
const GPSD_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// gpsd command enabling JSON reports
const GPSD_WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true};\n";

/// A single raw reading from the platform
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub lat: f64,
    pub lng: f64,
    /// Horizontal error radius in meters (larger is worse)
    pub accuracy: f64,
    pub timestamp: DateTime<Utc>,
}

/// Sensor failures reported by a provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SensorError {
    #[error("geolocation is not available on this host")]
    Unavailable,

    #[error("location permission denied")]
    PermissionDenied,

    #[error("timed out waiting for a position fix")]
    Timeout,

    #[error("sensor error: {0}")]
    Transient(String),
}

/// Options for a fix request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixRequest {
    pub high_accuracy: bool,
    pub timeout: Duration,
}

impl FixRequest {
    pub fn quick(timeout: Duration) -> Self {
        FixRequest { high_accuracy: false, timeout }
    }

    pub fn precise(timeout: Duration) -> Self {
        FixRequest { high_accuracy: true, timeout }
    }
}

/// Cancellable handle on a continuous position watch
pub struct Subscription {
    rx: mpsc::Receiver<Result<Fix, SensorError>>,
    reader: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Result<Fix, SensorError>>, reader: Option<JoinHandle<()>>) -> Self {
        Subscription { rx, reader }
    }

    /// Next fix or sensor error. `None` once the source is gone.
    pub async fn next(&mut self) -> Option<Result<Fix, SensorError>> {
        self.rx.recv().await
    }

    /// Stop the watch and release the sensor
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Source of device positions
pub trait LocationProvider: Send + Sync + 'static {
    /// Single fix, resolved once or failed
    fn current_position(
        &self,
        request: FixRequest,
    ) -> impl Future<Output = Result<Fix, SensorError>> + Send;

    /// Continuous stream of fixes until the subscription is dropped
    fn watch_position(
        &self,
        request: FixRequest,
    ) -> impl Future<Output = Result<Subscription, SensorError>> + Send;
}

/// TPV ("time-position-velocity") report as sent by gpsd
#[derive(Debug, Deserialize)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    time: Option<DateTime<Utc>>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
}

/// Parse one gpsd JSON line into a fix. Non-TPV classes and reports
/// without at least a 2D fix yield `None`.
pub fn parse_gpsd_line(line: &str) -> Option<Fix> {
    let report: GpsdReport = serde_json::from_str(line).ok()?;
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }
    let accuracy = match (report.eph, report.epx, report.epy) {
        (Some(eph), _, _) => eph,
        (None, Some(x), Some(y)) => x.max(y),
        (None, Some(e), None) | (None, None, Some(e)) => e,
        (None, None, None) => f64::INFINITY,
    };
    Some(Fix {
        lat: report.lat?,
        lng: report.lon?,
        accuracy,
        timestamp: report.time.unwrap_or_else(Utc::now),
    })
}

/// Position source backed by a gpsd daemon (JSON protocol over TCP)
#[derive(Debug, Clone)]
pub struct GpsdProvider {
    addr: String,
}

impl GpsdProvider {
    pub fn new(addr: impl Into<String>) -> Self {
        GpsdProvider { addr: addr.into() }
    }

    async fn open(addr: &str) -> Result<tokio::io::Lines<BufReader<TcpStream>>, SensorError> {
        let mut stream = TcpStream::connect(addr).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::NotFound => SensorError::Unavailable,
            std::io::ErrorKind::PermissionDenied => SensorError::PermissionDenied,
            _ => SensorError::Transient(e.to_string()),
        })?;
        stream
            .write_all(GPSD_WATCH_COMMAND)
            .await
            .map_err(|e| SensorError::Transient(e.to_string()))?;
        Ok(BufReader::new(stream).lines())
    }

    async fn first_fix(
        lines: &mut tokio::io::Lines<BufReader<TcpStream>>,
    ) -> Result<Fix, SensorError> {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(fix) = parse_gpsd_line(&line) {
                        return Ok(fix);
                    }
                }
                Ok(None) => return Err(SensorError::Transient("gpsd closed the connection".into())),
                Err(e) => return Err(SensorError::Transient(e.to_string())),
            }
        }
    }
}

impl LocationProvider for GpsdProvider {
    async fn current_position(&self, request: FixRequest) -> Result<Fix, SensorError> {
        let mut lines = Self::open(&self.addr).await?;
        match tokio::time::timeout(request.timeout, Self::first_fix(&mut lines)).await {
            Ok(result) => result,
            Err(_) => Err(SensorError::Timeout),
        }
    }

    async fn watch_position(&self, request: FixRequest) -> Result<Subscription, SensorError> {
        let mut lines = Self::open(&self.addr).await?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let addr = self.addr.clone();
        info!("Watching gpsd at {}", addr);

        let reader = tokio::spawn(async move {
            loop {
                let event = match tokio::time::timeout(request.timeout, lines.next_line()).await {
                    Ok(Ok(Some(line))) => match parse_gpsd_line(&line) {
                        Some(fix) => Ok(fix),
                        None => continue,
                    },
                    Ok(Ok(None)) => Err(SensorError::Transient("gpsd closed the connection".into())),
                    Ok(Err(e)) => Err(SensorError::Transient(e.to_string())),
                    Err(_) => Err(SensorError::Timeout),
                };
                let lost = matches!(event, Err(SensorError::Transient(_)));
                if tx.send(event).await.is_err() {
                    return;
                }
                if !lost {
                    continue;
                }
                // The watch keeps itself alive: reconnect instead of ending the stream
                loop {
                    tokio::time::sleep(GPSD_RECONNECT_DELAY).await;
                    if tx.is_closed() {
                        return;
                    }
                    match Self::open(&addr).await {
                        Ok(l) => {
                            debug!("Reconnected to gpsd at {}", addr);
                            lines = l;
                            break;
                        }
                        Err(e) => warn!("gpsd reconnect to {} failed: {}", addr, e),
                    }
                }
            }
        });

        Ok(Subscription::new(rx, Some(reader)))
    }
}

/// Scripted position source
///
/// One-shot answers are queued with `push_current`. Fixes pushed with
/// `push` go to every live watch.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    inner: Arc<Mutex<ScriptedState>>,
}

#[derive(Debug, Default)]
struct ScriptedState {
    unavailable: bool,
    current: std::collections::VecDeque<Result<Fix, SensorError>>,
    watchers: Vec<mpsc::Sender<Result<Fix, SensorError>>>,
    watch_requests: Vec<FixRequest>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider reporting no geolocation capability at all
    pub fn unavailable() -> Self {
        let provider = Self::default();
        provider.lock().unavailable = true;
        provider
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptedState> {
        // A poisoned lock only means a test panicked mid-push; keep going
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue the answer for the next `current_position` call
    pub fn push_current(&self, result: Result<Fix, SensorError>) {
        self.lock().current.push_back(result);
    }

    /// Deliver a fix or error to every live watch
    pub fn push(&self, event: Result<Fix, SensorError>) {
        let mut state = self.lock();
        state.watchers.retain(|tx| !tx.is_closed());
        for tx in &state.watchers {
            if let Err(e) = tx.try_send(event.clone()) {
                warn!("Scripted watch dropped an event: {}", e);
            }
        }
    }

    /// Raw sender of the most recent watch, for replaying late callbacks
    pub fn last_watch_feed(&self) -> Option<mpsc::Sender<Result<Fix, SensorError>>> {
        self.lock().watchers.last().cloned()
    }

    /// Number of watches whose subscription is still held
    pub fn active_watches(&self) -> usize {
        self.lock().watchers.iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Requests seen by `watch_position`, oldest first
    pub fn watch_requests(&self) -> Vec<FixRequest> {
        self.lock().watch_requests.clone()
    }
}

impl LocationProvider for ScriptedProvider {
    async fn current_position(&self, _request: FixRequest) -> Result<Fix, SensorError> {
        let next = {
            let mut state = self.lock();
            if state.unavailable {
                return Err(SensorError::Unavailable);
            }
            state.current.pop_front()
        };
        match next {
            Some(result) => result,
            None => Err(SensorError::Timeout),
        }
    }

    async fn watch_position(&self, request: FixRequest) -> Result<Subscription, SensorError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(SensorError::Unavailable);
        }
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        state.watchers.push(tx);
        state.watch_requests.push(request);
        Ok(Subscription::new(rx, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(lat: f64, lng: f64, accuracy: f64) -> Fix {
        Fix { lat, lng, accuracy, timestamp: Utc::now() }
    }

    #[test]
    fn test_parse_gpsd_tpv() {
        let line = r#"{"class":"TPV","device":"/dev/ttyUSB0","mode":3,"time":"2024-05-01T10:00:00.000Z","lat":31.5204,"lon":74.3587,"alt":210.0,"eph":7.5,"epx":5.1,"epy":6.0}"#;
        let fix = parse_gpsd_line(line).unwrap();
        assert_eq!(fix.lat, 31.5204);
        assert_eq!(fix.lng, 74.3587);
        assert_eq!(fix.accuracy, 7.5);
        assert_eq!(fix.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }

    #[test]
    fn test_parse_gpsd_uses_epx_epy_without_eph() {
        let line = r#"{"class":"TPV","mode":2,"lat":1.5,"lon":2.5,"epx":12.0,"epy":9.0}"#;
        let fix = parse_gpsd_line(line).unwrap();
        assert_eq!(fix.accuracy, 12.0);
    }

    #[test]
    fn test_parse_gpsd_skips_non_fix() {
        assert!(parse_gpsd_line(r#"{"class":"VERSION","release":"3.25"}"#).is_none());
        assert!(parse_gpsd_line(r#"{"class":"TPV","mode":1}"#).is_none());
        assert!(parse_gpsd_line("not json").is_none());
    }

    #[tokio::test]
    async fn test_scripted_current_position() {
        let provider = ScriptedProvider::new();
        provider.push_current(Ok(fix(1.0, 2.0, 30.0)));

        let got = provider.current_position(FixRequest::quick(Duration::from_secs(1))).await;
        assert_eq!(got.unwrap().accuracy, 30.0);

        let empty = provider.current_position(FixRequest::quick(Duration::from_secs(1))).await;
        assert_eq!(empty, Err(SensorError::Timeout));
    }

    #[tokio::test]
    async fn test_scripted_watch_cancel_releases_sensor() {
        let provider = ScriptedProvider::new();
        let mut sub = provider.watch_position(FixRequest::precise(Duration::from_secs(1))).await.unwrap();
        assert_eq!(provider.active_watches(), 1);

        provider.push(Ok(fix(1.0, 2.0, 5.0)));
        let got = sub.next().await.unwrap().unwrap();
        assert_eq!(got.lat, 1.0);

        sub.cancel();
        assert_eq!(provider.active_watches(), 0);
    }

    #[tokio::test]
    async fn test_scripted_unavailable() {
        let provider = ScriptedProvider::unavailable();
        let res = provider.watch_position(FixRequest::precise(Duration::from_secs(1))).await;
        assert!(matches!(res, Err(SensorError::Unavailable)));
    }

    #[tokio::test]
    async fn test_gpsd_watch_streams_fixes() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = stream.read(&mut buf).await;
            stream.write_all(b"{\"class\":\"VERSION\",\"release\":\"3.25\"}\n").await.unwrap();
            stream
                .write_all(b"{\"class\":\"TPV\",\"mode\":3,\"lat\":31.52,\"lon\":74.35,\"eph\":4.0}\n")
                .await
                .unwrap();
            // Hold the connection open until the test ends
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let provider = GpsdProvider::new(addr.to_string());
        let mut sub = provider.watch_position(FixRequest::precise(Duration::from_secs(2))).await.unwrap();
        let fix = sub.next().await.unwrap().unwrap();
        assert_eq!(fix.lat, 31.52);
        assert_eq!(fix.accuracy, 4.0);
    }

    #[tokio::test]
    async fn test_gpsd_refused_is_unavailable() {
        // Bind then drop to get a port that is (almost certainly) closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = GpsdProvider::new(addr.to_string());
        let res = provider.current_position(FixRequest::quick(Duration::from_secs(1))).await;
        assert_eq!(res, Err(SensorError::Unavailable));
    }
}
