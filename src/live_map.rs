// Live map presenter
//
// Polls every actor's latest position and keeps one marker per actor on a map
// surface. Markers are updated in place and never removed; after each batch
// with at least one usable coordinate the viewport is refit to all markers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::constants::{MAP_FIT_PADDING_PX, MAP_POLL_INTERVAL};
use crate::error::Result;
use crate::geocode::format_flat_address;
use crate::geodesy::Coordinate;
use crate::map_surface::{Bounds, MapSurface, Marker};
use crate::net::{RemoteActorPosition, StaffFeed};
use crate::store::ActorId;

/// Popup text for one actor: label, short address, last seen time
pub fn popup_content(pos: &RemoteActorPosition) -> String {
    let address = format_flat_address(pos.address.as_deref().unwrap_or(""));
    let last_seen = match pos.last_seen {
        Some(t) => t.format("%Y-%m-%d %H:%M UTC").to_string(),
        None => "unknown".to_string(),
    };
    format!("{}\n{}\nLast seen: {}", pos.label, address, last_seen)
}

/// Marker-per-actor view over a staff feed
pub struct LiveMap<F, S> {
    feed: Arc<F>,
    surface: S,
    markers: HashMap<ActorId, Marker>,
    padding_px: u32,
}

impl<F: StaffFeed, S: MapSurface> LiveMap<F, S> {
    /// Create the presenter; the surface is initialized here and only here.
    pub fn new(feed: Arc<F>, mut surface: S) -> Result<Self> {
        surface.init()?;
        Ok(LiveMap {
            feed,
            surface,
            markers: HashMap::new(),
            padding_px: MAP_FIT_PADDING_PX,
        })
    }

    pub fn markers(&self) -> &HashMap<ActorId, Marker> {
        &self.markers
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    /// Apply one poll result. Returns how many entries had a usable coordinate.
    pub fn apply_poll(&mut self, batch: Vec<RemoteActorPosition>) -> Result<usize> {
        let mut valid = 0;
        for pos in batch {
            let (Some(lat), Some(lng)) = (pos.lat, pos.lng) else {
                debug!(actor = %pos.id, "No coordinates, skipping");
                continue;
            };
            let position = Coordinate::new(lat, lng);
            if !position.is_plausible() {
                debug!(actor = %pos.id, lat, lng, "Implausible coordinates, skipping");
                continue;
            }
            valid += 1;

            let popup = popup_content(&pos);
            let marker = self.markers.entry(pos.id.clone()).or_insert_with(|| Marker {
                id: pos.id.clone(),
                label: String::new(),
                position,
                popup: String::new(),
                avatar_url: None,
            });
            marker.label = pos.label;
            marker.position = position;
            marker.popup = popup;
            marker.avatar_url = pos.avatar_url;
            self.surface.upsert_marker(marker)?;
        }

        if valid > 0 {
            if let Some(bounds) = Bounds::around(self.markers.values().map(|m| &m.position)) {
                self.surface.fit_bounds(bounds, self.padding_px)?;
            }
            self.surface.flush()?;
        }
        Ok(valid)
    }

    /// Fetch the feed once and apply it
    pub async fn poll_once(&mut self) -> Result<usize> {
        let batch = self.feed.fetch_positions().await?;
        let total = batch.len();
        let valid = self.apply_poll(batch)?;
        debug!(total, valid, markers = self.markers.len(), "Applied staff locations");
        Ok(valid)
    }

    /// Poll on the default cadence, starting right away
    pub fn spawn(self) -> LiveMapHandle {
        self.spawn_every(MAP_POLL_INTERVAL)
    }

    pub fn spawn_every(mut self, period: Duration) -> LiveMapHandle {
        let task = tokio::spawn(async move {
            info!("Live map polling every {:?}", period);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once().await {
                    warn!("Staff locations poll failed: {}", e);
                }
            }
        });
        LiveMapHandle { task: Some(task) }
    }
}

/// Owner of the polling task; dropping it stops polling
pub struct LiveMapHandle {
    task: Option<JoinHandle<()>>,
}

impl LiveMapHandle {
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for LiveMapHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
