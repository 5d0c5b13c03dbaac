// Map surfaces
//
// Where the live map draws: a GeoJSON file any web map can load, or an
// in-memory recorder for headless runs and tests.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::Result;
use crate::geodesy::Coordinate;

/// One actor pin on the map
#[derive(Debug, Clone, PartialEq)]
pub struct Marker {
    pub id: String,
    pub label: String,
    pub position: Coordinate,
    pub popup: String,
    pub avatar_url: Option<String>,
}

/// Geographic bounding box
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub south: f64,
    pub west: f64,
    pub north: f64,
    pub east: f64,
}

impl Bounds {
    /// Smallest box containing every coordinate, `None` when empty
    pub fn around<'a>(coords: impl IntoIterator<Item = &'a Coordinate>) -> Option<Bounds> {
        coords.into_iter().fold(None, |acc, c| {
            Some(match acc {
                None => Bounds { south: c.lat, west: c.lng, north: c.lat, east: c.lng },
                Some(b) => Bounds {
                    south: b.south.min(c.lat),
                    west: b.west.min(c.lng),
                    north: b.north.max(c.lat),
                    east: b.east.max(c.lng),
                },
            })
        })
    }

    /// GeoJSON `bbox` order
    pub fn to_bbox(&self) -> [f64; 4] {
        [self.west, self.south, self.east, self.north]
    }
}

/// Rendering target of the live map
pub trait MapSurface: Send + 'static {
    fn init(&mut self) -> Result<()>;
    fn upsert_marker(&mut self, marker: &Marker) -> Result<()>;
    fn fit_bounds(&mut self, bounds: Bounds, padding_px: u32) -> Result<()>;
    /// Publish everything drawn since the last flush
    fn flush(&mut self) -> Result<()>;
}

/// Writes markers as a GeoJSON FeatureCollection to `<work_dir>/markers.json`,
/// once per `flush`
#[derive(Debug)]
pub struct GeoJsonSurface {
    work_dir: PathBuf,
    markers: BTreeMap<String, Marker>,
    viewport: Option<(Bounds, u32)>,
}

impl GeoJsonSurface {
    pub const FILE_NAME: &'static str = "markers.json";

    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        GeoJsonSurface {
            work_dir: work_dir.into(),
            markers: BTreeMap::new(),
            viewport: None,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.work_dir.join(Self::FILE_NAME)
    }

    fn document(&self) -> Value {
        let features: Vec<Value> = self
            .markers
            .values()
            .map(|m| {
                json!({
                    "type": "Feature",
                    "id": m.id,
                    "geometry": {
                        "type": "Point",
                        "coordinates": [m.position.lng, m.position.lat],
                    },
                    "properties": {
                        "label": m.label,
                        "popup": m.popup,
                        "avatar_url": m.avatar_url,
                    },
                })
            })
            .collect();

        let mut doc = json!({
            "type": "FeatureCollection",
            "features": features,
        });
        if let Some((bounds, padding)) = self.viewport {
            doc["bbox"] = json!(bounds.to_bbox());
            doc["padding_px"] = json!(padding);
        }
        doc
    }

    fn write(&self) -> Result<()> {
        write_atomic(&self.work_dir, Self::FILE_NAME, &self.document())
    }
}

/// Write through a temporary file and rename, so readers never see a partial file
fn write_atomic(dir: &Path, name: &str, value: &Value) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", name));
    let path = dir.join(name);
    std::fs::write(&tmp, serde_json::to_vec(value)?)?;
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

impl MapSurface for GeoJsonSurface {
    fn init(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        self.write()?;
        info!("Map surface at {}", self.path().display());
        Ok(())
    }

    fn upsert_marker(&mut self, marker: &Marker) -> Result<()> {
        self.markers.insert(marker.id.clone(), marker.clone());
        Ok(())
    }

    fn fit_bounds(&mut self, bounds: Bounds, padding_px: u32) -> Result<()> {
        self.viewport = Some((bounds, padding_px));
        debug!(?bounds, padding_px, "Fitting map bounds");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.write()
    }
}

/// Operation recorded by [`MemorySurface`]
#[derive(Debug, Clone, PartialEq)]
pub enum SurfaceOp {
    Init,
    Upsert(String),
    FitBounds(Bounds, u32),
}

#[derive(Debug, Default)]
struct MemoryState {
    ops: Vec<SurfaceOp>,
    markers: HashMap<String, Marker>,
    flushes: usize,
}

/// In-memory surface. Clones share state, so a clone kept outside a running
/// presenter observes what it draws.
#[derive(Debug, Clone, Default)]
pub struct MemorySurface {
    state: Arc<Mutex<MemoryState>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ops(&self) -> Vec<SurfaceOp> {
        self.lock().ops.clone()
    }

    pub fn marker(&self, id: &str) -> Option<Marker> {
        self.lock().markers.get(id).cloned()
    }

    pub fn marker_count(&self) -> usize {
        self.lock().markers.len()
    }

    pub fn init_count(&self) -> usize {
        self.lock().ops.iter().filter(|op| **op == SurfaceOp::Init).count()
    }

    pub fn flush_count(&self) -> usize {
        self.lock().flushes
    }

    pub fn last_viewport(&self) -> Option<(Bounds, u32)> {
        self.lock().ops.iter().rev().find_map(|op| match op {
            SurfaceOp::FitBounds(b, p) => Some((*b, *p)),
            _ => None,
        })
    }
}

impl MapSurface for MemorySurface {
    fn init(&mut self) -> Result<()> {
        self.lock().ops.push(SurfaceOp::Init);
        Ok(())
    }

    fn upsert_marker(&mut self, marker: &Marker) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(SurfaceOp::Upsert(marker.id.clone()));
        state.markers.insert(marker.id.clone(), marker.clone());
        Ok(())
    }

    fn fit_bounds(&mut self, bounds: Bounds, padding_px: u32) -> Result<()> {
        self.lock().ops.push(SurfaceOp::FitBounds(bounds, padding_px));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(id: &str, lat: f64, lng: f64) -> Marker {
        Marker {
            id: id.to_string(),
            label: format!("Rider {}", id),
            position: Coordinate::new(lat, lng),
            popup: "popup".to_string(),
            avatar_url: None,
        }
    }

    #[test]
    fn test_bounds_around() {
        let coords = [
            Coordinate::new(31.52, 74.35),
            Coordinate::new(31.40, 74.50),
            Coordinate::new(31.60, 74.20),
        ];
        let b = Bounds::around(&coords).unwrap();
        assert_eq!(b, Bounds { south: 31.40, west: 74.20, north: 31.60, east: 74.50 });
        assert_eq!(b.to_bbox(), [74.20, 31.40, 74.50, 31.60]);
        assert!(Bounds::around(&Vec::<Coordinate>::new()).is_none());
    }

    #[test]
    fn test_geojson_surface_writes_collection() {
        let dir = std::env::temp_dir().join(format!("fieldtrack-surface-{}", std::process::id()));
        let mut surface = GeoJsonSurface::new(&dir);
        surface.init().unwrap();

        surface.upsert_marker(&marker("1", 31.52, 74.35)).unwrap();
        surface.upsert_marker(&marker("2", 31.40, 74.50)).unwrap();
        surface.upsert_marker(&marker("1", 31.53, 74.36)).unwrap();
        surface
            .fit_bounds(Bounds { south: 31.40, west: 74.36, north: 31.53, east: 74.50 }, 50)
            .unwrap();

        // Nothing reaches the file until the batch is flushed
        let path = surface.path();
        let read = || -> Value { serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap() };
        assert_eq!(read()["features"].as_array().unwrap().len(), 0);
        assert!(read().get("bbox").is_none());

        surface.flush().unwrap();
        let doc = read();
        assert_eq!(doc["type"], "FeatureCollection");
        assert_eq!(doc["features"].as_array().unwrap().len(), 2);
        assert_eq!(doc["features"][0]["geometry"]["coordinates"], json!([74.36, 31.53]));
        assert_eq!(doc["bbox"], json!([74.36, 31.40, 74.50, 31.53]));
        assert_eq!(doc["padding_px"], 50);
        assert!(!dir.join("markers.json.tmp").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_memory_surface_shares_state() {
        let surface = MemorySurface::new();
        let mut drawing = surface.clone();
        drawing.init().unwrap();
        drawing.upsert_marker(&marker("1", 1.0, 2.0)).unwrap();
        drawing.upsert_marker(&marker("1", 1.5, 2.5)).unwrap();

        assert_eq!(surface.init_count(), 1);
        assert_eq!(surface.marker_count(), 1);
        assert_eq!(surface.marker("1").unwrap().position, Coordinate::new(1.5, 2.5));
        assert_eq!(surface.ops().len(), 3);
    }
}
