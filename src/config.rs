use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::constants::{MAP_POLL_INTERVAL, SYNC_INTERVAL};
use crate::net::ApiPaths;

/// Field staff location tracker
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Base URL of the field operations backend
    #[arg(long, global = true, value_name = "URL", default_value = "http://127.0.0.1:8000")]
    pub api_base: String,

    /// Bearer token for the backend
    #[arg(long, global = true, env = "FIELDTRACK_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Nominatim-compatible reverse geocoding endpoint
    #[arg(
        long,
        global = true,
        value_name = "URL",
        default_value = "https://nominatim.openstreetmap.org/reverse"
    )]
    pub geocoder_url: String,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Mode {
    /// Sample, broadcast and sync the position of one actor
    Track(TrackArgs),
    /// Keep a live map of every actor's latest position
    Map(MapArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct TrackArgs {
    /// Id of the tracked actor
    #[arg(long, value_name = "ID")]
    pub actor: String,

    /// gpsd server to read fixes from
    #[arg(long, value_name = "HOST:PORT", default_value = "127.0.0.1:2947")]
    pub gpsd: String,

    /// Backend path receiving position uplinks
    #[arg(long, value_name = "PATH", default_value = "/api/location/update/")]
    pub location_path: String,

    /// Seconds between sync gate evaluations
    #[arg(long, default_value_t = SYNC_INTERVAL.as_secs())]
    pub sync_interval_secs: u64,
}

#[derive(clap::Args, Debug, Clone)]
pub struct MapArgs {
    /// Directory receiving markers.json
    #[arg(long, value_name = "DIR")]
    pub work_dir: PathBuf,

    /// Backend path listing every actor's latest position
    #[arg(long, value_name = "PATH", default_value = "/api/staff/locations/")]
    pub staff_locations_path: String,

    /// Seconds between staff location polls
    #[arg(long, default_value_t = MAP_POLL_INTERVAL.as_secs())]
    pub poll_interval_secs: u64,

    /// Serve the work directory over HTTP on this port
    #[arg(long, value_name = "PORT")]
    pub http_port: Option<u16>,
}

impl TrackArgs {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn api_paths(&self) -> ApiPaths {
        ApiPaths {
            location_update: self.location_path.clone(),
            ..ApiPaths::default()
        }
    }
}

impl MapArgs {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn api_paths(&self) -> ApiPaths {
        ApiPaths {
            staff_locations: self.staff_locations_path.clone(),
            ..ApiPaths::default()
        }
    }
}
