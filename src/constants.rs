// Shared constants for position sampling, throttling and sync

use std::time::Duration;

/// Mean Earth radius for the spherical model (m).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Decimal places kept on lat/lng before comparison or transmission (~0.11 m).
pub const COORD_DECIMALS: i32 = 6;

/// Samples with a horizontal error above this are never forwarded to shared state (m).
pub const MAX_BROADCAST_ACCURACY_M: f64 = 100.0;

/// At most one forwarded update per window.
pub const BROADCAST_THROTTLE: Duration = Duration::from_secs(5);

/// Sync gate evaluation cadence (also the retry cadence after a failed uplink).
pub const SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Movement below this is not worth an uplink (m).
pub const SYNC_MIN_DISTANCE_M: f64 = 5.0;

/// Resend even without movement once this much time has passed.
pub const SYNC_MAX_SILENCE: Duration = Duration::from_secs(5 * 60);

/// One-shot low accuracy fix timeout before falling back to a continuous watch.
pub const QUICK_FIX_TIMEOUT: Duration = Duration::from_secs(5);

/// Continuous watch fix timeout handed to the provider.
pub const WATCH_FIX_TIMEOUT: Duration = Duration::from_secs(20);

/// Live map poll cadence.
pub const MAP_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Viewport padding when fitting bounds (px).
pub const MAP_FIT_PADDING_PX: u32 = 50;

/// Reverse geocoding request timeout.
pub const GEOCODE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum comma separated segments kept from a flattened address.
pub const FLAT_ADDRESS_SEGMENTS: usize = 4;

/// Display text when an address cannot be resolved.
pub const UNKNOWN_LOCATION: &str = "Unknown location";
