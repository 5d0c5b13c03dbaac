pub mod constants;
pub mod error;
pub mod geodesy;
pub mod geocode;
pub mod provider;
pub mod store;
pub mod throttle;
pub mod sampler;
pub mod broadcaster;
pub mod sync_gate;
pub mod map_surface;
pub mod live_map;
pub mod net;
pub mod config;

#[cfg(test)]
mod testutil;
