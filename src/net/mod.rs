// Network layer module
// HTTP access to the backend: position uplink and staff locations feed

pub mod api;
pub mod messages;

pub use api::{ApiClient, ApiPaths, StaffFeed, Uplink};
pub use messages::{LocationUplink, RemoteActorPosition};
