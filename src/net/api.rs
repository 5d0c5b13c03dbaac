// HTTP client for the field operations backend

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::messages::{LocationUplink, RemoteActorPosition, StaffLocations};
use crate::error::{Result, TrackError};

/// Request timeout for backend calls
const API_TIMEOUT: Duration = Duration::from_secs(15);

/// Destination for significant position updates
pub trait Uplink: Send + Sync + 'static {
    fn send_location(&self, payload: &LocationUplink) -> impl Future<Output = Result<()>> + Send;
}

/// Source of every actor's latest known position
pub trait StaffFeed: Send + Sync + 'static {
    fn fetch_positions(&self) -> impl Future<Output = Result<Vec<RemoteActorPosition>>> + Send;
}

/// Paths of the backend endpoints, relative to the API base
#[derive(Debug, Clone)]
pub struct ApiPaths {
    pub location_update: String,
    pub staff_locations: String,
}

impl Default for ApiPaths {
    fn default() -> Self {
        ApiPaths {
            location_update: "/api/location/update/".to_string(),
            staff_locations: "/api/staff/locations/".to_string(),
        }
    }
}

/// Authenticated JSON client for the backend
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base: String,
    token: Option<String>,
    paths: ApiPaths,
}

impl ApiClient {
    pub fn new(base: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(API_TIMEOUT).build()?;
        Ok(ApiClient {
            client,
            base: base.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            paths: ApiPaths::default(),
        })
    }

    pub fn with_paths(mut self, paths: ApiPaths) -> Self {
        self.paths = paths;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn check(response: &reqwest::Response, url: &str) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TrackError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            })
        }
    }
}

impl Uplink for ApiClient {
    async fn send_location(&self, payload: &LocationUplink) -> Result<()> {
        let url = self.url(&self.paths.location_update);
        let response = self
            .authorize(self.client.post(&url).json(payload))
            .send()
            .await?;
        Self::check(&response, &url)?;
        debug!(identifier = %payload.identifier, "Location uplink accepted");
        Ok(())
    }
}

impl StaffFeed for ApiClient {
    async fn fetch_positions(&self) -> Result<Vec<RemoteActorPosition>> {
        let url = self.url(&self.paths.staff_locations);
        let response = self.authorize(self.client.get(&url)).send().await?;
        Self::check(&response, &url)?;
        let body = response.bytes().await?;
        let feed: StaffLocations = serde_json::from_slice(&body)?;
        Ok(feed.into_rows().into_iter().map(RemoteActorPosition::from).collect())
    }
}
