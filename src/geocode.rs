// Reverse geocoding
//
// Turns coordinates into a short display address. Lookups never fail from the
// caller's point of view: any problem resolves to "Unknown location".

use std::future::Future;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::constants::{FLAT_ADDRESS_SEGMENTS, GEOCODE_TIMEOUT, UNKNOWN_LOCATION};
use crate::error::{Result, TrackError};

/// Something that can name a place
pub trait Geocoder: Send + Sync + 'static {
    /// Short address for a coordinate; falls back to "Unknown location".
    fn resolve_address(&self, lat: f64, lng: f64) -> impl Future<Output = String> + Send;
}

/// Structured address block of a reverse geocoding response
#[derive(Debug, Default, Clone, Deserialize)]
pub struct AddressDetails {
    pub road: Option<String>,
    pub neighbourhood: Option<String>,
    pub suburb: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<AddressDetails>,
    #[serde(default)]
    display_name: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Compact "road, area, locality, state, country" string, or `None` if every
/// field is empty.
pub fn compact_address(details: &AddressDetails) -> Option<String> {
    let parts: Vec<&str> = [
        non_empty(&details.road),
        non_empty(&details.neighbourhood).or_else(|| non_empty(&details.suburb)),
        non_empty(&details.city)
            .or_else(|| non_empty(&details.town))
            .or_else(|| non_empty(&details.village)),
        non_empty(&details.state),
        non_empty(&details.country),
    ]
    .into_iter()
    .flatten()
    .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

/// Shorten an already flattened address to its first four segments
///
/// Used for addresses that arrive as one string (shop records, staff
/// location rows). Blank segments are dropped.
pub fn format_flat_address(address: &str) -> String {
    let parts: Vec<&str> = address
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .take(FLAT_ADDRESS_SEGMENTS)
        .collect();
    if parts.is_empty() {
        UNKNOWN_LOCATION.to_string()
    } else {
        parts.join(", ")
    }
}

/// Reverse geocoder speaking the Nominatim `/reverse` protocol
#[derive(Debug, Clone)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(GEOCODE_TIMEOUT)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(NominatimGeocoder {
            client,
            endpoint: endpoint.into(),
        })
    }

    async fn lookup(&self, lat: f64, lng: f64) -> Result<Option<String>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lng.to_string()),
                ("format", "jsonv2".to_string()),
                ("zoom", "18".to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TrackError::Status {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }

        let body = response.bytes().await?;
        let parsed: ReverseResponse = serde_json::from_slice(&body)?;

        let structured = parsed.address.as_ref().and_then(compact_address);
        Ok(structured.or_else(|| {
            non_empty(&parsed.display_name).map(format_flat_address)
        }))
    }
}

impl Geocoder for NominatimGeocoder {
    async fn resolve_address(&self, lat: f64, lng: f64) -> String {
        match self.lookup(lat, lng).await {
            Ok(Some(address)) => {
                debug!(lat, lng, address = %address, "Resolved address");
                address
            }
            Ok(None) => {
                warn!(lat, lng, "Reverse geocoder returned no address");
                UNKNOWN_LOCATION.to_string()
            }
            Err(e) => {
                warn!(lat, lng, "Reverse geocoding failed: {}", e);
                UNKNOWN_LOCATION.to_string()
            }
        }
    }
}

/// Geocoder that always answers with the same text (offline use)
#[derive(Debug, Clone)]
pub struct StaticGeocoder {
    text: String,
}

impl StaticGeocoder {
    pub fn new(text: impl Into<String>) -> Self {
        StaticGeocoder { text: text.into() }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_LOCATION)
    }
}

impl Geocoder for StaticGeocoder {
    async fn resolve_address(&self, _lat: f64, _lng: f64) -> String {
        self.text.clone()
    }
}
