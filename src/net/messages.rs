// JSON message type definitions
// Wire formats for the position uplink and the staff locations feed

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

/// Body of the position uplink POST
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationUplink {
    pub identifier: String,
    pub lat: f64,
    pub lng: f64,
    pub address: String,
}

/// One row of the staff locations feed as sent by the backend
#[derive(Debug, Clone, Deserialize)]
pub struct StaffLocationRow {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
    #[serde(default, deserialize_with = "de_coord")]
    pub current_lat: Option<f64>,
    #[serde(default, deserialize_with = "de_coord")]
    pub current_lng: Option<f64>,
    #[serde(default)]
    pub last_seen: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Staff feed payload: either a bare list or a paginated `{results: [...]}`.
/// Rows stay raw until `into_rows`, so one malformed row cannot sink the batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum StaffLocations {
    List(Vec<Value>),
    Paged { results: Vec<Value> },
}

impl StaffLocations {
    /// Decode every row, dropping the ones that do not parse
    pub fn into_rows(self) -> Vec<StaffLocationRow> {
        let raw = match self {
            StaffLocations::List(rows) => rows,
            StaffLocations::Paged { results } => results,
        };
        raw.into_iter()
            .filter_map(|row| match serde_json::from_value::<StaffLocationRow>(row) {
                Ok(row) => Some(row),
                Err(e) => {
                    debug!("Skipping malformed staff location row: {}", e);
                    None
                }
            })
            .collect()
    }
}

/// Latest known position of one actor, map side
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteActorPosition {
    pub id: String,
    pub label: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub last_seen: Option<DateTime<Utc>>,
    pub address: Option<String>,
    pub avatar_url: Option<String>,
}

impl From<StaffLocationRow> for RemoteActorPosition {
    fn from(row: StaffLocationRow) -> Self {
        let label = row
            .name
            .filter(|s| !s.trim().is_empty())
            .or(row.identifier)
            .unwrap_or_else(|| row.id.clone());
        RemoteActorPosition {
            id: row.id,
            label,
            lat: row.current_lat,
            lng: row.current_lng,
            last_seen: row.last_seen.as_deref().and_then(parse_timestamp),
            address: row.address,
            avatar_url: row.image_url,
        }
    }
}

/// Parse an RFC 3339 timestamp, or a naive ISO one taken as UTC
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Ids arrive as numbers or strings
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {}", other))),
    }
}

/// Coordinates arrive as numbers, numeric strings (decimal fields), or null.
/// Anything unparsable becomes `None`.
fn de_coord<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_uplink() {
        let msg = LocationUplink {
            identifier: "rider-7".to_string(),
            lat: 31.5204,
            lng: 74.3587,
            address: "Mall Road, Lahore".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["identifier"], "rider-7");
        assert_eq!(json["lat"], 31.5204);
        assert_eq!(json["lng"], 74.3587);
        assert_eq!(json["address"], "Mall Road, Lahore");
    }

    #[test]
    fn test_deserialize_list_feed() {
        let json = r#"[
            {"id": 3, "name": "Ali", "current_lat": "31.520400", "current_lng": 74.3587,
             "last_seen": "2024-05-01T10:00:00Z", "address": "Mall Road", "image_url": "/a.png"},
            {"id": "4", "identifier": "rider-4", "current_lat": null}
        ]"#;
        let rows = serde_json::from_str::<StaffLocations>(json).unwrap().into_rows();
        assert_eq!(rows.len(), 2);

        let first = RemoteActorPosition::from(rows[0].clone());
        assert_eq!(first.id, "3");
        assert_eq!(first.label, "Ali");
        assert_eq!(first.lat, Some(31.5204));
        assert_eq!(first.lng, Some(74.3587));
        assert_eq!(first.last_seen.unwrap().to_rfc3339(), "2024-05-01T10:00:00+00:00");
        assert_eq!(first.avatar_url.as_deref(), Some("/a.png"));

        let second = RemoteActorPosition::from(rows[1].clone());
        assert_eq!(second.label, "rider-4");
        assert_eq!(second.lat, None);
        assert_eq!(second.lng, None);
    }

    #[test]
    fn test_deserialize_paged_feed() {
        let json = r#"{"count": 1, "next": null, "results": [{"id": 9, "current_lat": "abc", "current_lng": 1}]}"#;
        let rows = serde_json::from_str::<StaffLocations>(json).unwrap().into_rows();
        assert_eq!(rows.len(), 1);
        let pos = RemoteActorPosition::from(rows[0].clone());
        assert_eq!(pos.label, "9");
        assert_eq!(pos.lat, None);
        assert_eq!(pos.lng, Some(1.0));
    }

    #[test]
    fn test_malformed_row_is_skipped() {
        let json = r#"[
            {"id": 1, "name": "Ali", "current_lat": 31.52, "current_lng": 74.35},
            {"id": null, "name": "Ghost", "current_lat": 31.40, "current_lng": 74.50},
            {"id": {"nested": true}},
            "not an object"
        ]"#;
        let rows = serde_json::from_str::<StaffLocations>(json).unwrap().into_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "1");
    }

    #[test]
    fn test_parse_naive_timestamp() {
        let dt = parse_timestamp("2024-05-01T10:00:00.123456").unwrap();
        assert_eq!(dt.timestamp(), 1714557600);
        assert!(parse_timestamp("yesterday").is_none());
    }
}
