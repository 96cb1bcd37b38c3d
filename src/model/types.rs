use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A tracked object as the backend reports it. Identity is `id`; two
/// fetches with the same id are the same logical entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub id: String,
    #[serde(rename = "object_id")]
    pub external_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Open tag keyed against the server-managed type registry.
    #[serde(rename = "type")]
    pub kind: String,
    pub source_id: String,
    #[serde(with = "super::timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "super::timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub additional_info: Option<HashMap<String, serde_json::Value>>,
}

impl TrackedObject {
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => format!("{} #{}", self.kind, self.external_id),
        }
    }
}

/// One position report. Coordinates are optional on the wire; readings
/// without both are ignored by resolution and sampling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: String,
    pub tracked_object_id: String,
    #[serde(rename = "raw_sensor_id", default)]
    pub sensor_external_id: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub altitude: Option<f64>,
    #[serde(with = "super::timestamp")]
    pub timestamp: DateTime<Utc>,
}

impl SensorReading {
    /// Latitude and longitude, if both are present and finite.
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon)) if lat.is_finite() && lon.is_finite() => Some((lat, lon)),
            _ => None,
        }
    }
}

/// Registry entry describing how objects of one type are drawn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectType {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub icon: String,
    pub color: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}
