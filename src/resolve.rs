use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::SensorReading;

/// Where an object is right now, derived from its newest usable reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedPosition {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub reading_id: String,
}

/// Picks the reading with the greatest timestamp among those carrying both
/// coordinates. Equal timestamps are broken by the lexicographically
/// largest reading id, never by arrival order.
pub fn resolve(readings: &[SensorReading]) -> Option<ResolvedPosition> {
    let newest = readings
        .iter()
        .filter(|r| r.coordinates().is_some())
        .max_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.id.cmp(&b.id))
        })?;

    let (latitude, longitude) = newest.coordinates()?;
    Some(ResolvedPosition {
        latitude,
        longitude,
        altitude: newest.altitude,
        timestamp: newest.timestamp,
        reading_id: newest.id.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::types::fixtures::reading;

    #[test]
    fn test_empty_is_none() {
        assert!(resolve(&[]).is_none());
    }

    #[test]
    fn test_picks_max_timestamp_regardless_of_order() {
        let readings = vec![
            reading("r2", "a", 20, 2.0, 2.0),
            reading("r3", "a", 30, 3.0, 3.0),
            reading("r1", "a", 10, 1.0, 1.0),
        ];
        let pos = resolve(&readings).unwrap();
        assert_eq!(pos.reading_id, "r3");
        assert_eq!((pos.latitude, pos.longitude), (3.0, 3.0));

        let mut reversed = readings.clone();
        reversed.reverse();
        assert_eq!(resolve(&reversed), Some(pos));
    }

    #[test]
    fn test_tie_broken_by_largest_id() {
        let a = reading("a", "obj", 50, 1.0, 1.0);
        let b = reading("b", "obj", 50, 9.0, 9.0);

        let forward = resolve(&[a.clone(), b.clone()]).unwrap();
        let backward = resolve(&[b, a]).unwrap();
        assert_eq!(forward.reading_id, "b");
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_skips_readings_without_coordinates() {
        let mut newest = reading("r9", "a", 90, 0.0, 0.0);
        newest.longitude = None;
        let mut broken = reading("r8", "a", 80, 0.0, 0.0);
        broken.latitude = Some(f64::NAN);
        let older = reading("r1", "a", 10, 4.0, 5.0);

        let pos = resolve(&[newest, broken, older]).unwrap();
        assert_eq!(pos.reading_id, "r1");
    }

    #[test]
    fn test_all_missing_coordinates_is_none() {
        let mut only = reading("r1", "a", 10, 0.0, 0.0);
        only.latitude = None;
        assert!(resolve(&[only]).is_none());
    }
}
