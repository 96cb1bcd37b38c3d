use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::backend::{Backend, BackendError};
use crate::model::SensorReading;

/// Renderers are not built for unbounded polylines; anything above this is
/// downsampled.
pub const MAX_PATH_POINTS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Builds the path polyline, oldest first, bounded to [`MAX_PATH_POINTS`].
/// The fetch already applies the window; readings older than
/// `window_minutes` before the newest one are still dropped. The cutoff
/// follows the readings, never the local clock.
pub fn sample(readings: &[SensorReading], window_minutes: u32) -> Vec<PathPoint> {
    let mut located: Vec<&SensorReading> =
        readings.iter().filter(|r| r.coordinates().is_some()).collect();
    located.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let cutoff = match located.last() {
        Some(newest) => newest.timestamp - Duration::minutes(i64::from(window_minutes)),
        None => return Vec::new(),
    };

    let points: Vec<PathPoint> = located
        .into_iter()
        .filter(|r| r.timestamp >= cutoff)
        .filter_map(|r| {
            r.coordinates().map(|(latitude, longitude)| PathPoint {
                latitude,
                longitude,
                timestamp: r.timestamp,
            })
        })
        .collect();

    downsample(points, MAX_PATH_POINTS)
}

/// Keeps every `ceil(len / max)`-th point and always the last one, so the
/// most recent position survives whatever the stride.
pub fn downsample<T>(points: Vec<T>, max: usize) -> Vec<T> {
    let count = points.len();
    if count <= max || max == 0 {
        return points;
    }

    let stride = count.div_ceil(max);
    let last = count - 1;
    points
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % stride == 0 || *i == last)
        .map(|(_, p)| p)
        .collect()
}

/// Fetches the windowed history for one object and samples it.
pub async fn fetch_path<B: Backend>(
    backend: &B,
    object_id: &str,
    window_minutes: u32,
) -> Result<Vec<PathPoint>, BackendError> {
    let readings = backend.sensor_data(object_id, Some(window_minutes)).await?;
    Ok(sample(&readings, window_minutes))
}
