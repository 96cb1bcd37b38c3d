mod error;
mod rest;

pub use error::BackendError;
pub use rest::RestBackend;

use std::future::Future;

use crate::filter::Filter;
use crate::model::{ObjectType, SensorReading, TrackedObject};

/// The REST surface the tracking engine reads from.
pub trait Backend: Send + Sync + 'static {
    /// `GET /objects` with the server-side part of `filter`.
    fn list_objects(
        &self,
        filter: &Filter,
    ) -> impl Future<Output = Result<Vec<TrackedObject>, BackendError>> + Send;

    /// `GET /objects/{id}`
    fn get_object(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<TrackedObject, BackendError>> + Send;

    /// `GET /objects/{id}/sensor-data`, optionally restricted to the last
    /// `time_range` minutes. Order is not guaranteed.
    fn sensor_data(
        &self,
        id: &str,
        time_range: Option<u32>,
    ) -> impl Future<Output = Result<Vec<SensorReading>, BackendError>> + Send;

    /// Server-managed type registry.
    fn object_types(&self) -> impl Future<Output = Result<Vec<ObjectType>, BackendError>> + Send;
}
