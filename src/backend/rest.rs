use chrono::Local;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;

use super::error::{parse_error_detail, BackendError};
use super::Backend;
use crate::filter::Filter;
use crate::model::{ObjectType, SensorReading, TrackedObject};

/// [`Backend`] over HTTP/JSON.
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    base: String,
}

impl RestBackend {
    pub fn new(api_url: &str) -> Self {
        Self {
            client: Client::new(),
            base: api_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, BackendError> {
        let response = self.client.get(self.url(path)).query(query).send().await?;
        let status = response.status();

        if !status.is_success() {
            let reason = status.canonical_reason().unwrap_or("unknown");
            let body = response.text().await.unwrap_or_default();
            let detail = parse_error_detail(status.as_u16(), reason, &body);
            log::debug!("GET {} failed: {}", path, detail);
            return Err(BackendError::Status {
                status: status.as_u16(),
                detail,
            });
        }

        let body = response.text().await?;
        decode_body(status, &body)
    }
}

/// A 204 on a list endpoint is an empty list.
fn decode_body<T: DeserializeOwned>(status: StatusCode, body: &str) -> Result<T, BackendError> {
    if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
        return Ok(serde_json::from_str("[]")?);
    }
    Ok(serde_json::from_str(body)?)
}

impl Backend for RestBackend {
    fn list_objects(
        &self,
        filter: &Filter,
    ) -> impl Future<Output = Result<Vec<TrackedObject>, BackendError>> + Send {
        let query = filter.query_pairs(&Local::now());
        async move { self.get_json("/api/objects", &query).await }
    }

    fn get_object(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<TrackedObject, BackendError>> + Send {
        let path = format!("/api/objects/{}", id);
        async move { self.get_json(&path, &[]).await }
    }

    fn sensor_data(
        &self,
        id: &str,
        time_range: Option<u32>,
    ) -> impl Future<Output = Result<Vec<SensorReading>, BackendError>> + Send {
        let path = format!("/api/objects/{}/sensor-data", id);
        let query: Vec<(&str, String)> = time_range
            .map(|minutes| vec![("time_range", minutes.to_string())])
            .unwrap_or_default();
        async move { self.get_json(&path, &query).await }
    }

    fn object_types(&self) -> impl Future<Output = Result<Vec<ObjectType>, BackendError>> + Send {
        async move { self.get_json("/object-types/", &[]).await }
    }
}
