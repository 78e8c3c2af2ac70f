//! Device listing client for the Netatmo weather API.

use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;

use crate::error::{ExporterError, Result};

/// Upper bound on any single call to the Netatmo API.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Netatmo error code for an invalid or expired access token.
const INVALID_ACCESS_TOKEN: i64 = 2;

/// The unnormalised `body.devices` array.
pub type RawTopology = Vec<Value>;

/// Build the HTTP client shared by the authenticator and the fetcher.
pub fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ExporterError::Config(format!("failed to build HTTP client: {}", e)))
}

/// Client for the station data endpoint.
#[derive(Debug, Clone)]
pub struct StationsClient {
    http: reqwest::Client,
    stations_url: String,
}

impl StationsClient {
    pub fn new(http: reqwest::Client, stations_url: impl Into<String>) -> Self {
        Self {
            http,
            stations_url: stations_url.into(),
        }
    }

    /// Fetch the raw device list using the given session headers.
    pub async fn fetch(&self, headers: HeaderMap) -> Result<RawTopology> {
        log::debug!("Fetching stations data from Netatmo API...");

        let response = self
            .http
            .post(&self.stations_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| ExporterError::Api(format!("Failed to fetch stations data: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExporterError::Api(format!("Failed to read stations data: {}", e)))?;

        let devices = classify_response(status, &body)?;
        log::debug!("Received data for {} station(s)", devices.len());
        Ok(devices)
    }
}

/// Turn a device listing response into the raw device list or a typed error.
///
/// Checks run in priority order: throttling, invalid access token, other
/// HTTP errors, malformed JSON, then an `error` object in a 200 body.
pub fn classify_response(status: StatusCode, body: &str) -> Result<RawTopology> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(ExporterError::Throttling);
    }

    if status == StatusCode::FORBIDDEN {
        let code = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error")?.get("code")?.as_i64());
        if code == Some(INVALID_ACCESS_TOKEN) {
            return Err(ExporterError::Auth("Invalid access token".to_string()));
        }
        return Err(ExporterError::Api("Access forbidden (403)".to_string()));
    }

    if status.as_u16() >= 400 {
        return Err(ExporterError::Api(format!(
            "API request failed with status {}: {}",
            status.as_u16(),
            body
        )));
    }

    let data: Value =
        serde_json::from_str(body).map_err(|e| ExporterError::JsonDecode(e.to_string()))?;

    let payload = data.get("body").filter(|b| is_truthy(b));
    if payload.is_none() {
        if let Some(error) = data.get("error").filter(|e| is_truthy(e)) {
            return Err(ExporterError::Api(format!("API error: {}", error)));
        }
    }

    Ok(payload
        .and_then(|b| b.get("devices"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Number(_) => true,
    }
}
