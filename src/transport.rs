//! HTTP boundary between the session core and the backend.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::TransportError;

/// An outgoing call, kept as plain data so it can be re-issued after a
/// token refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the configured base URL, e.g. `api/login/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    /// Set once the request has been replayed after a refresh.
    pub retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, TransportError> {
        let value = serde_json::to_value(body).map_err(|e| TransportError::Decode(e.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    /// Replace any existing `Authorization` header with a bearer token.
    pub fn set_bearer(&mut self, token: &str) -> Result<(), TransportError> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| TransportError::InvalidHeader(e.to_string()))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    pub fn clear_bearer(&mut self) {
        self.headers.remove(AUTHORIZATION);
    }

    /// The bearer token currently stamped on the request, if any.
    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body).map_err(|e| TransportError::Decode(e.to_string()))
    }

    /// Body as JSON, or `Null` when it is empty or not JSON.
    pub fn json_value(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }

    pub fn error_for_status(self) -> Result<Self, TransportError> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Status {
                status: self.status,
                body: String::from_utf8_lossy(&self.body).into_owned(),
            })
        }
    }
}

/// Sends requests to the backend. Any HTTP status is a response; only
/// failures to get one are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// Production transport over `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    base_url: Url,
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self {
            base_url: normalize_base(base_url),
            client,
        })
    }

    fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.path)?;
        debug!(method = %request.method, %url, retried = request.retried, "Dispatching request");

        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        debug!(%status, bytes = body.len(), "Response received");
        Ok(ApiResponse { status, body })
    }
}

/// Make sure relative endpoint paths join beneath the base path instead of
/// replacing its last segment.
pub fn normalize_base(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
