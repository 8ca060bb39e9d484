use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{AsHeaderName, HeaderMap, AUTHORIZATION};
use reqwest::{multipart, Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::auth::TokenStore;
use crate::error::{ApiError, TransportError};

/// Multipart upload payload, kept as plain data so a retry can rebuild it
#[derive(Debug, Clone)]
pub struct UploadForm {
    pub fields: Vec<(String, String)>,
    pub file_field: String,
    pub file_name: String,
    pub mime_type: String,
    pub content: Bytes,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(UploadForm),
}

/// A request relative to the API base URL
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn multipart(mut self, form: UploadForm) -> Self {
        self.body = RequestBody::Multipart(form);
        self
    }
}

/// Successful (2xx) response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Header value as text; None when absent or not visible ASCII
    pub fn header(&self, name: impl AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Deserialize the JSON body
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ApiError::Decode(format!("{} (status {})", e, self.status)))
    }
}

/// Issues requests with the current bearer token attached.
/// Implementations classify failures and never retry.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;

    /// Store the bearer token is read from
    fn token_store(&self) -> &TokenStore;
}

/// Connection settings for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub max_connections: usize,
    pub connect_timeout: u64,
    pub request_timeout: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            max_connections: 20,
            connect_timeout: 30,
            request_timeout: 120,
        }
    }
}

/// reqwest-backed transport for the Docflow API
pub struct HttpTransport {
    /// Shared HTTP client with connection pooling and the refresh cookie jar
    client: Client,

    /// API base URL without trailing slash, e.g. `http://localhost:8000/api/v1`
    base_url: String,

    tokens: TokenStore,
}

impl HttpTransport {
    pub fn new(base_url: &str, tokens: TokenStore, settings: &HttpSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .cookie_store(true)
            .pool_max_idle_per_host(settings.max_connections)
            .connect_timeout(Duration::from_secs(settings.connect_timeout))
            .timeout(Duration::from_secs(settings.request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_multipart(upload: &UploadForm) -> Result<multipart::Form, TransportError> {
        let mut form = multipart::Form::new();
        for (name, value) in &upload.fields {
            form = form.text(name.clone(), value.clone());
        }

        let part = multipart::Part::bytes(upload.content.to_vec())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.mime_type)
            .map_err(|e| TransportError::Network(format!("Invalid upload body: {}", e)))?;

        Ok(form.part(upload.file_field.clone(), part))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let method = request.method.clone();

        let mut builder = self.client.request(method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = self.tokens.get().await {
            builder = builder.header(AUTHORIZATION, token.bearer());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Multipart(upload) => builder.multipart(Self::build_multipart(upload)?),
        };

        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else if e.is_body() {
                    "body_error"
                } else {
                    "unknown"
                };

                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );

                return Err(TransportError::Network(format!(
                    "{} (kind: {})",
                    e, error_kind
                )));
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(format!("Failed to read response body: {}", e)))?;

        tracing::debug!(status = %status, url = %url, "Received HTTP response");

        if status.is_success() {
            return Ok(ApiResponse {
                status: status.as_u16(),
                headers,
                body,
            });
        }

        let message = error_message(&body, status.canonical_reason());
        if status.as_u16() == 401 {
            return Err(TransportError::Unauthorized { message });
        }

        tracing::warn!(
            status = status.as_u16(),
            url = %url,
            message = %message,
            "HTTP request failed with error response"
        );

        Err(TransportError::Http {
            status: status.as_u16(),
            message,
        })
    }

    fn token_store(&self) -> &TokenStore {
        &self.tokens
    }
}

/// Extract a human-readable message from an error body.
/// The service reports `{"detail": "..."}`, or a list of `{"msg": ...}` for validation errors.
pub(crate) fn error_message(body: &[u8], fallback: Option<&str>) -> String {
    if let Ok(json) = serde_json::from_slice::<Value>(body) {
        match json.get("detail") {
            Some(Value::String(detail)) => return detail.clone(),
            Some(Value::Array(items)) => {
                let messages: Vec<&str> = items
                    .iter()
                    .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                    .collect();
                if !messages.is_empty() {
                    return messages.join("; ");
                }
            }
            _ => {}
        }
    }

    let text = String::from_utf8_lossy(body).trim().to_string();
    if text.is_empty() {
        fallback.unwrap_or("Unknown error").to_string()
    } else {
        text
    }
}
