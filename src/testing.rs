// Scripted transport for unit tests

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::auth::{AccessToken, TokenStore};
use crate::error::TransportError;
use crate::http_client::{ApiRequest, ApiResponse, Transport};

type Handler = Arc<
    dyn Fn(ApiRequest, Option<AccessToken>) -> BoxFuture<'static, Result<ApiResponse, TransportError>>
        + Send
        + Sync,
>;

/// Transport whose responses come from a closure. Records every request path.
pub(crate) struct MockTransport {
    tokens: TokenStore,
    handler: Handler,
    calls: Mutex<Vec<String>>,
}

impl MockTransport {
    pub(crate) fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(ApiRequest, Option<AccessToken>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, TransportError>> + Send + 'static,
    {
        Self {
            tokens: TokenStore::new(),
            handler: Arc::new(move |req, token| Box::pin(handler(req, token))),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Number of requests sent to `path`
    pub(crate) fn calls_to(&self, path: &str) -> usize {
        self.calls.lock().iter().filter(|p| p.as_str() == path).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.calls.lock().push(request.path.clone());
        let token = self.tokens.get().await;
        (self.handler)(request.clone(), token).await
    }

    fn token_store(&self) -> &TokenStore {
        &self.tokens
    }
}

pub(crate) fn ok_json(value: Value) -> Result<ApiResponse, TransportError> {
    Ok(ApiResponse::new(200, value.to_string()))
}

pub(crate) fn unauthorized() -> Result<ApiResponse, TransportError> {
    Err(TransportError::Unauthorized {
        message: "Could not validate credentials".to_string(),
    })
}

pub(crate) fn token_response(token: &str) -> Result<ApiResponse, TransportError> {
    ok_json(serde_json::json!({
        "access_token": token,
        "token_type": "bearer",
        "expires_in": 1800
    }))
}
