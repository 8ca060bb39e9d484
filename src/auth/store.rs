// In-memory access token slot

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Opaque bearer token. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Value for the `Authorization` header
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "AccessToken({}...)", prefix)
    }
}

#[derive(Debug, Default)]
struct Slot {
    token: Option<AccessToken>,
    expires_at: Option<DateTime<Utc>>,
}

/// Token store
/// Holds the single current access token; read by the transport on every call
#[derive(Debug, Clone, Default)]
pub struct TokenStore {
    slot: Arc<RwLock<Slot>>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current token, if signed in
    pub async fn get(&self) -> Option<AccessToken> {
        self.slot.read().await.token.clone()
    }

    /// Replace (or clear, with `None`) the current token
    pub async fn set(&self, token: Option<AccessToken>) {
        let mut slot = self.slot.write().await;
        slot.token = token;
        slot.expires_at = None;
    }

    /// Replace the token and record the server-reported lifetime
    pub async fn set_with_expiry(&self, token: AccessToken, expires_in: u64) {
        let mut slot = self.slot.write().await;
        slot.token = Some(token);
        slot.expires_at = Some(Utc::now() + Duration::seconds(expires_in as i64));
    }

    pub async fn clear(&self) {
        self.set(None).await;
    }

    /// Server-reported expiry of the current token (informational only)
    pub async fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.slot.read().await.expires_at
    }
}
