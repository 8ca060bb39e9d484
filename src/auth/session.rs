// Sign-in, sign-up and sign-out

use serde_json::json;

use crate::error::{ApiError, Result};
use crate::http_client::{ApiRequest, Transport};

use super::coordinator::RefreshCoordinator;
use super::store::AccessToken;
use super::types::{AuthResponse, SessionState, SignInRequest, SignUpRequest, UserProfile};

/// Session operations. Credential exchanges go straight to the transport:
/// a 401 there means bad credentials, not an expired token.
pub struct Session<T: Transport> {
    coordinator: RefreshCoordinator<T>,
}

impl<T: Transport> Session<T> {
    pub fn new(coordinator: RefreshCoordinator<T>) -> Self {
        Self { coordinator }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let body = serde_json::to_value(SignInRequest { email, password })
            .map_err(|e| ApiError::Internal(e.into()))?;
        let response = self
            .coordinator
            .transport()
            .send(&ApiRequest::post("/auth/signin").json(body))
            .await?;

        let auth: AuthResponse = response.json()?;
        self.establish(&auth).await;
        tracing::info!(email = %auth.user.email, "Signed in");
        Ok(auth)
    }

    pub async fn sign_up(&self, request: SignUpRequest) -> Result<AuthResponse> {
        if request.password != request.password_confirm {
            return Err(ApiError::Validation("Passwords do not match".to_string()));
        }

        let body = serde_json::to_value(&request).map_err(|e| ApiError::Internal(e.into()))?;
        let response = self
            .coordinator
            .transport()
            .send(&ApiRequest::post("/auth/signup").json(body))
            .await?;

        let auth: AuthResponse = response.json()?;
        self.establish(&auth).await;
        tracing::info!(email = %auth.user.email, "Signed up");
        Ok(auth)
    }

    /// Revoke the refresh cookie server-side (best effort) and drop the access token
    pub async fn sign_out(&self) {
        if let Err(e) = self
            .coordinator
            .transport()
            .send(&ApiRequest::post("/auth/signout").json(json!({})))
            .await
        {
            tracing::warn!(error = %e, "Sign-out request failed; clearing local session anyway");
        }

        self.coordinator.token_store().clear().await;
        self.coordinator.set_session_state(SessionState::SignedOut);
        tracing::info!("Signed out");
    }

    /// Current user, through the refresh coordinator
    pub async fn current_user(&self) -> Result<UserProfile> {
        self.coordinator
            .request_json(&ApiRequest::get("/users/me"))
            .await
    }

    async fn establish(&self, auth: &AuthResponse) {
        self.coordinator
            .token_store()
            .set_with_expiry(
                AccessToken::new(auth.token.access_token.clone()),
                auth.token.expires_in,
            )
            .await;
        self.coordinator.set_session_state(SessionState::Active);
    }
}
