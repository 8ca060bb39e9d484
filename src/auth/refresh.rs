// Token refresh exchange

use crate::error::{ApiError, TransportError};
use crate::http_client::{ApiRequest, Transport};

use super::types::TokenResponse;

/// Refresh endpoint. The refresh credential travels as an HTTP-only cookie.
pub const REFRESH_PATH: &str = "/auth/refresh";

/// Exchange the refresh cookie for a new access token.
/// Goes straight to the transport so a 401 here is never intercepted again.
pub async fn exchange_refresh_token<T: Transport + ?Sized>(
    transport: &T,
) -> Result<TokenResponse, ApiError> {
    let response = transport
        .send(&ApiRequest::post(REFRESH_PATH))
        .await
        .map_err(|e| match e {
            TransportError::Unauthorized { message } => ApiError::AuthExpired(message),
            other => ApiError::AuthExpired(format!("Refresh request failed: {}", other)),
        })?;

    let data: TokenResponse = response
        .json()
        .map_err(|e| ApiError::AuthExpired(format!("Failed to parse refresh response: {}", e)))?;

    if data.access_token.is_empty() {
        return Err(ApiError::AuthExpired(
            "Refresh response does not contain access_token".to_string(),
        ));
    }

    tracing::info!(expires_in = data.expires_in, "Access token refreshed");

    Ok(data)
}
