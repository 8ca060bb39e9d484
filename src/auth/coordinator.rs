use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

use crate::error::{ApiError, Result, TransportError};
use crate::http_client::{ApiRequest, ApiResponse, Transport};

use super::refresh;
use super::store::{AccessToken, TokenStore};
use super::types::SessionState;

/// Result of one refresh epoch, shared by every waiter of that epoch
#[derive(Debug, Clone)]
enum RefreshOutcome {
    Refreshed(AccessToken),
    Failed(String),
}

enum RefreshState {
    Idle,
    Refreshing {
        epoch: u64,
        /// Released in insertion order when the epoch resolves
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

struct Shared<T> {
    transport: T,
    state: Mutex<RefreshState>,
    /// Number of epochs started so far
    epochs: AtomicU64,
    session: watch::Sender<SessionState>,
}

/// Refresh coordinator
/// Makes 401 handling transparent to callers: at most one refresh exchange is
/// in flight at any time and every caller that hit a 401 meanwhile shares its outcome.
/// Each original request is retried exactly once.
pub struct RefreshCoordinator<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for RefreshCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport> RefreshCoordinator<T> {
    pub fn new(transport: T) -> Self {
        let (session, _) = watch::channel(SessionState::SignedOut);
        Self {
            shared: Arc::new(Shared {
                transport,
                state: Mutex::new(RefreshState::Idle),
                epochs: AtomicU64::new(0),
                session,
            }),
        }
    }

    /// Underlying transport, for calls that must bypass 401 interception
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    pub fn token_store(&self) -> &TokenStore {
        self.shared.transport.token_store()
    }

    /// Number of refresh exchanges issued
    pub fn refresh_count(&self) -> u64 {
        self.shared.epochs.load(Ordering::SeqCst)
    }

    /// True while a refresh exchange is outstanding
    pub fn is_refreshing(&self) -> bool {
        matches!(*self.shared.state.lock(), RefreshState::Refreshing { .. })
    }

    /// Epoch currently in flight, if any
    pub fn epoch(&self) -> Option<u64> {
        match *self.shared.state.lock() {
            RefreshState::Refreshing { epoch, .. } => Some(epoch),
            RefreshState::Idle => None,
        }
    }

    /// Session state changes, e.g. to redirect to sign-in on `Expired`
    pub fn session_events(&self) -> watch::Receiver<SessionState> {
        self.shared.session.subscribe()
    }

    pub fn session_state(&self) -> SessionState {
        *self.shared.session.borrow()
    }

    pub(crate) fn set_session_state(&self, state: SessionState) {
        self.shared.session.send_replace(state);
    }

    /// Issue a request, transparently refreshing the access token on 401
    pub async fn request(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let sent_with = self.token_store().get().await;

        let message = match self.shared.transport.send(request).await {
            Err(TransportError::Unauthorized { message }) => message,
            other => return Ok(other?),
        };

        tracing::warn!(
            method = %request.method,
            path = %request.path,
            message = %message,
            "Received 401, coordinating token refresh"
        );

        // A completed epoch may already have replaced the token this request carried
        let current = self.token_store().get().await;
        if current.is_some() && current != sent_with {
            tracing::debug!(path = %request.path, "Token already refreshed, retrying");
            return Ok(self.shared.transport.send(request).await?);
        }

        match self.await_refresh().await {
            RefreshOutcome::Refreshed(_) => {
                tracing::debug!(path = %request.path, "Retrying request after refresh");
                Ok(self.shared.transport.send(request).await?)
            }
            RefreshOutcome::Failed(reason) => Err(ApiError::AuthExpired(reason)),
        }
    }

    /// Issue a request and deserialize its JSON body
    pub async fn request_json<R: DeserializeOwned>(&self, request: &ApiRequest) -> Result<R> {
        self.request(request).await?.json()
    }

    /// Join the in-flight epoch, or open one, and wait for its outcome
    async fn await_refresh(&self) -> RefreshOutcome {
        let (tx, rx) = oneshot::channel();

        let opened = {
            let mut state = self.shared.state.lock();
            match &mut *state {
                RefreshState::Refreshing { epoch, waiters } => {
                    waiters.push(tx);
                    tracing::debug!(
                        epoch = *epoch,
                        waiters = waiters.len(),
                        "Joining in-flight token refresh"
                    );
                    None
                }
                RefreshState::Idle => {
                    let epoch = self.shared.epochs.fetch_add(1, Ordering::SeqCst) + 1;
                    *state = RefreshState::Refreshing {
                        epoch,
                        waiters: vec![tx],
                    };
                    Some(epoch)
                }
            }
        };

        // The exchange runs detached so a cancelled driver cannot strand the other waiters
        if let Some(epoch) = opened {
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.run_epoch(epoch).await });
        }

        rx.await.unwrap_or_else(|_| {
            RefreshOutcome::Failed("Token refresh was interrupted".to_string())
        })
    }

    async fn run_epoch(&self, epoch: u64) {
        tracing::info!(epoch, "Refreshing access token...");

        let outcome = match refresh::exchange_refresh_token(&self.shared.transport).await {
            Ok(data) => {
                let token = AccessToken::new(data.access_token);
                self.token_store()
                    .set_with_expiry(token.clone(), data.expires_in)
                    .await;
                self.set_session_state(SessionState::Active);
                RefreshOutcome::Refreshed(token)
            }
            Err(e) => {
                tracing::error!(epoch, error = %e, "Token refresh failed, clearing session");
                self.token_store().clear().await;
                self.set_session_state(SessionState::Expired);
                RefreshOutcome::Failed(e.to_string())
            }
        };

        let waiters = {
            let mut state = self.shared.state.lock();
            match std::mem::replace(&mut *state, RefreshState::Idle) {
                RefreshState::Refreshing { waiters, .. } => waiters,
                RefreshState::Idle => Vec::new(),
            }
        };

        tracing::debug!(epoch, waiters = waiters.len(), "Releasing refresh waiters");
        for waiter in waiters {
            // A waiter whose caller went away is simply skipped
            let _ = waiter.send(outcome.clone());
        }
    }
}
