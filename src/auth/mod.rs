// Authentication module
// Token store, single-flight refresh and session operations

mod coordinator;
mod refresh;
mod session;
mod store;
mod types;

pub use coordinator::RefreshCoordinator;
pub use refresh::REFRESH_PATH;
pub use session::Session;
pub use store::{AccessToken, TokenStore};
pub use types::{AuthResponse, SessionState, SignUpRequest, TokenResponse, UserProfile};
