//! Session state holder and everything it depends on
//!
//! - `session`: session values and the auth state machine
//! - `providers`: identity providers that issue and refresh sessions
//! - `storage`: local cache of the last live session
//! - `refresh`: the background token refresh loop
//! - `service`: the holder itself

use async_trait::async_trait;

pub mod providers;
mod refresh;
pub mod service;
pub mod session;
pub mod storage;

pub use providers::{FederatedCredential, FirebaseAuthProvider, IdentityProvider, TestIdentityProvider};
pub use service::{AuthService, AuthSubscription};
pub use session::{AuthState, AuthTransition, Session, SessionTokens, TransitionCause};
pub use storage::{FileSessionCache, MemorySessionCache, SessionCache};

/// Anything that can hand out a bearer token for backend calls
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    /// Current token, or `None` when nobody is signed in
    async fn access_token(&self) -> Option<String>;
}
