use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::session::{Session, SessionTokens};
use crate::error::SpensoResult;

pub mod firebase;

pub use firebase::FirebaseAuthProvider;
pub use test::TestIdentityProvider;

/// Credential produced by a platform sign-in flow (e.g. the Google account picker)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum FederatedCredential {
    /// OpenID Connect id token issued by Google
    GoogleIdToken { id_token: String },
    /// Any other IdP, identified by its provider id (e.g. "apple.com")
    IdToken { provider_id: String, id_token: String },
}

impl FederatedCredential {
    /// Provider id as understood by the identity provider
    pub fn provider_id(&self) -> &str {
        match self {
            FederatedCredential::GoogleIdToken { .. } => "google.com",
            FederatedCredential::IdToken { provider_id, .. } => provider_id,
        }
    }

    /// The raw id token carried by this credential
    pub fn id_token(&self) -> &str {
        match self {
            FederatedCredential::GoogleIdToken { id_token } => id_token,
            FederatedCredential::IdToken { id_token, .. } => id_token,
        }
    }
}

/// Remote identity provider issuing short-lived session tokens
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Exchange a federated credential for a session
    async fn sign_in(&self, credential: &FederatedCredential) -> SpensoResult<Session>;

    /// Obtain fresh tokens for a live session
    async fn refresh(&self, session: &Session) -> SpensoResult<SessionTokens>;

    /// Tell the provider the session is over (if supported)
    async fn sign_out(&self, _session: &Session) -> SpensoResult<()> {
        // Default implementation does nothing
        Ok(())
    }
}
