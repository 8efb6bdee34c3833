use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Provider-issued credentials backing a session
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionTokens {
    /// Short-lived token presented to backend services
    pub id_token: String,
    /// Long-lived token used to obtain a new id token
    pub refresh_token: String,
    /// When the id token stops being accepted (if the provider told us)
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for SessionTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTokens")
            .field("id_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// An authenticated session for one account.
///
/// Sessions are immutable values: every refresh produces a new one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Stable account identifier issued by the identity provider
    pub account_id: String,
    /// Display name from the federated profile
    pub display_name: Option<String>,
    /// Email address from the federated profile
    pub email: Option<String>,
    /// Avatar URL from the federated profile
    pub photo_url: Option<String>,
    /// When the current token was issued
    pub token_issued_at: DateTime<Utc>,
    /// Tokens used to talk to the provider and backend
    pub tokens: SessionTokens,
}

impl Session {
    /// Time elapsed since the current token was issued
    pub fn token_age(&self, now: DateTime<Utc>) -> Duration {
        now - self.token_issued_at
    }

    /// Whether the token is older than the given refresh interval
    pub fn needs_refresh(&self, now: DateTime<Utc>, interval: Duration) -> bool {
        self.token_age(now) > interval
    }

    /// Time left until the next refresh boundary, clamped at zero
    pub fn time_until_refresh(&self, now: DateTime<Utc>, interval: Duration) -> std::time::Duration {
        (interval - self.token_age(now))
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }

    /// Produce the session that follows a successful token refresh
    pub fn refreshed(&self, tokens: SessionTokens, issued_at: DateTime<Utc>) -> Self {
        Self {
            tokens,
            token_issued_at: issued_at,
            ..self.clone()
        }
    }
}

/// Authentication status of the app
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthState {
    /// A sign-in or session restore is in progress
    Loading,
    /// No session; the user has to sign in
    Unauthenticated,
    /// A live session
    Authenticated { session: Session },
    /// The last attempt failed; the message is meant for the user
    Error { message: String },
}

impl AuthState {
    /// The session, if authenticated
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthState::Authenticated { session } => Some(session),
            _ => None,
        }
    }

    /// Account id of the live session, if any
    pub fn account_id(&self) -> Option<&str> {
        self.session().map(|s| s.account_id.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated { .. })
    }

    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            AuthState::Loading => "loading",
            AuthState::Unauthenticated => "unauthenticated",
            AuthState::Authenticated { .. } => "authenticated",
            AuthState::Error { .. } => "error",
        }
    }
}

/// What caused a transition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCause {
    /// Startup read of the cached session
    Restore,
    /// An interactive sign-in
    SignIn,
    /// A new token for the session that was already live
    Refresh,
    /// The user signed out
    SignOut,
    /// The provider rejected the session, or it could not be refreshed for too long
    Expired,
}

/// One step in the auth state sequence, as seen by every observer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthTransition {
    /// Strictly increasing per holder
    pub sequence: u64,
    pub cause: TransitionCause,
    pub previous: AuthState,
    pub current: AuthState,
    pub at: DateTime<Utc>,
}

impl AuthTransition {
    /// True when this transition starts a session, as opposed to a token
    /// refresh of the session that was already live.
    pub fn is_sign_in(&self) -> bool {
        self.current.is_authenticated() && self.cause != TransitionCause::Refresh
    }

    /// True when this transition carries new tokens for the live session
    pub fn is_refresh(&self) -> bool {
        self.current.is_authenticated() && self.cause == TransitionCause::Refresh
    }

    /// True when this transition ends a session
    pub fn is_sign_out(&self) -> bool {
        self.previous.is_authenticated() && self.current == AuthState::Unauthenticated
    }
}
