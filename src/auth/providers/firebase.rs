use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::providers::{FederatedCredential, IdentityProvider};
use crate::auth::session::{Session, SessionTokens};
use crate::config::IdentityConfig;
use crate::error::{errors, SpensoError, SpensoResult};

const PROVIDER_NAME: &str = "firebase";

// Error messages that mean the refresh token or account is no longer usable
const DEAD_SESSION_MESSAGES: &[&str] = &[
    "TOKEN_EXPIRED",
    "USER_DISABLED",
    "USER_NOT_FOUND",
    "INVALID_REFRESH_TOKEN",
    "MISSING_REFRESH_TOKEN",
    "INVALID_GRANT_TYPE",
    "PROJECT_NUMBER_MISMATCH",
];

// Request body for accounts:signInWithIdp
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpRequest<'a> {
    post_body: String,
    request_uri: &'a str,
    return_secure_token: bool,
    return_idp_credential: bool,
}

// Response for accounts:signInWithIdp
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignInWithIdpResponse {
    local_id: String,
    email: Option<String>,
    display_name: Option<String>,
    photo_url: Option<String>,
    id_token: String,
    refresh_token: String,
    expires_in: Option<String>,
}

// Response for the secure token endpoint
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: Option<String>,
    user_id: Option<String>,
}

// Error envelope returned by the Google identity endpoints
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Identity provider backed by the Firebase Auth REST API
pub struct FirebaseAuthProvider {
    /// HTTP client for API requests
    client: Client,
    /// Web API key of the Firebase project
    api_key: String,
    /// Base URL of the identity toolkit API
    identity_url: String,
    /// Base URL of the secure token API
    token_url: String,
    /// Redirect URI reported to signInWithIdp
    request_uri: String,
}

impl FirebaseAuthProvider {
    /// Create a new Firebase auth provider
    pub fn new(config: &IdentityConfig) -> SpensoResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            identity_url: config.identity_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.trim_end_matches('/').to_string(),
            request_uri: config.request_uri.clone(),
        })
    }

    fn sign_in_url(&self) -> String {
        format!("{}/v1/accounts:signInWithIdp", self.identity_url)
    }

    fn refresh_url(&self) -> String {
        format!("{}/v1/token", self.token_url)
    }

    /// Turn a non-success response into a classified error
    async fn error_from_response(response: Response, operation: &str) -> SpensoError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.clone());

        warn!(status = %status, operation, message = %message, "Firebase request rejected");

        let dead_session = DEAD_SESSION_MESSAGES
            .iter()
            .any(|m| message.starts_with(m));

        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                if operation == "sign_in" =>
            {
                errors::sign_in_failed(PROVIDER_NAME, message).into()
            }
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                if dead_session =>
            {
                errors::auth_refresh_failed(message).into()
            }
            _ => errors::from_status(PROVIDER_NAME, status.as_u16(), message).into(),
        }
    }
}

/// Form-encoded `postBody` carrying the federated credential
fn idp_post_body(credential: &FederatedCredential) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("id_token", credential.id_token())
        .append_pair("providerId", credential.provider_id())
        .finish()
}

fn expires_at(expires_in: Option<&str>) -> Option<chrono::DateTime<Utc>> {
    expires_in
        .and_then(|s| s.parse::<i64>().ok())
        .map(|secs| Utc::now() + chrono::Duration::seconds(secs))
}

#[async_trait]
impl IdentityProvider for FirebaseAuthProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn sign_in(&self, credential: &FederatedCredential) -> SpensoResult<Session> {
        let post_body = idp_post_body(credential);
        let request = SignInWithIdpRequest {
            post_body,
            request_uri: &self.request_uri,
            return_secure_token: true,
            return_idp_credential: true,
        };

        debug!(provider_id = credential.provider_id(), "Exchanging federated credential");

        let response = self
            .client
            .post(self.sign_in_url())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, "sign_in").await);
        }

        let body: SignInWithIdpResponse = response.json().await?;
        if body.local_id.is_empty() {
            return Err(errors::api_response_invalid(PROVIDER_NAME, "sign-in response has no account id").into());
        }

        info!(account_id = %body.local_id, "Federated sign-in accepted");

        Ok(Session {
            account_id: body.local_id,
            display_name: body.display_name,
            email: body.email,
            photo_url: body.photo_url,
            token_issued_at: Utc::now(),
            tokens: SessionTokens {
                id_token: body.id_token,
                refresh_token: body.refresh_token,
                expires_at: expires_at(body.expires_in.as_deref()),
            },
        })
    }

    async fn refresh(&self, session: &Session) -> SpensoResult<SessionTokens> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", session.tokens.refresh_token.as_str()),
        ];

        let response = self
            .client
            .post(self.refresh_url())
            .query(&[("key", self.api_key.as_str())])
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response, "refresh").await);
        }

        let body: RefreshResponse = response.json().await?;
        if let Some(user_id) = &body.user_id {
            if user_id != &session.account_id {
                return Err(errors::api_response_invalid(
                    PROVIDER_NAME,
                    "refreshed token belongs to a different account",
                )
                .into());
            }
        }

        debug!(account_id = %session.account_id, "Session token refreshed");

        Ok(SessionTokens {
            id_token: body.id_token,
            refresh_token: body.refresh_token,
            expires_at: expires_at(body.expires_in.as_deref()),
        })
    }
}
