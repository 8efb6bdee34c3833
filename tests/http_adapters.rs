use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mockito::{Matcher, Server};
use serde_json::json;
use spenso::auth::{FirebaseAuthProvider, IdentityProvider, MemorySessionCache, SessionTokens};
use spenso::config::{IdentityConfig, SessionConfig, StoreConfig};
use spenso::error::{ErrorCategory, ErrorCode, RetryPolicy};
use spenso::profile::{DocumentStore, FieldValue, Fields, FirestoreDocumentStore, FIELD_CURRENCY, FIELD_JOIN_DATE};
use spenso::{AccessTokenSource, AuthService, FederatedCredential, ProfileSynchronizer, Session};

const API_KEY: &str = "test-api-key";
const DOCUMENT_PATH: &str = r"^/v1/projects/demo-project/databases/[^/]+/documents/users/acct-1";

fn identity_config(url: &str) -> IdentityConfig {
    IdentityConfig {
        api_key: API_KEY.to_string(),
        identity_url: url.to_string(),
        token_url: url.to_string(),
        request_uri: "http://localhost".to_string(),
        timeout_seconds: 5,
    }
}

fn store_config(url: &str) -> StoreConfig {
    StoreConfig {
        base_url: url.to_string(),
        project_id: "demo-project".to_string(),
        users_collection: "users".to_string(),
    }
}

fn session() -> Session {
    Session {
        account_id: "acct-1".to_string(),
        display_name: Some("Grace Hopper".to_string()),
        email: Some("grace@example.com".to_string()),
        photo_url: None,
        token_issued_at: Utc::now(),
        tokens: SessionTokens {
            id_token: "id-token-1".to_string(),
            refresh_token: "refresh-token-1".to_string(),
            expires_at: None,
        },
    }
}

struct FixedToken(&'static str);

#[async_trait]
impl AccessTokenSource for FixedToken {
    async fn access_token(&self) -> Option<String> {
        Some(self.0.to_string())
    }
}

fn sign_in_body() -> serde_json::Value {
    json!({
        "federatedId": "https://accounts.google.com/1234",
        "providerId": "google.com",
        "localId": "acct-1",
        "email": "grace@example.com",
        "displayName": "Grace Hopper",
        "photoUrl": "https://example.com/grace.png",
        "idToken": "id-token-1",
        "refreshToken": "refresh-token-1",
        "expiresIn": "3600"
    })
}

#[tokio::test]
async fn firebase_sign_in_exchanges_google_token() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/accounts:signInWithIdp")
        .match_query(Matcher::UrlEncoded("key".into(), API_KEY.into()))
        .match_body(Matcher::PartialJson(json!({
            "postBody": "id_token=google-token&providerId=google.com",
            "returnSecureToken": true
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(sign_in_body().to_string())
        .create_async()
        .await;

    let provider = FirebaseAuthProvider::new(&identity_config(&server.url())).unwrap();
    let session = provider
        .sign_in(&FederatedCredential::GoogleIdToken {
            id_token: "google-token".into(),
        })
        .await
        .unwrap();

    mock.assert_async().await;
    assert_eq!(session.account_id, "acct-1");
    assert_eq!(session.display_name.as_deref(), Some("Grace Hopper"));
    assert_eq!(session.tokens.refresh_token, "refresh-token-1");
    assert!(session.tokens.expires_at.is_some());
}

#[tokio::test]
async fn firebase_rejected_sign_in_is_an_auth_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/v1/accounts:signInWithIdp")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(json!({"error": {"code": 400, "message": "INVALID_IDP_RESPONSE : bad token"}}).to_string())
        .create_async()
        .await;

    let provider = FirebaseAuthProvider::new(&identity_config(&server.url())).unwrap();
    let err = provider
        .sign_in(&FederatedCredential::GoogleIdToken {
            id_token: "bad".into(),
        })
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::AuthSignInFailed);
    assert!(err.message.contains("INVALID_IDP_RESPONSE"));
}

#[tokio::test]
async fn firebase_refresh_returns_new_tokens() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/token")
        .match_query(Matcher::UrlEncoded("key".into(), API_KEY.into()))
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "refresh-token-1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "access_token": "id-token-2",
                "expires_in": "3600",
                "token_type": "Bearer",
                "refresh_token": "refresh-token-2",
                "id_token": "id-token-2",
                "user_id": "acct-1",
                "project_id": "1234"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let provider = FirebaseAuthProvider::new(&identity_config(&server.url())).unwrap();
    let tokens = provider.refresh(&session()).await.unwrap();

    mock.assert_async().await;
    assert_eq!(tokens.id_token, "id-token-2");
    assert_eq!(tokens.refresh_token, "refresh-token-2");
}

#[tokio::test]
async fn firebase_refresh_errors_are_classified() {
    let mut server = Server::new_async().await;
    let provider = FirebaseAuthProvider::new(&identity_config(&server.url())).unwrap();

    let dead = server
        .mock("POST", "/v1/token")
        .match_query(Matcher::Any)
        .with_status(400)
        .with_body(json!({"error": {"code": 400, "message": "TOKEN_EXPIRED"}}).to_string())
        .expect(1)
        .create_async()
        .await;
    let err = provider.refresh(&session()).await.unwrap_err();
    dead.assert_async().await;
    dead.remove_async().await;
    assert_eq!(err.code, ErrorCode::AuthRefreshFailed);
    assert!(!err.is_transient());

    server
        .mock("POST", "/v1/token")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("backend unavailable")
        .create_async()
        .await;
    let err = provider.refresh(&session()).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::ServiceUnavailable);
    assert!(err.is_transient());
}

#[tokio::test]
async fn unreachable_identity_service_is_transient() {
    // Nothing listens on port 1
    let provider = FirebaseAuthProvider::new(&identity_config("http://127.0.0.1:1")).unwrap();
    let err = provider.refresh(&session()).await.unwrap_err();
    assert_eq!(err.category, Some(ErrorCategory::Network));
    assert!(err.is_transient());
}

#[tokio::test]
async fn firestore_missing_document_is_none() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(DOCUMENT_PATH.into()))
        .match_query(Matcher::Any)
        .with_status(404)
        .with_body(json!({"error": {"code": 404, "status": "NOT_FOUND"}}).to_string())
        .create_async()
        .await;

    let store = FirestoreDocumentStore::new(&store_config(&server.url()), Duration::from_secs(5)).unwrap();
    assert!(store.get("users", "acct-1").await.unwrap().is_none());
}

#[tokio::test]
async fn firestore_get_decodes_typed_values() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", Matcher::Regex(DOCUMENT_PATH.into()))
        .match_query(Matcher::UrlEncoded("key".into(), API_KEY.into()))
        .match_header("authorization", "Bearer user-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "name": "projects/demo-project/databases/(default)/documents/users/acct-1",
                "fields": {
                    "currency": {"stringValue": "EUR"},
                    "joinDate": {"timestampValue": "2024-01-15T08:30:00.123456Z"},
                    "budget": {"doubleValue": 12.5}
                },
                "createTime": "2024-01-15T08:30:00.123456Z",
                "updateTime": "2024-02-01T10:00:00Z"
            })
            .to_string(),
        )
        .create_async()
        .await;

    let store = FirestoreDocumentStore::new(&store_config(&server.url()), Duration::from_secs(5))
        .unwrap()
        .with_api_key(API_KEY)
        .with_token_source(Arc::new(FixedToken("user-token")));
    let fields = store.get("users", "acct-1").await.unwrap().unwrap();

    mock.assert_async().await;
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[FIELD_CURRENCY], FieldValue::from("EUR"));
    assert!(fields[FIELD_JOIN_DATE].as_timestamp().is_some());
}

#[tokio::test]
async fn firestore_merge_sends_update_mask() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("PATCH", Matcher::Regex(DOCUMENT_PATH.into()))
        .match_query(Matcher::UrlEncoded("updateMask.fieldPaths".into(), "currency".into()))
        .match_header("authorization", "Bearer user-token")
        .match_body(Matcher::Json(json!({
            "fields": {"currency": {"stringValue": "JPY"}}
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let store = FirestoreDocumentStore::new(&store_config(&server.url()), Duration::from_secs(5))
        .unwrap()
        .with_token_source(Arc::new(FixedToken("user-token")));

    let mut fields = Fields::new();
    fields.insert(FIELD_CURRENCY.to_string(), "JPY".into());
    store.merge("users", "acct-1", &fields).await.unwrap();

    mock.assert_async().await;
}

#[tokio::test]
async fn firestore_rejected_write_keeps_status_category() {
    let mut server = Server::new_async().await;
    server
        .mock("PATCH", Matcher::Regex(DOCUMENT_PATH.into()))
        .match_query(Matcher::Any)
        .with_status(403)
        .with_body(json!({"error": {"code": 403, "status": "PERMISSION_DENIED"}}).to_string())
        .create_async()
        .await;

    let store = FirestoreDocumentStore::new(&store_config(&server.url()), Duration::from_secs(5)).unwrap();
    let err = store
        .merge("users", "acct-1", &Fields::new())
        .await
        .unwrap_err();

    assert_eq!(err.category, Some(ErrorCategory::Permission));
    assert!(err.context.unwrap().contains("users/acct-1"));
}

#[tokio::test]
async fn sign_in_then_profile_sync_over_http() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/v1/accounts:signInWithIdp")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(sign_in_body().to_string())
        .create_async()
        .await;
    server
        .mock("GET", Matcher::Regex(DOCUMENT_PATH.into()))
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer id-token-1")
        .with_status(404)
        .create_async()
        .await;
    let write = server
        .mock("PATCH", Matcher::Regex(DOCUMENT_PATH.into()))
        .match_query(Matcher::Any)
        .match_header("authorization", "Bearer id-token-1")
        .match_body(Matcher::PartialJson(json!({
            "fields": {
                "userId": {"stringValue": "acct-1"},
                "currency": {"stringValue": "USD"},
                "name": {"stringValue": "Grace Hopper"}
            }
        })))
        .with_status(200)
        .with_body("{}")
        .create_async()
        .await;

    let provider = Arc::new(FirebaseAuthProvider::new(&identity_config(&server.url())).unwrap());
    let auth = AuthService::new(provider, Arc::new(MemorySessionCache::new()), SessionConfig::default());

    let store = FirestoreDocumentStore::new(&store_config(&server.url()), Duration::from_secs(5))
        .unwrap()
        .with_token_source(Arc::new(auth.clone()));
    let profiles = ProfileSynchronizer::new(Arc::new(store), "users", RetryPolicy::no_retry());

    let session = auth
        .sign_in(FederatedCredential::GoogleIdToken {
            id_token: "google-token".into(),
        })
        .await
        .unwrap();
    let profile = profiles.sync(&session).await.unwrap();

    write.assert_async().await;
    assert_eq!(profile.currency_code, "USD");
    assert_eq!(profile.photo_url, "https://example.com/grace.png");

    auth.shutdown().await;
}
