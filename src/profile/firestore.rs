use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::auth::AccessTokenSource;
use crate::config::StoreConfig;
use crate::error::{errors, SpensoResult};
use crate::profile::store::DocumentStore;
use crate::profile::{FieldValue, Fields};

const STORE_NAME: &str = "firestore";

// Document as returned by the REST API
#[derive(Debug, Deserialize)]
struct Document {
    #[serde(default)]
    fields: HashMap<String, Value>,
}

// Body of a PATCH request
#[derive(Debug, Serialize)]
struct DocumentWrite {
    fields: HashMap<String, Value>,
}

/// Document store backed by the Cloud Firestore REST API
pub struct FirestoreDocumentStore {
    client: Client,
    /// `{base_url}/v1/projects/{project}/databases/(default)/documents`
    documents_url: String,
    /// Optional API key sent as the `key` query parameter
    api_key: Option<String>,
    /// Supplies the bearer token of the signed-in user
    token_source: Option<Arc<dyn AccessTokenSource>>,
}

impl FirestoreDocumentStore {
    pub fn new(config: &StoreConfig, timeout: Duration) -> SpensoResult<Self> {
        if config.project_id.is_empty() {
            return Err(errors::config_missing("store.project_id").into());
        }

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            documents_url: format!(
                "{}/v1/projects/{}/databases/(default)/documents",
                config.base_url.trim_end_matches('/'),
                config.project_id
            ),
            api_key: None,
            token_source: None,
        })
    }

    /// Send `key=<api_key>` with every request
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        let api_key = api_key.into();
        self.api_key = (!api_key.is_empty()).then_some(api_key);
        self
    }

    /// Authorize requests with the token from `source`
    pub fn with_token_source(mut self, source: Arc<dyn AccessTokenSource>) -> Self {
        self.token_source = Some(source);
        self
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}/{}", self.documents_url, collection, id)
    }

    async fn authorize(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(key) = &self.api_key {
            request = request.query(&[("key", key.as_str())]);
        }
        if let Some(source) = &self.token_source {
            match source.access_token().await {
                Some(token) => request = request.bearer_auth(token),
                None => trace!("No access token available, sending unauthenticated request"),
            }
        }
        request
    }
}

/// Encode a field value in the REST API's typed value format
fn encode_value(value: &FieldValue) -> Value {
    match value {
        FieldValue::String(s) => json!({ "stringValue": s }),
        FieldValue::Timestamp(t) => {
            json!({ "timestampValue": t.to_rfc3339_opts(SecondsFormat::Micros, true) })
        }
    }
}

/// Decode a typed value. Kinds we do not use are skipped.
fn decode_value(value: &Value) -> Option<FieldValue> {
    if let Some(s) = value.get("stringValue").and_then(Value::as_str) {
        return Some(FieldValue::String(s.to_string()));
    }
    if let Some(t) = value.get("timestampValue").and_then(Value::as_str) {
        return DateTime::parse_from_rfc3339(t)
            .ok()
            .map(|t| FieldValue::Timestamp(t.with_timezone(&Utc)));
    }
    None
}

fn decode_fields(document: Document) -> Fields {
    document
        .fields
        .iter()
        .filter_map(|(name, value)| decode_value(value).map(|v| (name.clone(), v)))
        .collect()
}

#[async_trait]
impl DocumentStore for FirestoreDocumentStore {
    fn name(&self) -> &str {
        STORE_NAME
    }

    async fn get(&self, collection: &str, id: &str) -> SpensoResult<Option<Fields>> {
        let request = self.authorize(self.client.get(self.document_url(collection, id))).await;
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(collection, id, "Document does not exist");
                Ok(None)
            }
            status if status.is_success() => {
                let document: Document = response.json().await?;
                Ok(Some(decode_fields(document)))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                warn!(collection, id, status = %status, "Document read rejected");
                let mut error: crate::error::SpensoError =
                    errors::from_status(STORE_NAME, status.as_u16(), body).into();
                error.context = Some(format!("get {}/{}", collection, id));
                Err(error)
            }
        }
    }

    async fn merge(&self, collection: &str, id: &str, fields: &Fields) -> SpensoResult<()> {
        // Only the listed paths are written; the rest of the document is kept
        let mask: Vec<(&str, &str)> = fields
            .keys()
            .map(|name| ("updateMask.fieldPaths", name.as_str()))
            .collect();
        let body = DocumentWrite {
            fields: fields
                .iter()
                .map(|(name, value)| (name.clone(), encode_value(value)))
                .collect(),
        };

        let request = self
            .client
            .patch(self.document_url(collection, id))
            .query(&mask)
            .json(&body);
        let response = self.authorize(request).await.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(collection, id, status = %status, "Document write rejected");
            let mut error: crate::error::SpensoError =
                errors::from_status(STORE_NAME, status.as_u16(), body).into();
            error.context = Some(format!("merge {}/{}", collection, id));
            return Err(error);
        }

        debug!(collection, id, fields = fields.len(), "Document merged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_encoding() {
        let at = DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let encoded = encode_value(&FieldValue::Timestamp(at));
        assert_eq!(encoded["timestampValue"], "2024-03-01T12:00:00.000000Z");
        assert_eq!(decode_value(&encoded), Some(FieldValue::Timestamp(at)));

        let encoded = encode_value(&FieldValue::from("EUR"));
        assert_eq!(encoded, json!({ "stringValue": "EUR" }));
    }

    #[test]
    fn test_unknown_value_kinds_are_skipped() {
        let document: Document = serde_json::from_value(json!({
            "name": "projects/p/databases/(default)/documents/users/a",
            "fields": {
                "currency": { "stringValue": "JPY" },
                "budget": { "integerValue": "1200" },
                "archived": { "booleanValue": false }
            }
        }))
        .unwrap();

        let fields = decode_fields(document);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["currency"], FieldValue::from("JPY"));
    }

    #[test]
    fn test_requires_project_id() {
        let config = StoreConfig {
            base_url: "http://localhost".into(),
            project_id: String::new(),
            users_collection: "users".into(),
        };
        assert!(FirestoreDocumentStore::new(&config, Duration::from_secs(5)).is_err());
    }
}
