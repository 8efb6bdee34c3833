//! User profile documents
//!
//! One document per account lives in the users collection. The field names
//! match the documents written by the mobile app so both can share a backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Session;
use crate::error::{errors, SpensoError};

pub mod firestore;
pub mod store;
pub mod sync;

pub use firestore::FirestoreDocumentStore;
pub use store::{DocumentStore, MemoryDocumentStore};
pub use sync::{ProfileEvent, ProfileState, ProfileSynchronizer, SyncHandle};

// Stored field names
pub const FIELD_USER_ID: &str = "userId";
pub const FIELD_EMAIL: &str = "email";
pub const FIELD_NAME: &str = "name";
pub const FIELD_PHOTO_URL: &str = "photoUrl";
pub const FIELD_CURRENCY: &str = "currency";
pub const FIELD_JOIN_DATE: &str = "joinDate";
pub const FIELD_LAST_LOGIN: &str = "lastLogin";

/// Currency every new profile starts with
pub const DEFAULT_CURRENCY: &str = "USD";

/// Typed value of a document field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    String(String),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            FieldValue::Timestamp(_) => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(t) => Some(*t),
            FieldValue::String(_) => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(value)
    }
}

/// Document contents, keyed by field name
pub type Fields = BTreeMap<String, FieldValue>;

/// ISO-4217 style currency code: three uppercase ASCII letters
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CurrencyCode(String);

impl CurrencyCode {
    /// Parse user input. Surrounding whitespace is ignored and letters are uppercased.
    pub fn parse(input: &str) -> Result<Self, SpensoError> {
        let code = input.trim().to_ascii_uppercase();
        if code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase()) {
            Ok(Self(code))
        } else {
            Err(errors::invalid_currency_code(input).into())
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CurrencyCode {
    fn default() -> Self {
        Self(DEFAULT_CURRENCY.to_string())
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CurrencyCode {
    type Err = SpensoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CurrencyCode {
    type Error = SpensoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CurrencyCode> for String {
    fn from(code: CurrencyCode) -> Self {
        code.0
    }
}

/// Per-account profile document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub account_id: String,
    pub email: String,
    pub name: String,
    pub photo_url: String,
    /// As stored; may not be a valid code if another client wrote it
    pub currency_code: String,
    pub joined_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
}

impl UserProfile {
    /// Profile for an account signing in for the first time
    pub fn first_login(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            account_id: session.account_id.clone(),
            email: session.email.clone().unwrap_or_default(),
            name: session.display_name.clone().unwrap_or_default(),
            photo_url: session.photo_url.clone().unwrap_or_default(),
            currency_code: DEFAULT_CURRENCY.to_string(),
            joined_at: now,
            last_login_at: now,
        }
    }

    /// Profile after a later sign-in: display fields follow the session where
    /// it has them, everything else is kept
    pub fn next_login(&self, session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            email: session.email.clone().unwrap_or_else(|| self.email.clone()),
            name: session
                .display_name
                .clone()
                .unwrap_or_else(|| self.name.clone()),
            photo_url: session
                .photo_url
                .clone()
                .unwrap_or_else(|| self.photo_url.clone()),
            last_login_at: now,
            ..self.clone()
        }
    }

    /// Every stored field
    pub fn to_fields(&self) -> Fields {
        let mut fields = self.login_fields();
        fields.insert(FIELD_USER_ID.to_string(), self.account_id.as_str().into());
        fields.insert(FIELD_CURRENCY.to_string(), self.currency_code.as_str().into());
        fields.insert(FIELD_JOIN_DATE.to_string(), self.joined_at.into());
        fields
    }

    /// Fields rewritten on each sign-in
    pub fn login_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_NAME.to_string(), self.name.as_str().into());
        fields.insert(FIELD_EMAIL.to_string(), self.email.as_str().into());
        fields.insert(FIELD_PHOTO_URL.to_string(), self.photo_url.as_str().into());
        fields.insert(FIELD_LAST_LOGIN.to_string(), self.last_login_at.into());
        fields
    }

    /// Decode a stored document. Missing strings become empty, missing
    /// timestamps become `now`.
    pub fn from_fields(account_id: &str, fields: &Fields, now: DateTime<Utc>) -> Self {
        let string = |name: &str| {
            fields
                .get(name)
                .and_then(FieldValue::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let timestamp = |name: &str| {
            fields
                .get(name)
                .and_then(FieldValue::as_timestamp)
                .unwrap_or(now)
        };

        let currency = string(FIELD_CURRENCY);
        Self {
            account_id: account_id.to_string(),
            email: string(FIELD_EMAIL),
            name: string(FIELD_NAME),
            photo_url: string(FIELD_PHOTO_URL),
            currency_code: if currency.is_empty() {
                DEFAULT_CURRENCY.to_string()
            } else {
                currency
            },
            joined_at: timestamp(FIELD_JOIN_DATE),
            last_login_at: timestamp(FIELD_LAST_LOGIN),
        }
    }

    /// The stored currency, if it is a valid code
    pub fn currency(&self) -> Option<CurrencyCode> {
        CurrencyCode::parse(&self.currency_code).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::tests::session_for;
    use chrono::Duration;

    #[test]
    fn test_currency_code_parsing() {
        assert_eq!(CurrencyCode::parse(" eur ").unwrap().as_str(), "EUR");
        assert_eq!(CurrencyCode::default().as_str(), "USD");
        assert!(CurrencyCode::parse("EURO").is_err());
        assert!(CurrencyCode::parse("E1R").is_err());
        assert!(CurrencyCode::parse("").is_err());
        assert!("ÄÖÜ".parse::<CurrencyCode>().is_err());
    }

    #[test]
    fn test_first_login_profile() {
        let now = Utc::now();
        let profile = UserProfile::first_login(&session_for("acct-1", now), now);

        assert_eq!(profile.currency_code, "USD");
        assert_eq!(profile.joined_at, now);
        assert_eq!(profile.photo_url, "");

        let fields = profile.to_fields();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[FIELD_USER_ID], FieldValue::from("acct-1"));
        assert_eq!(fields[FIELD_NAME], FieldValue::from("Ada Lovelace"));
    }

    #[test]
    fn test_next_login_keeps_currency_and_join_date() {
        let joined = Utc::now() - Duration::days(30);
        let stored = UserProfile {
            currency_code: "EUR".to_string(),
            photo_url: "https://example.com/a.png".to_string(),
            ..UserProfile::first_login(&session_for("acct-1", joined), joined)
        };

        let now = Utc::now();
        let mut session = session_for("acct-1", now);
        session.display_name = Some("Ada King".to_string());
        let next = stored.next_login(&session, now);

        assert_eq!(next.name, "Ada King");
        assert_eq!(next.photo_url, "https://example.com/a.png");
        assert_eq!(next.currency_code, "EUR");
        assert_eq!(next.joined_at, joined);
        assert_eq!(next.last_login_at, now);

        let fields = next.login_fields();
        assert!(!fields.contains_key(FIELD_CURRENCY));
        assert!(!fields.contains_key(FIELD_JOIN_DATE));
    }

    #[test]
    fn test_from_fields_fills_gaps() {
        let now = Utc::now();
        let mut fields = Fields::new();
        fields.insert(FIELD_EMAIL.to_string(), "ada@example.com".into());
        fields.insert(FIELD_JOIN_DATE.to_string(), FieldValue::String("not a timestamp".into()));

        let profile = UserProfile::from_fields("acct-1", &fields, now);
        assert_eq!(profile.email, "ada@example.com");
        assert_eq!(profile.name, "");
        assert_eq!(profile.currency_code, "USD");
        assert_eq!(profile.joined_at, now);
    }
}
