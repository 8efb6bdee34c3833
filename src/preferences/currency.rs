use tokio::sync::watch;
use tracing::{debug, info};

use crate::auth::AuthService;
use crate::error::SpensoResult;
use crate::profile::{CurrencyCode, ProfileSynchronizer};

/// The currency amounts are shown in.
///
/// The selection lives locally and, when someone is signed in, in their profile.
pub struct CurrencyPreferences {
    auth: AuthService,
    profiles: ProfileSynchronizer,
    selected: watch::Sender<CurrencyCode>,
}

impl CurrencyPreferences {
    /// Start with the default currency
    pub fn new(auth: AuthService, profiles: ProfileSynchronizer) -> Self {
        let (selected, _) = watch::channel(CurrencyCode::default());
        Self {
            auth,
            profiles,
            selected,
        }
    }

    /// Adopt the signed-in user's stored currency, if it is valid
    pub async fn load(&self) -> SpensoResult<CurrencyCode> {
        if let Some(session) = self.auth.current_session() {
            let stored = self
                .profiles
                .profile(&session.account_id)
                .await?
                .and_then(|profile| profile.currency());

            match stored {
                Some(code) => {
                    debug!(account_id = %session.account_id, currency = %code, "Loaded stored currency");
                    self.set_local(code);
                }
                None => debug!(account_id = %session.account_id, "No valid stored currency, keeping selection"),
            }
        }

        Ok(self.selected())
    }

    /// Validate and select a currency.
    ///
    /// The local selection changes at once. The remote write happens after,
    /// and its failure is returned without undoing the local change.
    pub async fn select(&self, input: &str) -> SpensoResult<CurrencyCode> {
        let code = CurrencyCode::parse(input)?;
        self.set_local(code.clone());

        if let Some(session) = self.auth.current_session() {
            self.profiles
                .update_currency(&session.account_id, &code)
                .await?;
        }

        Ok(code)
    }

    pub fn selected(&self) -> CurrencyCode {
        self.selected.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CurrencyCode> {
        self.selected.subscribe()
    }

    fn set_local(&self, code: CurrencyCode) {
        let changed = self.selected.send_if_modified(|current| {
            if *current == code {
                false
            } else {
                *current = code.clone();
                true
            }
        });
        if changed {
            info!(currency = %code, "Currency selected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::providers::test::{TestAccount, TestIdentityProvider};
    use crate::auth::{FederatedCredential, MemorySessionCache};
    use crate::config::SessionConfig;
    use crate::error::{errors, ErrorCode, RetryPolicy};
    use crate::profile::{FieldValue, MemoryDocumentStore, FIELD_CURRENCY};
    use std::sync::Arc;

    async fn signed_in() -> (CurrencyPreferences, Arc<MemoryDocumentStore>) {
        let auth = AuthService::new(
            Arc::new(TestIdentityProvider::new(TestAccount::new("acct-1"))),
            Arc::new(MemorySessionCache::new()),
            SessionConfig::default(),
        );
        auth.sign_in(FederatedCredential::GoogleIdToken {
            id_token: "google-token".into(),
        })
        .await
        .unwrap();

        let store = Arc::new(MemoryDocumentStore::new());
        let profiles = ProfileSynchronizer::new(store.clone(), "users", RetryPolicy::no_retry());
        profiles.sync(&auth.current_session().unwrap()).await.unwrap();

        (CurrencyPreferences::new(auth, profiles), store)
    }

    #[tokio::test]
    async fn test_invalid_code_changes_nothing() {
        let (currency, store) = signed_in().await;
        let writes = store.writes();

        let err = currency.select("euro").await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationFailed);
        assert_eq!(currency.selected().as_str(), "USD");
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local_selection() {
        let (currency, store) = signed_in().await;
        store
            .fail_next_write(errors::network_timeout("memory", "merge"))
            .await;

        assert!(currency.select("JPY").await.is_err());
        assert_eq!(currency.selected().as_str(), "JPY");
        assert_eq!(
            store.document("users", "acct-1").unwrap()[FIELD_CURRENCY],
            FieldValue::from("USD")
        );
    }

    #[tokio::test]
    async fn test_load_adopts_stored_currency() {
        let (currency, store) = signed_in().await;
        let mut doc = store.document("users", "acct-1").unwrap();
        doc.insert(FIELD_CURRENCY.into(), "CHF".into());
        store.insert("users", "acct-1", doc);
        currency.profiles.clear_cache();

        assert_eq!(currency.load().await.unwrap().as_str(), "CHF");
    }
}
