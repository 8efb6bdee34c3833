use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod auth;
pub mod common;
pub mod config;
pub mod error;
pub mod events;
pub mod preferences;
pub mod profile;

// Re-export core components
pub use crate::auth::{
    AccessTokenSource, AuthService, AuthState, AuthSubscription, AuthTransition, FederatedCredential,
    IdentityProvider, Session, TransitionCause,
};
pub use crate::config::{Config, ConfigManager};
pub use crate::error::{ErrorCategory, ErrorCode, SpensoError, SpensoResult};
pub use crate::preferences::{CurrencyCode, CurrencyPreferences, SettingsStore, ThemeMode, ThemePreferences};
pub use crate::profile::{DocumentStore, ProfileEvent, ProfileState, ProfileSynchronizer, UserProfile};

use crate::auth::{FileSessionCache, FirebaseAuthProvider};
use crate::profile::{FirestoreDocumentStore, SyncHandle};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main application state
pub struct AppState {
    pub config: Config,
    /// Session state holder
    pub auth: AuthService,
    /// Profile document synchronizer
    pub profiles: ProfileSynchronizer,
    pub currency: Arc<CurrencyPreferences>,
    pub theme: Arc<ThemePreferences>,
    /// Background listeners, set by `initialize`
    listeners: Mutex<Option<Listeners>>,
}

struct Listeners {
    profile_sync: SyncHandle,
    currency_cancel: CancellationToken,
    currency_task: JoinHandle<()>,
}

impl AppState {
    /// Assemble the app around the given session holder and document store
    pub async fn new(config: Config, auth: AuthService, store: Arc<dyn DocumentStore>) -> SpensoResult<Self> {
        let profiles = ProfileSynchronizer::new(
            store,
            config.store.users_collection.clone(),
            config.session.profile_write_policy(),
        );
        let settings = Arc::new(SettingsStore::open(&config.data_dir).await?);
        let theme = Arc::new(ThemePreferences::load(settings).await);
        let currency = Arc::new(CurrencyPreferences::new(auth.clone(), profiles.clone()));

        Ok(Self {
            config,
            auth,
            profiles,
            currency,
            theme,
            listeners: Mutex::new(None),
        })
    }

    /// Build the app against Firebase Auth and Firestore
    pub async fn from_config(config: Config) -> SpensoResult<Self> {
        config.validate()?;

        let provider = Arc::new(FirebaseAuthProvider::new(&config.identity)?);
        let cache = Arc::new(FileSessionCache::new(&config.data_dir));
        let auth = AuthService::new(provider, cache, config.session.clone());

        let store = FirestoreDocumentStore::new(
            &config.store,
            Duration::from_secs(config.identity.timeout_seconds),
        )?
        .with_api_key(config.identity.api_key.clone())
        .with_token_source(Arc::new(auth.clone()));

        Self::new(config, auth, Arc::new(store)).await
    }

    /// Start listeners, restore the session and load the currency
    pub async fn initialize(&self) -> SpensoResult<()> {
        info!(version = VERSION, "Initializing application");

        let mut listeners = self.listeners.lock().await;
        if listeners.is_none() {
            // Listeners go first so a restored session is synced too
            let profile_sync = self.profiles.attach(&self.auth);
            let (currency_cancel, currency_task) = self.follow_synced_currency();
            *listeners = Some(Listeners {
                profile_sync,
                currency_cancel,
                currency_task,
            });
        }
        drop(listeners);

        self.auth.initialize().await?;

        if let Err(e) = self.currency.load().await {
            warn!(error = %e, "Could not load the stored currency, keeping the default");
        }

        Ok(())
    }

    /// Adopt the stored currency whenever the signed-in user's profile is synced
    fn follow_synced_currency(&self) -> (CancellationToken, JoinHandle<()>) {
        let mut events = self.profiles.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let currency = Arc::clone(&self.currency);
        let auth = self.auth.clone();

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(ProfileEvent::Synced { profile }) => {
                        let is_current = auth
                            .current_session()
                            .is_some_and(|s| s.account_id == profile.account_id);
                        if is_current {
                            if let Err(e) = currency.load().await {
                                warn!(error = %e, "Failed to adopt stored currency");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Currency follower lagged behind profile events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        (cancel, task)
    }

    /// Stop background work. The cached session is kept for the next start.
    pub async fn shutdown(&self) {
        info!("Shutting down application");

        if let Some(listeners) = self.listeners.lock().await.take() {
            listeners.profile_sync.shutdown().await;
            listeners.currency_cancel.cancel();
            if let Err(e) = listeners.currency_task.await {
                warn!(error = %e, "Currency follower ended abnormally");
            }
        }

        self.auth.shutdown().await;
    }
}
