//! Profile synchronizer
//!
//! Makes sure every account that signs in has a profile document, and keeps
//! its login fields current. Sync failures are reported as events and never
//! change the auth state. The profile of the signed-in account is also kept
//! as an observable `ProfileState`.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthService, AuthState, Session};
use crate::common::with_retry;
use crate::error::{errors, RetryPolicy, SpensoResult};
use crate::events::{EventStream, Subscriber, PROFILE_EVENT_CAPACITY};
use crate::profile::store::DocumentStore;
use crate::profile::{CurrencyCode, Fields, UserProfile, FIELD_CURRENCY, FIELD_JOIN_DATE, FIELD_USER_ID};

/// Outcome notifications from the synchronizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProfileEvent {
    /// The profile document is up to date
    Synced { profile: UserProfile },
    /// Every attempt failed. Meant to be shown as a transient notice.
    SyncFailed {
        account_id: String,
        message: String,
        attempts: usize,
    },
    /// The stored currency was changed
    CurrencyUpdated { account_id: String, currency: CurrencyCode },
}

/// Profile of the signed-in account, as last seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProfileState {
    /// Nobody is signed in
    NotAuthenticated,
    /// The profile of `account_id` is being synced or reloaded
    Loading { account_id: String },
    /// The profile is up to date
    Ready { profile: UserProfile },
    /// The last sync or update of `account_id` failed
    Error { account_id: String, message: String },
}

impl ProfileState {
    /// Account this state belongs to, if any
    pub fn account_id(&self) -> Option<&str> {
        match self {
            ProfileState::NotAuthenticated => None,
            ProfileState::Loading { account_id } | ProfileState::Error { account_id, .. } => Some(account_id),
            ProfileState::Ready { profile } => Some(&profile.account_id),
        }
    }

    /// The profile, when ready
    pub fn profile(&self) -> Option<&UserProfile> {
        match self {
            ProfileState::Ready { profile } => Some(profile),
            _ => None,
        }
    }
}

struct SyncInner {
    store: Arc<dyn DocumentStore>,
    collection: String,
    policy: RetryPolicy,
    /// Last known profile per account
    profiles: DashMap<String, UserProfile>,
    events: EventStream<ProfileEvent>,
    state_tx: watch::Sender<ProfileState>,
}

/// Keeps profile documents in step with sign-ins
#[derive(Clone)]
pub struct ProfileSynchronizer {
    inner: Arc<SyncInner>,
}

impl ProfileSynchronizer {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>, policy: RetryPolicy) -> Self {
        let (state_tx, _) = watch::channel(ProfileState::NotAuthenticated);
        Self {
            inner: Arc::new(SyncInner {
                store,
                collection: collection.into(),
                policy,
                profiles: DashMap::new(),
                events: EventStream::new(PROFILE_EVENT_CAPACITY),
                state_tx,
            }),
        }
    }

    /// Create or update the profile of the account behind `session`.
    ///
    /// A new account gets a full profile. An existing one only gets its
    /// display fields and last login rewritten.
    pub async fn sync(&self, session: &Session) -> SpensoResult<UserProfile> {
        let account_id = session.account_id.clone();
        self.inner.state_tx.send_replace(ProfileState::Loading {
            account_id: account_id.clone(),
        });

        let inner = Arc::clone(&self.inner);
        let owned_session = session.clone();

        let result = with_retry(
            move |attempt| {
                let inner = Arc::clone(&inner);
                let session = owned_session.clone();
                Box::pin(async move { inner.sync_once(&session, attempt).await })
            },
            self.inner.policy,
            "Profile sync",
        )
        .await;

        match result {
            Ok(profile) => {
                info!(account_id = %account_id, "Profile synced");
                self.inner.profiles.insert(account_id, profile.clone());
                self.inner.settle(ProfileState::Ready {
                    profile: profile.clone(),
                });
                self.inner.events.publish(ProfileEvent::Synced {
                    profile: profile.clone(),
                });
                Ok(profile)
            }
            Err(e) => {
                error!(account_id = %account_id, error = %e, "Profile sync gave up");
                self.inner.settle(ProfileState::Error {
                    account_id: account_id.clone(),
                    message: format!("Failed to load profile: {}", e.message),
                });
                self.inner.events.publish(ProfileEvent::SyncFailed {
                    account_id,
                    message: e.message.clone(),
                    attempts: self.inner.policy.max_attempts,
                });
                Err(e)
            }
        }
    }

    /// Profile of `account_id`, served from cache when possible
    pub async fn profile(&self, account_id: &str) -> SpensoResult<Option<UserProfile>> {
        if let Some(profile) = self.cached(account_id) {
            return Ok(Some(profile));
        }

        let Some(fields) = self
            .inner
            .store
            .get(&self.inner.collection, account_id)
            .await?
        else {
            return Ok(None);
        };

        let profile = UserProfile::from_fields(account_id, &fields, Utc::now());
        self.inner
            .profiles
            .insert(account_id.to_string(), profile.clone());
        self.inner.settle(ProfileState::Ready {
            profile: profile.clone(),
        });
        Ok(Some(profile))
    }

    /// Write `updates` into the profile of `account_id`, then reload it from
    /// the store.
    ///
    /// `userId` and `joinDate` cannot be changed. A currency must be a valid code.
    pub async fn update_profile(&self, account_id: &str, mut updates: Fields) -> SpensoResult<UserProfile> {
        if let Some(field) = [FIELD_USER_ID, FIELD_JOIN_DATE]
            .into_iter()
            .find(|f| updates.contains_key(*f))
        {
            return Err(errors::read_only_field(field).into());
        }
        if let Some(value) = updates.get(FIELD_CURRENCY) {
            let code = CurrencyCode::parse(value.as_str().unwrap_or_default())?;
            updates.insert(FIELD_CURRENCY.to_string(), code.as_str().into());
        }

        let result = self.merge_and_reload(account_id, &updates).await;
        match &result {
            Ok(profile) => {
                info!(account_id, fields = updates.len(), "Profile updated");
                self.inner.settle(ProfileState::Ready {
                    profile: profile.clone(),
                });
            }
            Err(e) => {
                warn!(account_id, error = %e, "Profile update failed");
                self.inner.settle(ProfileState::Error {
                    account_id: account_id.to_string(),
                    message: format!("Failed to update profile: {}", e.message),
                });
            }
        }
        result
    }

    async fn merge_and_reload(&self, account_id: &str, updates: &Fields) -> SpensoResult<UserProfile> {
        let store = &self.inner.store;
        store.merge(&self.inner.collection, account_id, updates).await?;

        let fields = store
            .get(&self.inner.collection, account_id)
            .await?
            .unwrap_or_else(|| updates.clone());
        let profile = UserProfile::from_fields(account_id, &fields, Utc::now());
        self.inner
            .profiles
            .insert(account_id.to_string(), profile.clone());
        Ok(profile)
    }

    /// Cached profile, without touching the store
    pub fn cached(&self, account_id: &str) -> Option<UserProfile> {
        self.inner.profiles.get(account_id).map(|p| p.value().clone())
    }

    /// Store a new currency for `account_id`
    pub async fn update_currency(&self, account_id: &str, currency: &CurrencyCode) -> SpensoResult<()> {
        let mut fields = Fields::new();
        fields.insert(FIELD_CURRENCY.to_string(), currency.as_str().into());

        self.inner
            .store
            .merge(&self.inner.collection, account_id, &fields)
            .await?;

        if let Some(mut profile) = self.inner.profiles.get_mut(account_id) {
            profile.currency_code = currency.to_string();
        }
        self.inner.state_tx.send_if_modified(|state| match state {
            ProfileState::Ready { profile } if profile.account_id == account_id => {
                profile.currency_code = currency.to_string();
                true
            }
            _ => false,
        });
        debug!(account_id, currency = %currency, "Stored currency updated");

        self.inner
            .events
            .publish(ProfileEvent::CurrencyUpdated {
                account_id: account_id.to_string(),
                currency: currency.clone(),
            });
        Ok(())
    }

    /// Forget every cached profile
    pub fn clear_cache(&self) {
        self.inner.profiles.clear();
    }

    /// Snapshot of the signed-in account's profile state
    pub fn state(&self) -> ProfileState {
        self.inner.state_tx.borrow().clone()
    }

    /// Latest-value observer of the profile state
    pub fn watch(&self) -> watch::Receiver<ProfileState> {
        self.inner.state_tx.subscribe()
    }

    /// Observe sync outcomes
    pub fn subscribe(&self) -> Subscriber<ProfileEvent> {
        self.inner.events.subscribe()
    }

    /// Sync on every sign-in of `auth` until the returned handle is cancelled
    pub fn attach(&self, auth: &AuthService) -> SyncHandle {
        let mut subscription = auth.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let synchronizer = self.clone();

        let task = tokio::spawn(async move {
            loop {
                let transition = tokio::select! {
                    _ = token.cancelled() => break,
                    next = subscription.recv() => match next {
                        Some(transition) => transition,
                        None => break,
                    },
                };

                if transition.is_sign_in() {
                    if let Some(session) = transition.current.session() {
                        // Failures are already reported as events
                        let _ = synchronizer.sync(session).await;
                    }
                } else if transition.current == AuthState::Unauthenticated {
                    synchronizer.clear_cache();
                    synchronizer.inner.state_tx.send_replace(ProfileState::NotAuthenticated);
                }
            }
            debug!("Profile listener stopped");
        });

        SyncHandle {
            cancel,
            task: Some(task),
        }
    }
}

impl SyncInner {
    /// Publish `next` unless the state has moved on to another account, or to
    /// nobody, in the meantime
    fn settle(&self, next: ProfileState) {
        let account_id = next.account_id().map(str::to_string);
        let applied = self.state_tx.send_if_modified(|state| {
            if state.account_id().is_some() && state.account_id() == account_id.as_deref() {
                *state = next;
                true
            } else {
                false
            }
        });
        if !applied {
            debug!(account_id = ?account_id, "Dropping profile state for an account that is no longer active");
        }
    }

    async fn sync_once(&self, session: &Session, attempt: usize) -> SpensoResult<UserProfile> {
        let account_id = session.account_id.as_str();
        debug!(account_id, attempt, "Syncing profile");

        let existing = self.store.get(&self.collection, account_id).await?;
        let now = Utc::now();

        let (profile, fields) = match existing {
            None => {
                info!(account_id, "Creating profile for new account");
                let profile = UserProfile::first_login(session, now);
                let fields = profile.to_fields();
                (profile, fields)
            }
            Some(stored) => {
                let profile = UserProfile::from_fields(account_id, &stored, now).next_login(session, now);
                let fields = profile.login_fields();
                (profile, fields)
            }
        };

        if let Err(e) = self.store.merge(&self.collection, account_id, &fields).await {
            warn!(account_id, attempt, error = %e, "Profile write failed");
            return Err(e);
        }
        Ok(profile)
    }
}

/// Handle on a running profile listener
pub struct SyncHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    /// Stop listening
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop listening and wait for an in-flight sync to finish
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Profile listener ended abnormally");
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
