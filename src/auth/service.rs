use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::Stream;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::providers::{FederatedCredential, IdentityProvider};
use crate::auth::refresh::{spawn_refresh_loop, RefreshStep, SessionEpoch};
use crate::auth::session::{AuthState, AuthTransition, Session, TransitionCause};
use crate::auth::storage::SessionCache;
use crate::auth::AccessTokenSource;
use crate::config::SessionConfig;
use crate::error::{errors, SpensoError, SpensoResult};
use crate::events::{EventStream, Subscriber, AUTH_EVENT_CAPACITY};

/// State guarded by the transition lock
pub(crate) struct Control {
    /// Sequence number of the last published transition
    sequence: u64,
    pub(crate) epoch: SessionEpoch,
}

/// Shared internals of the session holder
pub(crate) struct AuthInner {
    pub(crate) provider: Arc<dyn IdentityProvider>,
    pub(crate) cache: Arc<dyn SessionCache>,
    pub(crate) config: SessionConfig,
    /// Latest state, for snapshot readers and watch observers
    pub(crate) state_tx: watch::Sender<AuthState>,
    /// Ordered transition stream
    events: EventStream<AuthTransition>,
    /// Serialises every transition
    pub(crate) control: Mutex<Control>,
    /// Provider refresh calls made so far
    pub(crate) refresh_count: AtomicUsize,
}

impl AuthInner {
    /// Publish a new state. Callers must hold the transition lock.
    pub(crate) fn publish(&self, control: &mut Control, cause: TransitionCause, next: AuthState) {
        let previous = self.state_tx.send_replace(next.clone());
        control.sequence += 1;

        info!(
            sequence = control.sequence,
            ?cause,
            from = previous.label(),
            to = next.label(),
            account_id = next.account_id().unwrap_or("-"),
            "Auth state changed"
        );

        let transition = AuthTransition {
            sequence: control.sequence,
            cause,
            previous,
            current: next,
            at: Utc::now(),
        };
        let receivers = self.events.publish(transition);
        debug!(receivers, "Auth transition delivered");
    }
}

impl Drop for AuthInner {
    fn drop(&mut self) {
        // Wake the refresh task so it notices the holder is gone
        self.control.get_mut().epoch.cancel();
    }
}

/// Session state holder.
///
/// Owns the current `AuthState`, the session cache and the refresh loop. Cloning
/// is cheap and every clone observes the same session.
#[derive(Clone)]
pub struct AuthService {
    inner: Arc<AuthInner>,
}

impl AuthService {
    /// Create a new holder in `Loading`
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        cache: Arc<dyn SessionCache>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(AuthState::Loading);

        Self {
            inner: Arc::new(AuthInner {
                provider,
                cache,
                config,
                state_tx,
                events: EventStream::new(AUTH_EVENT_CAPACITY),
                control: Mutex::new(Control {
                    sequence: 0,
                    epoch: SessionEpoch::new(),
                }),
                refresh_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Restore the cached session, if any.
    ///
    /// A session younger than the refresh interval is adopted as is. An older
    /// one is refreshed before this returns. Failures land in the state.
    pub async fn initialize(&self) -> SpensoResult<()> {
        info!(provider = self.inner.provider.name(), "Initializing auth service");

        let cached = match self.inner.cache.load().await {
            Ok(cached) => cached,
            Err(e) => {
                error!(error = %e, "Failed to restore cached session");
                let message = format!("Failed to restore session: {}", e.message);
                self.end_epoch_with(TransitionCause::Restore, AuthState::Error { message })
                    .await;
                return Ok(());
            }
        };

        let Some(session) = cached else {
            debug!("No cached session, user must sign in");
            self.end_epoch_with(TransitionCause::Restore, AuthState::Unauthenticated).await;
            return Ok(());
        };

        let interval = self.inner.config.refresh_interval();
        if session.needs_refresh(Utc::now(), interval) {
            info!(account_id = %session.account_id, "Cached session is stale, refreshing");
            // The outcome has already been applied to the state
            let _ = self.refresh_and_reschedule(session).await;
        } else {
            info!(account_id = %session.account_id, "Restored cached session");
            let mut control = self.inner.control.lock().await;
            let (guard, _) = control.epoch.advance();
            let delay = session.time_until_refresh(Utc::now(), interval);
            self.inner.publish(
                &mut control,
                TransitionCause::Restore,
                AuthState::Authenticated {
                    session: session.clone(),
                },
            );
            let task = spawn_refresh_loop(&self.inner, guard, session, delay);
            control.epoch.attach(task);
        }

        Ok(())
    }

    /// End whatever session epoch is running and publish `next`
    async fn end_epoch_with(&self, cause: TransitionCause, next: AuthState) {
        let old_task = {
            let mut control = self.inner.control.lock().await;
            let (_, old_task) = control.epoch.advance();
            self.inner.publish(&mut control, cause, next);
            old_task
        };

        if let Some(task) = old_task {
            task.abort();
        }
    }

    /// Exchange a federated credential for a session.
    ///
    /// Publishes `Loading` first, then `Authenticated` or `Error`.
    pub async fn sign_in(&self, credential: FederatedCredential) -> SpensoResult<Session> {
        let guard = {
            let mut control = self.inner.control.lock().await;
            // Any previous session ends here
            let (guard, _) = control.epoch.advance();
            self.inner.publish(&mut control, TransitionCause::SignIn, AuthState::Loading);
            guard
        };

        info!(
            provider = self.inner.provider.name(),
            provider_id = credential.provider_id(),
            "Signing in"
        );

        let result = self.inner.provider.sign_in(&credential).await;

        let mut control = self.inner.control.lock().await;
        if !control.epoch.is_current(&guard) {
            warn!("Sign-in finished after the attempt was superseded, discarding it");
            return Err(errors::sign_in_failed(
                self.inner.provider.name(),
                "sign-in was superseded by another session change",
            )
            .into());
        }

        match result {
            Ok(session) => {
                if let Err(e) = self.inner.cache.store(&session).await {
                    warn!(error = %e, "Failed to cache session, it will not survive a restart");
                }

                self.inner.publish(
                    &mut control,
                    TransitionCause::SignIn,
                    AuthState::Authenticated {
                        session: session.clone(),
                    },
                );

                let delay = session.time_until_refresh(Utc::now(), self.inner.config.refresh_interval());
                let task = spawn_refresh_loop(&self.inner, guard, session.clone(), delay);
                control.epoch.attach(task);

                Ok(session)
            }
            Err(e) => {
                error!(error = %e, "Sign-in failed");
                self.inner.publish(
                    &mut control,
                    TransitionCause::SignIn,
                    AuthState::Error {
                        message: e.message.clone(),
                    },
                );
                Err(e)
            }
        }
    }

    /// End the current session.
    ///
    /// The state becomes `Unauthenticated` at once, whatever is in flight.
    /// Clearing the cache and notifying the provider are best-effort.
    pub async fn sign_out(&self) -> SpensoResult<()> {
        let (previous, old_task) = {
            let mut control = self.inner.control.lock().await;
            let (_, old_task) = control.epoch.advance();

            let previous = self.inner.state_tx.borrow().session().cloned();
            if *self.inner.state_tx.borrow() != AuthState::Unauthenticated {
                self.inner.publish(&mut control, TransitionCause::SignOut, AuthState::Unauthenticated);
            }

            if let Err(e) = self.inner.cache.clear().await {
                warn!(error = %e, "Failed to clear cached session");
            }

            (previous, old_task)
        };

        if let Some(task) = old_task {
            // Already cancelled; just make sure it is gone
            task.abort();
        }

        if let Some(session) = previous {
            info!(account_id = %session.account_id, "Signed out");
            if let Err(e) = self.inner.provider.sign_out(&session).await {
                warn!(error = %e, "Provider sign-out failed");
            }
        }

        Ok(())
    }

    /// Refresh the current session right away.
    ///
    /// The refresh loop restarts from the new token's issue time.
    pub async fn refresh_now(&self) -> SpensoResult<Session> {
        let session = self
            .current_session()
            .ok_or_else(|| SpensoError::from(errors::not_signed_in()))?;

        match self.refresh_and_reschedule(session).await {
            RefreshStep::Refreshed { session, .. } => Ok(session),
            RefreshStep::Deferred { error, .. } => Err(error),
            RefreshStep::Ended { error } => Err(error.unwrap_or_else(|| errors::not_signed_in().into())),
        }
    }

    /// Start a new epoch, refresh inline, and keep the loop going if the session survived
    async fn refresh_and_reschedule(&self, session: Session) -> RefreshStep {
        let guard = {
            let mut control = self.inner.control.lock().await;
            let (guard, _) = control.epoch.advance();
            guard
        };

        let mut transient_failures = 0;
        let step = self
            .inner
            .refresh_step(&guard, &session, &mut transient_failures)
            .await;

        let next = match &step {
            RefreshStep::Refreshed { session, delay } | RefreshStep::Deferred { session, delay, .. } => {
                Some((session.clone(), *delay))
            }
            RefreshStep::Ended { .. } => None,
        };

        if let Some((session, delay)) = next {
            let mut control = self.inner.control.lock().await;
            if control.epoch.is_current(&guard) {
                let task = spawn_refresh_loop(&self.inner, guard, session, delay);
                control.epoch.attach(task);
            }
        }

        step
    }

    /// Cancel the refresh loop and end the session epoch.
    ///
    /// The state is left as it is; the cached session is kept for the next start.
    pub async fn shutdown(&self) {
        let old_task = {
            let mut control = self.inner.control.lock().await;
            let (_, old_task) = control.epoch.advance();
            old_task
        };

        if let Some(task) = old_task {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Refresh task ended abnormally");
                }
            }
        }

        info!("Auth service shut down");
    }

    /// Snapshot of the current state
    pub fn state(&self) -> AuthState {
        self.inner.state_tx.borrow().clone()
    }

    /// The live session, if authenticated
    pub fn current_session(&self) -> Option<Session> {
        self.inner.state_tx.borrow().session().cloned()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state_tx.borrow().is_authenticated()
    }

    /// Latest-value observer of the state
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.inner.state_tx.subscribe()
    }

    /// Observe every later transition, in order
    pub fn subscribe(&self) -> AuthSubscription {
        let subscription = AuthSubscription {
            id: Uuid::new_v4(),
            subscriber: self.inner.events.subscribe(),
        };
        debug!(subscription_id = %subscription.id, "Auth subscription opened");
        subscription
    }

    /// Number of provider refresh calls made so far
    pub fn refresh_count(&self) -> usize {
        self.inner.refresh_count.load(Ordering::SeqCst)
    }

    /// Id token of the live session, if any
    pub fn access_token(&self) -> Option<String> {
        self.inner
            .state_tx
            .borrow()
            .session()
            .map(|s| s.tokens.id_token.clone())
    }
}

#[async_trait]
impl AccessTokenSource for AuthService {
    async fn access_token(&self) -> Option<String> {
        AuthService::access_token(self)
    }
}

/// Handle on the auth transition stream.
///
/// Dropping the handle ends the subscription.
pub struct AuthSubscription {
    id: Uuid,
    subscriber: Subscriber<AuthTransition>,
}

impl AuthSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next transition, or `None` once the holder is gone
    pub async fn recv(&mut self) -> Option<AuthTransition> {
        loop {
            match self.subscriber.recv().await {
                Ok(transition) => return Some(transition),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        subscription_id = %self.id,
                        skipped,
                        "Auth subscriber fell behind, skipping transitions"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Stop observing
    pub fn cancel(self) {
        debug!(subscription_id = %self.id, "Auth subscription cancelled");
    }

    /// Turn the subscription into a stream of transitions
    pub fn into_stream(mut self) -> impl Stream<Item = AuthTransition> + Send {
        async_stream::stream! {
            while let Some(transition) = self.recv().await {
                yield transition;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::providers::test::{TestAccount, TestIdentityProvider};
    use crate::auth::session::tests::session_for;
    use crate::auth::storage::MemorySessionCache;
    use std::time::Duration;

    fn google(token: &str) -> FederatedCredential {
        FederatedCredential::GoogleIdToken {
            id_token: token.to_string(),
        }
    }

    fn service_with(cache: MemorySessionCache) -> (AuthService, Arc<TestIdentityProvider>, Arc<MemorySessionCache>) {
        let provider = Arc::new(TestIdentityProvider::new(TestAccount::new("acct-1").with_name("Ada")));
        let cache = Arc::new(cache);
        let service = AuthService::new(provider.clone(), cache.clone(), SessionConfig::default());
        (service, provider, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_in_publishes_loading_then_authenticated() {
        let (service, _provider, cache) = service_with(MemorySessionCache::new());
        let mut subscription = service.subscribe();

        let session = service.sign_in(google("google-token")).await.unwrap();
        assert_eq!(session.account_id, "acct-1");

        let first = subscription.recv().await.unwrap();
        assert_eq!(first.current, AuthState::Loading);
        let second = subscription.recv().await.unwrap();
        assert!(second.current.is_authenticated());
        assert!(second.sequence > first.sequence);

        assert_eq!(cache.load().await.unwrap(), Some(session));
        assert!(service.access_token().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sign_in_reports_error() {
        let (service, provider, cache) = service_with(MemorySessionCache::new());
        provider
            .fail_next_sign_in(errors::sign_in_failed("test", "user cancelled"))
            .await;

        let err = service.sign_in(google("google-token")).await.unwrap_err();
        assert!(err.is_authentication());
        assert!(matches!(service.state(), AuthState::Error { .. }));
        assert!(cache.load().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_without_cache_is_unauthenticated() {
        let (service, provider, _cache) = service_with(MemorySessionCache::new());
        service.initialize().await.unwrap();

        assert_eq!(service.state(), AuthState::Unauthenticated);
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_refreshes_stale_session() {
        let stale = session_for("acct-1", Utc::now() - chrono::Duration::hours(3));
        let (service, provider, cache) = service_with(MemorySessionCache::with_session(stale));

        service.initialize().await.unwrap();

        assert_eq!(provider.refresh_calls(), 1);
        let session = service.current_session().unwrap();
        assert_eq!(session.tokens.id_token, "id-acct-1-1");
        assert_eq!(cache.load().await.unwrap(), Some(session));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_restarts_the_loop() {
        let (service, provider, _cache) = service_with(MemorySessionCache::new());
        service.sign_in(google("google-token")).await.unwrap();

        tokio::time::advance(Duration::from_secs(30 * 60)).await;
        let refreshed = service.refresh_now().await.unwrap();
        assert_eq!(refreshed.tokens.id_token, "id-acct-1-1");

        // The old boundary at 60 minutes no longer fires
        tokio::time::sleep(Duration::from_secs(45 * 60)).await;
        assert_eq!(provider.refresh_calls(), 1);

        tokio::time::sleep(Duration::from_secs(20 * 60)).await;
        assert_eq!(provider.refresh_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_now_requires_a_session() {
        let (service, _provider, _cache) = service_with(MemorySessionCache::new());
        let err = service.refresh_now().await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::AuthNotSignedIn);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_clears_cache_and_notifies_provider() {
        let (service, provider, cache) = service_with(MemorySessionCache::new());
        service.sign_in(google("google-token")).await.unwrap();

        service.sign_out().await.unwrap();
        assert_eq!(service.state(), AuthState::Unauthenticated);
        assert!(cache.load().await.unwrap().is_none());
        assert_eq!(provider.sign_out_calls(), 1);

        // Signing out twice publishes nothing new
        let watcher = service.watch();
        service.sign_out().await.unwrap();
        assert!(!watcher.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_service_stops_refreshing() {
        let (service, provider, _cache) = service_with(MemorySessionCache::new());
        service.sign_in(google("google-token")).await.unwrap();
        drop(service);

        tokio::time::sleep(Duration::from_secs(3 * 3600)).await;
        assert_eq!(provider.refresh_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_as_stream() {
        use futures_util::StreamExt;

        let (service, _provider, _cache) = service_with(MemorySessionCache::new());
        let stream = service.subscribe().into_stream();
        futures_util::pin_mut!(stream);

        service.sign_in(google("google-token")).await.unwrap();
        service.sign_out().await.unwrap();

        let labels: Vec<_> = stream
            .take(3)
            .map(|t| t.current.label())
            .collect()
            .await;
        assert_eq!(labels, vec!["loading", "authenticated", "unauthenticated"]);
    }
}
