//! Session token refresh loop
//!
//! Each live session owns one epoch. An epoch carries a cancellation token and
//! at most one background refresh task. Starting a new session, signing out or
//! shutting down advances the epoch, which cancels the task. Every state write
//! made on behalf of an epoch is checked against the current epoch under the
//! transition lock, so a refresh that finishes late is discarded instead of
//! re-asserting a session that has already ended.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::service::AuthInner;
use crate::auth::session::{AuthState, Session, TransitionCause};
use crate::error::{errors, SpensoError};

/// Bookkeeping for the current session epoch
pub(crate) struct SessionEpoch {
    id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Handle to one epoch, passed to the work done on its behalf
#[derive(Clone)]
pub(crate) struct EpochGuard {
    pub id: u64,
    pub cancel: CancellationToken,
}

impl SessionEpoch {
    pub(crate) fn new() -> Self {
        Self {
            id: 0,
            cancel: CancellationToken::new(),
            task: None,
        }
    }

    /// End the current epoch and start a new one.
    ///
    /// Returns the handle of the task that belonged to the old epoch so the
    /// caller can join it outside the lock.
    pub(crate) fn advance(&mut self) -> (EpochGuard, Option<JoinHandle<()>>) {
        self.cancel.cancel();
        let previous_task = self.task.take();

        self.id += 1;
        self.cancel = CancellationToken::new();

        (self.guard(), previous_task)
    }

    pub(crate) fn guard(&self) -> EpochGuard {
        EpochGuard {
            id: self.id,
            cancel: self.cancel.clone(),
        }
    }

    pub(crate) fn is_current(&self, guard: &EpochGuard) -> bool {
        self.id == guard.id && !guard.cancel.is_cancelled()
    }

    /// Record the refresh task running for this epoch
    pub(crate) fn attach(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.task.replace(task) {
            // Only one refresh chain per epoch
            old.abort();
        }
    }

    /// Cancel without starting a new epoch
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// What a single refresh attempt decided
#[derive(Debug)]
pub(crate) enum RefreshStep {
    /// New tokens are live; refresh again after `delay`
    Refreshed { session: Session, delay: Duration },
    /// Transient failure; the session stays authenticated and is retried after `delay`
    Deferred {
        session: Session,
        delay: Duration,
        error: SpensoError,
    },
    /// The chain is over: the session was rejected, or the epoch ended underneath us
    Ended { error: Option<SpensoError> },
}

impl AuthInner {
    /// Run one refresh of `session` on behalf of `guard`'s epoch and apply the result.
    pub(crate) async fn refresh_step(
        &self,
        guard: &EpochGuard,
        session: &Session,
        transient_failures: &mut u32,
    ) -> RefreshStep {
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        debug!(account_id = %session.account_id, epoch = guard.id, "Refreshing session token");

        let result = tokio::select! {
            _ = guard.cancel.cancelled() => {
                debug!(epoch = guard.id, "Refresh abandoned, session epoch ended");
                return RefreshStep::Ended { error: None };
            }
            result = self.provider.refresh(session) => result,
        };

        let mut control = self.control.lock().await;
        if !control.epoch.is_current(guard) {
            // Sign-out or a new sign-in won the race; drop the result
            debug!(epoch = guard.id, "Discarding refresh result for a finished epoch");
            return RefreshStep::Ended { error: None };
        }

        match result {
            Ok(tokens) => {
                *transient_failures = 0;
                let next = session.refreshed(tokens, Utc::now());

                if let Err(e) = self.cache.store(&next).await {
                    warn!(error = %e, "Failed to cache refreshed session");
                }
                // Restoring a stale cached session lands here before anything is live
                let cause = if self.state_tx.borrow().is_authenticated() {
                    TransitionCause::Refresh
                } else {
                    TransitionCause::Restore
                };
                self.publish(&mut control, cause, AuthState::Authenticated { session: next.clone() });

                let delay = next.time_until_refresh(Utc::now(), self.config.refresh_interval());
                info!(
                    account_id = %next.account_id,
                    next_refresh_secs = delay.as_secs(),
                    "Session token refreshed"
                );
                RefreshStep::Refreshed { session: next, delay }
            }
            Err(e) if e.is_transient() && *transient_failures < self.config.max_network_retries => {
                *transient_failures += 1;
                let delay = self.config.network_retry_delay();
                warn!(
                    account_id = %session.account_id,
                    error = %e,
                    attempt = *transient_failures,
                    retry_in_secs = delay.as_secs(),
                    "Session refresh hit a transient error, keeping session"
                );

                // Restoring a stale session from cache lands here while still Loading
                if !self.state_tx.borrow().is_authenticated() {
                    self.publish(
                        &mut control,
                        TransitionCause::Restore,
                        AuthState::Authenticated {
                            session: session.clone(),
                        },
                    );
                }

                RefreshStep::Deferred {
                    session: session.clone(),
                    delay,
                    error: e,
                }
            }
            Err(e) => {
                let error = if e.is_transient() {
                    error!(
                        account_id = %session.account_id,
                        failures = *transient_failures,
                        "Session could not be refreshed for too long, signing out"
                    );
                    SpensoError::from(errors::auth_refresh_failed(format!(
                        "gave up after {} transient failures: {}",
                        *transient_failures, e
                    )))
                } else {
                    error!(account_id = %session.account_id, error = %e, "Session refresh rejected, signing out");
                    e
                };

                // End the epoch so nothing else acts on this session
                let (_, _own_task) = control.epoch.advance();
                if let Err(e) = self.cache.clear().await {
                    warn!(error = %e, "Failed to clear cached session");
                }
                self.publish(&mut control, TransitionCause::Expired, AuthState::Unauthenticated);

                RefreshStep::Ended { error: Some(error) }
            }
        }
    }
}

/// Spawn the refresh loop for `guard`'s epoch.
///
/// The task holds only a weak reference to the holder, so dropping the last
/// `AuthService` ends it as well.
pub(crate) fn spawn_refresh_loop(
    inner: &Arc<AuthInner>,
    guard: EpochGuard,
    session: Session,
    delay: Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(refresh_loop(weak, guard, session, delay))
}

async fn refresh_loop(inner: Weak<AuthInner>, guard: EpochGuard, mut session: Session, mut delay: Duration) {
    let mut transient_failures = 0u32;

    loop {
        debug!(epoch = guard.id, delay_secs = delay.as_secs(), "Next session refresh scheduled");

        tokio::select! {
            _ = guard.cancel.cancelled() => {
                debug!(epoch = guard.id, "Refresh loop cancelled");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = inner.upgrade() else {
            return;
        };

        match inner.refresh_step(&guard, &session, &mut transient_failures).await {
            RefreshStep::Refreshed { session: next, delay: next_delay }
            | RefreshStep::Deferred {
                session: next,
                delay: next_delay,
                ..
            } => {
                session = next;
                delay = next_delay;
            }
            RefreshStep::Ended { .. } => return,
        }
    }
}
