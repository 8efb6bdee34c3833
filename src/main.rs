use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use spenso::{AppState, AuthState, ConfigManager, ProfileEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if it exists
    let env_file_path = dotenvy::dotenv().ok();

    // Initialize the tracing subscriber for structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "spenso=debug,warn".into()
            } else {
                "spenso=info,warn".into()
            }
        }))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    info!(version = spenso::VERSION, "Spenso starting");

    match env_file_path {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => debug!("No .env file found. Using existing environment variables."),
    };

    let manager = ConfigManager::from_env()
        .await
        .context("Failed to load configuration")?;
    info!(path = %manager.path().display(), "Configuration loaded");

    let config = manager.get_config().await;
    config
        .require_remote()
        .context("Identity and store settings are required")?;

    let state = AppState::from_config(config)
        .await
        .context("Failed to build application state")?;

    // Subscribe before initializing so the restore is logged as well
    let mut transitions = state.auth.subscribe();
    let mut profile_events = state.profiles.subscribe();

    state
        .initialize()
        .await
        .context("Failed to initialize application")?;
    info!(
        theme = %state.theme.mode(),
        currency = %state.currency.selected(),
        "Spenso running, press Ctrl-C to stop"
    );

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            transition = transitions.recv() => {
                let Some(transition) = transition else { break };
                match &transition.current {
                    AuthState::Authenticated { session } => info!(
                        sequence = transition.sequence,
                        account_id = %session.account_id,
                        "Session active"
                    ),
                    AuthState::Error { message } => warn!(
                        sequence = transition.sequence,
                        message = %message,
                        "Authentication problem"
                    ),
                    other => info!(sequence = transition.sequence, state = other.label(), "Auth state"),
                }
            }
            event = profile_events.recv() => match event {
                Ok(ProfileEvent::Synced { profile }) => {
                    info!(account_id = %profile.account_id, currency = %profile.currency_code, "Profile synced")
                }
                Ok(ProfileEvent::SyncFailed { account_id, message, attempts }) => {
                    warn!(account_id = %account_id, attempts, "Profile sync failed: {}", message)
                }
                Ok(ProfileEvent::CurrencyUpdated { account_id, currency }) => {
                    info!(account_id = %account_id, currency = %currency, "Currency updated")
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "Profile log lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    state.shutdown().await;
    info!("Spenso stopped");
    Ok(())
}
