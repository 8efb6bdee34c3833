use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::error::SpensoResult;
use crate::preferences::settings::SettingsStore;

/// Settings key holding the theme mode
pub const THEME_MODE_KEY: &str = "theme_mode";

/// Appearance of the app
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThemeMode {
    /// Follow the operating system
    #[default]
    System,
    Light,
    Dark,
}

impl ThemeMode {
    /// Name the mode is stored under
    pub fn as_str(&self) -> &'static str {
        match self {
            ThemeMode::System => "SYSTEM",
            ThemeMode::Light => "LIGHT",
            ThemeMode::Dark => "DARK",
        }
    }

    /// Decode a stored name; anything unrecognised means `System`
    pub fn from_stored(value: Option<&str>) -> Self {
        match value {
            Some("LIGHT") => ThemeMode::Light,
            Some("DARK") => ThemeMode::Dark,
            _ => ThemeMode::System,
        }
    }
}

impl fmt::Display for ThemeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device-local theme preference
pub struct ThemePreferences {
    settings: Arc<SettingsStore>,
    mode: watch::Sender<ThemeMode>,
}

impl ThemePreferences {
    /// Read the stored mode
    pub async fn load(settings: Arc<SettingsStore>) -> Self {
        let stored = settings.get(THEME_MODE_KEY).await;
        let mode = ThemeMode::from_stored(stored.as_deref());
        let (tx, _) = watch::channel(mode);

        Self { settings, mode: tx }
    }

    /// Persist a new mode, then tell observers
    pub async fn set_mode(&self, mode: ThemeMode) -> SpensoResult<()> {
        self.settings.set(THEME_MODE_KEY, mode.as_str()).await?;

        let changed = self.mode.send_if_modified(|current| {
            if *current == mode {
                false
            } else {
                *current = mode;
                true
            }
        });
        if changed {
            info!(mode = %mode, "Theme mode changed");
        }
        Ok(())
    }

    pub fn mode(&self) -> ThemeMode {
        *self.mode.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ThemeMode> {
        self.mode.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_values_fall_back_to_system() {
        assert_eq!(ThemeMode::from_stored(Some("DARK")), ThemeMode::Dark);
        assert_eq!(ThemeMode::from_stored(Some("dark")), ThemeMode::System);
        assert_eq!(ThemeMode::from_stored(None), ThemeMode::System);
    }

    #[tokio::test]
    async fn test_set_mode_persists_and_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::open(dir.path()).await.unwrap());

        let theme = ThemePreferences::load(settings.clone()).await;
        assert_eq!(theme.mode(), ThemeMode::System);

        let mut watcher = theme.watch();
        theme.set_mode(ThemeMode::Light).await.unwrap();
        assert!(watcher.has_changed().unwrap());
        assert_eq!(*watcher.borrow_and_update(), ThemeMode::Light);

        // Same mode again is not a change
        theme.set_mode(ThemeMode::Light).await.unwrap();
        assert!(!watcher.has_changed().unwrap());

        let reloaded = ThemePreferences::load(Arc::new(SettingsStore::open(dir.path()).await.unwrap())).await;
        assert_eq!(reloaded.mode(), ThemeMode::Light);
    }
}
