use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{errors, SpensoResult};

/// File name of the settings file inside the data directory
pub const SETTINGS_FILE_NAME: &str = "settings.json";

/// Small key/value store for local settings, persisted as one JSON object
pub struct SettingsStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, String>>,
}

impl SettingsStore {
    /// Open `<data_dir>/settings.json`. A missing file is an empty store.
    pub async fn open(data_dir: impl AsRef<Path>) -> SpensoResult<Self> {
        let path = data_dir.as_ref().join(SETTINGS_FILE_NAME);

        let values = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(errors::storage_io(path.display(), e).into()),
        };
        debug!(path = %path.display(), "Settings loaded");

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.values.read().await.get(key).cloned()
    }

    /// Set a value and write the file
    pub async fn set(&self, key: &str, value: &str) -> SpensoResult<()> {
        let mut values = self.values.write().await;
        values.insert(key.to_string(), value.to_string());
        self.save(&values).await
    }

    /// Remove a value and write the file
    pub async fn remove(&self, key: &str) -> SpensoResult<()> {
        let mut values = self.values.write().await;
        if values.remove(key).is_some() {
            self.save(&values).await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(&self, values: &BTreeMap<String, String>) -> SpensoResult<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| errors::storage_io(parent.display(), e))?;
        }

        let json = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, json)
            .await
            .map_err(|e| errors::storage_io(self.path.display(), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");

        let settings = SettingsStore::open(&data_dir).await.unwrap();
        assert_eq!(settings.get("theme_mode").await, None);
        settings.set("theme_mode", "DARK").await.unwrap();
        settings.set("other", "x").await.unwrap();
        settings.remove("other").await.unwrap();

        let reopened = SettingsStore::open(&data_dir).await.unwrap();
        assert_eq!(reopened.get("theme_mode").await.as_deref(), Some("DARK"));
        assert_eq!(reopened.get("other").await, None);
    }
}
