use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::auth::session::Session;
use crate::error::{errors, SpensoError, SpensoResult};

/// File name of the cached session inside the data directory
pub const SESSION_FILE_NAME: &str = "session.json";

/// Local cache of the last live session, so a restart can skip sign-in
#[async_trait]
pub trait SessionCache: Send + Sync {
    /// Load the cached session, if any
    async fn load(&self) -> SpensoResult<Option<Session>>;

    /// Replace the cached session
    async fn store(&self, session: &Session) -> SpensoResult<()>;

    /// Forget the cached session
    async fn clear(&self) -> SpensoResult<()>;
}

/// On-disk envelope around the cached session
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionPayload {
    /// Format version, bumped on incompatible changes
    version: u32,
    /// When this entry was written
    stored_at: DateTime<Utc>,
    session: Session,
}

const PAYLOAD_VERSION: u32 = 1;

/// Session cache persisted as a JSON file
pub struct FileSessionCache {
    path: PathBuf,
}

impl FileSessionCache {
    /// Cache stored at `<data_dir>/session.json`
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(SESSION_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SessionCache for FileSessionCache {
    async fn load(&self) -> SpensoResult<Option<Session>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No cached session");
                return Ok(None);
            }
            Err(e) => return Err(errors::storage_io(self.path.display(), e).into()),
        };

        let payload: SessionPayload = serde_json::from_str(&raw)?;
        if payload.version != PAYLOAD_VERSION {
            warn!(
                version = payload.version,
                "Ignoring cached session written by an incompatible version"
            );
            return Ok(None);
        }

        debug!(account_id = %payload.session.account_id, "Loaded cached session");
        Ok(Some(payload.session))
    }

    async fn store(&self, session: &Session) -> SpensoResult<()> {
        // Ensure parent directory exists
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| errors::storage_io(parent.display(), e))?;
        }

        let payload = SessionPayload {
            version: PAYLOAD_VERSION,
            stored_at: Utc::now(),
            session: session.clone(),
        };
        let json = serde_json::to_string_pretty(&payload)?;

        // Write next to the target and rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| errors::storage_io(tmp.display(), e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| errors::storage_io(self.path.display(), e))?;

        debug!(account_id = %session.account_id, "Session cached");
        Ok(())
    }

    async fn clear(&self) -> SpensoResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Cached session removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(errors::storage_io(self.path.display(), e).into()),
        }
    }
}

/// In-memory session cache with scriptable failures
#[derive(Default)]
pub struct MemorySessionCache {
    session: RwLock<Option<Session>>,
    load_failures: Mutex<VecDeque<SpensoError>>,
    store_failures: Mutex<VecDeque<SpensoError>>,
}

impl MemorySessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-populated with a session
    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
            ..Self::default()
        }
    }

    /// Make the next load fail. Calls queue up.
    pub async fn fail_next_load(&self, error: impl Into<SpensoError>) {
        self.load_failures.lock().await.push_back(error.into());
    }

    /// Make the next store fail. Calls queue up.
    pub async fn fail_next_store(&self, error: impl Into<SpensoError>) {
        self.store_failures.lock().await.push_back(error.into());
    }
}

#[async_trait]
impl SessionCache for MemorySessionCache {
    async fn load(&self) -> SpensoResult<Option<Session>> {
        if let Some(error) = self.load_failures.lock().await.pop_front() {
            debug!("Injected session cache load failure");
            return Err(error);
        }
        Ok(self.session.read().await.clone())
    }

    async fn store(&self, session: &Session) -> SpensoResult<()> {
        if let Some(error) = self.store_failures.lock().await.pop_front() {
            debug!("Injected session cache store failure");
            return Err(error);
        }
        *self.session.write().await = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> SpensoResult<()> {
        self.session.write().await.take();
        Ok(())
    }
}
