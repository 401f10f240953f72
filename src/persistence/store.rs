//! Durable session metadata store.
//!
//! One JSON document at a stable path, shaped `{"sessions": {<external_id>:
//! {...}}}`. Every mutation rewrites the whole document atomically: write to
//! a temp file, fsync, rename over the target. Writers are serialized by an
//! in-process mutex; reads happen only at startup. A missing or corrupt
//! file degrades to an empty store — losing resumability must never stop
//! the bridge from booting.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::models::PersistedSession;
use crate::{AppError, Result};

/// On-disk document shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    sessions: HashMap<String, PersistedSession>,
}

/// Atomically persisted mapping of external session id → session metadata.
pub struct SessionStore {
    path: PathBuf,
    state: Mutex<HashMap<String, PersistedSession>>,
}

impl SessionStore {
    /// Open the store at `path`, loading any existing document.
    ///
    /// Unreadable or malformed documents are logged and treated as empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sessions = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<Document>(&raw) {
                Ok(doc) => {
                    if !doc.sessions.is_empty() {
                        info!(
                            count = doc.sessions.len(),
                            path = %path.display(),
                            "loaded persisted sessions"
                        );
                    }
                    doc.sessions
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "corrupt session store, starting empty");
                    HashMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no persisted sessions file");
                HashMap::new()
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read session store, starting empty");
                HashMap::new()
            }
        };

        Self {
            path,
            state: Mutex::new(sessions),
        }
    }

    /// Insert or replace a session record and persist the document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the document cannot be written.
    pub async fn upsert(&self, session: PersistedSession) -> Result<()> {
        let mut state = self.state.lock().await;
        state.insert(session.external_session_id.clone(), session);
        self.save(&state).await
    }

    /// Delete a session record and persist the document.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Store` if the document cannot be written.
    pub async fn remove(&self, external_session_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.remove(external_session_id).is_none() {
            return Ok(());
        }
        self.save(&state).await
    }

    /// Fetch one session record.
    pub async fn get(&self, external_session_id: &str) -> Option<PersistedSession> {
        self.state.lock().await.get(external_session_id).cloned()
    }

    /// Snapshot of every persisted session.
    pub async fn all(&self) -> Vec<PersistedSession> {
        self.state.lock().await.values().cloned().collect()
    }

    /// Write the document atomically: temp file, fsync, rename.
    async fn save(&self, sessions: &HashMap<String, PersistedSession>) -> Result<()> {
        let doc = Document {
            sessions: sessions.clone(),
        };
        let raw = serde_json::to_vec_pretty(&doc)
            .map_err(|err| AppError::Store(format!("failed to serialize sessions: {err}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| AppError::Store(format!("failed to create store dir: {err}")))?;
        }

        let tmp = temp_path(&self.path);
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|err| AppError::Store(format!("failed to create temp store: {err}")))?;
        file.write_all(&raw)
            .await
            .map_err(|err| AppError::Store(format!("failed to write temp store: {err}")))?;
        file.sync_all()
            .await
            .map_err(|err| AppError::Store(format!("failed to sync temp store: {err}")))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| AppError::Store(format!("failed to replace store: {err}")))?;

        debug!(count = sessions.len(), path = %self.path.display(), "persisted sessions");
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(|| "sessions.json".into(), |n| n.to_os_string());
    name.push(".tmp");
    path.with_file_name(name)
}
