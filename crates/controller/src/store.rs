//! Durable storage for [`PersistedState`] as a small JSON document.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::Mutex;

use crate::state::PersistedState;

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the stored state. Missing or unreadable state yields the default.
    async fn load(&self) -> PersistedState;

    async fn save(&self, state: &PersistedState) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON file
// ---------------------------------------------------------------------------

pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> PersistedState {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<PersistedState>(&contents) {
                Ok(state) => {
                    tracing::info!(
                        path = %self.path.display(),
                        last_written_ts_ms = state.last_written_ts_ms,
                        last_pump_ts_ms = state.last_pump_ts_ms,
                        "loaded persisted state"
                    );
                    state
                }
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), "unparseable state file, starting fresh: {e}");
                    PersistedState::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no state file, starting fresh");
                PersistedState::default()
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "failed to read state file: {e}");
                PersistedState::default()
            }
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let json = serde_json::to_string(state).context("failed to serialize state")?;

        // Write-then-rename so a crash never leaves a torn document.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .await
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory (tests, ephemeral hosts)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<PersistedState>,
}

impl MemoryStore {
    pub fn new(state: PersistedState) -> Self {
        Self {
            inner: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> PersistedState {
        self.inner.lock().await.clone()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> PersistedState {
        self.inner.lock().await.clone()
    }

    async fn save(&self, state: &PersistedState) -> Result<()> {
        *self.inner.lock().await = state.clone();
        Ok(())
    }
}
