//! Resume cursor store
//!
//! Durably remembers the last acknowledged feed position so a restart
//! resumes where the previous run stopped. Saves are buffered: the hot path
//! only touches memory, and a flush goes to the backend at most every
//! `save_interval`, on the periodic background save, or immediately when
//! forced (shutdown). The persisted record also carries a bounded history of
//! prior positions for operational rollback.
//!
//! The file backend writes atomically: serialize to a sibling temp file,
//! then rename over the target. A crash mid-write leaves the previous valid
//! record in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use webhook_core::config::CursorConfig;
use webhook_core::ResumeToken;

use crate::error::CursorError;

/// The persisted cursor record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorSnapshot {
    pub token: ResumeToken,
    /// Most recent positions, oldest first, bounded by `max_history`
    #[serde(default)]
    pub history: Vec<ResumeToken>,
    pub last_saved: DateTime<Utc>,
    /// Service identity that owns this cursor
    pub service: String,
}

/// Storage for the cursor record. File and database modes both fit behind
/// this; tests use the in-memory backend.
#[async_trait]
pub trait CursorBackend: Send + Sync {
    async fn load(&self) -> Result<Option<CursorSnapshot>, CursorError>;
    async fn store(&self, snapshot: CursorSnapshot) -> Result<(), CursorError>;
}

/// File-backed cursor: one JSON object, atomically replaced on store.
pub struct FileCursorBackend {
    path: PathBuf,
}

impl FileCursorBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CursorBackend for FileCursorBackend {
    async fn load(&self) -> Result<Option<CursorSnapshot>, CursorError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || match std::fs::read(&path) {
            Ok(bytes) => {
                let snapshot: CursorSnapshot = serde_json::from_slice(&bytes)?;
                Ok(Some(snapshot))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(CursorError::Io(err)),
        })
        .await
        .map_err(|join| CursorError::Io(std::io::Error::other(join)))?
    }

    async fn store(&self, snapshot: CursorSnapshot) -> Result<(), CursorError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let bytes = serde_json::to_vec_pretty(&snapshot)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, &bytes)?;
            std::fs::rename(&tmp, &path)?;
            Ok(())
        })
        .await
        .map_err(|join| CursorError::Io(std::io::Error::other(join)))?
    }
}

/// In-memory backend for tests and as the seam a database row plugs into.
#[derive(Default)]
pub struct MemoryCursorBackend {
    snapshot: Mutex<Option<CursorSnapshot>>,
}

impl MemoryCursorBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorBackend for MemoryCursorBackend {
    async fn load(&self) -> Result<Option<CursorSnapshot>, CursorError> {
        Ok(self.snapshot.lock().await.clone())
    }

    async fn store(&self, snapshot: CursorSnapshot) -> Result<(), CursorError> {
        *self.snapshot.lock().await = Some(snapshot);
        Ok(())
    }
}

struct CursorState {
    current: Option<ResumeToken>,
    history: Vec<ResumeToken>,
    dirty: bool,
    last_flush: Instant,
}

/// Buffered cursor writer with a bounded position history.
pub struct CursorStore {
    backend: Arc<dyn CursorBackend>,
    service: String,
    max_history: usize,
    save_interval: Duration,
    state: Mutex<CursorState>,
}

impl CursorStore {
    pub fn new(backend: Arc<dyn CursorBackend>, service: impl Into<String>, config: &CursorConfig) -> Self {
        Self {
            backend,
            service: service.into(),
            max_history: config.max_history,
            save_interval: Duration::from_millis(config.save_interval_ms),
            state: Mutex::new(CursorState {
                current: None,
                history: Vec::new(),
                dirty: false,
                last_flush: Instant::now(),
            }),
        }
    }

    /// Load the persisted token, if any, and seed the in-memory state.
    pub async fn load(&self) -> Result<Option<ResumeToken>, CursorError> {
        let snapshot = self.backend.load().await?;
        let mut state = self.state.lock().await;
        match snapshot {
            Some(snapshot) => {
                if !snapshot.token.is_valid() {
                    return Err(CursorError::InvalidToken);
                }
                state.current = Some(snapshot.token.clone());
                state.history = snapshot.history;
                Ok(Some(snapshot.token))
            }
            None => Ok(None),
        }
    }

    /// Buffer a save of `token`. Flushes when forced or when the save
    /// interval has elapsed since the last flush; otherwise the periodic
    /// flusher picks it up. Persist failures are logged and retried on the
    /// next flush; the pending token is never dropped.
    pub async fn save(&self, token: ResumeToken, force: bool) {
        if !token.is_valid() {
            warn!("discarding malformed resume token");
            return;
        }
        let due = {
            let mut state = self.state.lock().await;
            if let Some(previous) = state.current.replace(token) {
                state.history.push(previous);
                let excess = state.history.len().saturating_sub(self.max_history);
                if excess > 0 {
                    state.history.drain(..excess);
                }
            }
            state.dirty = true;
            force || state.last_flush.elapsed() >= self.save_interval
        };
        if due {
            if let Err(error) = self.flush().await {
                warn!(%error, "cursor persist failed, will retry on next flush");
            }
        }
    }

    /// Write any pending state to the backend.
    pub async fn flush(&self) -> Result<(), CursorError> {
        let snapshot = {
            let state = self.state.lock().await;
            if !state.dirty {
                return Ok(());
            }
            let Some(token) = state.current.clone() else {
                return Ok(());
            };
            CursorSnapshot {
                token,
                history: state.history.clone(),
                last_saved: Utc::now(),
                service: self.service.clone(),
            }
        };
        self.backend.store(snapshot).await?;
        let mut state = self.state.lock().await;
        state.dirty = false;
        state.last_flush = Instant::now();
        debug!("resume cursor flushed");
        Ok(())
    }

    /// Current in-memory token (may be ahead of what is persisted).
    pub async fn current(&self) -> Option<ResumeToken> {
        self.state.lock().await.current.clone()
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.dirty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> CursorConfig {
        CursorConfig {
            save_interval_ms: 0, // flush on every save in tests
            periodic_save_ms: 30_000,
            max_history: 3,
            file_path: String::new(),
        }
    }

    fn token(n: u32) -> ResumeToken {
        ResumeToken::Doc(json!({"_data": format!("pos-{n}")}))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let backend = Arc::new(MemoryCursorBackend::new());
        let store = CursorStore::new(backend.clone(), "svc", &config());
        store.save(token(1), true).await;

        let reloaded = CursorStore::new(backend, "svc", &config());
        assert_eq!(reloaded.load().await.unwrap(), Some(token(1)));
    }

    #[tokio::test]
    async fn history_is_bounded_and_ordered() {
        let backend = Arc::new(MemoryCursorBackend::new());
        let store = CursorStore::new(backend.clone(), "svc", &config());
        for n in 1..=5 {
            store.save(token(n), true).await;
        }
        let snapshot = backend.load().await.unwrap().unwrap();
        assert_eq!(snapshot.token, token(5));
        // last max_history prior positions, oldest first
        assert_eq!(snapshot.history, vec![token(2), token(3), token(4)]);
    }

    #[tokio::test]
    async fn malformed_tokens_are_discarded() {
        let backend = Arc::new(MemoryCursorBackend::new());
        let store = CursorStore::new(backend.clone(), "svc", &config());
        store.save(ResumeToken::Text(String::new()), true).await;
        assert!(backend.load().await.unwrap().is_none());
        assert!(store.current().await.is_none());
    }

    #[tokio::test]
    async fn buffered_save_waits_for_flush() {
        let mut cfg = config();
        cfg.save_interval_ms = 60_000;
        let backend = Arc::new(MemoryCursorBackend::new());
        let store = CursorStore::new(backend.clone(), "svc", &cfg);

        store.save(token(1), false).await;
        assert!(backend.load().await.unwrap().is_none());
        assert!(store.has_pending().await);

        store.flush().await.unwrap();
        assert_eq!(backend.load().await.unwrap().unwrap().token, token(1));
        assert!(!store.has_pending().await);
    }

    #[tokio::test]
    async fn file_backend_atomic_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let backend = FileCursorBackend::new(&path);

        assert!(backend.load().await.unwrap().is_none());

        backend
            .store(CursorSnapshot {
                token: token(9),
                history: vec![token(8)],
                last_saved: Utc::now(),
                service: "svc".into(),
            })
            .await
            .unwrap();

        let loaded = backend.load().await.unwrap().unwrap();
        assert_eq!(loaded.token, token(9));
        assert_eq!(loaded.service, "svc");
        // no temp file left behind
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn file_backend_survives_torn_temp_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        let backend = FileCursorBackend::new(&path);

        backend
            .store(CursorSnapshot {
                token: token(1),
                history: vec![],
                last_saved: Utc::now(),
                service: "svc".into(),
            })
            .await
            .unwrap();

        // Simulate a crash that left a partial temp file behind
        std::fs::write(path.with_extension("json.tmp"), b"{\"token\": \"tru").unwrap();

        let loaded = backend.load().await.unwrap().unwrap();
        assert_eq!(loaded.token, token(1));
    }

    #[tokio::test]
    async fn corrupt_cursor_file_is_an_error_not_a_panic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.json");
        std::fs::write(&path, b"not json at all").unwrap();
        let backend = FileCursorBackend::new(&path);
        assert!(backend.load().await.is_err());
    }
}
