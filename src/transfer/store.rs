//! Persistence for resumable upload sessions.
//!
//! One JSON file per session under the engine's home directory. All writes
//! funnel through a single writer task (write-temp then atomic rename, never
//! a torn file); loads at startup delete anything malformed instead of
//! repairing it.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::transfer::session::UploadSession;
use crate::transfer::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

const SESSION_SUFFIX: &str = ".session";
/// How much payload is hashed between scheduler yields.
const HASH_STRIDE: usize = 256 * 1024;
/// Hex characters kept from the SHA-256 digest.
const HASH_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub directory: PathBuf,
    pub session_ttl: Duration,
    pub cleanup_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let directory = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".easy-file-management")
            .join("upload-sessions");
        StoreConfig {
            directory,
            session_ttl: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Default)]
pub struct StoreStats {
    pub persist_writes: AtomicU64,
    pub removed_files: AtomicU64,
    pub discarded_on_load: AtomicU64,
}

enum WriteJob {
    Persist(Box<UploadSession>),
    Remove(String),
    Flush(oneshot::Sender<()>),
}

pub struct ResumableUploadStore {
    config: StoreConfig,
    sessions: DashMap<String, UploadSession>,
    writer_tx: mpsc::UnboundedSender<WriteJob>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reaper_cancel: CancellationToken,
    stats: StoreStats,
}

impl ResumableUploadStore {
    /// Open the store: create the directory, load surviving session files,
    /// start the writer task and the hourly expiry reaper.
    pub async fn open(config: StoreConfig) -> Result<Arc<Self>> {
        tokio::fs::create_dir_all(&config.directory).await?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let store = Arc::new(ResumableUploadStore {
            config,
            sessions: DashMap::new(),
            writer_tx,
            writer_task: Mutex::new(None),
            reaper_cancel: CancellationToken::new(),
            stats: StoreStats::default(),
        });

        store.load_existing().await;
        store.spawn_writer(writer_rx).await;
        store.spawn_reaper();
        Ok(store)
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn session(&self, session_id: &str) -> Option<UploadSession> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Create a session, or resume the stored one addressed by the payload
    /// fingerprint. A stored hit is only honoured when it is unexpired,
    /// layout-valid for the current limits, and matches (hash, size,
    /// chunk_size); otherwise it is discarded and recreated.
    pub async fn create_or_resume(
        &self,
        filename: &str,
        target_path: &str,
        payload: &[u8],
        chunk_size: u32,
        persist: bool,
    ) -> Result<UploadSession> {
        let chunk_size = self.validate_chunk_size(chunk_size)?;
        let ttl = ChronoDuration::from_std(self.config.session_ttl)
            .map_err(|err| EngineError::config(format!("session ttl: {err}")))?;

        if !persist {
            let session = UploadSession::ephemeral(
                filename.to_owned(),
                target_path.to_owned(),
                payload.len() as u64,
                chunk_size,
                ttl,
            )?;
            self.sessions
                .insert(session.session_id.clone(), session.clone());
            return Ok(session);
        }

        let file_hash = fingerprint(payload).await;
        let session_id = format!("{file_hash}_{filename}");

        if let Some(existing) = self.session(&session_id) {
            let resumable = !existing.is_expired()
                && existing.is_layout_valid()
                && existing.matches(&file_hash, payload.len() as u64, chunk_size);
            if resumable {
                let mut entry = self
                    .sessions
                    .get_mut(&session_id)
                    .ok_or_else(|| EngineError::session("session vanished during resume"))?;
                entry.touch(ttl);
                let session = entry.clone();
                drop(entry);
                self.enqueue_persist(&session);
                debug!(
                    target: "transfer::store",
                    session = %session_id,
                    acked = session.uploaded_chunks.len(),
                    "Resumed stored session"
                );
                return Ok(session);
            }
            info!(
                target: "transfer::store",
                session = %session_id,
                "Stored session is stale or incompatible, recreating"
            );
            self.remove_session(&session_id);
        }

        let session = UploadSession::persistent(
            file_hash,
            filename.to_owned(),
            target_path.to_owned(),
            payload.len() as u64,
            chunk_size,
            ttl,
        )?;
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        self.enqueue_persist(&session);
        Ok(session)
    }

    /// Record a server ack. Idempotent per index; only the first ack of a
    /// chunk schedules a persistence write.
    pub fn mark_chunk_uploaded(&self, session_id: &str, chunk_index: u32) -> Result<()> {
        let ttl = ChronoDuration::from_std(self.config.session_ttl)
            .map_err(|err| EngineError::config(format!("session ttl: {err}")))?;
        let mut entry = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| EngineError::session(format!("unknown session {session_id}")))?;
        if entry.is_expired() {
            return Err(EngineError::session(format!(
                "session {session_id} expired at {}",
                entry.expires_at
            )));
        }
        let newly_added = entry.mark_uploaded(chunk_index)?;
        if newly_added {
            entry.touch(ttl);
            let snapshot = entry.clone();
            drop(entry);
            self.enqueue_persist(&snapshot);
        }
        Ok(())
    }

    pub fn pending_chunks(&self, session_id: &str) -> Result<Vec<u32>> {
        self.with_session(session_id, |session| session.pending_chunks())
    }

    pub fn next_chunk(&self, session_id: &str) -> Result<Option<u32>> {
        self.with_session(session_id, |session| session.next_pending())
    }

    pub fn is_complete(&self, session_id: &str) -> Result<bool> {
        self.with_session(session_id, |session| session.is_complete())
    }

    /// Finish a session: drop the record and its file.
    pub fn complete(&self, session_id: &str) -> Result<()> {
        if self.sessions.remove(session_id).is_none() {
            return Err(EngineError::session(format!(
                "unknown session {session_id}"
            )));
        }
        let _ = self.writer_tx.send(WriteJob::Remove(session_id.to_owned()));
        Ok(())
    }

    /// Drop expired sessions and their files. Runs hourly in the background
    /// but can be invoked directly.
    pub fn cleanup_expired(&self) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect();
        let count = expired.len();
        for session_id in expired {
            self.remove_session(&session_id);
        }
        if count > 0 {
            info!(target: "transfer::store", count, "Expired upload sessions removed");
        }
        count
    }

    /// Wait until every queued write has hit the filesystem.
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.writer_tx
            .send(WriteJob::Flush(tx))
            .map_err(|_| EngineError::session("store writer is gone"))?;
        rx.await
            .map_err(|_| EngineError::session("store writer dropped the flush"))
    }

    pub async fn shutdown(&self) {
        self.reaper_cancel.cancel();
        let _ = self.flush().await;
        if let Some(task) = self.writer_task.lock().await.take() {
            task.abort();
        }
    }

    fn validate_chunk_size(&self, chunk_size: u32) -> Result<u32> {
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(EngineError::config(format!(
                "chunk size {chunk_size} below minimum {MIN_CHUNK_SIZE}"
            )));
        }
        if chunk_size > MAX_CHUNK_SIZE {
            warn!(
                target: "transfer::store",
                requested = chunk_size,
                clamped = MAX_CHUNK_SIZE,
                "Chunk size above frame budget, clamping"
            );
            return Ok(MAX_CHUNK_SIZE);
        }
        Ok(chunk_size)
    }

    fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&UploadSession) -> T) -> Result<T> {
        self.sessions
            .get(session_id)
            .map(|entry| f(entry.value()))
            .ok_or_else(|| EngineError::session(format!("unknown session {session_id}")))
    }

    fn remove_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
        let _ = self.writer_tx.send(WriteJob::Remove(session_id.to_owned()));
    }

    fn enqueue_persist(&self, session: &UploadSession) {
        if !session.persistent {
            return;
        }
        let _ = self
            .writer_tx
            .send(WriteJob::Persist(Box::new(session.clone())));
    }

    fn session_file(&self, session_id: &str) -> PathBuf {
        self.config
            .directory
            .join(format!("{}{}", sanitize_id(session_id), SESSION_SUFFIX))
    }

    async fn load_existing(self: &Arc<Self>) {
        let mut dir = match tokio::fs::read_dir(&self.config.directory).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!(target: "transfer::store", error = %err, "Cannot scan session directory");
                return;
            }
        };
        let mut loaded = 0usize;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("session") {
                continue;
            }
            match Self::read_session(&path).await {
                Ok(session) if session.is_layout_valid() && !session.is_expired() => {
                    self.sessions.insert(session.session_id.clone(), session);
                    loaded += 1;
                }
                Ok(_) | Err(_) => {
                    // Malformed, expired or from an older layout: delete,
                    // never repair.
                    self.stats.discarded_on_load.fetch_add(1, Ordering::Relaxed);
                    if let Err(err) = tokio::fs::remove_file(&path).await {
                        warn!(
                            target: "transfer::store",
                            path = %path.display(),
                            error = %err,
                            "Could not delete unusable session file"
                        );
                    }
                }
            }
        }
        if loaded > 0 {
            info!(target: "transfer::store", loaded, "Resumable sessions loaded");
        }
    }

    async fn read_session(path: &PathBuf) -> Result<UploadSession> {
        let raw = tokio::fs::read(path).await?;
        serde_json::from_slice(&raw)
            .map_err(|err| EngineError::session(format!("unreadable session file: {err}")))
    }

    async fn spawn_writer(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<WriteJob>) {
        let store = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                match job {
                    WriteJob::Persist(session) => {
                        let path = store.session_file(&session.session_id);
                        if let Err(err) = write_atomically(&path, &session).await {
                            warn!(
                                target: "transfer::store",
                                session = %session.session_id,
                                error = %err,
                                "Session write failed"
                            );
                        } else {
                            store.stats.persist_writes.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    WriteJob::Remove(session_id) => {
                        let path = store.session_file(&session_id);
                        match tokio::fs::remove_file(&path).await {
                            Ok(()) => {
                                store.stats.removed_files.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                            Err(err) => {
                                warn!(
                                    target: "transfer::store",
                                    session = %session_id,
                                    error = %err,
                                    "Session file removal failed"
                                );
                            }
                        }
                    }
                    WriteJob::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        *self.writer_task.lock().await = Some(task);
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let cancel = self.reaper_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.config.cleanup_interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        store.cleanup_expired();
                    }
                }
            }
        });
    }
}

/// Truncated SHA-256 over the payload, computed in strides with scheduler
/// yields so large buffers do not stall the runtime.
pub async fn fingerprint(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    for stride in payload.chunks(HASH_STRIDE) {
        hasher.update(stride);
        tokio::task::yield_now().await;
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..HASH_LEN / 2])
}

/// Session ids become file names; anything outside a conservative set is
/// replaced.
fn sanitize_id(session_id: &str) -> String {
    session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn write_atomically(path: &PathBuf, session: &UploadSession) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(session)
        .map_err(|err| EngineError::session(format!("session serialize: {err}")))?;
    let tmp = path.with_extension("session.tmp");
    tokio::fs::write(&tmp, &serialized).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_store(dir: &std::path::Path) -> Arc<ResumableUploadStore> {
        ResumableUploadStore::open(StoreConfig {
            directory: dir.to_path_buf(),
            session_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn fingerprint_is_stable_and_truncated() {
        let a = fingerprint(b"hello world").await;
        let b = fingerprint(b"hello world").await;
        let c = fingerprint(b"hello world!").await;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), HASH_LEN);
    }

    #[tokio::test]
    async fn create_persist_and_resume_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let payload = vec![7u8; 100 * 1024];

        let session_id = {
            let store = open_store(dir.path()).await;
            let session = store
                .create_or_resume("data.bin", "/inbox", &payload, 32 * 1024, true)
                .await
                .unwrap();
            store.mark_chunk_uploaded(&session.session_id, 0).unwrap();
            store.mark_chunk_uploaded(&session.session_id, 2).unwrap();
            store.flush().await.unwrap();
            store.shutdown().await;
            session.session_id
        };

        // A fresh store sees the acked chunks.
        let store = open_store(dir.path()).await;
        let resumed = store
            .create_or_resume("data.bin", "/inbox", &payload, 32 * 1024, true)
            .await
            .unwrap();
        assert_eq!(resumed.session_id, session_id);
        assert_eq!(
            resumed.uploaded_chunks.iter().copied().collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(store.pending_chunks(&session_id).unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn re_acks_write_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let payload = vec![1u8; 64 * 1024];
        let session = store
            .create_or_resume("once.bin", "/inbox", &payload, 16 * 1024, true)
            .await
            .unwrap();
        store.flush().await.unwrap();
        let baseline = store.stats.persist_writes.load(Ordering::Relaxed);

        for _ in 0..5 {
            store.mark_chunk_uploaded(&session.session_id, 1).unwrap();
        }
        store.flush().await.unwrap();
        assert_eq!(
            store.stats.persist_writes.load(Ordering::Relaxed),
            baseline + 1
        );
        store.shutdown().await;
    }

    #[tokio::test]
    async fn mismatched_resume_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let payload = vec![3u8; 128 * 1024];
        let first = store
            .create_or_resume("f.bin", "/inbox", &payload, 32 * 1024, true)
            .await
            .unwrap();
        store.mark_chunk_uploaded(&first.session_id, 0).unwrap();

        // Same payload, different chunk size: the stored record is discarded.
        let second = store
            .create_or_resume("f.bin", "/inbox", &payload, 64 * 1024, true)
            .await
            .unwrap();
        assert_eq!(second.session_id, first.session_id);
        assert!(second.uploaded_chunks.is_empty());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn completed_session_refuses_further_acks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let payload = vec![9u8; 32 * 1024];
        let session = store
            .create_or_resume("done.bin", "/inbox", &payload, 16 * 1024, true)
            .await
            .unwrap();
        store.mark_chunk_uploaded(&session.session_id, 0).unwrap();
        store.mark_chunk_uploaded(&session.session_id, 1).unwrap();
        assert!(store.is_complete(&session.session_id).unwrap());

        store.complete(&session.session_id).unwrap();
        assert!(matches!(
            store.mark_chunk_uploaded(&session.session_id, 0),
            Err(EngineError::Session(_))
        ));
        store.flush().await.unwrap();
        assert!(!store.session_file(&session.session_id).exists());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_files_are_deleted_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("broken.session");
        tokio::fs::write(&bogus, b"{ not json").await.unwrap();

        let store = open_store(dir.path()).await;
        assert_eq!(store.session_count(), 0);
        assert_eq!(store.stats.discarded_on_load.load(Ordering::Relaxed), 1);
        assert!(!bogus.exists());
        store.shutdown().await;
    }

    #[tokio::test]
    async fn ephemeral_sessions_never_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let payload = vec![5u8; 64 * 1024];
        let session = store
            .create_or_resume("mem.bin", "/inbox", &payload, 16 * 1024, false)
            .await
            .unwrap();
        store.mark_chunk_uploaded(&session.session_id, 0).unwrap();
        store.flush().await.unwrap();
        assert_eq!(store.stats.persist_writes.load(Ordering::Relaxed), 0);
        store.shutdown().await;
    }

    #[test]
    fn sanitizer_keeps_ids_filesystem_safe() {
        assert_eq!(sanitize_id("abc123_file.bin"), "abc123_file.bin");
        assert_eq!(sanitize_id("a/b\\c:d eñe"), "a_b_c_d_e_e");
    }

    #[tokio::test]
    async fn oversized_chunk_size_is_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path()).await;
        let session = store
            .create_or_resume("big.bin", "/inbox", &[0u8; 1024], MAX_CHUNK_SIZE + 4096, true)
            .await
            .unwrap();
        assert_eq!(session.chunk_size, MAX_CHUNK_SIZE);
        store.shutdown().await;
    }
}
