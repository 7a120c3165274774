//! Upload session state, persisted across restarts for resumable uploads.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::transfer::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

/// Bumped when the on-disk layout changes; older files are discarded.
pub const SESSION_FORMAT_VERSION: u32 = 1;

/// One logical multi-chunk upload.
///
/// `uploaded_chunks` is an ordered set: indices are unique, sorted, and
/// always within `[0, total_chunks)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub session_id: String,
    pub format_version: u32,
    /// Remote directory the file lands in.
    pub target_path: String,
    pub filename: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
    pub uploaded_chunks: BTreeSet<u32>,
    /// Truncated SHA-256 of the payload; absent for ephemeral sessions.
    pub file_hash: Option<String>,
    /// Whether this session is written to disk.
    pub persistent: bool,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl UploadSession {
    /// A persisted session addressed by `hash + "_" + filename`.
    pub fn persistent(
        file_hash: String,
        filename: String,
        target_path: String,
        file_size: u64,
        chunk_size: u32,
        ttl: ChronoDuration,
    ) -> Result<Self> {
        let session_id = format!("{file_hash}_{filename}");
        Self::build(
            session_id,
            Some(file_hash),
            true,
            filename,
            target_path,
            file_size,
            chunk_size,
            ttl,
        )
    }

    /// An in-memory session with a random identity.
    pub fn ephemeral(
        filename: String,
        target_path: String,
        file_size: u64,
        chunk_size: u32,
        ttl: ChronoDuration,
    ) -> Result<Self> {
        Self::build(
            Uuid::new_v4().to_string(),
            None,
            false,
            filename,
            target_path,
            file_size,
            chunk_size,
            ttl,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        session_id: String,
        file_hash: Option<String>,
        persistent: bool,
        filename: String,
        target_path: String,
        file_size: u64,
        chunk_size: u32,
        ttl: ChronoDuration,
    ) -> Result<Self> {
        if chunk_size < MIN_CHUNK_SIZE {
            return Err(EngineError::config(format!(
                "chunk size {chunk_size} below the {MIN_CHUNK_SIZE} byte minimum"
            )));
        }
        if chunk_size > MAX_CHUNK_SIZE {
            return Err(EngineError::config(format!(
                "chunk size {chunk_size} above the {MAX_CHUNK_SIZE} byte maximum"
            )));
        }
        let now = Utc::now();
        Ok(UploadSession {
            session_id,
            format_version: SESSION_FORMAT_VERSION,
            target_path,
            filename,
            file_size,
            chunk_size,
            total_chunks: total_chunks_for(file_size, chunk_size),
            uploaded_chunks: BTreeSet::new(),
            file_hash,
            persistent,
            created_at: now,
            last_updated_at: now,
            expires_at: now + ttl,
        })
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Refresh activity and push the expiry forward.
    pub fn touch(&mut self, ttl: ChronoDuration) {
        let now = Utc::now();
        self.last_updated_at = now;
        self.expires_at = now + ttl;
    }

    /// Whether a resume request is talking about the same upload.
    pub fn matches(&self, file_hash: &str, file_size: u64, chunk_size: u32) -> bool {
        self.file_hash.as_deref() == Some(file_hash)
            && self.file_size == file_size
            && self.chunk_size == chunk_size
    }

    /// A stored session whose chunk size no longer fits the frame limit
    /// cannot be resumed.
    pub fn is_layout_valid(&self) -> bool {
        self.format_version == SESSION_FORMAT_VERSION
            && self.chunk_size >= MIN_CHUNK_SIZE
            && self.chunk_size <= MAX_CHUNK_SIZE
            && self.total_chunks == total_chunks_for(self.file_size, self.chunk_size)
            && self
                .uploaded_chunks
                .iter()
                .all(|&index| index < self.total_chunks)
    }

    /// Record an acknowledged chunk. Returns `true` when the index was new;
    /// re-acks are idempotent and return `false`.
    pub fn mark_uploaded(&mut self, chunk_index: u32) -> Result<bool> {
        if chunk_index >= self.total_chunks {
            return Err(EngineError::session(format!(
                "chunk {chunk_index} outside session of {} chunks",
                self.total_chunks
            )));
        }
        Ok(self.uploaded_chunks.insert(chunk_index))
    }

    /// Indices not yet acknowledged, ascending.
    pub fn pending_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|index| !self.uploaded_chunks.contains(index))
            .collect()
    }

    pub fn next_pending(&self) -> Option<u32> {
        (0..self.total_chunks).find(|index| !self.uploaded_chunks.contains(index))
    }

    pub fn is_complete(&self) -> bool {
        self.uploaded_chunks.len() as u32 == self.total_chunks
    }

    /// Byte range `[start, end)` of one chunk.
    pub fn chunk_range(&self, chunk_index: u32) -> (u64, u64) {
        let start = chunk_index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.file_size);
        (start, end)
    }

    pub fn chunk_len(&self, chunk_index: u32) -> usize {
        let (start, end) = self.chunk_range(chunk_index);
        (end - start) as usize
    }
}

/// `max(1, ceil(file_size / chunk_size))`; an empty file is one empty chunk.
pub fn total_chunks_for(file_size: u64, chunk_size: u32) -> u32 {
    if file_size == 0 {
        return 1;
    }
    file_size.div_ceil(chunk_size as u64) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(file_size: u64, chunk_size: u32) -> UploadSession {
        UploadSession::persistent(
            "00112233aabbccdd".to_owned(),
            "data.bin".to_owned(),
            "/remote/inbox".to_owned(),
            file_size,
            chunk_size,
            ChronoDuration::hours(24),
        )
        .unwrap()
    }

    #[test]
    fn chunk_math_partitions_the_file() {
        let session = session(80 * 1024 + 5, 16 * 1024);
        assert_eq!(session.total_chunks, 6);
        let mut covered = 0u64;
        for index in 0..session.total_chunks {
            let (start, end) = session.chunk_range(index);
            assert_eq!(start, covered);
            assert!(end > start);
            covered = end;
        }
        assert_eq!(covered, session.file_size);
    }

    #[test]
    fn empty_file_still_has_one_chunk() {
        assert_eq!(total_chunks_for(0, 16 * 1024), 1);
        let session = session(0, 16 * 1024);
        assert_eq!(session.total_chunks, 1);
        assert_eq!(session.chunk_len(0), 0);
    }

    #[test]
    fn exact_multiple_has_no_tail_chunk() {
        assert_eq!(total_chunks_for(64 * 1024, 16 * 1024), 4);
        assert_eq!(total_chunks_for(64 * 1024 + 1, 16 * 1024), 5);
    }

    #[test]
    fn mark_uploaded_is_idempotent_and_ordered() {
        let mut session = session(64 * 1024, 16 * 1024);
        assert!(session.mark_uploaded(3).unwrap());
        assert!(session.mark_uploaded(1).unwrap());
        assert!(!session.mark_uploaded(3).unwrap());
        assert_eq!(
            session.uploaded_chunks.iter().copied().collect::<Vec<_>>(),
            vec![1, 3]
        );
        assert_eq!(session.pending_chunks(), vec![0, 2]);
        assert!(session.mark_uploaded(4).is_err());
    }

    #[test]
    fn pending_and_uploaded_partition_the_index_space() {
        let mut session = session(64 * 1024, 16 * 1024);
        for index in [2, 0] {
            session.mark_uploaded(index).unwrap();
        }
        let mut all: Vec<u32> = session.pending_chunks();
        all.extend(session.uploaded_chunks.iter().copied());
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
        assert!(!session.is_complete());
        session.mark_uploaded(1).unwrap();
        session.mark_uploaded(3).unwrap();
        assert!(session.is_complete());
        assert_eq!(session.next_pending(), None);
    }

    #[test]
    fn chunk_bounds_are_enforced() {
        assert!(matches!(
            UploadSession::ephemeral(
                "f".to_owned(),
                "/t".to_owned(),
                10,
                MIN_CHUNK_SIZE - 1,
                ChronoDuration::hours(1)
            ),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            UploadSession::ephemeral(
                "f".to_owned(),
                "/t".to_owned(),
                10,
                MAX_CHUNK_SIZE + 1,
                ChronoDuration::hours(1)
            ),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn layout_validation_rejects_oversized_legacy_chunk() {
        let mut session = session(1024 * 1024, 64 * 1024);
        assert!(session.is_layout_valid());
        session.chunk_size = MAX_CHUNK_SIZE + 1024;
        assert!(!session.is_layout_valid());
    }
}
