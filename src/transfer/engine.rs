//! Upload and download orchestration over the multiplexed connection.
//!
//! Small payloads go out as a single whole-file request. Everything else is
//! chunked: a session is created or resumed, K workers claim chunk indices
//! from a shared counter, each chunk is retried with linear backoff, and the
//! session store records every ack. Downloads run the init/chunk/finish
//! protocol with the server-assigned chunk size as the authority.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::error::{EngineError, Result};
use crate::protocol::command::Command;
use crate::protocol::message::{FileRequest, Operation};
use crate::transfer::progress::{ProgressCallback, ProgressTracker};
use crate::transfer::session::UploadSession;
use crate::transfer::store::{ResumableUploadStore, fingerprint};
use crate::transfer::strategy::{AdaptiveChunkStrategy, TransferSample, timeout_for_chunk};
use crate::transfer::{CHUNK_ALIGN, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

#[derive(Debug, Clone)]
pub struct TransferEngineConfig {
    /// Payloads at or below this go out as one UPLOAD_FILE request.
    pub whole_file_limit: usize,
    /// Hard cap on parallel chunk workers.
    pub max_concurrency: usize,
    /// Attempts per chunk (first try included).
    pub chunk_attempts: u32,
    /// Linear backoff unit between chunk retries.
    pub retry_delay: Duration,
    /// UPLOAD_END / finish timeout for ordinary files.
    pub end_timeout: Duration,
    /// UPLOAD_END timeout for large files.
    pub end_timeout_large: Duration,
    /// Persist upload sessions for resume.
    pub persist_sessions: bool,
}

impl Default for TransferEngineConfig {
    fn default() -> Self {
        TransferEngineConfig {
            whole_file_limit: 256 * 1024,
            max_concurrency: 6,
            chunk_attempts: 3,
            retry_delay: Duration::from_millis(500),
            end_timeout: Duration::from_secs(30),
            end_timeout_large: Duration::from_secs(120),
            persist_sessions: true,
        }
    }
}

/// Files above this always get at least two workers.
const TWO_WORKER_THRESHOLD: u64 = 32 * 1024 * 1024;
/// "Large file" bar for the extended end-of-upload timeout.
const LARGE_FILE_THRESHOLD: u64 = 32 * 1024 * 1024;

#[derive(Default)]
pub struct UploadOptions {
    /// Fixed chunk size; bypasses the adaptive recommendation.
    pub chunk_size: Option<u32>,
    /// Chunk even below the whole-file limit.
    pub force_chunked: bool,
    /// Override the engine-level session persistence switch.
    pub persist: Option<bool>,
    pub progress: Option<Arc<dyn ProgressCallback>>,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct DownloadOptions {
    /// Chunk size hint sent with the start request; the server's
    /// accepted_chunk_size wins.
    pub chunk_size_hint: Option<u32>,
    pub progress: Option<Arc<dyn ProgressCallback>>,
    pub cancel: CancellationToken,
}

pub struct TransferEngine {
    connection: Arc<Connection>,
    strategy: Arc<AdaptiveChunkStrategy>,
    store: Arc<ResumableUploadStore>,
    config: TransferEngineConfig,
}

impl TransferEngine {
    pub fn new(
        connection: Arc<Connection>,
        strategy: Arc<AdaptiveChunkStrategy>,
        store: Arc<ResumableUploadStore>,
        config: TransferEngineConfig,
    ) -> Arc<Self> {
        Arc::new(TransferEngine {
            connection,
            strategy,
            store,
            config,
        })
    }

    pub fn strategy(&self) -> &Arc<AdaptiveChunkStrategy> {
        &self.strategy
    }

    pub fn store(&self) -> &Arc<ResumableUploadStore> {
        &self.store
    }

    /// Upload `payload` as `filename` under `target_path`.
    pub async fn upload(
        self: &Arc<Self>,
        target_path: &str,
        filename: &str,
        payload: Bytes,
        options: UploadOptions,
    ) -> Result<()> {
        if options.cancel.is_cancelled() {
            return Err(EngineError::Aborted);
        }
        if !options.force_chunked && payload.len() <= self.config.whole_file_limit {
            self.upload_whole(target_path, filename, payload).await
        } else {
            self.upload_chunked(target_path, filename, payload, options)
                .await
        }
    }

    /// Single-request upload for small payloads.
    async fn upload_whole(&self, target_path: &str, filename: &str, payload: Bytes) -> Result<()> {
        let checksum = fingerprint(&payload).await;
        let request = FileRequest {
            file_size: Some(payload.len() as u64),
            data: Some(payload.to_vec()),
            checksum: Some(checksum),
            ..FileRequest::new(Operation::UploadFile)
                .with_path(target_path)
                .with_name(filename)
        };
        let response = self
            .connection
            .request_default(Command::UploadFile, &request)
            .await?;
        if !response.is_success() {
            return Err(EngineError::session(format!(
                "upload rejected: {}",
                response.message_or_default()
            )));
        }
        debug!(
            target: "transfer::engine",
            path = target_path,
            name = filename,
            bytes = payload.len(),
            "Whole-file upload complete"
        );
        Ok(())
    }

    async fn upload_chunked(
        self: &Arc<Self>,
        target_path: &str,
        filename: &str,
        payload: Bytes,
        options: UploadOptions,
    ) -> Result<()> {
        let file_size = payload.len() as u64;
        let chunk_size = match options.chunk_size {
            Some(fixed) => fixed.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE) / CHUNK_ALIGN * CHUNK_ALIGN,
            None => self.pick_chunk_size(file_size),
        };
        let persist = options.persist.unwrap_or(self.config.persist_sessions);

        let session = self
            .store
            .create_or_resume(filename, target_path, &payload, chunk_size, persist)
            .await?;
        info!(
            target: "transfer::engine",
            session = %session.session_id,
            file_size,
            chunk_size = session.chunk_size,
            total_chunks = session.total_chunks,
            "Starting chunked upload"
        );

        let init = FileRequest {
            file_size: Some(file_size),
            chunk_size: Some(session.chunk_size),
            total_chunks: Some(session.total_chunks),
            ..FileRequest::new(Operation::UploadReq)
                .with_path(target_path)
                .with_name(filename)
                .with_option("sessionId", &session.session_id)
        };
        let response = self
            .connection
            .request_default(Command::UploadReq, &init)
            .await?;
        if !response.is_success() {
            return Err(EngineError::session(format!(
                "upload init rejected: {}",
                response.message_or_default()
            )));
        }

        // Server-side resume is not negotiated yet: every chunk is sent on a
        // cold start, the store's ack set is client-side bookkeeping.
        let pending: Vec<u32> = (0..session.total_chunks).collect();
        self.run_upload_workers(&session, payload, pending, &options)
            .await?;

        let end = FileRequest {
            file_size: Some(file_size),
            total_chunks: Some(session.total_chunks),
            ..FileRequest::new(Operation::UploadEnd)
                .with_path(target_path)
                .with_name(filename)
                .with_option("sessionId", &session.session_id)
        };
        let end_timeout = if file_size > LARGE_FILE_THRESHOLD {
            self.config.end_timeout_large
        } else {
            self.config.end_timeout
        };
        let response = self
            .connection
            .request(Command::UploadEnd, &end, end_timeout)
            .await?;
        if !response.is_success() {
            // The session stays on disk for a future resume attempt.
            return Err(EngineError::session(format!(
                "upload finalize rejected: {}",
                response.message_or_default()
            )));
        }

        if let Err(err) = self.store.complete(&session.session_id) {
            warn!(
                target: "transfer::engine",
                session = %session.session_id,
                error = %err,
                "Completed upload but could not drop the session record"
            );
        }
        info!(
            target: "transfer::engine",
            session = %session.session_id,
            "Chunked upload complete"
        );
        Ok(())
    }

    async fn run_upload_workers(
        self: &Arc<Self>,
        session: &UploadSession,
        payload: Bytes,
        pending: Vec<u32>,
        options: &UploadOptions,
    ) -> Result<()> {
        let recommendation = self.strategy.recommendation();
        let mut workers = self
            .config
            .max_concurrency
            .min(recommendation.concurrency)
            .min(pending.len().max(1));
        if session.file_size > TWO_WORKER_THRESHOLD && pending.len() >= 2 {
            workers = workers.max(2);
        }

        let tracker = ProgressTracker::new(session.file_size, session.total_chunks as usize);
        let pending = Arc::new(pending);
        let claim = Arc::new(AtomicUsize::new(0));
        // Any worker failure cancels the siblings at their next claim.
        let abort = CancellationToken::new();

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let engine = Arc::clone(self);
            let session = session.clone();
            let payload = payload.clone();
            let pending = Arc::clone(&pending);
            let claim = Arc::clone(&claim);
            let tracker = Arc::clone(&tracker);
            let abort = abort.clone();
            let external = options.cancel.clone();
            let progress = options.progress.clone();

            handles.push(tokio::spawn(async move {
                loop {
                    if external.is_cancelled() {
                        return Err(EngineError::Aborted);
                    }
                    if abort.is_cancelled() {
                        return Ok(());
                    }
                    let slot = claim.fetch_add(1, Ordering::SeqCst);
                    let Some(&chunk_index) = pending.get(slot) else {
                        return Ok(());
                    };
                    let result = engine
                        .send_chunk(&session, &payload, chunk_index, &external, &tracker)
                        .await;
                    match result {
                        Ok(()) => {
                            if let Some(callback) = &progress {
                                tracker.maybe_emit(callback.as_ref()).await;
                            }
                        }
                        Err(err) => {
                            abort.cancel();
                            debug!(
                                target: "transfer::engine",
                                worker = worker_id,
                                chunk = chunk_index,
                                error = %err,
                                "Worker aborting upload"
                            );
                            return Err(err);
                        }
                    }
                }
            }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(EngineError::session(format!(
                            "upload worker panicked: {join_err}"
                        )));
                    }
                }
            }
        }
        if let Some(callback) = &options.progress {
            tracker.emit_final(callback.as_ref()).await;
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// One chunk, with retries. The session stays untouched on failure.
    async fn send_chunk(
        &self,
        session: &UploadSession,
        payload: &Bytes,
        chunk_index: u32,
        cancel: &CancellationToken,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<()> {
        let (start, end) = session.chunk_range(chunk_index);
        let data = payload.slice(start as usize..end as usize);
        let chunk_hash = fingerprint(&data).await;
        let timeout = timeout_for_chunk(data.len() as u32);

        tracker.start_chunk();
        let mut last_error: Option<EngineError> = None;
        for attempt in 0..self.config.chunk_attempts {
            if cancel.is_cancelled() {
                tracker.abandon_chunk();
                return Err(EngineError::Aborted);
            }
            if attempt > 0 {
                // Linear backoff between attempts.
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay * attempt) => {}
                    _ = cancel.cancelled() => {
                        tracker.abandon_chunk();
                        return Err(EngineError::Aborted);
                    }
                }
            }

            let request = FileRequest {
                data: Some(data.to_vec()),
                file_size: Some(session.file_size),
                ..FileRequest::new(Operation::UploadData)
                    .with_path(&session.target_path)
                    .with_name(&session.filename)
                    .with_chunk(chunk_index, session.total_chunks, chunk_hash.clone())
                    .with_option("sessionId", &session.session_id)
            };

            // The attempt's bytes count as progress while the request is on
            // the wire; a failed attempt rolls them back before the retry.
            tracker.add_bytes(data.len() as u64);
            let started = tokio::time::Instant::now();
            match self
                .connection
                .request(Command::UploadData, &request, timeout)
                .await
            {
                Ok(response) if response.is_success() => {
                    self.strategy.record_sample(TransferSample {
                        success: true,
                        duration: started.elapsed(),
                        bytes: data.len() as u64,
                        retries: attempt,
                    });
                    if let Err(err) = self.store.mark_chunk_uploaded(&session.session_id, chunk_index)
                    {
                        warn!(
                            target: "transfer::engine",
                            session = %session.session_id,
                            chunk = chunk_index,
                            error = %err,
                            "Could not record chunk ack"
                        );
                    }
                    tracker.complete_chunk();
                    return Ok(());
                }
                Ok(response) => {
                    tracker.rollback_bytes(data.len() as u64);
                    last_error = Some(EngineError::session(format!(
                        "chunk rejected: {}",
                        response.message_or_default()
                    )));
                }
                Err(err @ EngineError::Aborted) => {
                    tracker.rollback_bytes(data.len() as u64);
                    tracker.abandon_chunk();
                    return Err(err);
                }
                Err(err) => {
                    tracker.rollback_bytes(data.len() as u64);
                    last_error = Some(err);
                }
            }
            self.strategy.record_sample(TransferSample {
                success: false,
                duration: started.elapsed(),
                bytes: data.len() as u64,
                retries: attempt,
            });
            warn!(
                target: "transfer::engine",
                chunk = chunk_index,
                attempt = attempt + 1,
                max = self.config.chunk_attempts,
                "Chunk upload attempt failed"
            );
        }

        tracker.abandon_chunk();
        Err(EngineError::Transfer {
            chunk_index,
            source: Box::new(last_error.unwrap_or(EngineError::Aborted)),
        })
    }

    /// Adaptive size bounded by the file's size class.
    fn pick_chunk_size(&self, file_size: u64) -> u32 {
        let adaptive = self.strategy.recommendation().chunk_size;
        let cap = size_class_cap(file_size, adaptive);
        adaptive
            .min(cap)
            .clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
            .div_euclid(CHUNK_ALIGN)
            * CHUNK_ALIGN
    }

    /// Download `remote_path` fully into memory.
    pub async fn download(self: &Arc<Self>, remote_path: &str, options: DownloadOptions) -> Result<Vec<u8>> {
        let plan = self.download_start(remote_path, &options).await?;
        let slots: Arc<std::sync::Mutex<Vec<Option<Bytes>>>> = Arc::new(std::sync::Mutex::new(
            vec![None; plan.total_chunks as usize],
        ));

        let sink_slots = Arc::clone(&slots);
        self.run_download_workers(remote_path, &plan, &options, move |index, bytes| {
            let mut slots = sink_slots.lock().expect("download slots lock");
            let slot = &mut slots[index as usize];
            // At-most-once writes; duplicate chunks are dropped.
            if slot.is_none() {
                *slot = Some(bytes);
            }
        })
        .await?;

        self.download_finish(remote_path, &plan).await;

        let mut assembled = Vec::with_capacity(plan.file_size as usize);
        let mut slots = slots.lock().expect("download slots lock");
        for (index, slot) in slots.iter_mut().enumerate() {
            match slot.take() {
                Some(bytes) => assembled.extend_from_slice(&bytes),
                None => {
                    return Err(EngineError::IncompleteDownload {
                        missing_chunk: index as u32,
                    });
                }
            }
        }
        Ok(assembled)
    }

    /// Download as an in-order byte stream. Chunks arriving out of order are
    /// buffered until their turn; late or duplicate indices are dropped.
    pub async fn download_streaming(
        self: &Arc<Self>,
        remote_path: &str,
        options: DownloadOptions,
    ) -> Result<ReceiverStream<Result<Bytes>>> {
        let plan = self.download_start(remote_path, &options).await?;
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<(u32, Bytes)>();
        let (out_tx, out_rx) = mpsc::channel::<Result<Bytes>>(16);

        // Reorder task: strict file order toward the consumer.
        let total_chunks = plan.total_chunks;
        let reorder_out = out_tx.clone();
        let reorder = tokio::spawn(async move {
            let mut expected = 0u32;
            let mut queued: BTreeMap<u32, Bytes> = BTreeMap::new();
            while expected < total_chunks {
                let Some((index, bytes)) = chunk_rx.recv().await else {
                    return;
                };
                if index < expected || queued.contains_key(&index) {
                    debug!(
                        target: "transfer::engine",
                        index,
                        expected,
                        "Dropping late or duplicate download chunk"
                    );
                    continue;
                }
                queued.insert(index, bytes);
                while let Some(bytes) = queued.remove(&expected) {
                    if reorder_out.send(Ok(bytes)).await.is_err() {
                        return;
                    }
                    expected += 1;
                }
            }
        });

        let engine = Arc::clone(self);
        let remote_path = remote_path.to_owned();
        tokio::spawn(async move {
            let result = engine
                .run_download_workers(&remote_path, &plan, &options, move |index, bytes| {
                    let _ = chunk_tx.send((index, bytes));
                })
                .await;
            match result {
                Ok(()) => {
                    // All chunks delivered; let the reorderer drain, then
                    // close the server-side session.
                    let _ = reorder.await;
                    engine.download_finish(&remote_path, &plan).await;
                }
                Err(err) => {
                    reorder.abort();
                    // Consumer learns about the failure in-stream.
                    let _ = out_tx.send(Err(err)).await;
                }
            }
        });

        Ok(ReceiverStream::new(out_rx))
    }

    async fn download_start(
        &self,
        remote_path: &str,
        options: &DownloadOptions,
    ) -> Result<DownloadPlan> {
        let hint = options
            .chunk_size_hint
            .unwrap_or_else(|| self.strategy.recommendation().chunk_size);
        let request = FileRequest::new(Operation::DownloadReq)
            .with_path(remote_path)
            .with_option("action", "start")
            .with_option("chunkSize", hint.to_string());
        let response = self
            .connection
            .request_default(Command::DownloadReq, &request)
            .await?;
        if !response.is_success() {
            return Err(EngineError::session(format!(
                "download start rejected: {}",
                response.message_or_default()
            )));
        }
        let session_id = response
            .session_id
            .clone()
            .ok_or_else(|| EngineError::schema("download start response lacks session_id"))?;
        let accepted_chunk_size = response
            .accepted_chunk_size
            .ok_or_else(|| EngineError::schema("download start response lacks accepted_chunk_size"))?;
        let file_size = response.file_size.unwrap_or(0);
        // total_chunks = 0 means an empty file; it still occupies one chunk.
        let total_chunks = response.total_chunks.unwrap_or(0).max(1);
        info!(
            target: "transfer::engine",
            path = remote_path,
            session = %session_id,
            accepted_chunk_size,
            total_chunks,
            file_size,
            "Download session opened"
        );
        Ok(DownloadPlan {
            session_id,
            accepted_chunk_size,
            total_chunks,
            file_size,
        })
    }

    async fn run_download_workers(
        self: &Arc<Self>,
        remote_path: &str,
        plan: &DownloadPlan,
        options: &DownloadOptions,
        sink: impl Fn(u32, Bytes) + Send + Sync + 'static,
    ) -> Result<()> {
        let recommendation = self.strategy.recommendation();
        let workers = self
            .config
            .max_concurrency
            .min(recommendation.concurrency)
            .min(plan.total_chunks as usize)
            .max(1);

        let tracker = ProgressTracker::new(plan.file_size, plan.total_chunks as usize);
        let claim = Arc::new(AtomicUsize::new(0));
        let abort = CancellationToken::new();
        let sink = Arc::new(sink);

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let engine = Arc::clone(self);
            let plan = plan.clone();
            let remote_path = remote_path.to_owned();
            let claim = Arc::clone(&claim);
            let abort = abort.clone();
            let external = options.cancel.clone();
            let tracker = Arc::clone(&tracker);
            let progress = options.progress.clone();
            let sink = Arc::clone(&sink);

            handles.push(tokio::spawn(async move {
                loop {
                    if external.is_cancelled() {
                        return Err(EngineError::Aborted);
                    }
                    if abort.is_cancelled() {
                        return Ok(());
                    }
                    let index = claim.fetch_add(1, Ordering::SeqCst) as u32;
                    if index >= plan.total_chunks {
                        return Ok(());
                    }
                    match engine
                        .fetch_chunk(&remote_path, &plan, index, &external, &tracker)
                        .await
                    {
                        Ok(bytes) => {
                            sink(index, bytes);
                            if let Some(callback) = &progress {
                                tracker.maybe_emit(callback.as_ref()).await;
                            }
                        }
                        Err(err) => {
                            abort.cancel();
                            return Err(err);
                        }
                    }
                }
            }));
        }

        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        first_error = Some(EngineError::session(format!(
                            "download worker panicked: {join_err}"
                        )));
                    }
                }
            }
        }
        if let Some(callback) = &options.progress {
            tracker.emit_final(callback.as_ref()).await;
        }

        match first_error {
            Some(err) => {
                self.download_abort(remote_path, plan).await;
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn fetch_chunk(
        &self,
        remote_path: &str,
        plan: &DownloadPlan,
        index: u32,
        cancel: &CancellationToken,
        tracker: &Arc<ProgressTracker>,
    ) -> Result<Bytes> {
        let timeout = timeout_for_chunk(plan.accepted_chunk_size);
        tracker.start_chunk();
        let mut last_error: Option<EngineError> = None;
        for attempt in 0..self.config.chunk_attempts {
            if cancel.is_cancelled() {
                tracker.abandon_chunk();
                return Err(EngineError::Aborted);
            }
            if attempt > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.retry_delay * attempt) => {}
                    _ = cancel.cancelled() => {
                        tracker.abandon_chunk();
                        return Err(EngineError::Aborted);
                    }
                }
            }

            let request = FileRequest::new(Operation::DownloadReq)
                .with_path(remote_path)
                .with_option("action", "chunk")
                .with_option("sessionId", &plan.session_id)
                .with_option("chunkIndex", index.to_string());

            let started = tokio::time::Instant::now();
            match self
                .connection
                .request(Command::DownloadReq, &request, timeout)
                .await
            {
                Ok(response) if response.is_success() => {
                    let Some(data) = response.data else {
                        last_error = Some(EngineError::schema("chunk response carries no data"));
                        continue;
                    };
                    self.strategy.record_sample(TransferSample {
                        success: true,
                        duration: started.elapsed(),
                        bytes: data.len() as u64,
                        retries: attempt,
                    });
                    // Downloaded bytes only materialise with a successful
                    // response, so they are counted here, not speculatively.
                    tracker.add_bytes(data.len() as u64);
                    tracker.complete_chunk();
                    return Ok(Bytes::from(data));
                }
                Ok(response) => {
                    last_error = Some(EngineError::session(format!(
                        "chunk request rejected: {}",
                        response.message_or_default()
                    )));
                }
                Err(err @ EngineError::Aborted) => {
                    tracker.abandon_chunk();
                    return Err(err);
                }
                Err(err) => last_error = Some(err),
            }
            self.strategy.record_sample(TransferSample {
                success: false,
                duration: started.elapsed(),
                bytes: plan.accepted_chunk_size as u64,
                retries: attempt,
            });
        }
        tracker.abandon_chunk();
        Err(EngineError::Transfer {
            chunk_index: index,
            source: Box::new(last_error.unwrap_or(EngineError::Aborted)),
        })
    }

    async fn download_finish(&self, remote_path: &str, plan: &DownloadPlan) {
        let request = FileRequest::new(Operation::DownloadReq)
            .with_path(remote_path)
            .with_option("action", "finish")
            .with_option("sessionId", &plan.session_id)
            .with_option("totalChunks", plan.total_chunks.to_string())
            .with_option("fileSize", plan.file_size.to_string());
        match self
            .connection
            .request_default(Command::DownloadReq, &request)
            .await
        {
            Ok(response) if response.is_success() => {}
            Ok(response) => {
                warn!(
                    target: "transfer::engine",
                    session = %plan.session_id,
                    message = response.message_or_default(),
                    "Download finish reported failure"
                );
            }
            Err(err) => {
                warn!(
                    target: "transfer::engine",
                    session = %plan.session_id,
                    error = %err,
                    "Download finish failed"
                );
            }
        }
    }

    async fn download_abort(&self, remote_path: &str, plan: &DownloadPlan) {
        let request = FileRequest::new(Operation::DownloadReq)
            .with_path(remote_path)
            .with_option("action", "abort")
            .with_option("sessionId", &plan.session_id);
        if let Err(err) = self
            .connection
            .request_default(Command::DownloadReq, &request)
            .await
        {
            warn!(
                target: "transfer::engine",
                session = %plan.session_id,
                error = %err,
                "Download abort notification failed"
            );
        }
    }
}

#[derive(Debug, Clone)]
struct DownloadPlan {
    session_id: String,
    accepted_chunk_size: u32,
    total_chunks: u32,
    file_size: u64,
}

/// Size-class caps from the transfer playbook: bigger files get bigger
/// chunks, tiny files stay under the adaptive value.
fn size_class_cap(file_size: u64, adaptive: u32) -> u32 {
    const MIB: u64 = 1024 * 1024;
    match file_size {
        s if s >= 200 * MIB => 512 * 1024,
        s if s >= 50 * MIB => 256 * 1024,
        s if s >= 10 * MIB => 192 * 1024,
        s if s >= MIB => 160 * 1024,
        s if s >= 128 * 1024 => 128 * 1024,
        _ => adaptive.min(64 * 1024),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_class_caps_follow_the_table() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(size_class_cap(300 * MIB, 1024 * 1024), 512 * 1024);
        assert_eq!(size_class_cap(80 * MIB, 1024 * 1024), 256 * 1024);
        assert_eq!(size_class_cap(20 * MIB, 1024 * 1024), 192 * 1024);
        assert_eq!(size_class_cap(5 * MIB, 1024 * 1024), 160 * 1024);
        assert_eq!(size_class_cap(512 * 1024, 1024 * 1024), 128 * 1024);
        assert_eq!(size_class_cap(64 * 1024, 1024 * 1024), 64 * 1024);
        assert_eq!(size_class_cap(64 * 1024, 32 * 1024), 32 * 1024);
    }
}
