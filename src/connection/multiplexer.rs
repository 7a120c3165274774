//! Request/response multiplexing over a single framed stream.
//!
//! Outbound requests get a 16-bit sequence number and a pending slot; the
//! reader task feeds inbound frames back in and the matching slot resolves.
//! Responses may arrive in any order, sequence matching is authoritative.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{EngineError, Result};
use crate::protocol::codec::MessageCodec;
use crate::protocol::command::Command;
use crate::protocol::frame::{self, MAX_PAYLOAD_LEN};
use crate::protocol::message::{FileRequest, FileResponse};

/// Hard cap on live slots.
pub const MAX_CONCURRENT_REQUESTS: usize = 1000;
/// How many sequence numbers the allocator probes before giving up.
const SEQ_PROBE_LIMIT: usize = 128;
/// Slots older than this are reaped by the emergency cleanup.
const STALE_SLOT_AGE: Duration = Duration::from_secs(60);
/// Receive buffer bound: 1.5x the largest possible frame.
const RECV_BUFFER_LIMIT: usize = MAX_PAYLOAD_LEN + (MAX_PAYLOAD_LEN / 2);

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub max_concurrent: usize,
    pub default_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            max_concurrent: MAX_CONCURRENT_REQUESTS,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Timings recorded for a completed request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestMetrics {
    pub encode_ms: f64,
    pub frame_ms: f64,
    pub payload_bytes: usize,
    pub frame_bytes: usize,
    pub round_trip_ms: f64,
}

/// Aggregate counters, readable at any time.
#[derive(Debug, Default)]
pub struct MuxStats {
    pub sent: AtomicU64,
    pub resolved: AtomicU64,
    pub timed_out: AtomicU64,
    pub cancelled: AtomicU64,
    pub dropped_responses: AtomicU64,
    pub emergency_cleanups: AtomicU64,
}

struct PendingSlot {
    tx: oneshot::Sender<Result<FileResponse>>,
    created_at: Instant,
}

pub struct Multiplexer {
    config: MuxConfig,
    codec: MessageCodec,
    seq_counter: AtomicU32,
    pending: DashMap<u16, PendingSlot>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    stats: MuxStats,
}

impl Multiplexer {
    pub fn new(config: MuxConfig, codec: MessageCodec) -> Arc<Self> {
        Arc::new(Multiplexer {
            config,
            codec,
            seq_counter: AtomicU32::new(0),
            pending: DashMap::new(),
            writer: Mutex::new(None),
            stats: MuxStats::default(),
        })
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub fn stats(&self) -> &MuxStats {
        &self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Install the write half of a fresh connection.
    pub async fn set_writer(&self, writer: OwnedWriteHalf) {
        *self.writer.lock().await = Some(writer);
    }

    /// Drop the writer and reject everything in flight.
    pub async fn detach(&self, reason: &str) {
        *self.writer.lock().await = None;
        self.fail_all(reason);
    }

    /// Send a request and await its response.
    ///
    /// One frame, one write; responses are matched by sequence number, so
    /// concurrent callers may resolve in any order.
    pub async fn send(
        &self,
        command: Command,
        request: &FileRequest,
        timeout: Duration,
    ) -> Result<FileResponse> {
        if self.pending.len() >= self.config.max_concurrent {
            return Err(EngineError::Backpressure {
                inflight: self.pending.len(),
                limit: self.config.max_concurrent,
            });
        }

        let encode_started = Instant::now();
        let (format, payload) = self.codec.smart_encode(request)?;
        let encode_ms = encode_started.elapsed().as_secs_f64() * 1000.0;

        let (tx, rx) = oneshot::channel();
        let seq = self.allocate_seq(tx)?;

        let frame_started = Instant::now();
        let encoded = match frame::encode(command, format, &payload, seq) {
            Ok(encoded) => encoded,
            Err(err) => {
                self.pending.remove(&seq);
                return Err(err);
            }
        };
        let frame_ms = frame_started.elapsed().as_secs_f64() * 1000.0;

        if let Err(err) = self.write_frame(&encoded).await {
            self.pending.remove(&seq);
            return Err(err);
        }
        self.stats.sent.fetch_add(1, Ordering::Relaxed);

        let sent_at = Instant::now();
        let outcome = tokio::time::timeout(timeout, rx).await;
        match outcome {
            Ok(Ok(result)) => {
                let metrics = RequestMetrics {
                    encode_ms,
                    frame_ms,
                    payload_bytes: payload.len(),
                    frame_bytes: encoded.len(),
                    round_trip_ms: sent_at.elapsed().as_secs_f64() * 1000.0,
                };
                trace!(
                    target: "connection::mux",
                    seq,
                    command = command.as_str(),
                    payload_bytes = metrics.payload_bytes,
                    frame_bytes = metrics.frame_bytes,
                    round_trip_ms = metrics.round_trip_ms,
                    "Request resolved"
                );
                self.stats.resolved.fetch_add(1, Ordering::Relaxed);
                result
            }
            // Sender dropped: the slot was reaped by cleanup or disconnect.
            Ok(Err(_)) => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::Disconnected(
                    "request slot was reaped".to_owned(),
                ))
            }
            Err(_) => {
                self.pending.remove(&seq);
                self.stats.timed_out.fetch_add(1, Ordering::Relaxed);
                Err(EngineError::Timeout {
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Feed one inbound frame. Unmatched sequence numbers are logged and
    /// dropped.
    pub fn handle_frame(&self, frame: frame::Frame) {
        let response = match self.codec.auto_decode_response(&frame.payload, frame.format) {
            Ok(response) => response,
            Err(err) => {
                // Only this caller is poisoned, not the connection.
                if let Some((_, slot)) = self.pending.remove(&frame.seq) {
                    let _ = slot.tx.send(Err(err));
                } else {
                    warn!(
                        target: "connection::mux",
                        seq = frame.seq,
                        error = %err,
                        "Undeliverable malformed response"
                    );
                }
                return;
            }
        };

        match self.pending.remove(&frame.seq) {
            Some((_, slot)) => {
                let _ = slot.tx.send(Ok(response));
            }
            None => {
                self.stats.dropped_responses.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "connection::mux",
                    seq = frame.seq,
                    command = frame.command.as_str(),
                    "Response with no pending request, dropping"
                );
            }
        }
    }

    /// Reject every in-flight request; used on disconnect.
    pub fn fail_all(&self, reason: &str) {
        let seqs: Vec<u16> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut rejected = 0usize;
        for seq in seqs {
            if let Some((_, slot)) = self.pending.remove(&seq) {
                let _ = slot.tx.send(Err(EngineError::Disconnected(reason.to_owned())));
                rejected += 1;
            }
        }
        if rejected > 0 {
            debug!(
                target: "connection::mux",
                rejected,
                reason,
                "Rejected in-flight requests"
            );
        }
    }

    fn allocate_seq(&self, tx: oneshot::Sender<Result<FileResponse>>) -> Result<u16> {
        match self.try_probe(tx) {
            Ok(seq) => Ok(seq),
            Err(tx) => {
                // Sequence space is congested; reap slots whose callers have
                // long since timed out, then try once more.
                self.emergency_cleanup();
                self.try_probe(tx).map_err(|_| EngineError::Backpressure {
                    inflight: self.pending.len(),
                    limit: self.config.max_concurrent,
                })
            }
        }
    }

    /// Probe forward from the counter for a free sequence number. Returns
    /// the sender back on exhaustion so the caller can retry.
    fn try_probe(
        &self,
        tx: oneshot::Sender<Result<FileResponse>>,
    ) -> std::result::Result<u16, oneshot::Sender<Result<FileResponse>>> {
        for _ in 0..SEQ_PROBE_LIMIT {
            let seq = (self.seq_counter.fetch_add(1, Ordering::Relaxed) & 0xFFFF) as u16;
            match self.pending.entry(seq) {
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(PendingSlot {
                        tx,
                        created_at: Instant::now(),
                    });
                    return Ok(seq);
                }
                dashmap::mapref::entry::Entry::Occupied(_) => {}
            }
        }
        Err(tx)
    }

    fn emergency_cleanup(&self) {
        self.stats.emergency_cleanups.fetch_add(1, Ordering::Relaxed);
        let stale: Vec<u16> = self
            .pending
            .iter()
            .filter(|entry| entry.value().created_at.elapsed() > STALE_SLOT_AGE)
            .map(|entry| *entry.key())
            .collect();
        let count = stale.len();
        for seq in stale {
            if let Some((_, slot)) = self.pending.remove(&seq) {
                let _ = slot.tx.send(Err(EngineError::Timeout {
                    elapsed_ms: STALE_SLOT_AGE.as_millis() as u64,
                }));
            }
        }
        warn!(
            target: "connection::mux",
            reaped = count,
            remaining = self.pending.len(),
            "Emergency cleanup of stale request slots"
        );
    }

    async fn write_frame(&self, encoded: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| EngineError::Disconnected("no active connection".to_owned()))?;
        writer.write_all(encoded).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// Inbound byte accumulator: a chunk list with a running total, flattened
/// only when the parser actually needs a contiguous view.
pub struct RecvBuffer {
    chunks: VecDeque<Bytes>,
    total: usize,
}

impl RecvBuffer {
    pub fn new() -> Self {
        RecvBuffer {
            chunks: VecDeque::new(),
            total: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Append bytes. If the buffer overflows the bound, everything before
    /// the last magic occurrence is discarded, preserving at most one
    /// (possibly incomplete) trailing frame.
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.total += data.len();
        self.chunks.push_back(data);
        if self.total > RECV_BUFFER_LIMIT {
            let flat = self.contiguous().to_vec();
            let keep_from = frame::rfind_magic(&flat).unwrap_or(flat.len());
            warn!(
                target: "connection::mux",
                buffered = flat.len(),
                discarded = keep_from,
                "Receive buffer overflow, salvaging trailing frame"
            );
            self.chunks.clear();
            self.total = flat.len() - keep_from;
            if self.total > 0 {
                self.chunks.push_back(Bytes::copy_from_slice(&flat[keep_from..]));
            }
        }
    }

    /// A contiguous view of everything buffered. Collapses the chunk list
    /// into a single chunk when more than one is held.
    pub fn contiguous(&mut self) -> &[u8] {
        if self.chunks.len() > 1 {
            let mut flat = BytesMut::with_capacity(self.total);
            for chunk in &self.chunks {
                flat.extend_from_slice(chunk);
            }
            self.chunks.clear();
            self.chunks.push_back(flat.freeze());
        }
        self.chunks.front().map(|b| b.as_ref()).unwrap_or(&[])
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, mut n: usize) {
        n = n.min(self.total);
        self.total -= n;
        while n > 0 {
            let front = self.chunks.front_mut().expect("consume within bounds");
            if front.len() > n {
                front.advance(n);
                return;
            }
            n -= front.len();
            self.chunks.pop_front();
        }
    }
}

impl Default for RecvBuffer {
    fn default() -> Self {
        RecvBuffer::new()
    }
}
