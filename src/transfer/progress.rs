//! Throttled progress reporting for transfers.
//!
//! Byte counters are atomics so concurrent chunk workers can report without
//! coordination; speed comes from a sliding window; callbacks fire at most
//! once per throttle interval plus one final event.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

/// Minimum spacing between progress callbacks.
pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

/// Snapshot sent to callbacks.
#[derive(Clone)]
pub struct ProgressUpdate {
    pub total_size: u64,
    pub transferred: u64,
    /// 0.0 - 1.0
    pub progress: f64,
    pub speed_bytes_per_sec: u64,
    pub eta_seconds: Option<u64>,
    pub total_chunks: usize,
    pub completed_chunks: usize,
    pub active_chunks: usize,
}

impl std::fmt::Debug for ProgressUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Progress: {:.1}% ({} / {}) @ {}/s | chunks {}/{} ({} active)",
            self.progress * 100.0,
            format_bytes(self.transferred),
            format_bytes(self.total_size),
            format_bytes(self.speed_bytes_per_sec),
            self.completed_chunks,
            self.total_chunks,
            self.active_chunks,
        )
    }
}

impl ProgressUpdate {
    fn new(
        total_size: u64,
        transferred: u64,
        speed: u64,
        total_chunks: usize,
        completed_chunks: usize,
        active_chunks: usize,
    ) -> Self {
        let progress = if total_size > 0 {
            (transferred as f64 / total_size as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };
        let eta_seconds = if speed > 0 && transferred < total_size {
            Some((total_size - transferred) / speed)
        } else {
            None
        };
        ProgressUpdate {
            total_size,
            transferred,
            progress,
            speed_bytes_per_sec: speed,
            eta_seconds,
            total_chunks,
            completed_chunks,
            active_chunks,
        }
    }
}

/// Human-readable byte count for log lines.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Receiver of progress events.
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, update: ProgressUpdate);
}

/// Closure adapter.
pub struct FnProgress<F>(pub F);

impl<F> ProgressCallback for FnProgress<F>
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn on_progress(&self, update: ProgressUpdate) {
        (self.0)(update)
    }
}

impl<T: ProgressCallback> ProgressCallback for Arc<T> {
    fn on_progress(&self, update: ProgressUpdate) {
        (**self).on_progress(update)
    }
}

/// Sliding-window speed estimate.
struct SpeedCalculator {
    samples: Vec<(Instant, u64)>,
    window: Duration,
}

impl SpeedCalculator {
    fn new() -> Self {
        SpeedCalculator {
            samples: Vec::with_capacity(32),
            window: Duration::from_secs(10),
        }
    }

    fn record_and_calculate(&mut self, total_bytes: u64) -> u64 {
        let now = Instant::now();
        self.samples.push((now, total_bytes));
        let cutoff = now - self.window;
        self.samples.retain(|(t, _)| *t >= cutoff);

        if self.samples.len() >= 2 {
            let (oldest_time, oldest_bytes) = self.samples[0];
            let elapsed = now.duration_since(oldest_time);
            if elapsed.as_millis() > 0 {
                let diff = total_bytes.saturating_sub(oldest_bytes);
                return (diff as f64 / elapsed.as_secs_f64()) as u64;
            }
        }
        0
    }
}

/// Shared tracker for one transfer.
pub struct ProgressTracker {
    total_size: u64,
    total_chunks: usize,
    transferred: AtomicU64,
    completed_chunks: AtomicU64,
    active_chunks: AtomicU64,
    speed: RwLock<SpeedCalculator>,
    /// Milliseconds (since `origin`) of the last emitted event.
    last_emit_ms: AtomicU64,
    origin: Instant,
}

impl ProgressTracker {
    pub fn new(total_size: u64, total_chunks: usize) -> Arc<Self> {
        Arc::new(ProgressTracker {
            total_size,
            total_chunks,
            transferred: AtomicU64::new(0),
            completed_chunks: AtomicU64::new(0),
            active_chunks: AtomicU64::new(0),
            speed: RwLock::new(SpeedCalculator::new()),
            last_emit_ms: AtomicU64::new(u64::MAX),
            origin: Instant::now(),
        })
    }

    pub fn start_chunk(&self) {
        self.active_chunks.fetch_add(1, Ordering::SeqCst);
    }

    /// Count bytes of an attempt that is on the wire. Paired with
    /// `rollback_bytes` if the attempt fails.
    pub fn add_bytes(&self, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::SeqCst);
    }

    /// Undo the bytes of a failed attempt before its retry.
    pub fn rollback_bytes(&self, bytes: u64) {
        self.transferred.fetch_sub(bytes, Ordering::SeqCst);
    }

    /// The chunk's bytes were acknowledged (already counted via
    /// `add_bytes`).
    pub fn complete_chunk(&self) {
        self.active_chunks.fetch_sub(1, Ordering::SeqCst);
        self.completed_chunks.fetch_add(1, Ordering::SeqCst);
    }

    /// The chunk is given up on; it leaves the active set without counting
    /// as completed.
    pub fn abandon_chunk(&self) {
        self.active_chunks.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    pub fn completed_chunks(&self) -> usize {
        self.completed_chunks.load(Ordering::SeqCst) as usize
    }

    /// Emit to the callback if the throttle interval has elapsed.
    pub async fn maybe_emit(&self, callback: &dyn ProgressCallback) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let last = self.last_emit_ms.load(Ordering::Relaxed);
        if last != u64::MAX && now_ms.saturating_sub(last) < PROGRESS_THROTTLE.as_millis() as u64 {
            return;
        }
        // One worker wins the emit; the rest skip.
        if self
            .last_emit_ms
            .compare_exchange(last, now_ms, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        callback.on_progress(self.snapshot().await);
    }

    /// The unconditional final event.
    pub async fn emit_final(&self, callback: &dyn ProgressCallback) {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        self.last_emit_ms.store(now_ms, Ordering::SeqCst);
        callback.on_progress(self.snapshot().await);
    }

    async fn snapshot(&self) -> ProgressUpdate {
        let transferred = self.transferred();
        let speed = {
            let mut calc = self.speed.write().await;
            calc.record_and_calculate(transferred)
        };
        ProgressUpdate::new(
            self.total_size,
            transferred,
            speed,
            self.total_chunks,
            self.completed_chunks(),
            self.active_chunks.load(Ordering::SeqCst) as usize,
        )
    }
}
