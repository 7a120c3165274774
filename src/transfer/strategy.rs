//! Adaptive chunk sizing from a moving window of transfer outcomes.
//!
//! Workers feed per-chunk samples in; the strategy derives throughput, error
//! rate and a coarse network-quality label, and recommends the next chunk
//! size, worker count and per-request timeout. All sizes stay inside the
//! protocol-safe bounds and on 1 KiB alignment.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transfer::{CHUNK_ALIGN, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

const MIB: f64 = (1024 * 1024) as f64;

#[derive(Debug, Clone, Copy)]
pub struct TransferSample {
    pub success: bool,
    pub duration: Duration,
    pub bytes: u64,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NetworkQuality {
    VeryPoor,
    Poor,
    Moderate,
    Good,
    Excellent,
}

impl NetworkQuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkQuality::VeryPoor => "very_poor",
            NetworkQuality::Poor => "poor",
            NetworkQuality::Moderate => "moderate",
            NetworkQuality::Good => "good",
            NetworkQuality::Excellent => "excellent",
        }
    }

    fn chunk_size(&self) -> u32 {
        match self {
            NetworkQuality::Excellent => 1024 * 1024,
            NetworkQuality::Good => 512 * 1024,
            NetworkQuality::Moderate => 256 * 1024,
            NetworkQuality::Poor => 128 * 1024,
            NetworkQuality::VeryPoor => 64 * 1024,
        }
    }

    fn concurrency(&self) -> usize {
        match self {
            NetworkQuality::Excellent => 6,
            NetworkQuality::Good => 4,
            NetworkQuality::Moderate => 3,
            NetworkQuality::Poor => 2,
            NetworkQuality::VeryPoor => 1,
        }
    }
}

/// What the engine gets back for the next batch of chunks.
#[derive(Debug, Clone, Copy)]
pub struct Recommendation {
    pub chunk_size: u32,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub quality: NetworkQuality,
}

#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Ring buffer length.
    pub window: usize,
    /// Error rate above which auto-adjustment shrinks the chunk size.
    pub target_error_rate: f64,
    /// Throughput (bytes/s) whose 1.5x excess lets the chunk size grow.
    pub target_throughput: f64,
    pub auto_adjust: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig {
            window: 10,
            target_error_rate: 0.05,
            target_throughput: 2.0 * MIB,
            auto_adjust: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WindowStats {
    pub samples: usize,
    pub throughput: f64,
    pub error_rate: f64,
    pub total_retries: u32,
}

pub struct AdaptiveChunkStrategy {
    config: StrategyConfig,
    samples: Mutex<VecDeque<TransferSample>>,
    current_chunk_size: AtomicU32,
}

impl AdaptiveChunkStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        AdaptiveChunkStrategy {
            samples: Mutex::new(VecDeque::with_capacity(config.window)),
            current_chunk_size: AtomicU32::new(DEFAULT_CHUNK_SIZE),
            config,
        }
    }

    /// Workers call this after every chunk attempt, concurrently.
    pub fn record_sample(&self, sample: TransferSample) {
        let mut samples = self.samples.lock().expect("strategy samples lock");
        if samples.len() == self.config.window {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    pub fn window_stats(&self) -> WindowStats {
        let samples = self.samples.lock().expect("strategy samples lock");
        if samples.is_empty() {
            return WindowStats::default();
        }
        let total = samples.len();
        let failed = samples.iter().filter(|s| !s.success).count();
        let bytes: u64 = samples.iter().filter(|s| s.success).map(|s| s.bytes).sum();
        let elapsed: f64 = samples
            .iter()
            .filter(|s| s.success)
            .map(|s| s.duration.as_secs_f64())
            .sum();
        let throughput = if elapsed > 0.0 {
            bytes as f64 / elapsed
        } else {
            0.0
        };
        WindowStats {
            samples: total,
            throughput,
            error_rate: failed as f64 / total as f64,
            total_retries: samples.iter().map(|s| s.retries).sum(),
        }
    }

    /// Coarse label from the window thresholds.
    pub fn quality(&self) -> NetworkQuality {
        let stats = self.window_stats();
        if stats.samples == 0 {
            return NetworkQuality::Moderate;
        }
        let throughput = stats.throughput;
        let errors = stats.error_rate;
        if throughput >= 10.0 * MIB && errors < 0.01 {
            NetworkQuality::Excellent
        } else if throughput >= 5.0 * MIB && errors < 0.03 {
            NetworkQuality::Good
        } else if throughput >= 1.0 * MIB && errors < 0.05 {
            NetworkQuality::Moderate
        } else if throughput >= 0.5 * MIB && errors < 0.10 {
            NetworkQuality::Poor
        } else {
            NetworkQuality::VeryPoor
        }
    }

    /// The quality-indexed chunk size, clamped and 1 KiB aligned.
    pub fn optimal_chunk_size(&self) -> u32 {
        clamp_align(self.quality().chunk_size())
    }

    pub fn current_chunk_size(&self) -> u32 {
        self.current_chunk_size.load(Ordering::Relaxed)
    }

    /// Recommend size, concurrency and timeout for the next chunk batch.
    ///
    /// The size walks from the current value toward the quality target in
    /// bounded steps so one noisy window cannot whipsaw the transfer.
    pub fn recommendation(&self) -> Recommendation {
        let quality = self.quality();
        let target = clamp_align(quality.chunk_size());
        let chunk_size = self.step_toward(target);
        Recommendation {
            chunk_size,
            concurrency: quality.concurrency(),
            request_timeout: timeout_for_chunk(chunk_size),
            quality,
        }
    }

    /// One auto-adjustment round: shrink on high error rate, grow on
    /// comfortable throughput, never more than 20% either way.
    pub fn apply_adjustment(&self) {
        let stats = self.window_stats();
        if stats.samples < 3 {
            return;
        }
        let current = self.current_chunk_size();
        let adjusted = if stats.error_rate > self.config.target_error_rate {
            (current as f64 * 0.8) as u32
        } else if stats.throughput > self.config.target_throughput * 1.5 {
            (current as f64 * 1.2) as u32
        } else {
            return;
        };
        let adjusted = clamp_align(adjusted);
        if adjusted != current {
            debug!(
                target: "transfer::strategy",
                previous = current,
                current = adjusted,
                error_rate = stats.error_rate,
                throughput = stats.throughput,
                "Auto-adjusted chunk size"
            );
            self.current_chunk_size.store(adjusted, Ordering::Relaxed);
        }
    }

    /// Run `apply_adjustment` on a timer until the token cancels. A no-op
    /// handle is returned when auto-adjustment is disabled.
    pub fn spawn_auto_adjust(
        self: &std::sync::Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let strategy = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            if !strategy.config.auto_adjust {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => strategy.apply_adjustment(),
                }
            }
        })
    }

    fn step_toward(&self, target: u32) -> u32 {
        let current = self.current_chunk_size();
        let max_step = (current as f64 * 0.2) as u32;
        let next = if target > current {
            current.saturating_add(max_step.max(CHUNK_ALIGN)).min(target)
        } else if target < current {
            current.saturating_sub(max_step.max(CHUNK_ALIGN)).max(target)
        } else {
            current
        };
        let next = clamp_align(next);
        self.current_chunk_size.store(next, Ordering::Relaxed);
        next
    }
}

impl Default for AdaptiveChunkStrategy {
    fn default() -> Self {
        AdaptiveChunkStrategy::new(StrategyConfig::default())
    }
}

/// Per-chunk request timeout grows with chunk size.
pub fn timeout_for_chunk(chunk_size: u32) -> Duration {
    if chunk_size > 512 * 1024 {
        Duration::from_secs(120)
    } else {
        Duration::from_secs(60)
    }
}

fn clamp_align(size: u32) -> u32 {
    let clamped = size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    (clamped / CHUNK_ALIGN) * CHUNK_ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(strategy: &AdaptiveChunkStrategy, count: usize, success: bool, bytes: u64, ms: u64) {
        for _ in 0..count {
            strategy.record_sample(TransferSample {
                success,
                duration: Duration::from_millis(ms),
                bytes,
                retries: if success { 0 } else { 1 },
            });
        }
    }

    #[test]
    fn quality_ladder_follows_thresholds() {
        let strategy = AdaptiveChunkStrategy::default();
        assert_eq!(strategy.quality(), NetworkQuality::Moderate);

        // 16 MiB/s clean: excellent.
        feed(&strategy, 10, true, 16 * 1024 * 1024, 1000);
        assert_eq!(strategy.quality(), NetworkQuality::Excellent);
        assert_eq!(strategy.optimal_chunk_size(), 1024 * 1024);

        // A lossy window: everything fails.
        feed(&strategy, 10, false, 0, 1000);
        assert_eq!(strategy.quality(), NetworkQuality::VeryPoor);
        assert_eq!(strategy.optimal_chunk_size(), 64 * 1024);
    }

    #[test]
    fn window_is_bounded() {
        let strategy = AdaptiveChunkStrategy::default();
        feed(&strategy, 50, true, 1024, 10);
        assert_eq!(strategy.window_stats().samples, 10);
    }

    #[test]
    fn recommendation_steps_are_bounded() {
        let strategy = AdaptiveChunkStrategy::default();
        // Push the window to excellent; target jumps to 1 MiB but a single
        // recommendation may move at most 20% from 256 KiB.
        feed(&strategy, 10, true, 16 * 1024 * 1024, 1000);
        let first = strategy.recommendation();
        assert!(first.chunk_size <= DEFAULT_CHUNK_SIZE + DEFAULT_CHUNK_SIZE / 5);
        assert_eq!(first.concurrency, 6);

        // Repeated rounds converge on the target.
        let mut last = first.chunk_size;
        for _ in 0..20 {
            last = strategy.recommendation().chunk_size;
        }
        assert_eq!(last, 1024 * 1024);
    }

    #[test]
    fn sizes_stay_clamped_and_aligned() {
        assert_eq!(clamp_align(0), MIN_CHUNK_SIZE);
        assert_eq!(clamp_align(u32::MAX), MAX_CHUNK_SIZE);
        assert_eq!(clamp_align(100_000) % CHUNK_ALIGN, 0);
        assert!(MAX_CHUNK_SIZE % CHUNK_ALIGN == 0);
    }

    #[test]
    fn auto_adjust_shrinks_on_errors_and_grows_on_headroom() {
        let strategy = AdaptiveChunkStrategy::default();
        feed(&strategy, 10, false, 0, 100);
        let before = strategy.current_chunk_size();
        strategy.apply_adjustment();
        let after = strategy.current_chunk_size();
        assert!(after < before);
        assert!(after >= (before as f64 * 0.8) as u32 - CHUNK_ALIGN);

        feed(&strategy, 10, true, 8 * 1024 * 1024, 1000);
        let before = strategy.current_chunk_size();
        strategy.apply_adjustment();
        assert!(strategy.current_chunk_size() > before);
    }

    #[test]
    fn timeouts_scale_with_chunk_size() {
        assert_eq!(timeout_for_chunk(256 * 1024), Duration::from_secs(60));
        assert_eq!(timeout_for_chunk(1024 * 1024), Duration::from_secs(120));
    }
}
