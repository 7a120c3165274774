//! Payload compression with an adaptive size threshold.
//!
//! Three algorithms are offered (gzip, deflate, brotli). Every attempt is
//! recorded; the rolling window drives two decisions: the minimum payload
//! size worth compressing, and which algorithm "auto" resolves to.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;
use std::time::Instant;

use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::protocol::command::CompressionTag;

/// Starting point for the adaptive threshold.
pub const INITIAL_THRESHOLD: usize = 1024;
/// The threshold never drops below this.
pub const MIN_THRESHOLD: usize = 512;
/// The threshold never grows above this.
pub const MAX_THRESHOLD: usize = 4096;

const WINDOW_SIZE: usize = 32;
/// Re-evaluate the threshold after this many new samples.
const EVAL_EVERY: usize = 8;
const FAST_ENCODE_MS: f64 = 5.0;
const SLOW_ENCODE_MS: f64 = 50.0;

/// Algorithm selection as configured by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    None,
    Gzip,
    Deflate,
    Brotli,
    Auto,
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    success: bool,
    duration_ms: f64,
    orig_size: usize,
    out_size: usize,
    tag: CompressionTag,
}

#[derive(Debug, Default)]
struct CodecState {
    window: VecDeque<Attempt>,
    since_eval: usize,
    threshold: usize,
}

/// Aggregate view over the recent attempt window.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionStats {
    pub attempts: usize,
    pub failures: usize,
    pub avg_encode_ms: f64,
    pub avg_ratio: f64,
    pub current_threshold: usize,
}

/// Compressor configuration, a slice of the engine config.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: Algorithm,
    pub min_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            enabled: true,
            algorithm: Algorithm::Auto,
            min_bytes: INITIAL_THRESHOLD,
        }
    }
}

pub struct CompressionCodec {
    config: CompressionConfig,
    state: Mutex<CodecState>,
}

impl CompressionCodec {
    pub fn new(config: CompressionConfig) -> Self {
        let threshold = config.min_bytes.clamp(MIN_THRESHOLD, MAX_THRESHOLD);
        CompressionCodec {
            config,
            state: Mutex::new(CodecState {
                window: VecDeque::with_capacity(WINDOW_SIZE),
                since_eval: 0,
                threshold,
            }),
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled && self.config.algorithm != Algorithm::None
    }

    /// Current adaptive threshold in bytes. Payloads must be strictly larger
    /// to be considered for compression.
    pub fn threshold(&self) -> usize {
        self.state.lock().expect("compression state lock").threshold
    }

    pub fn should_compress(&self, payload_len: usize) -> bool {
        self.enabled() && payload_len > self.threshold()
    }

    /// Compress `data`, recording the attempt. Returns the chosen algorithm
    /// tag and the output; the caller decides whether the output is worth
    /// using (it must be strictly smaller than the input).
    pub fn compress(&self, data: &[u8]) -> Result<(CompressionTag, Vec<u8>)> {
        let tag = self.resolve_algorithm(data.len());
        let started = Instant::now();
        let outcome = compress_with(tag, data);
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(out) => {
                self.record(Attempt {
                    success: true,
                    duration_ms,
                    orig_size: data.len(),
                    out_size: out.len(),
                    tag,
                });
                Ok((tag, out))
            }
            Err(err) => {
                self.record(Attempt {
                    success: false,
                    duration_ms,
                    orig_size: data.len(),
                    out_size: data.len(),
                    tag,
                });
                warn!(
                    target: "protocol::compress",
                    algorithm = tag.as_str(),
                    error = %err,
                    "Compression attempt failed"
                );
                Err(err)
            }
        }
    }

    /// Decompress with an explicit tag, or sniff magic bytes when the frame
    /// carried no algorithm bits.
    pub fn decompress(&self, data: &[u8], tag: CompressionTag) -> Result<Vec<u8>> {
        let tag = match tag {
            CompressionTag::Unspecified => sniff_algorithm(data),
            explicit => explicit,
        };
        decompress_with(tag, data)
    }

    pub fn stats(&self) -> CompressionStats {
        let state = self.state.lock().expect("compression state lock");
        let attempts = state.window.len();
        if attempts == 0 {
            return CompressionStats {
                current_threshold: state.threshold,
                ..Default::default()
            };
        }
        let failures = state.window.iter().filter(|a| !a.success).count();
        let avg_encode_ms =
            state.window.iter().map(|a| a.duration_ms).sum::<f64>() / attempts as f64;
        let ratios: Vec<f64> = state
            .window
            .iter()
            .filter(|a| a.success && a.orig_size > 0)
            .map(|a| a.out_size as f64 / a.orig_size as f64)
            .collect();
        let avg_ratio = if ratios.is_empty() {
            1.0
        } else {
            ratios.iter().sum::<f64>() / ratios.len() as f64
        };
        CompressionStats {
            attempts,
            failures,
            avg_encode_ms,
            avg_ratio,
            current_threshold: state.threshold,
        }
    }

    fn resolve_algorithm(&self, payload_len: usize) -> CompressionTag {
        match self.config.algorithm {
            Algorithm::Gzip => CompressionTag::Gzip,
            Algorithm::Deflate => CompressionTag::Deflate,
            Algorithm::Brotli => CompressionTag::Brotli,
            Algorithm::None => CompressionTag::Deflate,
            Algorithm::Auto => self.pick_auto(payload_len),
        }
    }

    /// Auto selection: best (ratio x throughput) score over the window,
    /// size-based heuristics when there is no history for an algorithm.
    fn pick_auto(&self, payload_len: usize) -> CompressionTag {
        let state = self.state.lock().expect("compression state lock");
        let mut best: Option<(CompressionTag, f64)> = None;
        for tag in [
            CompressionTag::Gzip,
            CompressionTag::Deflate,
            CompressionTag::Brotli,
        ] {
            let samples: Vec<&Attempt> = state
                .window
                .iter()
                .filter(|a| a.tag == tag && a.success && a.orig_size > 0)
                .collect();
            if samples.is_empty() {
                continue;
            }
            let score: f64 = samples
                .iter()
                .map(|a| {
                    let gain = 1.0 - (a.out_size as f64 / a.orig_size as f64);
                    let throughput = a.orig_size as f64 / a.duration_ms.max(0.01);
                    gain.max(0.0) * throughput
                })
                .sum::<f64>()
                / samples.len() as f64;
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((tag, score));
            }
        }
        if let Some((tag, _)) = best {
            return tag;
        }
        // No history yet: small payloads favour deflate's low setup cost,
        // large ones brotli's ratio.
        if payload_len < 4 * 1024 {
            CompressionTag::Deflate
        } else if payload_len < 256 * 1024 {
            CompressionTag::Gzip
        } else {
            CompressionTag::Brotli
        }
    }

    fn record(&self, attempt: Attempt) {
        let mut state = self.state.lock().expect("compression state lock");
        if state.window.len() == WINDOW_SIZE {
            state.window.pop_front();
        }
        state.window.push_back(attempt);
        state.since_eval += 1;
        if state.since_eval >= EVAL_EVERY {
            state.since_eval = 0;
            Self::reevaluate_threshold(&mut state);
        }
    }

    fn reevaluate_threshold(state: &mut CodecState) {
        let total = state.window.len();
        if total < EVAL_EVERY {
            return;
        }
        let failures = state.window.iter().filter(|a| !a.success).count();
        let error_rate = failures as f64 / total as f64;
        let avg_ms = state.window.iter().map(|a| a.duration_ms).sum::<f64>() / total as f64;

        let previous = state.threshold;
        if error_rate > 0.1 || avg_ms > SLOW_ENCODE_MS {
            state.threshold = (state.threshold * 2).min(MAX_THRESHOLD);
        } else if error_rate < 0.02 && avg_ms < FAST_ENCODE_MS {
            state.threshold = (state.threshold / 2).max(MIN_THRESHOLD);
        }
        if state.threshold != previous {
            debug!(
                target: "protocol::compress",
                previous,
                current = state.threshold,
                error_rate,
                avg_ms,
                "Adjusted compression threshold"
            );
        }
    }
}

impl Default for CompressionCodec {
    fn default() -> Self {
        CompressionCodec::new(CompressionConfig::default())
    }
}

fn compress_with(tag: CompressionTag, data: &[u8]) -> Result<Vec<u8>> {
    match tag {
        CompressionTag::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionTag::Deflate | CompressionTag::Unspecified => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        CompressionTag::Brotli => {
            let mut out = Vec::new();
            let params = brotli::enc::BrotliEncoderParams {
                quality: 5,
                ..Default::default()
            };
            brotli::BrotliCompress(&mut &data[..], &mut out, &params)?;
            Ok(out)
        }
    }
}

fn decompress_with(tag: CompressionTag, data: &[u8]) -> Result<Vec<u8>> {
    match tag {
        CompressionTag::Gzip => {
            let mut decoder = flate2::write::GzDecoder::new(Vec::new());
            decoder.write_all(data)?;
            Ok(decoder.finish()?)
        }
        CompressionTag::Deflate => {
            let mut decoder = flate2::write::ZlibDecoder::new(Vec::new());
            decoder.write_all(data)?;
            Ok(decoder.finish()?)
        }
        CompressionTag::Brotli | CompressionTag::Unspecified => {
            let mut out = Vec::new();
            brotli::BrotliDecompress(&mut &data[..], &mut out).map_err(EngineError::Transport)?;
            Ok(out)
        }
    }
}

/// Identify the algorithm from leading magic bytes. Gzip opens with 1F 8B,
/// zlib deflate with 78 xx; anything else is treated as brotli, which has no
/// magic of its own.
fn sniff_algorithm(data: &[u8]) -> CompressionTag {
    match data {
        [0x1F, 0x8B, ..] => CompressionTag::Gzip,
        [0x78, second, ..] if matches!(second, 0x01 | 0x5E | 0x9C | 0xDA) => CompressionTag::Deflate,
        _ => CompressionTag::Brotli,
    }
}
