//! Chunked transfer engine: adaptive sizing, resumable sessions, uploads,
//! downloads and progress reporting.

pub mod engine;
pub mod progress;
pub mod session;
pub mod store;
pub mod strategy;

use crate::protocol::frame::MAX_PAYLOAD_LEN;

/// Smallest chunk the engine will use.
pub const MIN_CHUNK_SIZE: u32 = 4 * 1024;
/// Largest chunk that still fits a frame with room for the message envelope.
pub const MAX_CHUNK_SIZE: u32 = (MAX_PAYLOAD_LEN - 16 * 1024) as u32;
/// Starting point before any adaptive signal exists.
pub const DEFAULT_CHUNK_SIZE: u32 = 256 * 1024;
/// All chunk sizes are multiples of this.
pub const CHUNK_ALIGN: u32 = 1024;

pub use engine::{DownloadOptions, TransferEngine, TransferEngineConfig, UploadOptions};
pub use progress::{FnProgress, ProgressCallback, ProgressTracker, ProgressUpdate};
pub use session::UploadSession;
pub use store::{ResumableUploadStore, StoreConfig};
pub use strategy::{
    AdaptiveChunkStrategy, NetworkQuality, Recommendation, StrategyConfig, TransferSample,
};
