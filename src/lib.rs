//! Client-side file-transfer engine for the easy-file-management service.
//!
//! Talks a length-prefixed binary frame protocol over TCP: protobuf message
//! payloads, optional compression, a sequence-numbered request multiplexer,
//! keepalive with idle suppression, reconnect supervision, a chunked
//! transfer engine with adaptive sizing and resumable upload sessions, and
//! an alternative FTP transport with the same operation surface.
//!
//! The embedding host composes a [`client::FileServiceClient`] from an
//! [`config::EngineConfig`] and drives everything through it; the individual
//! layers stay public for hosts that need finer control.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod ftp;
pub mod logging;
pub mod protocol;
pub mod retry;
pub mod tasks;
pub mod transfer;

pub use client::FileServiceClient;
pub use config::EngineConfig;
pub use error::{EngineError, ProtocolViolation, Result};
