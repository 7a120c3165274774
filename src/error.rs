use thiserror::Error;

/// Detail on what exactly broke inside the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolViolation {
    BadMagic,
    BadTrailer,
    BadChecksum,
    LengthExceeded,
    ShortBuffer,
    UnknownCommand,
    UnknownFormat,
}

impl ProtocolViolation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolViolation::BadMagic => "bad_magic",
            ProtocolViolation::BadTrailer => "bad_trailer",
            ProtocolViolation::BadChecksum => "bad_checksum",
            ProtocolViolation::LengthExceeded => "length_exceeded",
            ProtocolViolation::ShortBuffer => "short_buffer",
            ProtocolViolation::UnknownCommand => "unknown_command",
            ProtocolViolation::UnknownFormat => "unknown_format",
        }
    }
}

impl std::fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the transfer engine.
///
/// Every variant maps to a stable kind identifier (see [`EngineError::kind`])
/// so callers and the UI layer can match on error class without parsing
/// messages.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Framing, checksum, length or command/format violation. Fatal to the
    /// current connection.
    #[error("protocol error ({violation}): {message}")]
    Protocol {
        violation: ProtocolViolation,
        message: String,
    },

    /// A message field is invalid or missing. Surfaces to the caller only.
    #[error("schema error: {0}")]
    Schema(String),

    /// A request did not receive its response within the deadline.
    #[error("request timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },

    /// The connection left CONNECTED while the operation was in flight.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Too many in-flight requests.
    #[error("backpressure: {inflight} requests in flight (limit {limit})")]
    Backpressure { inflight: usize, limit: usize },

    /// Cooperative cancellation.
    #[error("operation aborted")]
    Aborted,

    /// A chunk transfer failed after retries.
    #[error("transfer failed at chunk {chunk_index}: {source}")]
    Transfer {
        chunk_index: u32,
        #[source]
        source: Box<EngineError>,
    },

    /// Download assembly found a hole.
    #[error("incomplete download: chunk {missing_chunk} missing")]
    IncompleteDownload { missing_chunk: u32 },

    /// Session persistence or validation failure.
    #[error("session error: {0}")]
    Session(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Underlying socket failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
}

impl EngineError {
    pub fn protocol(violation: ProtocolViolation, message: impl Into<String>) -> Self {
        EngineError::Protocol {
            violation,
            message: message.into(),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        EngineError::Schema(message.into())
    }

    pub fn session(message: impl Into<String>) -> Self {
        EngineError::Session(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        EngineError::Config(message.into())
    }

    /// Stable kind identifier for tests and UI mapping.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Protocol { .. } => "protocol",
            EngineError::Schema(_) => "schema",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Disconnected(_) => "disconnected",
            EngineError::Backpressure { .. } => "backpressure",
            EngineError::Aborted => "aborted",
            EngineError::Transfer { .. } => "transfer",
            EngineError::IncompleteDownload { .. } => "incomplete_download",
            EngineError::Session(_) => "session",
            EngineError::Config(_) => "config",
            EngineError::Transport(_) => "transport",
        }
    }

    /// Whether the connection must be reset after this error.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(
            self,
            EngineError::Protocol { .. } | EngineError::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
