//! Wire protocol: framing, message schema, payload codec, compression.

pub mod codec;
pub mod command;
pub mod compress;
pub mod frame;
pub mod message;

pub use codec::MessageCodec;
pub use command::{Command, CompressionTag, FormatByte};
pub use compress::{Algorithm, CompressionCodec, CompressionConfig, CompressionStats};
pub use frame::{Frame, ParseOutcome};
pub use message::{FileInfo, FileRequest, FileResponse, Operation, ServerInfo};
