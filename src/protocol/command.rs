//! Command and format bytes of the wire envelope.

use crate::error::{EngineError, ProtocolViolation, Result};

/// Command byte carried in every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Ping = 0x01,
    Pong = 0x02,
    Connect = 0x03,
    Disconnect = 0x04,
    ListFiles = 0x10,
    FileInfo = 0x11,
    CreateDir = 0x12,
    DeleteFile = 0x13,
    RenameFile = 0x14,
    UploadFile = 0x20,
    DownloadFile = 0x21,
    UploadReq = 0x22,
    UploadData = 0x23,
    UploadEnd = 0x24,
    DownloadReq = 0x25,
    DownloadData = 0x26,
    DownloadEnd = 0x27,
}

impl Command {
    pub fn from_byte(value: u8) -> Result<Self> {
        let cmd = match value {
            0x01 => Command::Ping,
            0x02 => Command::Pong,
            0x03 => Command::Connect,
            0x04 => Command::Disconnect,
            0x10 => Command::ListFiles,
            0x11 => Command::FileInfo,
            0x12 => Command::CreateDir,
            0x13 => Command::DeleteFile,
            0x14 => Command::RenameFile,
            0x20 => Command::UploadFile,
            0x21 => Command::DownloadFile,
            0x22 => Command::UploadReq,
            0x23 => Command::UploadData,
            0x24 => Command::UploadEnd,
            0x25 => Command::DownloadReq,
            0x26 => Command::DownloadData,
            0x27 => Command::DownloadEnd,
            other => {
                return Err(EngineError::protocol(
                    ProtocolViolation::UnknownCommand,
                    format!("unknown command byte 0x{other:02x}"),
                ));
            }
        };
        Ok(cmd)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Ping => "ping",
            Command::Pong => "pong",
            Command::Connect => "connect",
            Command::Disconnect => "disconnect",
            Command::ListFiles => "list_files",
            Command::FileInfo => "file_info",
            Command::CreateDir => "create_dir",
            Command::DeleteFile => "delete_file",
            Command::RenameFile => "rename_file",
            Command::UploadFile => "upload_file",
            Command::DownloadFile => "download_file",
            Command::UploadReq => "upload_req",
            Command::UploadData => "upload_data",
            Command::UploadEnd => "upload_end",
            Command::DownloadReq => "download_req",
            Command::DownloadData => "download_data",
            Command::DownloadEnd => "download_end",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression algorithm tagged in bits 4-5 of the format byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionTag {
    /// Algorithm not tagged; decode falls back to content sniffing.
    Unspecified,
    Gzip,
    Deflate,
    Brotli,
}

impl CompressionTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionTag::Unspecified => "unspecified",
            CompressionTag::Gzip => "gzip",
            CompressionTag::Deflate => "deflate",
            CompressionTag::Brotli => "brotli",
        }
    }
}

/// Payload encoding descriptor byte.
///
/// Bit 0 marks the legacy JSON-compatible encoding (decode only), bit 1 the
/// protobuf binary encoding, bit 2 a compressed payload. When bit 2 is set,
/// bits 4-5 tag the algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatByte(pub u8);

impl FormatByte {
    pub const JSON: u8 = 0x01;
    pub const PROTOBUF: u8 = 0x02;
    pub const COMPRESSED: u8 = 0x04;
    pub const ALGORITHM_MASK: u8 = 0x30;
    pub const ALG_GZIP: u8 = 0x10;
    pub const ALG_DEFLATE: u8 = 0x20;
    pub const ALG_BROTLI: u8 = 0x30;

    pub fn protobuf() -> Self {
        FormatByte(Self::PROTOBUF)
    }

    pub fn compressed_protobuf(tag: CompressionTag) -> Self {
        let alg = match tag {
            CompressionTag::Unspecified => 0x00,
            CompressionTag::Gzip => Self::ALG_GZIP,
            CompressionTag::Deflate => Self::ALG_DEFLATE,
            CompressionTag::Brotli => Self::ALG_BROTLI,
        };
        FormatByte(Self::PROTOBUF | Self::COMPRESSED | alg)
    }

    pub fn is_json(&self) -> bool {
        self.0 & Self::JSON != 0
    }

    pub fn is_protobuf(&self) -> bool {
        self.0 & Self::PROTOBUF != 0
    }

    pub fn is_compressed(&self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    pub fn compression_tag(&self) -> CompressionTag {
        match self.0 & Self::ALGORITHM_MASK {
            Self::ALG_GZIP => CompressionTag::Gzip,
            Self::ALG_DEFLATE => CompressionTag::Deflate,
            Self::ALG_BROTLI => CompressionTag::Brotli,
            _ => CompressionTag::Unspecified,
        }
    }

    /// An encoding must be declared for the payload to be decodable.
    pub fn validate(&self) -> Result<()> {
        if !self.is_json() && !self.is_protobuf() {
            return Err(EngineError::protocol(
                ProtocolViolation::UnknownFormat,
                format!("format byte 0x{:02x} declares no encoding", self.0),
            ));
        }
        Ok(())
    }
}
