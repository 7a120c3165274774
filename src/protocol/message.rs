//! Logical request/response schema carried inside frame payloads.
//!
//! Messages are protobuf-encoded with hand-annotated prost structs. Optional
//! scalars matter here: the wire must distinguish an absent field from a
//! false/zero one (`is_chunk=false` survives a round trip, `chunk_index`
//! stays absent when it was never set), and 64-bit sizes are preserved
//! exactly.

use std::collections::BTreeMap;

use prost::Message;

/// Logical operation requested from the remote file service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum Operation {
    Unspecified = 0,
    Ping = 1,
    Connect = 2,
    Disconnect = 3,
    ListFiles = 4,
    FileInfo = 5,
    CreateDir = 6,
    DeleteFile = 7,
    RenameFile = 8,
    UploadFile = 9,
    DownloadFile = 10,
    UploadReq = 11,
    UploadData = 12,
    UploadEnd = 13,
    DownloadReq = 14,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Unspecified => "unspecified",
            Operation::Ping => "ping",
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::ListFiles => "list_files",
            Operation::FileInfo => "file_info",
            Operation::CreateDir => "create_dir",
            Operation::DeleteFile => "delete_file",
            Operation::RenameFile => "rename_file",
            Operation::UploadFile => "upload_file",
            Operation::DownloadFile => "download_file",
            Operation::UploadReq => "upload_req",
            Operation::UploadData => "upload_data",
            Operation::UploadEnd => "upload_end",
            Operation::DownloadReq => "download_req",
        }
    }

    /// Operation names as the legacy JSON encoding spells them.
    pub fn from_name(name: &str) -> Option<Self> {
        let op = match name {
            "ping" => Operation::Ping,
            "connect" => Operation::Connect,
            "disconnect" => Operation::Disconnect,
            "list_files" => Operation::ListFiles,
            "file_info" => Operation::FileInfo,
            "create_dir" => Operation::CreateDir,
            "delete_file" => Operation::DeleteFile,
            "rename_file" => Operation::RenameFile,
            "upload_file" => Operation::UploadFile,
            "download_file" => Operation::DownloadFile,
            "upload_req" => Operation::UploadReq,
            "upload_data" => Operation::UploadData,
            "upload_end" => Operation::UploadEnd,
            "download_req" => Operation::DownloadReq,
            _ => return None,
        };
        Some(op)
    }
}

/// Entry kind reported in listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum EntryType {
    File = 0,
    Directory = 1,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::File => "file",
            EntryType::Directory => "directory",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "file" => Some(EntryType::File),
            "directory" => Some(EntryType::Directory),
            _ => None,
        }
    }
}

/// One listing entry.
#[derive(Clone, PartialEq, Message)]
pub struct FileInfo {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(string, tag = "2")]
    pub path: String,

    #[prost(enumeration = "EntryType", tag = "3")]
    pub entry_type: i32,

    /// Size in bytes; directories report 0.
    #[prost(uint64, tag = "4")]
    pub size: u64,

    /// ISO-8601 timestamp, or a decimal epoch for older servers.
    #[prost(string, optional, tag = "5")]
    pub last_modified: Option<String>,

    #[prost(string, optional, tag = "6")]
    pub permissions: Option<String>,

    #[prost(bool, optional, tag = "7")]
    pub is_readonly: Option<bool>,

    #[prost(string, optional, tag = "8")]
    pub mime_type: Option<String>,
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.entry_type() == EntryType::Directory
    }
}

/// Server identity returned in the CONNECT exchange.
#[derive(Clone, PartialEq, Message)]
pub struct ServerInfo {
    #[prost(string, tag = "1")]
    pub name: String,

    #[prost(string, tag = "2")]
    pub version: String,

    #[prost(string, optional, tag = "3")]
    pub protocol_version: Option<String>,

    #[prost(uint64, optional, tag = "4")]
    pub max_payload_bytes: Option<u64>,
}

/// Request message. Field numbers are frozen wire format.
#[derive(Clone, PartialEq, Message)]
pub struct FileRequest {
    #[prost(enumeration = "Operation", tag = "1")]
    pub operation_code: i32,

    #[prost(string, optional, tag = "2")]
    pub path: Option<String>,

    #[prost(string, optional, tag = "3")]
    pub name: Option<String>,

    #[prost(string, optional, tag = "4")]
    pub new_name: Option<String>,

    /// Opaque payload bytes; never base64, binary in and binary out.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub data: Option<Vec<u8>>,

    #[prost(bool, optional, tag = "6")]
    pub is_chunk: Option<bool>,

    #[prost(uint32, optional, tag = "7")]
    pub chunk_index: Option<u32>,

    #[prost(uint32, optional, tag = "8")]
    pub total_chunks: Option<u32>,

    #[prost(string, optional, tag = "9")]
    pub chunk_hash: Option<String>,

    #[prost(uint32, optional, tag = "10")]
    pub chunk_size: Option<u32>,

    #[prost(uint64, optional, tag = "11")]
    pub file_size: Option<u64>,

    #[prost(string, optional, tag = "12")]
    pub checksum: Option<String>,

    #[prost(string, optional, tag = "13")]
    pub client_id: Option<String>,

    #[prost(string, optional, tag = "14")]
    pub version: Option<String>,

    #[prost(string, repeated, tag = "15")]
    pub supported_formats: Vec<String>,

    #[prost(string, optional, tag = "16")]
    pub preferred_format: Option<String>,

    /// String-to-string only; numeric or boolean values are stringified at
    /// the producer and parsed back at the consumer.
    #[prost(btree_map = "string, string", tag = "17")]
    pub options: BTreeMap<String, String>,
}

impl FileRequest {
    pub fn new(operation: Operation) -> Self {
        FileRequest {
            operation_code: operation as i32,
            ..Default::default()
        }
    }

    pub fn operation(&self) -> Option<Operation> {
        Operation::try_from(self.operation_code).ok()
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_new_name(mut self, new_name: impl Into<String>) -> Self {
        self.new_name = Some(new_name.into());
        self
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = Some(file_size);
        self
    }

    pub fn with_chunk(mut self, index: u32, total: u32, hash: impl Into<String>) -> Self {
        self.is_chunk = Some(true);
        self.chunk_index = Some(index);
        self.total_chunks = Some(total);
        self.chunk_hash = Some(hash.into());
        self
    }

    /// Set a string option. Numeric/boolean options go through here too;
    /// the wire mapping only carries strings.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Parse an integer-valued option back out, rejecting non-numeric text.
    pub fn option_u64(&self, key: &str) -> Option<std::result::Result<u64, String>> {
        self.options.get(key).map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| format!("option {key} is not an integer: {raw:?}"))
        })
    }

    /// Serialised size of this request once protobuf-encoded.
    pub fn encoded_size(&self) -> usize {
        self.encoded_len()
    }
}

/// Response message.
#[derive(Clone, PartialEq, Message)]
pub struct FileResponse {
    /// Always present on the wire, even when false.
    #[prost(bool, optional, tag = "1")]
    pub success: Option<bool>,

    #[prost(string, optional, tag = "2")]
    pub message: Option<String>,

    #[prost(message, repeated, tag = "3")]
    pub files: Vec<FileInfo>,

    #[prost(bytes = "vec", optional, tag = "4")]
    pub data: Option<Vec<u8>>,

    #[prost(bool, optional, tag = "5")]
    pub is_chunk: Option<bool>,

    #[prost(uint32, optional, tag = "6")]
    pub chunk_index: Option<u32>,

    #[prost(uint32, optional, tag = "7")]
    pub total_chunks: Option<u32>,

    #[prost(string, optional, tag = "8")]
    pub chunk_hash: Option<String>,

    #[prost(uint64, optional, tag = "9")]
    pub process_time_ms: Option<u64>,

    #[prost(uint64, optional, tag = "10")]
    pub file_size: Option<u64>,

    #[prost(uint32, optional, tag = "11")]
    pub progress_percent: Option<u32>,

    #[prost(string, optional, tag = "12")]
    pub status: Option<String>,

    #[prost(string, optional, tag = "13")]
    pub selected_format: Option<String>,

    #[prost(string, repeated, tag = "14")]
    pub supported_commands: Vec<String>,

    #[prost(message, optional, tag = "15")]
    pub server_info: Option<ServerInfo>,

    #[prost(uint64, optional, tag = "16")]
    pub timestamp: Option<u64>,

    #[prost(string, optional, tag = "17")]
    pub session_id: Option<String>,

    #[prost(uint32, optional, tag = "18")]
    pub accepted_chunk_size: Option<u32>,
}

impl FileResponse {
    pub fn ok() -> Self {
        FileResponse {
            success: Some(true),
            ..Default::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        FileResponse {
            success: Some(false),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.success.unwrap_or(false)
    }

    pub fn message_or_default(&self) -> &str {
        self.message.as_deref().unwrap_or("")
    }
}
