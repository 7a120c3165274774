//! Mapping between logical messages and frame payload bytes.
//!
//! New traffic is always protobuf (format bit 1), optionally compressed
//! (bit 2 + algorithm bits). The legacy JSON-compatible encoding (bit 0) is
//! accepted inbound only.

use std::sync::Arc;

use prost::Message;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::protocol::command::{CompressionTag, FormatByte};
use crate::protocol::compress::CompressionCodec;
use crate::protocol::frame::MAX_PAYLOAD_LEN;
use crate::protocol::message::{
    EntryType, FileInfo, FileRequest, FileResponse, Operation, ServerInfo,
};

pub struct MessageCodec {
    compression: Arc<CompressionCodec>,
}

impl MessageCodec {
    pub fn new(compression: Arc<CompressionCodec>) -> Self {
        MessageCodec { compression }
    }

    pub fn compression(&self) -> &Arc<CompressionCodec> {
        &self.compression
    }

    /// Validate and encode a request as plain protobuf.
    pub fn encode_request(&self, request: &FileRequest) -> Result<Vec<u8>> {
        validate_request(request)?;
        Ok(request.encode_to_vec())
    }

    pub fn encode_response(&self, response: &FileResponse) -> Result<Vec<u8>> {
        Ok(response.encode_to_vec())
    }

    /// Encode a request and choose the format byte. Compression applies only
    /// when enabled, the payload exceeds the adaptive threshold, and the
    /// compressed output is strictly smaller. A failed compression attempt
    /// falls back to the plain encoding.
    pub fn smart_encode(&self, request: &FileRequest) -> Result<(FormatByte, Vec<u8>)> {
        let encoded = self.encode_request(request)?;
        self.finish_encode(encoded)
    }

    pub fn smart_encode_response(&self, response: &FileResponse) -> Result<(FormatByte, Vec<u8>)> {
        let encoded = self.encode_response(response)?;
        self.finish_encode(encoded)
    }

    fn finish_encode(&self, encoded: Vec<u8>) -> Result<(FormatByte, Vec<u8>)> {
        if encoded.len() > MAX_PAYLOAD_LEN {
            return Err(EngineError::schema(format!(
                "encoded message of {} bytes cannot fit a frame",
                encoded.len()
            )));
        }
        if self.compression.should_compress(encoded.len()) {
            match self.compression.compress(&encoded) {
                Ok((tag, compressed)) if compressed.len() < encoded.len() => {
                    trace!(
                        target: "protocol::codec",
                        algorithm = tag.as_str(),
                        orig = encoded.len(),
                        compressed = compressed.len(),
                        "Compressed outbound payload"
                    );
                    return Ok((FormatByte::compressed_protobuf(tag), compressed));
                }
                Ok(_) => {
                    trace!(
                        target: "protocol::codec",
                        "Compression produced no gain, sending plain"
                    );
                }
                Err(err) => {
                    debug!(
                        target: "protocol::codec",
                        error = %err,
                        "Compression failed, sending plain"
                    );
                }
            }
        }
        Ok((FormatByte::protobuf(), encoded))
    }

    /// Decode an inbound response payload: decompress if bit 2 is set, then
    /// decode per the declared encoding.
    pub fn auto_decode_response(&self, payload: &[u8], format: FormatByte) -> Result<FileResponse> {
        let bytes = self.maybe_decompress(payload, format)?;
        if format.is_protobuf() {
            FileResponse::decode(bytes.as_ref())
                .map_err(|err| EngineError::schema(format!("response decode: {err}")))
        } else if format.is_json() {
            decode_response_json(&bytes)
        } else {
            Err(EngineError::schema("payload declares no known encoding"))
        }
    }

    /// Decode an inbound request payload (used by tests and tooling that
    /// play the server side).
    pub fn auto_decode_request(&self, payload: &[u8], format: FormatByte) -> Result<FileRequest> {
        let bytes = self.maybe_decompress(payload, format)?;
        let request = if format.is_protobuf() {
            FileRequest::decode(bytes.as_ref())
                .map_err(|err| EngineError::schema(format!("request decode: {err}")))?
        } else if format.is_json() {
            decode_request_json(&bytes)?
        } else {
            return Err(EngineError::schema("payload declares no known encoding"));
        };
        validate_request(&request)?;
        Ok(request)
    }

    fn maybe_decompress<'a>(
        &self,
        payload: &'a [u8],
        format: FormatByte,
    ) -> Result<std::borrow::Cow<'a, [u8]>> {
        if format.is_compressed() {
            let restored = self
                .compression
                .decompress(payload, format.compression_tag())?;
            Ok(std::borrow::Cow::Owned(restored))
        } else {
            Ok(std::borrow::Cow::Borrowed(payload))
        }
    }
}

/// Request validation applied before encoding and after decoding.
pub fn validate_request(request: &FileRequest) -> Result<()> {
    let operation = request
        .operation()
        .filter(|op| *op != Operation::Unspecified)
        .ok_or_else(|| {
            EngineError::schema(format!("unknown operation {}", request.operation_code))
        })?;

    if let Some(path) = &request.path {
        if path.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(EngineError::schema(format!(
                "path {path:?} contains a parent-directory segment"
            )));
        }
    }

    if let (Some(index), Some(total)) = (request.chunk_index, request.total_chunks) {
        if total == 0 || index >= total {
            return Err(EngineError::schema(format!(
                "chunk index {index} outside total {total}"
            )));
        }
    }

    if request.is_chunk == Some(true) {
        let legacy_mode = request.chunk_index.is_some() && request.total_chunks.is_some();
        let range_mode = match (
            request.option_u64("range_start"),
            request.option_u64("range_end"),
        ) {
            (Some(Ok(start)), Some(Ok(end))) => {
                if start >= end {
                    return Err(EngineError::schema(format!(
                        "chunk byte range is empty: {start}..{end}"
                    )));
                }
                true
            }
            (Some(Err(msg)), _) | (_, Some(Err(msg))) => {
                return Err(EngineError::schema(msg));
            }
            _ => false,
        };
        if !legacy_mode && !range_mode {
            return Err(EngineError::schema(format!(
                "{} chunk carries neither index/total nor a byte range",
                operation.as_str()
            )));
        }
    }

    Ok(())
}

// Legacy JSON-compatible decode. Field names are the snake_case wire names;
// binary data arrives as an array of byte values.

fn decode_request_json(bytes: &[u8]) -> Result<FileRequest> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| EngineError::schema(format!("legacy request is not valid JSON: {err}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::schema("legacy request is not a JSON object"))?;

    let op_name = obj
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::schema("legacy request is missing operation"))?;
    let operation = Operation::from_name(op_name)
        .ok_or_else(|| EngineError::schema(format!("unknown operation {op_name:?}")))?;

    let mut request = FileRequest::new(operation);
    request.path = json_string(obj, "path")?;
    request.name = json_string(obj, "name")?;
    request.new_name = json_string(obj, "new_name")?;
    request.data = json_bytes(obj, "data")?;
    request.is_chunk = json_bool(obj, "is_chunk")?;
    request.chunk_index = json_u32(obj, "chunk_index")?;
    request.total_chunks = json_u32(obj, "total_chunks")?;
    request.chunk_hash = json_string(obj, "chunk_hash")?;
    request.chunk_size = json_u32(obj, "chunk_size")?;
    request.file_size = json_u64(obj, "file_size")?;
    request.checksum = json_string(obj, "checksum")?;
    request.client_id = json_string(obj, "client_id")?;
    request.version = json_string(obj, "version")?;
    request.preferred_format = json_string(obj, "preferred_format")?;
    if let Some(formats) = obj.get("supported_formats").and_then(Value::as_array) {
        request.supported_formats = formats
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect();
    }
    if let Some(options) = obj.get("options").and_then(Value::as_object) {
        for (key, value) in options {
            let text = value
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| EngineError::schema(format!("option {key} is not a string")))?;
            request.options.insert(key.clone(), text);
        }
    }
    Ok(request)
}

fn decode_response_json(bytes: &[u8]) -> Result<FileResponse> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| EngineError::schema(format!("legacy response is not valid JSON: {err}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::schema("legacy response is not a JSON object"))?;

    let mut response = FileResponse::default();
    response.success = json_bool(obj, "success")?;
    if response.success.is_none() {
        return Err(EngineError::schema("legacy response is missing success"));
    }
    response.message = json_string(obj, "message")?;
    response.data = json_bytes(obj, "data")?;
    response.is_chunk = json_bool(obj, "is_chunk")?;
    response.chunk_index = json_u32(obj, "chunk_index")?;
    response.total_chunks = json_u32(obj, "total_chunks")?;
    response.chunk_hash = json_string(obj, "chunk_hash")?;
    response.process_time_ms = json_u64(obj, "process_time_ms")?;
    response.file_size = json_u64(obj, "file_size")?;
    response.progress_percent = json_u32(obj, "progress_percent")?;
    response.status = json_string(obj, "status")?;
    response.selected_format = json_string(obj, "selected_format")?;
    response.timestamp = json_u64(obj, "timestamp")?;
    response.session_id = json_string(obj, "session_id")?;
    response.accepted_chunk_size = json_u32(obj, "accepted_chunk_size")?;
    if let Some(commands) = obj.get("supported_commands").and_then(Value::as_array) {
        response.supported_commands = commands
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect();
    }
    if let Some(info) = obj.get("server_info").and_then(Value::as_object) {
        response.server_info = Some(ServerInfo {
            name: info
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            version: info
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            protocol_version: json_string(info, "protocol_version")?,
            max_payload_bytes: json_u64(info, "max_payload_bytes")?,
        });
    }
    if let Some(files) = obj.get("files").and_then(Value::as_array) {
        response.files = files
            .iter()
            .map(decode_file_info_json)
            .collect::<Result<Vec<_>>>()?;
    }
    Ok(response)
}

fn decode_file_info_json(value: &Value) -> Result<FileInfo> {
    let obj = value
        .as_object()
        .ok_or_else(|| EngineError::schema("file entry is not a JSON object"))?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .and_then(EntryType::from_name)
        .ok_or_else(|| EngineError::schema("file entry has no valid type"))?;
    let size = json_u64(obj, "size")?.unwrap_or(0);
    Ok(FileInfo {
        name: obj
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        path: obj
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        entry_type: kind as i32,
        size,
        last_modified: json_string(obj, "last_modified")?,
        permissions: json_string(obj, "permissions")?,
        is_readonly: json_bool(obj, "is_readonly")?,
        mime_type: json_string(obj, "mime_type")?,
    })
}

type JsonObject = serde_json::Map<String, Value>;

fn json_string(obj: &JsonObject, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(EngineError::schema(format!("field {key} is not a string"))),
    }
}

fn json_bool(obj: &JsonObject, key: &str) -> Result<Option<bool>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(EngineError::schema(format!("field {key} is not a bool"))),
    }
}

fn json_u64(obj: &JsonObject, key: &str) -> Result<Option<u64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| EngineError::schema(format!("field {key} is not a non-negative integer"))),
        Some(_) => Err(EngineError::schema(format!("field {key} is not a number"))),
    }
}

fn json_u32(obj: &JsonObject, key: &str) -> Result<Option<u32>> {
    match json_u64(obj, key)? {
        None => Ok(None),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| EngineError::schema(format!("field {key} exceeds 32 bits"))),
    }
}

fn json_bytes(obj: &JsonObject, key: &str) -> Result<Option<Vec<u8>>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|v| u8::try_from(v).ok())
                    .ok_or_else(|| EngineError::schema(format!("field {key} holds a non-byte value")))
            })
            .collect::<Result<Vec<u8>>>()
            .map(Some),
        Some(_) => Err(EngineError::schema(format!(
            "field {key} is not a byte array"
        ))),
    }
}
