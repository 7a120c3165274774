//! In-process mock file server speaking the framed protocol over real TCP.
//!
//! Requests are handled concurrently, so responses can (and do) come back
//! out of request order; behavior knobs let tests inject per-chunk delays
//! and mid-upload connection drops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use efm_engine::connection::RecvBuffer;
use efm_engine::protocol::command::Command;
use efm_engine::protocol::compress::CompressionCodec;
use efm_engine::protocol::frame::{self, ParseOutcome};
use efm_engine::protocol::message::{
    EntryType, FileInfo, FileRequest, FileResponse, Operation, ServerInfo,
};
use efm_engine::protocol::MessageCodec;

#[derive(Default)]
pub struct ServerBehavior {
    /// Close the connection after this many successful UPLOAD_DATA frames.
    pub drop_after_upload_chunks: Option<usize>,
    /// Extra latency per upload chunk index; responses overtake each other.
    pub upload_chunk_delays: HashMap<u32, Duration>,
    /// Overrides the client's chunkSize hint for downloads.
    pub download_chunk_size: Option<u32>,
}

#[derive(Default)]
struct UploadAccum {
    target: String,
    filename: String,
    file_size: u64,
    total_chunks: u32,
    chunks: HashMap<u32, Vec<u8>>,
}

#[derive(Clone)]
struct DownloadState {
    data: Vec<u8>,
    chunk_size: u32,
    total_chunks: u32,
}

pub struct ServerState {
    pub behavior: std::sync::Mutex<ServerBehavior>,
    files: std::sync::Mutex<HashMap<String, Vec<u8>>>,
    uploads: std::sync::Mutex<HashMap<String, UploadAccum>>,
    downloads: std::sync::Mutex<HashMap<String, DownloadState>>,
    pub upload_data_frames: AtomicUsize,
    download_session_counter: AtomicUsize,
    codec: MessageCodec,
}

impl ServerState {
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn put_file(&self, path: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_owned(), data);
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    accept_task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(ServerBehavior::default()).await
    }

    pub async fn start_with(behavior: ServerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState {
            behavior: std::sync::Mutex::new(behavior),
            files: std::sync::Mutex::new(HashMap::new()),
            uploads: std::sync::Mutex::new(HashMap::new()),
            downloads: std::sync::Mutex::new(HashMap::new()),
            upload_data_frames: AtomicUsize::new(0),
            download_session_counter: AtomicUsize::new(0),
            codec: MessageCodec::new(Arc::new(CompressionCodec::default())),
        });

        let accept_state = Arc::clone(&state);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    serve_connection(stream, state).await;
                });
            }
        });

        MockServer {
            addr,
            state,
            accept_task,
        }
    }

    pub fn stop(&self) {
        self.accept_task.abort();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(stream: TcpStream, state: Arc<ServerState>) {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut buffer = RecvBuffer::new();
    let mut scratch = vec![0u8; 16 * 1024];
    // Connection-scoped counter for the drop-after behavior.
    let upload_frames_this_conn = Arc::new(AtomicUsize::new(0));
    let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));

    loop {
        let read = match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buffer.push(bytes::Bytes::copy_from_slice(&scratch[..read]));

        loop {
            match frame::try_parse(buffer.contiguous()) {
                Ok(ParseOutcome::Frame { frame, consumed }) => {
                    buffer.consume(consumed);
                    let state = Arc::clone(&state);
                    let writer = Arc::clone(&writer);
                    let conn_count = Arc::clone(&upload_frames_this_conn);
                    let dropped = Arc::clone(&dropped);
                    tokio::spawn(async move {
                        handle_frame(frame, state, writer, conn_count, dropped).await;
                    });
                }
                Ok(ParseOutcome::NeedMore) => break,
                Ok(ParseOutcome::ResyncSkip(skip)) => buffer.consume(skip),
                Err(_) => return,
            }
        }
    }
}

async fn handle_frame(
    frame: frame::Frame,
    state: Arc<ServerState>,
    writer: Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    conn_upload_count: Arc<AtomicUsize>,
    dropped: Arc<std::sync::atomic::AtomicBool>,
) {
    let request = match state.codec.auto_decode_request(&frame.payload, frame.format) {
        Ok(request) => request,
        Err(err) => {
            let response = FileResponse::failure(format!("bad request: {err}"));
            respond(&state, &writer, frame.seq, frame.command, response).await;
            return;
        }
    };

    if request.operation() == Some(Operation::UploadData) {
        state.upload_data_frames.fetch_add(1, Ordering::SeqCst);
        let drop_after = state.behavior.lock().unwrap().drop_after_upload_chunks;
        if let Some(limit) = drop_after {
            let seen = conn_upload_count.fetch_add(1, Ordering::SeqCst);
            if seen >= limit {
                // Simulated network failure: shut the socket, answer nothing.
                if !dropped.swap(true, Ordering::SeqCst) {
                    let mut writer = writer.lock().await;
                    let _ = writer.shutdown().await;
                }
                return;
            }
        }
        let delay = request.chunk_index.and_then(|index| {
            state
                .behavior
                .lock()
                .unwrap()
                .upload_chunk_delays
                .get(&index)
                .copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    let response = dispatch(&state, &request);
    let command = match frame.command {
        Command::Ping => Command::Pong,
        other => other,
    };
    respond(&state, &writer, frame.seq, command, response).await;
}

async fn respond(
    state: &Arc<ServerState>,
    writer: &Arc<Mutex<tokio::net::tcp::OwnedWriteHalf>>,
    seq: u16,
    command: Command,
    response: FileResponse,
) {
    let (format, payload) = state.codec.smart_encode_response(&response).unwrap();
    let encoded = frame::encode(command, format, &payload, seq).unwrap();
    let mut writer = writer.lock().await;
    let _ = writer.write_all(&encoded).await;
    let _ = writer.flush().await;
}

fn dispatch(state: &Arc<ServerState>, request: &FileRequest) -> FileResponse {
    match request.operation() {
        Some(Operation::Ping) => FileResponse::ok(),
        Some(Operation::Connect) => FileResponse {
            selected_format: Some("protobuf".to_owned()),
            server_info: Some(ServerInfo {
                name: "mock-file-server".to_owned(),
                version: "1.0.0".to_owned(),
                protocol_version: Some("1".to_owned()),
                max_payload_bytes: Some(frame::MAX_PAYLOAD_LEN as u64),
            }),
            supported_commands: vec!["upload".to_owned(), "download".to_owned()],
            ..FileResponse::ok()
        },
        Some(Operation::Disconnect) => FileResponse::ok(),
        Some(Operation::ListFiles) => list_files(state, request),
        Some(Operation::FileInfo) => file_info(state, request),
        Some(Operation::CreateDir) => FileResponse::ok(),
        Some(Operation::DeleteFile) => {
            let path = request.path.clone().unwrap_or_default();
            state.files.lock().unwrap().remove(&path);
            FileResponse::ok()
        }
        Some(Operation::RenameFile) => rename_file(state, request),
        Some(Operation::UploadFile) => {
            let path = full_path(request);
            let data = request.data.clone().unwrap_or_default();
            state.put_file(&path, data);
            FileResponse::ok()
        }
        Some(Operation::DownloadFile) => {
            let path = request.path.clone().unwrap_or_default();
            match state.file(&path) {
                Some(data) => FileResponse {
                    file_size: Some(data.len() as u64),
                    data: Some(data),
                    ..FileResponse::ok()
                },
                None => FileResponse::failure("no such file"),
            }
        }
        Some(Operation::UploadReq) => upload_req(state, request),
        Some(Operation::UploadData) => upload_data(state, request),
        Some(Operation::UploadEnd) => upload_end(state, request),
        Some(Operation::DownloadReq) => download_req(state, request),
        _ => FileResponse::failure("unsupported operation"),
    }
}

fn full_path(request: &FileRequest) -> String {
    let dir = request.path.clone().unwrap_or_default();
    let name = request.name.clone().unwrap_or_default();
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn list_files(state: &Arc<ServerState>, request: &FileRequest) -> FileResponse {
    let prefix = request.path.clone().unwrap_or_default();
    let files = state.files.lock().unwrap();
    let entries: Vec<FileInfo> = files
        .iter()
        .filter(|(path, _)| path.starts_with(&prefix))
        .map(|(path, data)| FileInfo {
            name: path.rsplit('/').next().unwrap_or(path).to_owned(),
            path: path.clone(),
            entry_type: EntryType::File as i32,
            size: data.len() as u64,
            last_modified: Some("2026-08-01T00:00:00Z".to_owned()),
            permissions: Some("rw-r--r--".to_owned()),
            is_readonly: Some(false),
            mime_type: None,
        })
        .collect();
    FileResponse {
        files: entries,
        ..FileResponse::ok()
    }
}

fn file_info(state: &Arc<ServerState>, request: &FileRequest) -> FileResponse {
    let path = request.path.clone().unwrap_or_default();
    match state.file(&path) {
        Some(data) => FileResponse {
            files: vec![FileInfo {
                name: path.rsplit('/').next().unwrap_or(&path).to_owned(),
                path: path.clone(),
                entry_type: EntryType::File as i32,
                size: data.len() as u64,
                last_modified: Some("2026-08-01T00:00:00Z".to_owned()),
                permissions: Some("rw-r--r--".to_owned()),
                is_readonly: Some(false),
                mime_type: None,
            }],
            ..FileResponse::ok()
        },
        None => FileResponse::failure("no such file"),
    }
}

fn rename_file(state: &Arc<ServerState>, request: &FileRequest) -> FileResponse {
    let path = request.path.clone().unwrap_or_default();
    let new_name = request.new_name.clone().unwrap_or_default();
    let mut files = state.files.lock().unwrap();
    match files.remove(&path) {
        Some(data) => {
            let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
            files.insert(format!("{parent}/{new_name}"), data);
            FileResponse::ok()
        }
        None => FileResponse::failure("no such file"),
    }
}

fn upload_req(state: &Arc<ServerState>, request: &FileRequest) -> FileResponse {
    let Some(session_id) = request.options.get("sessionId").cloned() else {
        return FileResponse::failure("missing sessionId");
    };
    let accum = UploadAccum {
        target: request.path.clone().unwrap_or_default(),
        filename: request.name.clone().unwrap_or_default(),
        file_size: request.file_size.unwrap_or(0),
        total_chunks: request.total_chunks.unwrap_or(0),
        chunks: HashMap::new(),
    };
    state
        .uploads
        .lock()
        .unwrap()
        .entry(session_id.clone())
        .or_insert(accum);
    FileResponse {
        session_id: Some(session_id),
        ..FileResponse::ok()
    }
}

fn upload_data(state: &Arc<ServerState>, request: &FileRequest) -> FileResponse {
    let Some(session_id) = request.options.get("sessionId") else {
        return FileResponse::failure("missing sessionId");
    };
    let (Some(index), Some(data)) = (request.chunk_index, request.data.clone()) else {
        return FileResponse::failure("missing chunk fields");
    };
    let mut uploads = state.uploads.lock().unwrap();
    let Some(accum) = uploads.get_mut(session_id) else {
        return FileResponse::failure("unknown session");
    };
    // At-most-once: duplicates are acked but not rewritten.
    accum.chunks.entry(index).or_insert(data);
    FileResponse {
        chunk_index: Some(index),
        is_chunk: Some(true),
        ..FileResponse::ok()
    }
}

fn upload_end(state: &Arc<ServerState>, request: &FileRequest) -> FileResponse {
    let Some(session_id) = request.options.get("sessionId") else {
        return FileResponse::failure("missing sessionId");
    };
    let accum = state.uploads.lock().unwrap().remove(session_id);
    let Some(accum) = accum else {
        return FileResponse::failure("unknown session");
    };
    let total = request.total_chunks.unwrap_or(accum.total_chunks);
    let mut assembled = Vec::with_capacity(accum.file_size as usize);
    for index in 0..total {
        match accum.chunks.get(&index) {
            Some(chunk) => assembled.extend_from_slice(chunk),
            None => return FileResponse::failure(format!("missing chunk {index}")),
        }
    }
    let path = if accum.target.ends_with('/') {
        format!("{}{}", accum.target, accum.filename)
    } else {
        format!("{}/{}", accum.target, accum.filename)
    };
    state.put_file(&path, assembled);
    FileResponse::ok()
}

fn download_req(state: &Arc<ServerState>, request: &FileRequest) -> FileResponse {
    let action = request
        .options
        .get("action")
        .map(String::as_str)
        .unwrap_or("start");
    match action {
        "start" => {
            let path = request.path.clone().unwrap_or_default();
            let Some(data) = state.file(&path) else {
                return FileResponse::failure("no such file");
            };
            let hint: u32 = request
                .options
                .get("chunkSize")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(64 * 1024);
            let chunk_size = state
                .behavior
                .lock()
                .unwrap()
                .download_chunk_size
                .unwrap_or(hint)
                .max(1);
            let total_chunks = if data.is_empty() {
                0
            } else {
                data.len().div_ceil(chunk_size as usize) as u32
            };
            let session_id = format!(
                "dl-{}",
                state.download_session_counter.fetch_add(1, Ordering::SeqCst)
            );
            state.downloads.lock().unwrap().insert(
                session_id.clone(),
                DownloadState {
                    chunk_size,
                    total_chunks: total_chunks.max(1),
                    data: data.clone(),
                },
            );
            FileResponse {
                session_id: Some(session_id),
                accepted_chunk_size: Some(chunk_size),
                total_chunks: Some(total_chunks),
                file_size: Some(data.len() as u64),
                ..FileResponse::ok()
            }
        }
        "chunk" => {
            let Some(session_id) = request.options.get("sessionId") else {
                return FileResponse::failure("missing sessionId");
            };
            let Some(index) = request
                .options
                .get("chunkIndex")
                .and_then(|raw| raw.parse::<u32>().ok())
            else {
                return FileResponse::failure("missing chunkIndex");
            };
            let downloads = state.downloads.lock().unwrap();
            let Some(session) = downloads.get(session_id) else {
                return FileResponse::failure("unknown session");
            };
            if index >= session.total_chunks {
                return FileResponse::failure("chunk out of range");
            }
            let start = index as usize * session.chunk_size as usize;
            let end = (start + session.chunk_size as usize).min(session.data.len());
            let slice = if start >= session.data.len() {
                Vec::new()
            } else {
                session.data[start..end].to_vec()
            };
            FileResponse {
                chunk_index: Some(index),
                is_chunk: Some(true),
                data: Some(slice),
                ..FileResponse::ok()
            }
        }
        "finish" | "abort" => {
            if let Some(session_id) = request.options.get("sessionId") {
                state.downloads.lock().unwrap().remove(session_id);
            }
            FileResponse::ok()
        }
        other => FileResponse::failure(format!("unknown action {other}")),
    }
}
