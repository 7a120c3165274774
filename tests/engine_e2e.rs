//! End-to-end scenarios against the in-process mock server.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use tokio_stream::StreamExt;

use common::{MockServer, ServerBehavior};
use efm_engine::client::FileServiceClient;
use efm_engine::config::EngineConfig;
use efm_engine::error::EngineError;
use efm_engine::transfer::store::StoreConfig;
use efm_engine::transfer::{DownloadOptions, UploadOptions};

async fn client_for(
    server: &MockServer,
    store_dir: &std::path::Path,
) -> Arc<FileServiceClient> {
    let mut config = EngineConfig::default();
    config.transport.host = server.addr.ip().to_string();
    config.transport.port = server.addr.port();
    config.transport.timeout_ms = 10_000;
    let client = FileServiceClient::with_store_config(
        config,
        StoreConfig {
            directory: store_dir.to_path_buf(),
            session_ttl: Duration::from_secs(3600),
            cleanup_interval: Duration::from_secs(3600),
        },
    )
    .await
    .unwrap();
    client.connect().await.unwrap();
    client
}

#[tokio::test]
async fn small_upload_round_trip() {
    let server = MockServer::start().await;
    let store_dir = tempfile::tempdir().unwrap();
    let client = client_for(&server, store_dir.path()).await;

    let mut payload = b"hello-stream-e2e-".to_vec();
    payload.extend(std::iter::repeat_n(b'x', 10_000));
    let expected_chunks = payload.len().div_ceil(4096);

    client
        .upload(
            "/",
            "hello.bin",
            Bytes::from(payload.clone()),
            UploadOptions {
                chunk_size: Some(4096),
                force_chunked: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(
        server.state.upload_data_frames.load(Ordering::SeqCst),
        expected_chunks
    );
    assert_eq!(server.state.file("/hello.bin"), Some(payload.clone()));

    // And a whole-file download gives the bytes back.
    let downloaded = client
        .download("/hello.bin", DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(downloaded, payload);

    client.shutdown().await;
}

#[tokio::test]
async fn out_of_order_upload_acks() {
    let behavior = ServerBehavior {
        upload_chunk_delays: HashMap::from([
            (0u32, Duration::from_millis(40)),
            (1u32, Duration::from_millis(10)),
            (2u32, Duration::from_millis(60)),
            (3u32, Duration::from_millis(0)),
        ]),
        ..Default::default()
    };
    let server = MockServer::start_with(behavior).await;
    let store_dir = tempfile::tempdir().unwrap();
    let client = client_for(&server, store_dir.path()).await;

    let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    client
        .upload(
            "/inbox",
            "ooo.bin",
            Bytes::from(payload.clone()),
            UploadOptions {
                chunk_size: Some(16 * 1024),
                force_chunked: true,
                persist: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Server-side reconstruction is byte-equal despite shuffled acks.
    assert_eq!(server.state.file("/inbox/ooo.bin"), Some(payload));

    // One write created the session, one per chunk ack; the completed
    // session record itself is gone.
    let store = client.engine().store();
    store.flush().await.unwrap();
    assert_eq!(store.stats().persist_writes.load(Ordering::SeqCst), 5);
    assert_eq!(store.session_count(), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn upload_resumes_after_interruption() {
    let behavior = ServerBehavior {
        drop_after_upload_chunks: Some(2),
        ..Default::default()
    };
    let server = MockServer::start_with(behavior).await;
    let store_dir = tempfile::tempdir().unwrap();
    let client = client_for(&server, store_dir.path()).await;

    let payload: Vec<u8> = (0..80 * 1024u32).map(|i| (i * 13 % 256) as u8).collect();
    let options = || UploadOptions {
        chunk_size: Some(16 * 1024),
        force_chunked: true,
        persist: Some(true),
        ..Default::default()
    };

    // First attempt dies mid-transfer when the server drops the socket.
    let result = client
        .upload("/inbox", "resume.bin", Bytes::from(payload.clone()), options())
        .await;
    assert!(result.is_err());

    // The session survived the failure for a later resume.
    let store = client.engine().store();
    store.flush().await.unwrap();
    assert_eq!(store.session_count(), 1);

    // Server heals; reconnect and run the upload to completion.
    server.state.behavior.lock().unwrap().drop_after_upload_chunks = None;
    client.connect().await.unwrap();
    client
        .upload("/inbox", "resume.bin", Bytes::from(payload.clone()), options())
        .await
        .unwrap();

    assert_eq!(server.state.file("/inbox/resume.bin"), Some(payload.clone()));
    let downloaded = client
        .download("/inbox/resume.bin", DownloadOptions::default())
        .await
        .unwrap();
    assert_eq!(downloaded, payload);

    client.shutdown().await;
}

#[tokio::test]
async fn streaming_download_is_in_order() {
    let server = MockServer::start_with(ServerBehavior {
        download_chunk_size: Some(8 * 1024),
        ..Default::default()
    })
    .await;
    let store_dir = tempfile::tempdir().unwrap();
    let client = client_for(&server, store_dir.path()).await;

    let payload: Vec<u8> = (0..100 * 1024u32).map(|i| (i * 31 % 256) as u8).collect();
    server.state.put_file("/big/stream.bin", payload.clone());

    let mut stream = client
        .download_streaming("/big/stream.bin", DownloadOptions::default())
        .await
        .unwrap();
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk.unwrap());
    }
    assert_eq!(collected, payload);

    client.shutdown().await;
}

#[tokio::test]
async fn download_of_missing_file_fails_cleanly() {
    let server = MockServer::start().await;
    let store_dir = tempfile::tempdir().unwrap();
    let client = client_for(&server, store_dir.path()).await;

    let result = client.download("/nope.bin", DownloadOptions::default()).await;
    assert!(matches!(result, Err(EngineError::Session(_))));
    client.shutdown().await;
}

#[tokio::test]
async fn empty_file_download_normalises_to_one_chunk() {
    let server = MockServer::start().await;
    let store_dir = tempfile::tempdir().unwrap();
    let client = client_for(&server, store_dir.path()).await;

    server.state.put_file("/empty.bin", Vec::new());
    let downloaded = client
        .download("/empty.bin", DownloadOptions::default())
        .await
        .unwrap();
    assert!(downloaded.is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn file_management_operations() {
    let server = MockServer::start().await;
    let store_dir = tempfile::tempdir().unwrap();
    let client = client_for(&server, store_dir.path()).await;

    assert!(client.server_info().is_some());

    client
        .upload(
            "/docs",
            "a.txt",
            Bytes::from_static(b"alpha"),
            UploadOptions::default(),
        )
        .await
        .unwrap();
    client
        .upload(
            "/docs",
            "b.txt",
            Bytes::from_static(b"bravo"),
            UploadOptions::default(),
        )
        .await
        .unwrap();

    let listing = client.list_files("/docs").await.unwrap();
    assert_eq!(listing.len(), 2);

    let info = client.file_info("/docs/a.txt").await.unwrap();
    assert_eq!(info.size, 5);

    client.rename_file("/docs/a.txt", "a2.txt").await.unwrap();
    assert!(client.file_info("/docs/a.txt").await.is_err());
    assert_eq!(client.file_info("/docs/a2.txt").await.unwrap().size, 5);

    client.delete_file("/docs/b.txt").await.unwrap();
    assert!(client.file_info("/docs/b.txt").await.is_err());

    client.create_dir("/docs", "sub").await.unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn sequence_numbers_wrap_without_collisions() {
    let server = MockServer::start().await;
    let store_dir = tempfile::tempdir().unwrap();
    let client = client_for(&server, store_dir.path()).await;

    server.state.put_file("/ping-target", b"x".to_vec());
    let connection = client.connection();

    // Enough requests to wrap the 16-bit sequence space with room to spare.
    const TOTAL: usize = (1 << 16) + 5;
    const BATCH: usize = 512;
    let mut remaining = TOTAL;
    while remaining > 0 {
        let batch = remaining.min(BATCH);
        let mut handles = Vec::with_capacity(batch);
        for _ in 0..batch {
            let connection = Arc::clone(connection);
            handles.push(tokio::spawn(async move {
                let request = efm_engine::protocol::FileRequest::new(
                    efm_engine::protocol::Operation::Ping,
                );
                connection
                    .request(
                        efm_engine::protocol::Command::Ping,
                        &request,
                        Duration::from_secs(10),
                    )
                    .await
            }));
        }
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            assert!(response.is_success());
        }
        remaining -= batch;
    }

    let stats = connection.multiplexer().stats();
    assert_eq!(stats.emergency_cleanups.load(Ordering::SeqCst), 0);
    assert_eq!(connection.multiplexer().in_flight(), 0);
    client.shutdown().await;
}
