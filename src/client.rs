//! High-level client facade: remote file operations plus transfers,
//! composed from the connection, strategy, store and engine.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::error::{EngineError, Result};
use crate::protocol::command::Command;
use crate::protocol::compress::CompressionCodec;
use crate::protocol::message::{FileInfo, FileRequest, Operation, ServerInfo};
use crate::transfer::store::{ResumableUploadStore, StoreConfig};
use crate::transfer::{
    AdaptiveChunkStrategy, DownloadOptions, StrategyConfig, TransferEngine, TransferEngineConfig,
    UploadOptions,
};

pub struct FileServiceClient {
    config: EngineConfig,
    connection: Arc<Connection>,
    engine: Arc<TransferEngine>,
    strategy_cancel: CancellationToken,
}

impl FileServiceClient {
    /// Compose a client from configuration. The upload-session store opens
    /// (and possibly migrates) its on-disk state here.
    pub async fn new(config: EngineConfig) -> Result<Arc<Self>> {
        Self::with_store_config(config, StoreConfig::default()).await
    }

    pub async fn with_store_config(
        config: EngineConfig,
        store_config: StoreConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        if !config.host_allowed(&config.transport.host) {
            return Err(EngineError::config(format!(
                "host {:?} is not in the allowlist",
                config.transport.host
            )));
        }

        let compression = Arc::new(CompressionCodec::new(config.compression_config()));
        let connection = Connection::new(config.connection_config(), compression);

        let strategy = Arc::new(AdaptiveChunkStrategy::new(StrategyConfig {
            auto_adjust: config.transfer.chunk.auto_adjust,
            ..StrategyConfig::default()
        }));
        let strategy_cancel = CancellationToken::new();
        let _auto_adjust = strategy.spawn_auto_adjust(Duration::from_secs(30), strategy_cancel.clone());

        let store = ResumableUploadStore::open(store_config).await?;
        let engine = TransferEngine::new(
            Arc::clone(&connection),
            strategy,
            store,
            TransferEngineConfig {
                max_concurrency: config.transfer.concurrency.max as usize,
                ..TransferEngineConfig::default()
            },
        );

        Ok(Arc::new(FileServiceClient {
            config,
            connection,
            engine,
            strategy_cancel,
        }))
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn engine(&self) -> &Arc<TransferEngine> {
        &self.engine
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.connection.server_info()
    }

    /// List entries under a remote directory.
    pub async fn list_files(&self, path: &str) -> Result<Vec<FileInfo>> {
        let request = FileRequest::new(Operation::ListFiles).with_path(path);
        let response = self
            .connection
            .request_default(Command::ListFiles, &request)
            .await?;
        if !response.is_success() {
            return Err(EngineError::session(format!(
                "listing failed: {}",
                response.message_or_default()
            )));
        }
        Ok(response.files)
    }

    /// Stat one remote entry.
    pub async fn file_info(&self, path: &str) -> Result<FileInfo> {
        let request = FileRequest::new(Operation::FileInfo).with_path(path);
        let response = self
            .connection
            .request_default(Command::FileInfo, &request)
            .await?;
        if !response.is_success() {
            return Err(EngineError::session(format!(
                "stat failed: {}",
                response.message_or_default()
            )));
        }
        response
            .files
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::schema("stat response carries no entry"))
    }

    pub async fn create_dir(&self, path: &str, name: &str) -> Result<()> {
        let request = FileRequest::new(Operation::CreateDir)
            .with_path(path)
            .with_name(name);
        self.expect_ok(Command::CreateDir, &request, "create_dir")
            .await
    }

    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let request = FileRequest::new(Operation::DeleteFile).with_path(path);
        self.expect_ok(Command::DeleteFile, &request, "delete_file")
            .await
    }

    pub async fn rename_file(&self, path: &str, new_name: &str) -> Result<()> {
        let request = FileRequest::new(Operation::RenameFile)
            .with_path(path)
            .with_new_name(new_name);
        self.expect_ok(Command::RenameFile, &request, "rename_file")
            .await
    }

    /// Upload a buffer; the engine picks whole-file vs chunked.
    pub async fn upload(
        &self,
        target_path: &str,
        filename: &str,
        payload: Bytes,
        options: UploadOptions,
    ) -> Result<()> {
        self.engine
            .upload(target_path, filename, payload, options)
            .await
    }

    /// Download a remote file fully into memory.
    pub async fn download(&self, remote_path: &str, options: DownloadOptions) -> Result<Vec<u8>> {
        self.engine.download(remote_path, options).await
    }

    /// Download as an in-order stream of byte chunks.
    pub async fn download_streaming(
        &self,
        remote_path: &str,
        options: DownloadOptions,
    ) -> Result<ReceiverStream<Result<Bytes>>> {
        self.engine.download_streaming(remote_path, options).await
    }

    /// Tear everything down: connection, background tasks, session store.
    pub async fn shutdown(&self) {
        info!(target: "main", "File service client shutting down");
        self.strategy_cancel.cancel();
        self.connection.shutdown().await;
        self.engine.store().shutdown().await;
    }

    async fn expect_ok(
        &self,
        command: Command,
        request: &FileRequest,
        operation: &str,
    ) -> Result<()> {
        let response = self.connection.request_default(command, request).await?;
        if !response.is_success() {
            return Err(EngineError::session(format!(
                "{operation} failed: {}",
                response.message_or_default()
            )));
        }
        Ok(())
    }
}
