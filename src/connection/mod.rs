//! Connection ownership: one TCP stream, one reader task, one writer path.
//!
//! The reader task assembles frames and hands them to the multiplexer; all
//! writes go through the multiplexer's write gate. Keepalive and the
//! reconnect supervisor hang off the state machine.

pub mod keepalive;
pub mod multiplexer;
pub mod reconnect;
pub mod state;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::SockRef;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::protocol::codec::MessageCodec;
use crate::protocol::command::Command;
use crate::protocol::compress::CompressionCodec;
use crate::protocol::frame::{self, ParseOutcome};
use crate::protocol::message::{FileRequest, FileResponse, Operation, ServerInfo};

pub use keepalive::{KeepAlive, KeepAliveConfig, Pinger};
pub use multiplexer::{MAX_CONCURRENT_REQUESTS, Multiplexer, MuxConfig, MuxStats, RecvBuffer};
pub use reconnect::{ConnectionHandler, ReconnectConfig, ReconnectSupervisor};
pub use state::{ConnectionState, ConnectionStateMachine, SubscriptionId, TransitionRecord};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub client_id: String,
    pub client_version: String,
    pub keepalive: KeepAliveConfig,
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "127.0.0.1".to_owned(),
            port: 9521,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            client_id: "efm-engine".to_owned(),
            client_version: env!("CARGO_PKG_VERSION").to_owned(),
            keepalive: KeepAliveConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

struct ReaderHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Connection {
    config: ConnectionConfig,
    state: Arc<ConnectionStateMachine>,
    mux: Arc<Multiplexer>,
    keepalive: Arc<KeepAlive>,
    keepalive_task: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<ReaderHandle>>,
    server_info: std::sync::Mutex<Option<ServerInfo>>,
    connect_gate: Mutex<()>,
    supervisor: std::sync::Mutex<Option<Arc<ReconnectSupervisor>>>,
}

impl Connection {
    pub fn new(config: ConnectionConfig, compression: Arc<CompressionCodec>) -> Arc<Self> {
        let state = ConnectionStateMachine::new();
        let mux = Multiplexer::new(
            MuxConfig {
                default_timeout: config.request_timeout,
                ..Default::default()
            },
            MessageCodec::new(compression),
        );

        // Leaving CONNECTED rejects everything in flight, whatever the
        // trigger was (keepalive, reset, orderly disconnect).
        let fail_mux = Arc::clone(&mux);
        state.subscribe(move |record| {
            if record.from == ConnectionState::Connected {
                fail_mux.fail_all(&record.reason);
            }
        });

        let keepalive = KeepAlive::new(config.keepalive.clone());

        let connection = Arc::new(Connection {
            keepalive,
            state,
            mux,
            keepalive_task: Mutex::new(None),
            reader: Mutex::new(None),
            server_info: std::sync::Mutex::new(None),
            connect_gate: Mutex::new(()),
            supervisor: std::sync::Mutex::new(None),
            config,
        });

        if connection.config.reconnect.enabled {
            let supervisor = ReconnectSupervisor::attach(
                connection.config.reconnect.clone(),
                Arc::clone(&connection.state),
                Arc::new(Dialer {
                    connection: Arc::downgrade(&connection),
                }),
            );
            *connection.supervisor.lock().expect("supervisor lock") = Some(supervisor);
        }

        connection
    }

    pub fn state(&self) -> &Arc<ConnectionStateMachine> {
        &self.state
    }

    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    pub fn keepalive(&self) -> &Arc<KeepAlive> {
        &self.keepalive
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().expect("server info lock").clone()
    }

    /// Dial, perform the CONNECT exchange, and start the reader and
    /// keepalive tasks. A no-op when already connected.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _gate = self.connect_gate.lock().await;
        if self.state.is_connected() {
            return Ok(());
        }
        // Reconnect attempts arrive in RECONNECTING; everything else dials
        // through CONNECTING.
        if self.state.current() != ConnectionState::Reconnecting
            && !self.state.try_transition(ConnectionState::Connecting, "dial")
        {
            return Err(EngineError::Disconnected(format!(
                "cannot dial from state {}",
                self.state.current()
            )));
        }

        match self.establish().await {
            Ok(()) => {
                self.state.try_transition(ConnectionState::Connected, "handshake complete");
                self.start_keepalive().await;
                info!(
                    target: "connection",
                    host = %self.config.host,
                    port = self.config.port,
                    "Connected"
                );
                Ok(())
            }
            Err(err) => {
                self.teardown_io("dial failed").await;
                self.state
                    .try_transition(ConnectionState::Error, "dial failed");
                Err(err)
            }
        }
    }

    async fn establish(self: &Arc<Self>) -> Result<()> {
        let address = format!("{}:{}", self.config.host, self.config.port);
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| EngineError::Timeout {
                elapsed_ms: self.config.connect_timeout.as_millis() as u64,
            })??;

        // Latency-sensitive small frames: no Nagle. OS keepalive backs up
        // the application-level probe.
        stream.set_nodelay(true)?;
        let sock = SockRef::from(&stream);
        sock.set_keepalive(true)?;

        let (read_half, write_half) = stream.into_split();
        self.mux.set_writer(write_half).await;
        self.spawn_reader(read_half).await;

        let request = FileRequest {
            client_id: Some(self.config.client_id.clone()),
            version: Some(self.config.client_version.clone()),
            supported_formats: vec!["protobuf".to_owned()],
            preferred_format: Some("protobuf".to_owned()),
            ..FileRequest::new(Operation::Connect)
        };
        let response = self
            .mux
            .send(Command::Connect, &request, self.config.request_timeout)
            .await?;
        if !response.is_success() {
            return Err(EngineError::Disconnected(format!(
                "server refused connection: {}",
                response.message_or_default()
            )));
        }
        if let Some(info) = &response.server_info {
            debug!(
                target: "connection",
                server = %info.name,
                version = %info.version,
                "Server identified"
            );
        }
        *self.server_info.lock().expect("server info lock") = response.server_info.clone();
        self.keepalive.record_activity("connect");
        Ok(())
    }

    /// Send a request over this connection. Success counts as activity for
    /// keepalive idle suppression.
    pub async fn request(
        &self,
        command: Command,
        request: &FileRequest,
        timeout: Duration,
    ) -> Result<FileResponse> {
        if !self.state.is_connected() {
            return Err(EngineError::Disconnected(format!(
                "connection is {}",
                self.state.current()
            )));
        }
        let response = self.mux.send(command, request, timeout).await?;
        self.keepalive.record_activity("send");
        Ok(response)
    }

    pub async fn request_default(
        &self,
        command: Command,
        request: &FileRequest,
    ) -> Result<FileResponse> {
        self.request(command, request, self.config.request_timeout)
            .await
    }

    /// Orderly shutdown: best-effort DISCONNECT, then tear the stream down.
    pub async fn disconnect(&self) -> Result<()> {
        if self.state.is_connected() {
            let request = FileRequest::new(Operation::Disconnect);
            let _ = self
                .mux
                .send(Command::Disconnect, &request, Duration::from_secs(2))
                .await;
        }
        self.teardown_io("disconnect").await;
        self.state
            .try_transition(ConnectionState::Disconnected, "disconnect requested");
        Ok(())
    }

    /// Full shutdown including the reconnect supervisor. The connection is
    /// not reusable afterwards.
    pub async fn shutdown(&self) {
        if let Some(supervisor) = self.supervisor.lock().expect("supervisor lock").take() {
            supervisor.shutdown();
        }
        let _ = self.disconnect().await;
        self.keepalive.stop();
        if let Some(task) = self.keepalive_task.lock().await.take() {
            task.abort();
        }
    }

    async fn start_keepalive(self: &Arc<Self>) {
        let mut slot = self.keepalive_task.lock().await;
        if slot.is_some() {
            return;
        }
        let pinger: Arc<dyn Pinger> = Arc::new(MuxPinger {
            connection: Arc::downgrade(self),
        });
        let lost_state = Arc::clone(&self.state);
        let handle = self.keepalive.spawn(
            pinger,
            Arc::clone(&self.state),
            self.config.reconnect.enabled,
            Box::new(move || {
                warn!(target: "connection", "Keepalive declared the connection lost");
                // With auto-reconnect on, hand the machine to the supervisor.
                lost_state.try_transition(ConnectionState::Disconnected, "keepalive");
            }),
        );
        *slot = Some(handle);
    }

    async fn spawn_reader(self: &Arc<Self>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let connection = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut buffer = RecvBuffer::new();
            let mut scratch = vec![0u8; READ_CHUNK];
            loop {
                let read = tokio::select! {
                    _ = reader_cancel.cancelled() => return,
                    read = read_half.read(&mut scratch) => read,
                };
                match read {
                    Ok(0) => {
                        debug!(target: "connection", "Peer closed the stream");
                        connection.handle_stream_loss("peer closed").await;
                        return;
                    }
                    Ok(n) => {
                        buffer.push(Bytes::copy_from_slice(&scratch[..n]));
                        if let Err(err) = connection.drain_frames(&mut buffer) {
                            warn!(
                                target: "connection",
                                error = %err,
                                "Protocol violation, resetting connection"
                            );
                            connection.handle_stream_loss("protocol error").await;
                            return;
                        }
                    }
                    Err(err) => {
                        warn!(target: "connection", error = %err, "Socket read failed");
                        connection.handle_stream_loss("read error").await;
                        return;
                    }
                }
            }
        });

        *self.reader.lock().await = Some(ReaderHandle { cancel, task });
    }

    /// Parse every complete frame out of the buffer and dispatch it.
    fn drain_frames(&self, buffer: &mut RecvBuffer) -> Result<()> {
        loop {
            if buffer.is_empty() {
                return Ok(());
            }
            match frame::try_parse(buffer.contiguous())? {
                ParseOutcome::Frame { frame, consumed } => {
                    buffer.consume(consumed);
                    self.keepalive.record_activity("inbound");
                    self.mux.handle_frame(frame);
                }
                ParseOutcome::NeedMore => return Ok(()),
                ParseOutcome::ResyncSkip(skip) => {
                    warn!(
                        target: "connection",
                        skipped = skip,
                        "Desynchronised stream, dropping prefix"
                    );
                    buffer.consume(skip);
                }
            }
        }
    }

    async fn handle_stream_loss(&self, reason: &str) {
        self.mux.detach(reason).await;
        // Prefer ERROR for protocol faults, DISCONNECTED for orderly EOF.
        let target = if reason == "protocol error" {
            ConnectionState::Error
        } else {
            ConnectionState::Disconnected
        };
        self.state.try_transition(target, reason);
    }

    async fn teardown_io(&self, reason: &str) {
        if let Some(handle) = self.reader.lock().await.take() {
            handle.cancel.cancel();
            handle.task.abort();
        }
        self.mux.detach(reason).await;
    }
}

struct MuxPinger {
    connection: Weak<Connection>,
}

#[async_trait]
impl Pinger for MuxPinger {
    async fn ping(&self, timeout: Duration) -> Result<()> {
        let connection = self
            .connection
            .upgrade()
            .ok_or_else(|| EngineError::Disconnected("connection dropped".to_owned()))?;
        let request = FileRequest::new(Operation::Ping);
        let response = connection
            .mux
            .send(Command::Ping, &request, timeout)
            .await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(EngineError::Disconnected("ping rejected".to_owned()))
        }
    }
}

struct Dialer {
    connection: Weak<Connection>,
}

#[async_trait]
impl ConnectionHandler for Dialer {
    async fn connect(&self) -> Result<()> {
        match self.connection.upgrade() {
            Some(connection) => connection.connect().await,
            None => Err(EngineError::Disconnected("connection dropped".to_owned())),
        }
    }
}
