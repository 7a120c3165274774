//! Control connection pooling.
//!
//! Connections are expensive to set up (TCP + login + capability probe), so
//! idle ones are kept per server, health-checked on checkout, and evicted
//! after sitting unused too long.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::ftp::capability::{self, Capabilities};
use crate::ftp::client::FtpClient;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 4,
            idle_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

struct IdleConnection {
    client: FtpClient,
    parked_at: Instant,
}

/// Pool for one server (host, port, credentials).
pub struct FtpPool {
    host: String,
    port: u16,
    username: String,
    password: String,
    config: PoolConfig,
    idle: Mutex<Vec<IdleConnection>>,
    /// Bounds total live connections, idle or leased.
    permits: Arc<Semaphore>,
    capabilities: Mutex<Option<Capabilities>>,
}

impl FtpPool {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
        config: PoolConfig,
    ) -> Arc<Self> {
        Arc::new(FtpPool {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            permits: Arc::new(Semaphore::new(config.max_connections.max(1))),
            config,
            idle: Mutex::new(Vec::new()),
            capabilities: Mutex::new(None),
        })
    }

    /// Capabilities from the first connection's probe.
    pub async fn capabilities(self: &Arc<Self>) -> Result<Capabilities> {
        if let Some(capabilities) = *self.capabilities.lock().await {
            return Ok(capabilities);
        }
        let lease = self.acquire().await?;
        let capabilities = (*self.capabilities.lock().await).unwrap_or_default();
        self.release(lease).await;
        Ok(capabilities)
    }

    /// Check a connection out. Idle ones are health-checked with NOOP and
    /// stale ones discarded; a fresh dial happens only under the cap.
    pub async fn acquire(self: &Arc<Self>) -> Result<FtpClient> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::session("ftp pool is closed"))?;
        // The permit rides along implicitly: it is restored in release() or
        // when a dead connection is dropped.
        permit.forget();

        loop {
            let candidate = {
                let mut idle = self.idle.lock().await;
                idle.pop()
            };
            let Some(mut parked) = candidate else { break };

            if parked.parked_at.elapsed() > self.config.idle_timeout {
                debug!(target: "ftp::pool", "Evicting idle-expired connection");
                parked.client.quit().await;
                continue;
            }
            match parked.client.noop().await {
                Ok(()) => return Ok(parked.client),
                Err(err) => {
                    debug!(
                        target: "ftp::pool",
                        error = %err,
                        "Health check failed, discarding connection"
                    );
                    continue;
                }
            }
        }

        match self.dial().await {
            Ok(client) => Ok(client),
            Err(err) => {
                // The slot is free again.
                self.permits.add_permits(1);
                Err(err)
            }
        }
    }

    /// Return a healthy connection to the idle set.
    pub async fn release(&self, client: FtpClient) {
        let mut idle = self.idle.lock().await;
        idle.push(IdleConnection {
            client,
            parked_at: Instant::now(),
        });
        drop(idle);
        self.permits.add_permits(1);
    }

    /// Drop a connection that failed mid-operation.
    pub async fn discard(&self, mut client: FtpClient) {
        client.quit().await;
        self.permits.add_permits(1);
    }

    /// Close everything idle. Leased connections die when discarded.
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        for mut parked in idle.drain(..) {
            parked.client.quit().await;
        }
    }

    async fn dial(self: &Arc<Self>) -> Result<FtpClient> {
        let mut client =
            FtpClient::connect(&self.host, self.port, self.config.connect_timeout).await?;
        client.login(&self.username, &self.password).await?;
        client.type_image().await?;

        let mut cached = self.capabilities.lock().await;
        if cached.is_none() {
            match capability::probe(&mut client).await {
                Ok(capabilities) => {
                    debug!(
                        target: "ftp::pool",
                        host = %self.host,
                        capabilities = %capabilities.summary(),
                        "Capability probe complete"
                    );
                    *cached = Some(capabilities);
                }
                Err(err) => {
                    warn!(
                        target: "ftp::pool",
                        error = %err,
                        "Capability probe failed, assuming a bare server"
                    );
                    *cached = Some(Capabilities::default());
                }
            }
        }
        Ok(client)
    }
}
