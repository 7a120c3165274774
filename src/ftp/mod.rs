//! FTP transport: the same operation surface as the framed TCP protocol,
//! spoken over pooled FTP control connections.
//!
//! A capability probe on first connect decides which execution paths are
//! available (MLSD listings, REST resume, MODE Z compression); the strategy
//! selector picks per request and every extended path falls back once to
//! plain on failure.

pub mod capability;
pub mod client;
pub mod pool;
pub mod strategy;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::ftp::capability::Capabilities;
use crate::ftp::client::FtpClient;
use crate::ftp::pool::{FtpPool, PoolConfig};
use crate::ftp::strategy::{ListingPath, TransferPath};
use crate::protocol::message::{EntryType, FileInfo};
use crate::retry::{RetryConfig, RetryManager};

pub use capability::Capabilities as FtpCapabilities;
pub use pool::PoolConfig as FtpPoolConfig;

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
}

impl Default for FtpConfig {
    fn default() -> Self {
        FtpConfig {
            host: "127.0.0.1".to_owned(),
            port: 21,
            username: "anonymous".to_owned(),
            password: "anonymous@".to_owned(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

pub struct FtpTransport {
    pool: Arc<FtpPool>,
    retry: Arc<RetryManager>,
}

impl FtpTransport {
    pub fn new(config: FtpConfig) -> Arc<Self> {
        let pool = FtpPool::new(
            config.host.clone(),
            config.port,
            config.username.clone(),
            config.password.clone(),
            config.pool.clone(),
        );
        Arc::new(FtpTransport {
            pool,
            retry: RetryManager::new(config.retry),
        })
    }

    pub async fn capabilities(self: &Arc<Self>) -> Result<Capabilities> {
        self.pool.capabilities().await
    }

    /// List a directory: MLSD where supported, LIST otherwise.
    pub async fn list(self: &Arc<Self>, path: &str) -> Result<Vec<FileInfo>> {
        let path = sanitize_path(path)?;
        let capabilities = self.pool.capabilities().await?;
        let transport = Arc::clone(self);
        self.retry
            .execute_with_retry(&format!("ftp-list:{path}"), move || {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                async move {
                    let mut client = transport.pool.acquire().await?;
                    let outcome = match strategy::pick_listing(capabilities) {
                        ListingPath::Mlsd => {
                            match client.retrieve(&format!("MLSD {path}"), None).await {
                                Ok(raw) => Ok(parse_mlsd(&raw, &path)),
                                // One fallback to the plain listing.
                                Err(err) => {
                                    debug!(
                                        target: "ftp",
                                        error = %err,
                                        "MLSD failed, falling back to LIST"
                                    );
                                    client
                                        .retrieve(&format!("LIST {path}"), None)
                                        .await
                                        .map(|raw| parse_list(&raw, &path))
                                }
                            }
                        }
                        ListingPath::List => client
                            .retrieve(&format!("LIST {path}"), None)
                            .await
                            .map(|raw| parse_list(&raw, &path)),
                    };
                    transport.settle(client, &outcome).await;
                    outcome
                }
            })
            .await
    }

    /// Stat one entry via its parent listing.
    pub async fn stat(self: &Arc<Self>, path: &str) -> Result<Option<FileInfo>> {
        let path = sanitize_path(path)?;
        let (parent, name) = split_parent(&path);
        let entries = self.list(&parent).await?;
        Ok(entries.into_iter().find(|entry| entry.name == name))
    }

    pub async fn mkdir(self: &Arc<Self>, path: &str) -> Result<()> {
        self.plain_command(PlainVerb::Mkdir, path).await
    }

    pub async fn delete(self: &Arc<Self>, path: &str) -> Result<()> {
        self.plain_command(PlainVerb::Delete, path).await
    }

    pub async fn rmdir(self: &Arc<Self>, path: &str) -> Result<()> {
        self.plain_command(PlainVerb::Rmdir, path).await
    }

    pub async fn rename(self: &Arc<Self>, from: &str, to: &str) -> Result<()> {
        let from = sanitize_path(from)?;
        let to = sanitize_path(to)?;
        let transport = Arc::clone(self);
        self.retry
            .execute_with_retry(&format!("ftp-rename:{from}"), move || {
                let transport = Arc::clone(&transport);
                let from = from.clone();
                let to = to.clone();
                async move {
                    let mut client = transport.pool.acquire().await?;
                    let outcome = client.rename(&from, &to).await;
                    transport.settle(client, &outcome).await;
                    outcome
                }
            })
            .await
    }

    /// Upload with the strategy-selected path and a single fallback.
    pub async fn upload(self: &Arc<Self>, path: &str, payload: &[u8]) -> Result<()> {
        let path = sanitize_path(path)?;
        let capabilities = self.pool.capabilities().await?;
        let filename = path.rsplit('/').next().unwrap_or(&path);
        let mut path_choice =
            strategy::pick_upload(capabilities, payload.len() as u64, filename);

        loop {
            let result = self.upload_via(&path, payload, path_choice).await;
            match result {
                Ok(()) => {
                    info!(
                        target: "ftp",
                        path = %path,
                        bytes = payload.len(),
                        strategy = path_choice.as_str(),
                        "Upload complete"
                    );
                    return Ok(());
                }
                Err(err) => match strategy::fallback(path_choice) {
                    Some(plain) => {
                        warn!(
                            target: "ftp",
                            path = %path,
                            strategy = path_choice.as_str(),
                            error = %err,
                            "Extended upload path failed, retrying plain"
                        );
                        path_choice = plain;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    /// Download, resuming from `resume_offset` when REST is available.
    pub async fn download(self: &Arc<Self>, path: &str, resume_offset: u64) -> Result<Vec<u8>> {
        let path = sanitize_path(path)?;
        let capabilities = self.pool.capabilities().await?;
        let mut path_choice = strategy::pick_download(capabilities, resume_offset);

        loop {
            let result = self.download_via(&path, resume_offset, path_choice).await;
            match result {
                Ok(data) => return Ok(data),
                Err(err) => match strategy::fallback(path_choice) {
                    Some(plain) => {
                        warn!(
                            target: "ftp",
                            path = %path,
                            strategy = path_choice.as_str(),
                            error = %err,
                            "Extended download path failed, retrying plain"
                        );
                        path_choice = plain;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    async fn upload_via(
        self: &Arc<Self>,
        path: &str,
        payload: &[u8],
        path_choice: TransferPath,
    ) -> Result<()> {
        let transport = Arc::clone(self);
        let path = path.to_owned();
        let payload = payload.to_vec();
        self.retry
            .execute_with_retry(&format!("ftp-upload:{path}"), move || {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                let payload = payload.clone();
                async move {
                    let mut client = transport.pool.acquire().await?;
                    let outcome = match path_choice {
                        TransferPath::Plain => {
                            client.store(&format!("STOR {path}"), &payload, None).await
                        }
                        TransferPath::Resumable => {
                            // Append after whatever the server already holds.
                            let offset = client.size(&path).await?.unwrap_or(0);
                            let remaining =
                                payload.get(offset as usize..).unwrap_or(&[]);
                            if offset == 0 {
                                client.store(&format!("STOR {path}"), &payload, None).await
                            } else {
                                debug!(
                                    target: "ftp",
                                    path = %path,
                                    offset,
                                    "Resuming upload with APPE"
                                );
                                client.store(&format!("APPE {path}"), remaining, None).await
                            }
                        }
                        TransferPath::Compressed => {
                            let compressed = deflate(&payload)?;
                            client.set_mode_z(true).await?;
                            let stored = client
                                .store(&format!("STOR {path}"), &compressed, None)
                                .await;
                            let restored = client.set_mode_z(false).await;
                            stored.and(restored)
                        }
                    };
                    transport.settle(client, &outcome).await;
                    outcome
                }
            })
            .await
    }

    async fn download_via(
        self: &Arc<Self>,
        path: &str,
        resume_offset: u64,
        path_choice: TransferPath,
    ) -> Result<Vec<u8>> {
        let transport = Arc::clone(self);
        let path = path.to_owned();
        self.retry
            .execute_with_retry(&format!("ftp-download:{path}"), move || {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                async move {
                    let mut client = transport.pool.acquire().await?;
                    let outcome = match path_choice {
                        TransferPath::Resumable => {
                            client
                                .retrieve(&format!("RETR {path}"), Some(resume_offset))
                                .await
                        }
                        _ => client.retrieve(&format!("RETR {path}"), None).await,
                    };
                    transport.settle(client, &outcome).await;
                    outcome
                }
            })
            .await
    }

    async fn plain_command(self: &Arc<Self>, verb: PlainVerb, path: &str) -> Result<()> {
        let path = sanitize_path(path)?;
        let transport = Arc::clone(self);
        self.retry
            .execute_with_retry(&format!("{}:{path}", verb.as_str()), move || {
                let transport = Arc::clone(&transport);
                let path = path.clone();
                async move {
                    let mut client = transport.pool.acquire().await?;
                    let outcome = match verb {
                        PlainVerb::Mkdir => client.mkdir(&path).await,
                        PlainVerb::Delete => client.delete(&path).await,
                        PlainVerb::Rmdir => client.rmdir(&path).await,
                    };
                    transport.settle(client, &outcome).await;
                    outcome
                }
            })
            .await
    }

    /// Return a healthy connection to the pool, discard a broken one.
    async fn settle<T>(&self, client: FtpClient, outcome: &Result<T>) {
        match outcome {
            Ok(_) => self.pool.release(client).await,
            Err(_) => self.pool.discard(client).await,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PlainVerb {
    Mkdir,
    Delete,
    Rmdir,
}

impl PlainVerb {
    fn as_str(&self) -> &'static str {
        match self {
            PlainVerb::Mkdir => "ftp-mkdir",
            PlainVerb::Delete => "ftp-delete",
            PlainVerb::Rmdir => "ftp-rmdir",
        }
    }
}

/// Normalise separators, strip empty and `.` segments, refuse `..` outright.
pub fn sanitize_path(path: &str) -> Result<String> {
    let mut segments = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(EngineError::schema(format!(
                    "path {path:?} contains a parent-directory segment"
                )));
            }
            other => segments.push(other),
        }
    }
    Ok(format!("/{}", segments.join("/")))
}

fn split_parent(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_owned(), path[1..].to_owned()),
        Some(at) => (path[..at].to_owned(), path[at + 1..].to_owned()),
        None => ("/".to_owned(), path.to_owned()),
    }
}

/// MODE Z uses the zlib deflate stream.
fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[allow(dead_code)]
fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(data)?;
    Ok(decoder.finish()?)
}

/// Parse MLSD fact lines: `type=file;size=123;modify=20240101120000; name`.
fn parse_mlsd(raw: &[u8], base: &str) -> Vec<FileInfo> {
    String::from_utf8_lossy(raw)
        .lines()
        .filter_map(|line| parse_mlsd_line(line, base))
        .collect()
}

fn parse_mlsd_line(line: &str, base: &str) -> Option<FileInfo> {
    let (facts, name) = line.split_once(' ')?;
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    let mut entry_type = EntryType::File;
    let mut size = 0u64;
    let mut modify = None;
    let mut permissions = None;
    for fact in facts.split(';') {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        match key.to_ascii_lowercase().as_str() {
            "type" => match value.to_ascii_lowercase().as_str() {
                "dir" | "cdir" | "pdir" => entry_type = EntryType::Directory,
                _ => entry_type = EntryType::File,
            },
            "size" => size = value.parse().unwrap_or(0),
            "modify" => modify = Some(value.to_owned()),
            "unix.mode" | "perm" => permissions = Some(value.to_owned()),
            _ => {}
        }
    }
    Some(FileInfo {
        name: name.to_owned(),
        path: join_path(base, name),
        entry_type: entry_type as i32,
        size,
        last_modified: modify,
        permissions,
        is_readonly: None,
        mime_type: None,
    })
}

/// Parse a unix-style LIST line:
/// `-rw-r--r-- 1 user group 1234 Jan 01 12:00 name`.
fn parse_list(raw: &[u8], base: &str) -> Vec<FileInfo> {
    String::from_utf8_lossy(raw)
        .lines()
        .filter_map(|line| parse_list_line(line, base))
        .collect()
}

fn parse_list_line(line: &str, base: &str) -> Option<FileInfo> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 9 {
        return None;
    }
    let mode = fields[0];
    let entry_type = if mode.starts_with('d') {
        EntryType::Directory
    } else if mode.starts_with('-') {
        EntryType::File
    } else {
        // Links, sockets and the rest are not exposed.
        return None;
    };
    let size: u64 = fields[4].parse().unwrap_or(0);
    let modified = format!("{} {} {}", fields[5], fields[6], fields[7]);
    let name = fields[8..].join(" ");
    if name == "." || name == ".." {
        return None;
    }
    Some(FileInfo {
        name: name.clone(),
        path: join_path(base, &name),
        entry_type: entry_type as i32,
        size,
        last_modified: Some(modified),
        permissions: Some(mode.to_owned()),
        is_readonly: Some(!mode.contains('w')),
        mime_type: None,
    })
}

fn join_path(base: &str, name: &str) -> String {
    if base == "/" {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_sanitisation() {
        assert_eq!(sanitize_path("inbox/reports").unwrap(), "/inbox/reports");
        assert_eq!(sanitize_path("/a//b/./c").unwrap(), "/a/b/c");
        assert_eq!(sanitize_path("a\\b").unwrap(), "/a/b");
        assert!(sanitize_path("/a/../b").is_err());
        assert_eq!(sanitize_path("/").unwrap(), "/");
    }

    #[test]
    fn mlsd_parsing() {
        let raw = b"type=file;size=2048;modify=20240615120000; report.txt\r\n\
type=dir;modify=20240615120000; archive\r\n\
type=cdir; .\r\n";
        let entries = parse_mlsd(raw, "/inbox");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "report.txt");
        assert_eq!(entries[0].size, 2048);
        assert_eq!(entries[0].path, "/inbox/report.txt");
        assert!(!entries[0].is_directory());
        assert!(entries[1].is_directory());
    }

    #[test]
    fn list_parsing() {
        let raw = b"-rw-r--r-- 1 alice staff 1234 Jan 01 12:00 data file.bin\r\n\
drwxr-xr-x 2 alice staff 4096 Jan 02 09:30 logs\r\n\
lrwxrwxrwx 1 alice staff 9 Jan 03 10:00 link -> target\r\n";
        let entries = parse_list(raw, "/");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "data file.bin");
        assert_eq!(entries[0].size, 1234);
        assert_eq!(entries[0].path, "/data file.bin");
        assert!(entries[1].is_directory());
    }

    #[test]
    fn deflate_inflate_round_trip() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let packed = deflate(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(inflate(&packed).unwrap(), data);
    }

    #[test]
    fn parent_splitting() {
        assert_eq!(
            split_parent("/inbox/file.txt"),
            ("/inbox".to_owned(), "file.txt".to_owned())
        );
        assert_eq!(split_parent("/top"), ("/".to_owned(), "top".to_owned()));
    }
}
