//! FTP control connection: a line-oriented dialogue over TCP.
//!
//! Covers the command set the transport needs: login, FEAT, TYPE I, MODE Z,
//! PASV data connections, REST offsets, listings (MLSD/LIST) and the plain
//! file-management verbs. Replies follow RFC 959 framing, including
//! multi-line `code-` blocks.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::{EngineError, Result};

/// One parsed control-channel reply.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_positive_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_intermediate(&self) -> bool {
        (300..400).contains(&self.code)
    }

    /// 4xx: transient, worth retrying. 5xx: permanent.
    pub fn is_transient_error(&self) -> bool {
        (400..500).contains(&self.code)
    }

    pub fn text(&self) -> String {
        self.lines.join(" ")
    }
}

pub struct FtpClient {
    control: BufReader<TcpStream>,
    timeout: Duration,
    /// Peer address, reused when PASV advertises a bogus private address.
    peer_ip: Ipv4Addr,
}

impl FtpClient {
    /// Dial the control port and consume the 220 greeting.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| EngineError::Timeout {
                elapsed_ms: timeout.as_millis() as u64,
            })??;
        stream.set_nodelay(true)?;
        let peer_ip = match stream.peer_addr()? {
            std::net::SocketAddr::V4(addr) => *addr.ip(),
            std::net::SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let mut client = FtpClient {
            control: BufReader::new(stream),
            timeout,
            peer_ip,
        };
        let greeting = client.read_reply().await?;
        if !greeting.is_positive() {
            return Err(server_error(&greeting, "greeting"));
        }
        debug!(target: "ftp::client", host, port, "Control connection established");
        Ok(client)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let reply = self.command(&format!("USER {username}")).await?;
        if reply.is_intermediate() {
            let reply = self.command(&format!("PASS {password}")).await?;
            if !reply.is_positive() {
                return Err(server_error(&reply, "PASS"));
            }
        } else if !reply.is_positive() {
            return Err(server_error(&reply, "USER"));
        }
        Ok(())
    }

    /// Send one command and read its reply.
    pub async fn command(&mut self, line: &str) -> Result<Reply> {
        trace!(target: "ftp::client", command = redact(line), "->");
        let stream = self.control.get_mut();
        stream.write_all(line.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        self.read_reply().await
    }

    /// Send a command and require a 2xx completion.
    pub async fn expect_positive(&mut self, line: &str) -> Result<Reply> {
        let reply = self.command(line).await?;
        if !reply.is_positive() {
            return Err(server_error(&reply, line.split(' ').next().unwrap_or(line)));
        }
        Ok(reply)
    }

    pub async fn feat(&mut self) -> Result<Reply> {
        self.command("FEAT").await
    }

    /// Binary transfer mode; always set before data transfers.
    pub async fn type_image(&mut self) -> Result<()> {
        self.expect_positive("TYPE I").await.map(|_| ())
    }

    /// Toggle MODE Z (deflate-compressed data connections).
    pub async fn set_mode_z(&mut self, enabled: bool) -> Result<()> {
        let mode = if enabled { "MODE Z" } else { "MODE S" };
        self.expect_positive(mode).await.map(|_| ())
    }

    pub async fn noop(&mut self) -> Result<()> {
        self.expect_positive("NOOP").await.map(|_| ())
    }

    pub async fn quit(&mut self) {
        let _ = self.command("QUIT").await;
    }

    /// Remote file size, where the server supports SIZE.
    pub async fn size(&mut self, path: &str) -> Result<Option<u64>> {
        let reply = self.command(&format!("SIZE {path}")).await?;
        if reply.code == 213 {
            return Ok(reply.lines.first().and_then(|l| l.trim().parse().ok()));
        }
        Ok(None)
    }

    pub async fn delete(&mut self, path: &str) -> Result<()> {
        self.expect_positive(&format!("DELE {path}")).await.map(|_| ())
    }

    pub async fn mkdir(&mut self, path: &str) -> Result<()> {
        self.expect_positive(&format!("MKD {path}")).await.map(|_| ())
    }

    pub async fn rmdir(&mut self, path: &str) -> Result<()> {
        self.expect_positive(&format!("RMD {path}")).await.map(|_| ())
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let reply = self.command(&format!("RNFR {from}")).await?;
        if !reply.is_intermediate() {
            return Err(server_error(&reply, "RNFR"));
        }
        self.expect_positive(&format!("RNTO {to}")).await.map(|_| ())
    }

    /// Run `command` over a passive-mode data connection and collect
    /// everything the server sends.
    pub async fn retrieve(&mut self, command: &str, rest_offset: Option<u64>) -> Result<Vec<u8>> {
        let mut data = self.open_data_connection(command, rest_offset).await?;
        let mut collected = Vec::new();
        data.read_to_end(&mut collected).await?;
        drop(data);
        let closing = self.read_reply().await?;
        if !closing.is_positive() {
            return Err(server_error(&closing, command));
        }
        Ok(collected)
    }

    /// Run `command` over a passive-mode data connection, sending `payload`.
    pub async fn store(
        &mut self,
        command: &str,
        payload: &[u8],
        rest_offset: Option<u64>,
    ) -> Result<()> {
        let mut data = self.open_data_connection(command, rest_offset).await?;
        data.write_all(payload).await?;
        data.shutdown().await?;
        drop(data);
        let closing = self.read_reply().await?;
        if !closing.is_positive() {
            return Err(server_error(&closing, command));
        }
        Ok(())
    }

    /// PASV + dial + issue the transfer command, expecting 125/150.
    async fn open_data_connection(
        &mut self,
        command: &str,
        rest_offset: Option<u64>,
    ) -> Result<TcpStream> {
        if let Some(offset) = rest_offset {
            let reply = self.command(&format!("REST {offset}")).await?;
            if !reply.is_intermediate() {
                return Err(server_error(&reply, "REST"));
            }
        }

        let reply = self.command("PASV").await?;
        if !reply.is_positive() {
            return Err(server_error(&reply, "PASV"));
        }
        let (advertised_ip, port) = parse_pasv(&reply.text())?;
        // Some servers behind NAT advertise internal addresses; fall back to
        // the control connection's peer.
        let ip = if advertised_ip.is_private() || advertised_ip.is_unspecified() {
            self.peer_ip
        } else {
            advertised_ip
        };

        let data = tokio::time::timeout(self.timeout, TcpStream::connect((ip, port)))
            .await
            .map_err(|_| EngineError::Timeout {
                elapsed_ms: self.timeout.as_millis() as u64,
            })??;

        let opening = self.command(command).await?;
        if !opening.is_positive_preliminary() && !opening.is_positive() {
            return Err(server_error(&opening, command));
        }
        Ok(data)
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let first = self.read_line().await?;
        if first.len() < 4 {
            return Err(EngineError::session(format!(
                "malformed control reply {first:?}"
            )));
        }
        let code: u16 = first[..3]
            .parse()
            .map_err(|_| EngineError::session(format!("malformed reply code in {first:?}")))?;
        let mut lines = vec![first[4..].to_owned()];

        // "123-" opens a block closed by "123 ".
        if first.as_bytes()[3] == b'-' {
            let terminator = format!("{code} ");
            loop {
                let line = self.read_line().await?;
                if line.starts_with(&terminator) {
                    lines.push(line[4..].to_owned());
                    break;
                }
                lines.push(line);
            }
        }
        let reply = Reply { code, lines };
        trace!(target: "ftp::client", code = reply.code, "<-");
        Ok(reply)
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let read = tokio::time::timeout(self.timeout, self.control.read_line(&mut line))
            .await
            .map_err(|_| EngineError::Timeout {
                elapsed_ms: self.timeout.as_millis() as u64,
            })??;
        if read == 0 {
            return Err(EngineError::Disconnected(
                "control connection closed".to_owned(),
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_owned())
    }
}

/// 4xx replies map to transient transport faults (retryable), 5xx to
/// permanent session errors.
fn server_error(reply: &Reply, verb: &str) -> EngineError {
    if reply.is_transient_error() {
        EngineError::Transport(std::io::Error::other(format!(
            "{verb} failed transiently ({}): {}",
            reply.code,
            reply.text()
        )))
    } else {
        EngineError::session(format!(
            "{verb} rejected ({}): {}",
            reply.code,
            reply.text()
        ))
    }
}

/// Extract `(h1,h2,h3,h4,p1,p2)` from a 227 reply.
fn parse_pasv(text: &str) -> Result<(Ipv4Addr, u16)> {
    let open = text
        .find('(')
        .ok_or_else(|| EngineError::session(format!("unparseable PASV reply {text:?}")))?;
    let close = text[open..]
        .find(')')
        .map(|i| open + i)
        .ok_or_else(|| EngineError::session(format!("unparseable PASV reply {text:?}")))?;
    let numbers: Vec<u8> = text[open + 1..close]
        .split(',')
        .map(|part| part.trim().parse::<u8>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| EngineError::session(format!("unparseable PASV reply {text:?}")))?;
    if numbers.len() != 6 {
        return Err(EngineError::session(format!(
            "PASV reply carries {} numbers",
            numbers.len()
        )));
    }
    let ip = Ipv4Addr::new(numbers[0], numbers[1], numbers[2], numbers[3]);
    let port = u16::from(numbers[4]) << 8 | u16::from(numbers[5]);
    Ok((ip, port))
}

/// Strip credentials out of trace logging.
fn redact(line: &str) -> String {
    if let Some(rest) = line.strip_prefix("PASS ") {
        format!("PASS {}", "*".repeat(rest.len().min(8)))
    } else {
        line.to_owned()
    }
}
