//! Server capability probe over FEAT.

use crate::error::Result;
use crate::ftp::client::FtpClient;

/// What the extended transfer paths need to know about a server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Machine-readable listings.
    pub mlsd: bool,
    /// Restartable transfers (REST STREAM).
    pub rest: bool,
    /// Deflate-compressed data connections.
    pub mode_z: bool,
}

impl Capabilities {
    /// Parse a FEAT reply. A refused FEAT (many minimal servers) simply
    /// yields no capabilities.
    pub fn from_feat_lines(lines: &[String]) -> Self {
        let mut capabilities = Capabilities::default();
        for line in lines {
            let feature = line.trim().to_ascii_uppercase();
            if feature == "MLSD" || feature.starts_with("MLST") {
                capabilities.mlsd = true;
            } else if feature.starts_with("REST") {
                capabilities.rest = true;
            } else if feature == "MODE Z" {
                capabilities.mode_z = true;
            }
        }
        capabilities
    }

    pub fn summary(&self) -> String {
        let mut parts = Vec::new();
        if self.mlsd {
            parts.push("mlsd");
        }
        if self.rest {
            parts.push("rest");
        }
        if self.mode_z {
            parts.push("mode-z");
        }
        if parts.is_empty() {
            "none".to_owned()
        } else {
            parts.join("+")
        }
    }
}

/// Run the probe on a fresh control connection.
pub async fn probe(client: &mut FtpClient) -> Result<Capabilities> {
    match client.feat().await {
        Ok(reply) if reply.is_positive() => Ok(Capabilities::from_feat_lines(&reply.lines)),
        // FEAT not implemented: fall back to the plain paths everywhere.
        Ok(_) => Ok(Capabilities::default()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn full_feature_set() {
        let caps = Capabilities::from_feat_lines(&lines(&[
            "Features:",
            " MLSD",
            " MLST type*;size*;modify*;",
            " REST STREAM",
            " MODE Z",
            "End",
        ]));
        assert!(caps.mlsd);
        assert!(caps.rest);
        assert!(caps.mode_z);
        assert_eq!(caps.summary(), "mlsd+rest+mode-z");
    }

    #[test]
    fn bare_server() {
        let caps = Capabilities::from_feat_lines(&lines(&["Features:", " UTF8", "End"]));
        assert_eq!(caps, Capabilities::default());
        assert_eq!(caps.summary(), "none");
    }
}
