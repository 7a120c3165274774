//! Execution-path selection for FTP transfers.
//!
//! The selector picks the best path a server's capabilities allow; on
//! failure of an extended path the transport falls back once to plain.

use std::path::Path;

use crate::ftp::capability::Capabilities;

/// Files above this are worth a resumable upload when REST is available.
pub const RESUME_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Extensions that compress well enough to justify MODE Z.
const COMPRESSIBLE_EXTENSIONS: &[&str] = &[
    "txt", "log", "json", "xml", "csv", "html", "htm", "js", "css", "md", "svg", "yaml", "yml",
    "toml", "sql",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPath {
    Plain,
    Resumable,
    Compressed,
}

impl TransferPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferPath::Plain => "plain",
            TransferPath::Resumable => "resumable",
            TransferPath::Compressed => "compressed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingPath {
    Mlsd,
    List,
}

pub fn pick_listing(capabilities: Capabilities) -> ListingPath {
    if capabilities.mlsd {
        ListingPath::Mlsd
    } else {
        ListingPath::List
    }
}

/// Upload path: resume for big files, compression for compressible ones,
/// plain otherwise. Resume wins over compression (REST and MODE Z rarely
/// combine cleanly).
pub fn pick_upload(capabilities: Capabilities, file_size: u64, filename: &str) -> TransferPath {
    if capabilities.rest && file_size > RESUME_THRESHOLD {
        return TransferPath::Resumable;
    }
    if capabilities.mode_z && is_compressible(filename) {
        return TransferPath::Compressed;
    }
    TransferPath::Plain
}

pub fn pick_download(capabilities: Capabilities, resume_offset: u64) -> TransferPath {
    if capabilities.rest && resume_offset > 0 {
        TransferPath::Resumable
    } else {
        TransferPath::Plain
    }
}

/// The single-step fallback ladder: anything extended drops to plain.
pub fn fallback(path: TransferPath) -> Option<TransferPath> {
    match path {
        TransferPath::Plain => None,
        TransferPath::Resumable | TransferPath::Compressed => Some(TransferPath::Plain),
    }
}

fn is_compressible(filename: &str) -> bool {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            COMPRESSIBLE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}
