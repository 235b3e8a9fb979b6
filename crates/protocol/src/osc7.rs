//! OSC 7 directory-announcement decoding.
//!
//! A shell announces its working directory by printing
//!
//! ```text
//! ESC ] 7 ; file://<hostname><percent-encoded absolute path> (BEL | ESC \)
//! ```
//!
//! The decoder scans an arbitrary byte window, keeps only the last complete
//! announcement, and percent-decodes the host and path components.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use percent_encoding::percent_decode;
use regex::bytes::Regex;

use crate::error::{ProtocolError, Result};
use crate::path::display_path;

/// Maximum accepted length of a decoded path, in bytes.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Hostname reported when the announcement leaves it empty.
pub const DEFAULT_HOSTNAME: &str = "localhost";

const FILE_SCHEME: &str = "file://";

static OSC7_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)\x1b\]7;file://([^/\x07\x1b]*)(/?[^\x07\x1b]*?)(?:\x07|\x1b\\)")
        .expect("OSC 7 pattern is valid")
});

/// A decoded directory announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryAnnouncement {
    /// Announcing host, `localhost` when the sequence carried none.
    pub hostname: String,
    /// Absolute path with trailing slashes removed.
    pub path: String,
    /// Home-relative or truncated rendition of `path`.
    pub display_path: String,
    /// The `file://` URI as decoded, used for change detection.
    pub raw: String,
}

/// The last complete sequence found in a byte window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Osc7Match {
    /// Offset just past the terminator of the sequence.
    pub end: usize,
    /// The decoded announcement, or why it was rejected.
    pub result: Result<DirectoryAnnouncement>,
}

/// Stateless OSC 7 decoder.
///
/// The parser only carries the home directory used to derive display paths.
#[derive(Debug, Clone, Default)]
pub struct Osc7Parser {
    home: Option<String>,
}

impl Osc7Parser {
    /// Create a parser without home-directory substitution.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a parser that renders paths under `home` as `~/...`.
    pub fn with_home(home: impl Into<String>) -> Self {
        let home = home.into();
        let home = home.trim_end_matches('/').to_string();
        Self {
            home: (!home.is_empty()).then_some(home),
        }
    }

    /// Home directory used for display paths.
    pub fn home(&self) -> Option<&str> {
        self.home.as_deref()
    }

    /// Decode the last complete announcement in `data`.
    ///
    /// Earlier announcements in the same window are superseded. Returns
    /// `None` when there is no complete sequence or the last one is invalid.
    pub fn parse(&self, data: &[u8]) -> Option<DirectoryAnnouncement> {
        self.last_match(data).and_then(|m| m.result.ok())
    }

    /// Locate the last complete sequence and decode it.
    ///
    /// The end offset is reported even when decoding fails, so buffered
    /// callers can discard a rejected sequence.
    pub fn last_match(&self, data: &[u8]) -> Option<Osc7Match> {
        let captures = OSC7_PATTERN.captures_iter(data).last()?;
        let end = captures.get(0)?.end();
        let host = captures.get(1).map(|m| m.as_bytes()).unwrap_or_default();
        let path = captures.get(2).map(|m| m.as_bytes()).unwrap_or_default();

        Some(Osc7Match {
            end,
            result: self.decode(host, path),
        })
    }

    /// Decode a bare `file://host/path` URI.
    ///
    /// Terminal surfaces that track the directory themselves expose it in
    /// this form.
    pub fn parse_uri(&self, uri: &str) -> Result<DirectoryAnnouncement> {
        let rest = uri
            .strip_prefix(FILE_SCHEME)
            .ok_or_else(|| ProtocolError::NotFileUri(uri.to_string()))?;

        let (host, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        self.decode(host.as_bytes(), path.as_bytes())
    }

    /// Render `path` for display using this parser's home directory.
    pub fn display_path(&self, path: &str) -> String {
        display_path(path, self.home.as_deref())
    }

    fn decode(&self, host: &[u8], path: &[u8]) -> Result<DirectoryAnnouncement> {
        let hostname = decode_component(host);
        let hostname = if hostname.is_empty() {
            DEFAULT_HOSTNAME.to_string()
        } else {
            hostname.into_owned()
        };

        let path = normalize_path(&decode_component(path))?;
        let display_path = self.display_path(&path);
        let raw = format!("{FILE_SCHEME}{hostname}{path}");

        Ok(DirectoryAnnouncement {
            hostname,
            path,
            display_path,
            raw,
        })
    }
}

fn decode_component(raw: &[u8]) -> Cow<'_, str> {
    percent_decode(raw).decode_utf8_lossy()
}

fn normalize_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(ProtocolError::RelativePath(path.to_string()));
    }

    if path.len() > MAX_PATH_LENGTH {
        return Err(ProtocolError::PathTooLong {
            len: path.len(),
            max: MAX_PATH_LENGTH,
        });
    }

    let trimmed = path.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}
