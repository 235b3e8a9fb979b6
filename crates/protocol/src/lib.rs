//! # Shellward Protocol Library
//!
//! Wire format for directory announcements emitted by shells running inside
//! a Shellward session.
//!
//! ## Overview
//!
//! Shells report their working directory with the OSC 7 escape sequence:
//!
//! ```text
//! ESC ] 7 ; file://<hostname><percent-encoded path> BEL
//! ESC ] 7 ; file://<hostname><percent-encoded path> ESC \
//! ```
//!
//! This crate provides:
//!
//! - **Parser**: decodes the last complete announcement in a byte window
//! - **Buffer**: reassembles announcements split across arbitrary reads
//! - **Display paths**: home-relative and truncated renditions for titles
//!
//! ## Example Usage
//!
//! ```rust
//! use shellward_protocol::{Osc7Buffer, Osc7Parser};
//!
//! let parser = Osc7Parser::with_home("/home/u");
//! let mut buffer = Osc7Buffer::new();
//!
//! assert!(buffer.feed(&parser, b"\x1b]7;file://box/home/u/src").is_none());
//! let announcement = buffer.feed(&parser, b"/app\x07").unwrap();
//!
//! assert_eq!(announcement.hostname, "box");
//! assert_eq!(announcement.display_path, "~/src/app");
//! ```
//!
//! ## Modules
//!
//! - [`osc7`]: Sequence decoding
//! - [`buffer`]: Chunk reassembly
//! - [`path`]: Display path rules
//! - [`error`]: Error types

pub mod buffer;
pub mod error;
pub mod osc7;
pub mod path;

pub use buffer::{Osc7Buffer, DEFAULT_BUFFER_CAPACITY};
pub use error::{ProtocolError, Result};
pub use osc7::{DirectoryAnnouncement, Osc7Match, Osc7Parser, DEFAULT_HOSTNAME, MAX_PATH_LENGTH};
pub use path::display_path;
