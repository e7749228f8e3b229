// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! # LUKS2 header support
//!
//! This crate provides functionality for reading and parsing the metadata of
//! LUKS2 (Linux Unified Key Setup 2) volumes.
//!
//! LUKS2 keeps two redundant copies of its metadata area at the start of the
//! volume. Each copy is a binary header followed by a JSON area describing
//! keyslots, segments, digests and tokens. Readers take an advisory lock on
//! the volume so they never observe a copy while `cryptsetup` rewrites it,
//! then pick the valid copy with the highest sequence ID.
//!
//! ```no_run
//! use luks2::{read_header, LockMode};
//!
//! let header = read_header("/dev/sda2", LockMode::Blocking)?;
//! for (id, keyslot) in &header.metadata.keyslots {
//!     println!("keyslot {id}: priority {}", keyslot.priority);
//! }
//! # Ok::<(), luks2::Error>(())
//! ```

use std::io;

use thiserror::Error;

mod copies;
mod header;
pub mod lock;
pub mod metadata;
mod reader;
pub mod superblock;

#[cfg(test)]
mod testutil;

pub use copies::{select, Generation};
pub use header::Header;
pub use lock::{HeaderLock, LockMode};
pub use metadata::{
    Config, Digest, Kdf, KdfType, Keyslot, KeyslotArea, Metadata, Priority, Segment, SegmentSize, Token,
};
pub use reader::{decode, read_header, Reader};
pub use superblock::Role;

/// Errors that can occur when reading a LUKS2 header
#[derive(Debug, Error)]
pub enum Error {
    /// Neither metadata copy carries a LUKS2 signature
    #[error("not a LUKS2 volume")]
    NotLuks2,

    /// Both metadata copies are present but neither is usable
    #[error("corrupt LUKS2 header (primary: {primary}, secondary: {secondary})")]
    Corrupt { primary: CopyError, secondary: CopyError },

    /// The header is locked by another process
    #[error("LUKS2 header is locked by another process")]
    Locked,

    /// An I/O error occurred
    #[error("io: {0}")]
    IO(#[from] io::Error),
}

/// Reasons a single metadata copy is rejected
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CopyError {
    /// The volume ends before the copy
    #[error("no header found")]
    Missing,

    #[error("invalid magic")]
    Magic,

    #[error("unsupported version {0}")]
    Version(u16),

    #[error("invalid metadata area size {0:#x}")]
    AreaSize(u64),

    #[error("header offset {found:#x} does not match its location {expected:#x}")]
    Offset { expected: u64, found: u64 },

    #[error("unsupported checksum algorithm {0:?}")]
    ChecksumAlgorithm(String),

    #[error("checksum mismatch")]
    Checksum,

    #[error("invalid json: {0}")]
    Json(String),

    #[error("inconsistent metadata: {0}")]
    Inconsistent(String),
}

impl CopyError {
    /// Whether this copy simply is not a LUKS2 header, as opposed to a damaged one
    pub fn is_foreign(&self) -> bool {
        matches!(self, CopyError::Missing | CopyError::Magic | CopyError::Version(_))
    }
}
