// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use log::{debug, trace};

use crate::{
    copies::select,
    header::Header,
    lock::{HeaderLock, LockMode},
    metadata::Metadata,
    superblock::{self, Role, BINARY_HEADER_SIZE, METADATA_AREA_SIZES},
    CopyError, Error,
};

/// Reads LUKS2 headers under the advisory lock shared with `cryptsetup`
#[derive(Clone, Debug)]
pub struct Reader {
    run_dir: PathBuf,
}

impl Default for Reader {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from("/run"),
        }
    }
}

impl Reader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different runtime directory for block device lock files
    pub fn with_run_dir(self, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    /// Lock the volume at `path`, decode the authoritative header and release the lock.
    pub fn read(&self, path: impl AsRef<Path>, mode: LockMode) -> Result<Header, Error> {
        let path = path.as_ref();
        let _lock = HeaderLock::acquire(path, mode, &self.run_dir)?;
        let header = decode(File::open(path)?)?;
        debug!(
            "read LUKS2 header from {path:?}: seqid={} keyslots={} tokens={}",
            header.sequence_id,
            header.metadata.keyslots.len(),
            header.metadata.tokens.len()
        );
        Ok(header)
    }
}

/// Read the header of the volume at `path` using the default [`Reader`]
pub fn read_header(path: impl AsRef<Path>, mode: LockMode) -> Result<Header, Error> {
    Reader::default().read(path, mode)
}

/// Decode the authoritative header from both metadata copies, without locking
pub fn decode<R: Read + Seek>(mut reader: R) -> Result<Header, Error> {
    let primary_binary = read_binary(&mut reader, 0)?;
    let known_size = primary_binary
        .as_ref()
        .ok()
        .filter(|header| header.validate(Role::Primary, 0).is_ok())
        .map(|header| header.area_size());

    let primary = match primary_binary {
        Ok(binary) => read_copy(&mut reader, binary, Role::Primary, 0)?,
        Err(e) => Err(e),
    };

    let secondary = match known_size {
        Some(offset) => read_secondary(&mut reader, offset)?,
        None => probe_secondary(&mut reader)?,
    };

    let (role, header) = select(primary, secondary)?;
    trace!("using {role} header, seqid {}", header.sequence_id);
    Ok(header)
}

// A short volume simply holds no header at this offset
fn read_binary<R: Read + Seek>(reader: &mut R, offset: u64) -> io::Result<Result<superblock::BinaryHeader, CopyError>> {
    reader.seek(SeekFrom::Start(offset))?;
    match superblock::from_reader(reader) {
        Ok(header) => Ok(Ok(header)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(Err(CopyError::Missing)),
        Err(e) => Err(e),
    }
}

fn read_copy<R: Read + Seek>(
    reader: &mut R,
    binary: superblock::BinaryHeader,
    role: Role,
    offset: u64,
) -> io::Result<Result<Header, CopyError>> {
    if let Err(e) = binary.validate(role, offset) {
        trace!("{role} header at {offset:#x} rejected: {e}");
        return Ok(Err(e));
    }

    let mut json_area = vec![0u8; binary.json_size() as usize];
    reader.seek(SeekFrom::Start(offset + BINARY_HEADER_SIZE))?;
    match reader.read_exact(&mut json_area) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(Err(CopyError::Inconsistent(format!("{role} metadata area is truncated"))));
        }
        Err(e) => return Err(e),
    }

    let result = binary
        .verify_checksum(&json_area)
        .and_then(|_| Metadata::from_json_area(&json_area))
        .and_then(|metadata| Header::new(&binary, metadata));
    if let Err(e) = &result {
        trace!("{role} header at {offset:#x} rejected: {e}");
    }
    Ok(result)
}

fn read_secondary<R: Read + Seek>(reader: &mut R, offset: u64) -> io::Result<Result<Header, CopyError>> {
    match read_binary(reader, offset)? {
        Ok(binary) => read_copy(reader, binary, Role::Secondary, offset),
        Err(e) => Ok(Err(e)),
    }
}

/// Search the legal secondary offsets when the primary cannot tell us where to look.
///
/// The first usable copy wins. Otherwise a damaged copy carrying the secondary
/// magic is reported over a mere absence of one.
fn probe_secondary<R: Read + Seek>(reader: &mut R) -> io::Result<Result<Header, CopyError>> {
    let mut rejected = CopyError::Missing;

    for offset in METADATA_AREA_SIZES {
        match read_secondary(reader, offset)? {
            Ok(header) => return Ok(Ok(header)),
            Err(CopyError::Missing) => break,
            Err(e) if e.is_foreign() => {
                if rejected == CopyError::Missing {
                    rejected = e;
                }
            }
            Err(e) => {
                if rejected.is_foreign() {
                    rejected = e;
                }
            }
        }
    }

    Ok(Err(rejected))
}
