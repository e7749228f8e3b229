// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! # LUKS2 binary header
//!
//! Every LUKS2 metadata area starts with a fixed 4096 byte binary header,
//! followed by the JSON area. Two copies of the area exist on disk: the
//! primary at offset 0 and the secondary directly after it.
//!
//! ## Format Details
//!
//! The binary header contains:
//! - Magic number identifying the copy (primary or secondary)
//! - Version number
//! - Size of the whole metadata area and its offset on disk
//! - Sequence ID, bumped on every metadata update
//! - UUID, label and subsystem label
//! - Checksum algorithm, salt and checksum over the metadata area
//!

use std::{io::Read, mem::offset_of};

use log::trace;
use sha2::{Digest, Sha256};
use zerocopy::*;

use crate::CopyError;

pub const MAGIC_LEN: usize = 6;
/// Label and subsystem fields
pub const LABEL_LEN: usize = 48;
pub const CHECKSUM_ALG_LEN: usize = 32;
pub const SALT_LEN: usize = 64;
/// UUID text field, NUL padded
pub const UUID_LEN: usize = 40;
/// Room for the largest supported digest
pub const CHECKSUM_LEN: usize = 64;
/// Size of the binary header in bytes
pub const BINARY_HEADER_SIZE: u64 = 4096;

/// Legal sizes of one metadata area (binary header plus JSON area).
///
/// The secondary copy starts at the end of the primary area, so these are
/// also the only offsets at which a secondary header may live.
pub const METADATA_AREA_SIZES: [u64; 9] = [
    0x4000, 0x8000, 0x10000, 0x20000, 0x40000, 0x80000, 0x100000, 0x200000, 0x400000,
];

/// The fixed part of one metadata copy, all integers big endian
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned, Debug)]
#[repr(C, packed)]
pub struct BinaryHeader {
    /// `LUKS\xba\xbe` or `SKUL\xba\xbe` depending on the copy
    pub magic: [u8; MAGIC_LEN],
    pub version: U16<BigEndian>,
    /// Binary header plus JSON area, in bytes
    pub hdr_size: U64<BigEndian>,
    /// Bumped on every metadata update, the higher copy is current
    pub seqid: U64<BigEndian>,
    pub label: [u8; LABEL_LEN],
    /// Name of the checksum digest, NUL padded
    pub checksum_alg: [u8; CHECKSUM_ALG_LEN],
    pub salt: [u8; SALT_LEN],
    pub uuid: [u8; UUID_LEN],
    pub subsystem: [u8; LABEL_LEN],
    /// Where this copy lives, must match where it was found
    pub hdr_offset: U64<BigEndian>,
    pub padding: [u8; 184],
    /// Digest over this header (with this field zeroed) and the JSON area
    pub csum: [u8; CHECKSUM_LEN],
    pub padding4096: [u8; 7 * 512],
}

/// Signatures of the two metadata copies
pub struct Magic;

impl Magic {
    pub const LUKS2: [u8; MAGIC_LEN] = [b'L', b'U', b'K', b'S', 0xba, 0xbe];
    /// The primary signature with its first four bytes reversed
    pub const SKUL2: [u8; MAGIC_LEN] = [b'S', b'K', b'U', b'L', 0xba, 0xbe];
}

/// Which of the two redundant metadata copies a header belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    /// The magic number a header in this role must carry
    pub fn magic(&self) -> [u8; MAGIC_LEN] {
        match self {
            Role::Primary => Magic::LUKS2,
            Role::Secondary => Magic::SKUL2,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => f.write_str("primary"),
            Role::Secondary => f.write_str("secondary"),
        }
    }
}

/// Decode a binary header from the given read stream without validating it
pub fn from_reader<R: Read>(reader: &mut R) -> std::io::Result<BinaryHeader> {
    BinaryHeader::read_from_io(reader)
}

// Fixed size fields are NUL padded
fn field_str(bytes: &[u8]) -> Result<String, std::str::Utf8Error> {
    Ok(std::str::from_utf8(bytes)?.trim_end_matches('\0').to_owned())
}

impl BinaryHeader {
    /// Size of the whole metadata area described by this header
    pub fn area_size(&self) -> u64 {
        self.hdr_size.get()
    }

    /// Size of the JSON area that follows this header
    pub fn json_size(&self) -> u64 {
        self.area_size().saturating_sub(BINARY_HEADER_SIZE)
    }

    /// Sequence ID of this copy
    pub fn sequence_id(&self) -> u64 {
        self.seqid.get()
    }

    /// Volume label, empty when unset
    pub fn label(&self) -> Result<String, std::str::Utf8Error> {
        field_str(&self.label)
    }

    pub fn subsystem(&self) -> Result<String, std::str::Utf8Error> {
        field_str(&self.subsystem)
    }

    /// UUID in its textual form, as stored on disk
    pub fn uuid(&self) -> Result<String, std::str::Utf8Error> {
        field_str(&self.uuid)
    }

    pub fn checksum_algorithm(&self) -> Result<String, std::str::Utf8Error> {
        field_str(&self.checksum_alg)
    }

    /// Check the fixed fields of a header found at `offset` in the given role.
    ///
    /// This does not look at the JSON area, see [`BinaryHeader::verify_checksum`].
    pub fn validate(&self, role: Role, offset: u64) -> Result<(), CopyError> {
        let magic = self.magic;
        if magic != role.magic() {
            return Err(CopyError::Magic);
        }

        let version = self.version.get();
        if version != 2 {
            return Err(CopyError::Version(version));
        }

        let size = self.area_size();
        if !METADATA_AREA_SIZES.contains(&size) {
            return Err(CopyError::AreaSize(size));
        }

        let found = self.hdr_offset.get();
        if found != offset {
            return Err(CopyError::Offset { expected: offset, found });
        }

        trace!("{role} header at {offset:#x}: seqid={} size={size:#x}", self.sequence_id());
        Ok(())
    }

    /// Compute the SHA-256 checksum of this header with its checksum field zeroed,
    /// followed by the given JSON area.
    pub fn compute_checksum(&self, json_area: &[u8]) -> [u8; 32] {
        let csum = offset_of!(BinaryHeader, csum);
        let mut bytes = self.as_bytes().to_vec();
        bytes[csum..csum + CHECKSUM_LEN].fill(0);

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        hasher.update(json_area);
        hasher.finalize().into()
    }

    /// Verify the stored checksum against the JSON area read from disk
    pub fn verify_checksum(&self, json_area: &[u8]) -> Result<(), CopyError> {
        let algorithm = self.checksum_algorithm().map_err(|_| CopyError::ChecksumAlgorithm("<invalid utf8>".into()))?;
        if algorithm != "sha256" {
            return Err(CopyError::ChecksumAlgorithm(algorithm));
        }

        let computed = self.compute_checksum(json_area);
        let stored = self.csum;
        // Digests shorter than the field are zero padded
        if stored[..computed.len()] != computed || stored[computed.len()..].iter().any(|b| *b != 0) {
            return Err(CopyError::Checksum);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use test_log::test;

    use super::*;
    use crate::testutil::ImageBuilder;

    #[test]
    fn test_header_size() {
        assert_eq!(std::mem::size_of::<BinaryHeader>() as u64, BINARY_HEADER_SIZE);
        assert_eq!(offset_of!(BinaryHeader, csum), 448);
    }

    #[test]
    fn test_decode_fields() {
        let image = ImageBuilder::new().label("data").build();
        let header = from_reader(&mut Cursor::new(&image)).expect("cannot decode header");

        assert!(header.validate(Role::Primary, 0).is_ok());
        assert_eq!(header.label().unwrap(), "data");
        assert_eq!(header.area_size(), 0x4000);
        assert_eq!(header.json_size(), 0x3000);
        assert_eq!(header.uuid().unwrap(), ImageBuilder::UUID);
        assert_eq!(header.checksum_algorithm().unwrap(), "sha256");
    }

    #[test]
    fn test_validate_rejects() {
        let image = ImageBuilder::new().build();
        let header = from_reader(&mut Cursor::new(&image)).unwrap();

        assert!(matches!(header.validate(Role::Secondary, 0), Err(CopyError::Magic)));
        assert!(matches!(
            header.validate(Role::Primary, 0x4000),
            Err(CopyError::Offset { expected: 0x4000, found: 0 })
        ));

        let image = ImageBuilder::new().version(1).build();
        let header = from_reader(&mut Cursor::new(&image)).unwrap();
        assert!(matches!(header.validate(Role::Primary, 0), Err(CopyError::Version(1))));
    }

    #[test]
    fn test_checksum() {
        let image = ImageBuilder::new().build();
        let header = from_reader(&mut Cursor::new(&image)).unwrap();
        let json_area = &image[BINARY_HEADER_SIZE as usize..header.area_size() as usize];
        assert!(header.verify_checksum(json_area).is_ok());

        let mut tampered = json_area.to_vec();
        tampered[0] ^= 0xff;
        assert!(matches!(header.verify_checksum(&tampered), Err(CopyError::Checksum)));
    }
}
