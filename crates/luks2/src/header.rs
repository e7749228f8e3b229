// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde::Serialize;
use uuid::Uuid;

use crate::{copies::Generation, metadata::Metadata, superblock::BinaryHeader, CopyError};

/// A snapshot of the metadata of one LUKS2 volume.
///
/// This is never written back; mutations go through `cryptsetup` and the
/// header is read again afterwards.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Header {
    /// Volume label, empty if unset
    pub label: String,
    /// Subsystem label, empty if unset
    pub subsystem: String,
    pub uuid: Uuid,
    /// Sequence ID of the copy this snapshot was taken from
    pub sequence_id: u64,
    /// Size of one metadata area (binary header plus JSON area)
    pub area_size: u64,
    pub metadata: Metadata,
}

impl Header {
    pub(crate) fn new(binary: &BinaryHeader, metadata: Metadata) -> Result<Self, CopyError> {
        let invalid = |field: &str| CopyError::Inconsistent(format!("invalid {field} in binary header"));

        let uuid = binary.uuid().map_err(|_| invalid("uuid"))?;
        Ok(Self {
            label: binary.label().map_err(|_| invalid("label"))?,
            subsystem: binary.subsystem().map_err(|_| invalid("subsystem"))?,
            uuid: Uuid::parse_str(&uuid).map_err(|_| invalid("uuid"))?,
            sequence_id: binary.sequence_id(),
            area_size: binary.area_size(),
            metadata,
        })
    }
}

impl Generation for Header {
    fn generation(&self) -> u64 {
        self.sequence_id
    }
}
