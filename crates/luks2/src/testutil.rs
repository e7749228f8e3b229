// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Synthetic LUKS2 images for unit tests

use serde_json::{json, Value};
use zerocopy::{BigEndian, FromBytes, IntoBytes, U16, U64};

use crate::superblock::{BinaryHeader, Role, BINARY_HEADER_SIZE};

/// JSON area contents of a freshly formatted volume with a single keyslot
pub fn sample_metadata(json_size: u64) -> Value {
    json!({
        "keyslots": {
            "0": {
                "type": "luks2",
                "key_size": 64,
                "af": {"type": "luks1", "stripes": 4000, "hash": "sha256"},
                "area": {
                    "type": "raw",
                    "offset": "32768",
                    "size": "258048",
                    "encryption": "aes-xts-plain64",
                    "key_size": 64
                },
                "kdf": {
                    "type": "argon2i",
                    "time": 4,
                    "memory": 32768,
                    "cpus": 1,
                    "salt": "aGVsbG8gd29ybGQgaGVsbG8gd29ybGQgaGVsbG8gd29ybGQ="
                }
            }
        },
        "tokens": {},
        "segments": {
            "0": {
                "type": "crypt",
                "offset": "16777216",
                "size": "dynamic",
                "iv_tweak": "0",
                "encryption": "aes-xts-plain64",
                "sector_size": 512
            }
        },
        "digests": {
            "0": {
                "type": "pbkdf2",
                "keyslots": ["0"],
                "segments": ["0"],
                "hash": "sha256",
                "iterations": 1000,
                "salt": "c2FsdHNhbHRzYWx0c2FsdHNhbHRzYWx0c2FsdHNhbHQ=",
                "digest": "ZGlnZXN0ZGlnZXN0ZGlnZXN0ZGlnZXN0ZGlnZXN0ZGk="
            }
        },
        "config": {
            "json_size": json_size.to_string(),
            "keyslots_size": (16 * 1024 * 1024 - 2 * 0x4000u64).to_string()
        }
    })
}

/// JSON area contents of a volume midway through encryption in place
pub fn reencrypt_metadata(json_size: u64) -> Value {
    let mut metadata = sample_metadata(json_size);
    metadata["keyslots"]["1"] = json!({
        "type": "reencrypt",
        "key_size": 1,
        "area": {"type": "none", "offset": "290816", "size": "4096"},
        "mode": "encrypt",
        "direction": "forward"
    });
    metadata["keyslots"]["2"] = json!({
        "type": "luks2",
        "key_size": 64,
        "af": {"type": "luks1", "stripes": 4000, "hash": "sha256"},
        "area": {"type": "raw", "offset": "294912", "size": "258048", "encryption": "aes-xts-plain64", "key_size": 64},
        "kdf": {"type": "scrypt", "salt": "c2FsdA=="}
    });
    metadata["segments"]["0"]["size"] = json!("8388608");
    metadata["segments"]["1"] = json!({
        "type": "linear",
        "offset": "25165824",
        "size": "4194304",
        "flags": ["in-reencryption"]
    });
    metadata["digests"]["1"] = json!({
        "type": "pbkdf2",
        "keyslots": ["1"],
        "segments": [],
        "hash": "sha256",
        "iterations": 1000,
        "salt": "c2FsdA==",
        "digest": "ZGlnZXN0"
    });
    metadata
}

/// Builds an image holding both metadata copies
pub struct ImageBuilder {
    label: String,
    version: u16,
    area_size: u64,
    seqids: (u64, u64),
    metadata: Option<Value>,
    secondary_metadata: Option<Value>,
    corrupt: Vec<Role>,
    wipe: Vec<Role>,
    length: Option<u64>,
}

impl ImageBuilder {
    pub const UUID: &'static str = "2b5e6c4a-8f0e-4a39-9a3c-3c1d2f0e7b61";

    pub fn new() -> Self {
        Self {
            label: String::new(),
            version: 2,
            area_size: 0x4000,
            seqids: (1, 1),
            metadata: None,
            secondary_metadata: None,
            corrupt: vec![],
            wipe: vec![],
            length: None,
        }
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = label.to_owned();
        self
    }

    pub fn version(mut self, version: u16) -> Self {
        self.version = version;
        self
    }

    pub fn area_size(mut self, area_size: u64) -> Self {
        self.area_size = area_size;
        self
    }

    pub fn seqids(mut self, primary: u64, secondary: u64) -> Self {
        self.seqids = (primary, secondary);
        self
    }

    /// JSON area contents of both copies
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// JSON area contents of the secondary copy only
    pub fn secondary_metadata(mut self, metadata: Value) -> Self {
        self.secondary_metadata = Some(metadata);
        self
    }

    /// Flip a byte in the JSON area of a copy after checksumming it
    pub fn corrupt(mut self, role: Role) -> Self {
        self.corrupt.push(role);
        self
    }

    /// Leave a copy zeroed
    pub fn wipe(mut self, role: Role) -> Self {
        self.wipe.push(role);
        self
    }

    /// Truncate or extend the image to this length
    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    pub fn build(self) -> Vec<u8> {
        let json_size = self.area_size - BINARY_HEADER_SIZE;
        let metadata = self.metadata.clone().unwrap_or_else(|| sample_metadata(json_size));
        let secondary = self.secondary_metadata.clone().unwrap_or_else(|| metadata.clone());

        let mut image = vec![0u8; 2 * self.area_size as usize];
        for (role, offset, seqid, json) in [
            (Role::Primary, 0, self.seqids.0, &metadata),
            (Role::Secondary, self.area_size, self.seqids.1, &secondary),
        ] {
            if self.wipe.contains(&role) {
                continue;
            }
            let area = self.copy(role, offset, seqid, json);
            image[offset as usize..(offset + self.area_size) as usize].copy_from_slice(&area);
        }

        if let Some(length) = self.length {
            image.resize(length as usize, 0);
        }
        image
    }

    fn copy(&self, role: Role, offset: u64, seqid: u64, metadata: &Value) -> Vec<u8> {
        let Ok(mut header) = BinaryHeader::read_from_bytes(&[0u8; BINARY_HEADER_SIZE as usize]) else {
            unreachable!("binary header is exactly {BINARY_HEADER_SIZE} bytes")
        };
        header.magic = role.magic();
        header.version = U16::<BigEndian>::new(self.version);
        header.hdr_size = U64::<BigEndian>::new(self.area_size);
        header.seqid = U64::<BigEndian>::new(seqid);
        header.hdr_offset = U64::<BigEndian>::new(offset);
        header.label[..self.label.len()].copy_from_slice(self.label.as_bytes());
        header.checksum_alg[..6].copy_from_slice(b"sha256");
        header.uuid[..Self::UUID.len()].copy_from_slice(Self::UUID.as_bytes());

        let mut json_area = serde_json::to_vec(metadata).unwrap();
        json_area.resize((self.area_size - BINARY_HEADER_SIZE) as usize, 0);

        let csum = header.compute_checksum(&json_area);
        header.csum[..csum.len()].copy_from_slice(&csum);

        if self.corrupt.contains(&role) {
            json_area[0] ^= 0xff;
        }

        let mut area = header.as_bytes().to_vec();
        area.extend_from_slice(&json_area);
        area
    }
}
