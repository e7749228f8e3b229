// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! JSON metadata of a LUKS2 volume
//!
//! All identifier maps are keyed by small integers which the on-disk format
//! encodes as decimal strings. Identifiers are sparse, so they are kept in
//! ordered maps rather than dense arrays.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{de, ser::SerializeMap, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use serde_with::{serde_as, DisplayFromStr};

use crate::CopyError;

/// Top-level LUKS2 metadata, as stored in the JSON area.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Metadata {
    pub config: Config,
    /// Keyslots by ID, each wrapping the volume key under one passphrase
    pub keyslots: BTreeMap<u32, Keyslot>,
    /// Encrypted extents of the volume
    pub segments: BTreeMap<u32, Segment>,
    /// Digests verify keys decrypted from keyslots and bind them to segments
    #[serde(default)]
    pub digests: BTreeMap<u32, Digest>,
    /// Tokens attach typed metadata to keyslots
    #[serde(default)]
    pub tokens: BTreeMap<u32, Token>,
}

/// Sizes fixed at format time, plus persistent flags
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// Bytes reserved for JSON in each copy: the area size less the binary header
    #[serde_as(as = "DisplayFromStr")]
    pub json_size: u64,

    /// Bytes reserved for keyslot material after both metadata copies
    #[serde_as(as = "DisplayFromStr")]
    pub keyslots_size: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Requirements>,
}

/// Features a tool must understand before touching the volume
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Requirements {
    #[serde(default)]
    pub mandatory: Vec<String>,
}

/// Key derivation algorithm of a keyslot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KdfType {
    Pbkdf2,
    Argon2i,
    Argon2id,
    /// Any algorithm this crate does not model
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for KdfType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KdfType::Pbkdf2 => f.write_str("pbkdf2"),
            KdfType::Argon2i => f.write_str("argon2i"),
            KdfType::Argon2id => f.write_str("argon2id"),
            KdfType::Unknown => f.write_str("unknown"),
        }
    }
}

/// How a passphrase is stretched into the key protecting a keyslot
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Kdf {
    #[serde(rename = "type")]
    pub kdf_type: KdfType,
    /// base64
    pub salt: String,

    /// PBKDF2 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// PBKDF2 only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,

    /// Argon2 iteration count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<u32>,
    /// Argon2 memory cost in KiB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u32>,
    /// Argon2 lanes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
}

/// Order in which keyslots are tried when unlocking with a passphrase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Priority {
    /// Only used when explicitly requested
    Ignore,
    #[default]
    Normal,
    /// Tried before normal priority keyslots
    High,
}

impl TryFrom<u8> for Priority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::Ignore),
            1 => Ok(Priority::Normal),
            2 => Ok(Priority::High),
            v => Err(format!("invalid keyslot priority {v}")),
        }
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        match value {
            Priority::Ignore => 0,
            Priority::Normal => 1,
            Priority::High => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Ignore => f.write_str("ignore"),
            Priority::Normal => f.write_str("normal"),
            Priority::High => f.write_str("high"),
        }
    }
}

/// One keyslot
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Keyslot {
    #[serde(rename = "type")]
    pub slot_type: String,

    /// Size of the wrapped volume key in bytes
    pub key_size: u32,

    pub area: KeyslotArea,

    /// Key derivation parameters. A keyslot without one is unbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<Kdf>,

    /// Anti-forensic splitter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub af: Option<AntiForensic>,

    #[serde(default)]
    pub priority: Priority,
}

/// Where the encrypted key material of a keyslot lives in the keyslots area
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct KeyslotArea {
    #[serde(rename = "type")]
    pub area_type: String,

    /// Byte offset from the start of the volume
    #[serde_as(as = "DisplayFromStr")]
    pub offset: u64,

    #[serde_as(as = "DisplayFromStr")]
    pub size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_size: Option<u32>,
}

/// Anti-forensic splitter of a keyslot
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AntiForensic {
    #[serde(rename = "type")]
    pub af_type: String,
    pub stripes: u32,
    pub hash: String,
}

/// Size of a segment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentSize {
    /// The segment extends to the end of the underlying device
    Dynamic,
    /// Size in bytes
    Fixed(u64),
}

impl Serialize for SegmentSize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SegmentSize::Dynamic => serializer.serialize_str("dynamic"),
            SegmentSize::Fixed(size) => serializer.serialize_str(&size.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for SegmentSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "dynamic" => Ok(SegmentSize::Dynamic),
            size => size.parse().map(SegmentSize::Fixed).map_err(de::Error::custom),
        }
    }
}

/// An extent of the volume.
///
/// Settled volumes only have `crypt` segments. While a volume is being
/// reencrypted, plaintext ranges show up as `linear` segments, which carry
/// no cipher, IV tweak or sector size.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub segment_type: String,
    #[serde_as(as = "DisplayFromStr")]
    pub offset: u64,
    pub size: SegmentSize,
    #[serde_as(as = "DisplayFromStr")]
    #[serde(default)]
    pub iv_tweak: u64,
    /// Cipher in dm-crypt notation, such as `aes-xts-plain64`. Empty for linear segments.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub encryption: String,
    #[serde(default)]
    pub sector_size: u32,
    /// Data integrity protection, kept verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

/// Binds keyslots to segments through a digest of the volume key
#[serde_as]
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Digest {
    #[serde(rename = "type")]
    pub digest_type: String,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub keyslots: Vec<u32>,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    pub segments: Vec<u32>,
    pub salt: String,
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
}

/// A typed metadata record associated with zero or more keyslots.
///
/// Apart from `type` and `keyslots`, every member of the JSON object is a
/// token parameter. Numbers read back from a header are always floating
/// point, and binary data is stored as base64 text.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Token {
    pub token_type: String,
    pub keyslots: Vec<u32>,
    pub params: Map<String, Value>,
}

impl Token {
    pub fn new(token_type: impl Into<String>, keyslots: impl IntoIterator<Item = u32>) -> Self {
        Self {
            token_type: token_type.into(),
            keyslots: keyslots.into_iter().collect(),
            params: Map::new(),
        }
    }

    /// Add a parameter, encoded the way the header stores it
    pub fn with_param<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Result<Self, serde_json::Error> {
        self.params.insert(key.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Add a binary parameter as standard base64 text
    pub fn with_bytes(mut self, key: impl Into<String>, bytes: &[u8]) -> Self {
        self.params.insert(key.into(), Value::String(STANDARD.encode(bytes)));
        self
    }

    /// Decode a base64 parameter back into bytes
    pub fn bytes(&self, key: &str) -> Option<Vec<u8>> {
        STANDARD.decode(self.params.get(key)?.as_str()?).ok()
    }
}

// Numbers lose their integer-ness once they pass through the header
fn normalize_numbers(value: Value) -> Value {
    match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, normalize_numbers(v))).collect()),
        other => other,
    }
}

impl Serialize for Token {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let keyslots = self.keyslots.iter().map(u32::to_string).collect::<Vec<_>>();
        let mut map = serializer.serialize_map(Some(self.params.len() + 2))?;
        map.serialize_entry("type", &self.token_type)?;
        map.serialize_entry("keyslots", &keyslots)?;
        for (key, value) in self.params.iter().filter(|(k, _)| *k != "type" && *k != "keyslots") {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut object = Map::deserialize(deserializer)?;

        let token_type = match object.remove("type") {
            Some(Value::String(s)) => s,
            Some(_) => return Err(de::Error::custom("token type must be a string")),
            None => return Err(de::Error::missing_field("type")),
        };

        let keyslots = match object.remove("keyslots") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| de::Error::custom(format!("invalid token keyslot reference {item}")))
                })
                .collect::<Result<Vec<u32>, D::Error>>()?,
            Some(_) => return Err(de::Error::custom("token keyslots must be an array")),
            None => return Err(de::Error::missing_field("keyslots")),
        };

        let params = object.into_iter().map(|(k, v)| (k, normalize_numbers(v))).collect();

        Ok(Self {
            token_type,
            keyslots,
            params,
        })
    }
}

impl Metadata {
    /// Parse the NUL padded JSON area of one metadata copy
    pub fn from_json_area(json_area: &[u8]) -> Result<Self, CopyError> {
        let end = json_area.iter().position(|b| *b == 0).unwrap_or(json_area.len());
        let metadata: Self = serde_json::from_slice(&json_area[..end]).map_err(|e| CopyError::Json(e.to_string()))?;
        metadata.validate(json_area.len() as u64)?;
        Ok(metadata)
    }

    /// Check the structural invariants of the metadata against the JSON area size
    pub fn validate(&self, json_size: u64) -> Result<(), CopyError> {
        if self.config.json_size != json_size {
            return Err(CopyError::Inconsistent(format!(
                "config json_size {} does not match the area size {json_size}",
                self.config.json_size
            )));
        }

        for (id, token) in &self.tokens {
            if let Some(slot) = token.keyslots.iter().find(|s| !self.keyslots.contains_key(*s)) {
                return Err(CopyError::Inconsistent(format!(
                    "token {id} references missing keyslot {slot}"
                )));
            }
        }

        for (id, digest) in &self.digests {
            if let Some(slot) = digest.keyslots.iter().find(|s| !self.keyslots.contains_key(*s)) {
                return Err(CopyError::Inconsistent(format!(
                    "digest {id} references missing keyslot {slot}"
                )));
            }
            if let Some(segment) = digest.segments.iter().find(|s| !self.segments.contains_key(*s)) {
                return Err(CopyError::Inconsistent(format!(
                    "digest {id} references missing segment {segment}"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_log::test;

    use super::*;
    use crate::testutil::sample_metadata;

    #[test]
    fn test_parse_metadata() {
        let metadata: Metadata = serde_json::from_value(sample_metadata(0x3000)).expect("Cannot parse metadata");

        assert_eq!(metadata.config.json_size, 0x3000);
        assert_eq!(metadata.config.keyslots_size, 16 * 1024 * 1024 - 2 * 0x4000);

        let keyslot = metadata.keyslots.get(&0).unwrap();
        assert_eq!(keyslot.key_size, 64);
        assert_eq!(keyslot.priority, Priority::Normal);
        let kdf = keyslot.kdf.as_ref().unwrap();
        assert_eq!(kdf.kdf_type, KdfType::Argon2i);
        assert_eq!(kdf.time, Some(4));
        assert_eq!(kdf.memory, Some(32768));

        let segment = metadata.segments.get(&0).unwrap();
        assert_eq!(segment.encryption, "aes-xts-plain64");
        assert_eq!(segment.size, SegmentSize::Dynamic);
        assert_eq!(segment.offset, 16 * 1024 * 1024);

        assert_eq!(metadata.digests.get(&0).unwrap().keyslots, vec![0]);
        assert!(metadata.tokens.is_empty());
        assert!(metadata.validate(0x3000).is_ok());
    }

    #[test]
    fn test_reencryption_in_progress() {
        let metadata: Metadata = serde_json::from_value(crate::testutil::reencrypt_metadata(0x3000)).unwrap();

        let keyslot = &metadata.keyslots[&1];
        assert_eq!(keyslot.slot_type, "reencrypt");
        assert!(keyslot.kdf.is_none());
        assert_eq!(keyslot.area.area_type, "none");

        let linear = &metadata.segments[&1];
        assert_eq!(linear.segment_type, "linear");
        assert!(linear.encryption.is_empty());
        assert_eq!(linear.size, SegmentSize::Fixed(4 * 1024 * 1024));

        assert_eq!(metadata.keyslots[&2].kdf.as_ref().unwrap().kdf_type, KdfType::Unknown);
        assert!(metadata.validate(0x3000).is_ok());

        // Linear segments are written back without crypt-only members
        let encoded = serde_json::to_value(linear).unwrap();
        assert!(encoded.get("encryption").is_none());
    }

    #[test]
    fn test_priority_encoding() {
        let mut value = sample_metadata(0x3000);
        value["keyslots"]["0"]["priority"] = json!(2);
        let metadata: Metadata = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(metadata.keyslots[&0].priority, Priority::High);

        value["keyslots"]["0"]["priority"] = json!(7);
        assert!(serde_json::from_value::<Metadata>(value).is_err());

        assert_eq!(serde_json::to_value(Priority::Ignore).unwrap(), json!(0));
    }

    #[test]
    fn test_token_params() {
        let data = [0xa5u8; 128];
        let token = Token::new("secboot-test", [0, 1])
            .with_param("secboot-a", 50)
            .unwrap()
            .with_param("secboot-c", true)
            .unwrap()
            .with_bytes("secboot-b", &data);

        let encoded = serde_json::to_value(&token).unwrap();
        assert_eq!(encoded["type"], json!("secboot-test"));
        assert_eq!(encoded["keyslots"], json!(["0", "1"]));
        assert_eq!(encoded["secboot-a"], json!(50));

        let decoded: Token = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.token_type, "secboot-test");
        assert_eq!(decoded.keyslots, vec![0, 1]);
        assert_eq!(decoded.params["secboot-a"], json!(50.0));
        assert_eq!(decoded.params["secboot-c"], json!(true));
        assert_eq!(decoded.params["secboot-b"], json!(STANDARD.encode(data)));
        assert_eq!(decoded.bytes("secboot-b").unwrap(), data.to_vec());
    }

    #[test]
    fn test_token_nested_numbers() {
        let decoded: Token = serde_json::from_value(json!({
            "type": "nested",
            "keyslots": [],
            "outer": {"inner": [1, 2.5]},
        }))
        .unwrap();
        assert_eq!(decoded.params["outer"], json!({"inner": [1.0, 2.5]}));
        assert!(decoded.params["outer"]["inner"][0].is_f64());
    }

    #[test]
    fn test_validate_references() {
        let mut value = sample_metadata(0x3000);
        value["tokens"]["0"] = json!({"type": "orphan", "keyslots": ["3"]});
        let metadata: Metadata = serde_json::from_value(value).unwrap();
        assert!(matches!(metadata.validate(0x3000), Err(CopyError::Inconsistent(_))));

        let metadata: Metadata = serde_json::from_value(sample_metadata(0x3000)).unwrap();
        assert!(matches!(metadata.validate(0x7000), Err(CopyError::Inconsistent(_))));
    }
}
