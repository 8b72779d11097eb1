use crate::error::{Result, ShaleError};
use base64::Engine;
use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;

pub const KEY_SIZE: usize = 20;

/// A 20-byte object fingerprint (the SHA-1 digest of the object's bytes).
///
/// Three textual forms are accepted by [`ObjectKey::parse`]: 40 lowercase hex
/// characters, or `G` followed by the URL-safe base64 encoding of the raw 20
/// bytes. The `P` form carries the object itself and never names a stored
/// object; see [`inline_key`] and [`decode_inline_key`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectKey([u8; KEY_SIZE]);

impl ObjectKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(ShaleError::InvalidKey(format!(
                "key must be exactly {} bytes, got {}",
                KEY_SIZE,
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn from_hex(hex_key: &str) -> Result<Self> {
        if hex_key.len() != 40 {
            return Err(ShaleError::InvalidKey(format!(
                "hex key must be 40 characters, got {}",
                hex_key.len()
            )));
        }
        let bytes = hex::decode(hex_key)
            .map_err(|error| ShaleError::InvalidKey(format!("invalid hex key: {}", error)))?;
        Self::from_bytes(&bytes)
    }

    /// Parses the hex form or the `G` base64 form.
    pub fn parse(text: &str) -> Result<Self> {
        match text.as_bytes().first() {
            Some(b'G') => {
                let encoded = &text[1..];
                let bytes = URL_SAFE
                    .decode(encoded)
                    .or_else(|_| URL_SAFE_NO_PAD.decode(encoded))
                    .map_err(|error| {
                        ShaleError::InvalidKey(format!("invalid base64 key: {}", error))
                    })?;
                Self::from_bytes(&bytes)
            }
            Some(_) => Self::from_hex(text),
            None => Err(ShaleError::InvalidKey("key cannot be empty".to_string())),
        }
    }

    /// SHA-1 digest of `data`, i.e. the key the store assigns to it.
    pub fn digest_of(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn to_base64(&self) -> String {
        format!("G{}", URL_SAFE.encode(self.0))
    }

    /// The first eight key bytes as a big-endian integer, for ordering
    /// against hash-ring positions.
    pub fn prefix(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }
}

// The input is already a cryptographic hash; fold it into a word with just
// enough mixing to avoid clustering when keys come from a small number of
// segments of a consistent hash ring.
impl std::hash::Hash for ObjectKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let mut folded = 0u64;
        for (i, b) in self.0.iter().enumerate() {
            folded ^= (*b as u64) << ((i & 7) * 8);
        }
        state.write_u64(folded);
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", self.to_hex())
    }
}

impl Serialize for ObjectKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        ObjectKey::parse(&text).map_err(D::Error::custom)
    }
}

/// Encodes a small object directly into its key: `P` followed by the
/// URL-safe base64 of the object bytes, without padding. No storage takes
/// place for such objects; the key is the object.
pub fn inline_key(data: &[u8]) -> String {
    format!("P{}", URL_SAFE_NO_PAD.encode(data))
}

pub fn is_inline_key(key: &str) -> bool {
    key.starts_with('P')
}

/// Decodes the object carried by a `P` key.
pub fn decode_inline_key(key: &str) -> Result<Vec<u8>> {
    let encoded = key.strip_prefix('P').ok_or_else(|| {
        ShaleError::InvalidKey("in-key objects must start with 'P'".to_string())
    })?;
    URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|error| ShaleError::InvalidKey(format!("invalid in-key object: {}", error)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let key = ObjectKey::digest_of(b"roundtrip");
        let hex_key = key.to_hex();
        assert_eq!(hex_key.len(), 40);
        assert_eq!(ObjectKey::from_hex(&hex_key).unwrap(), key);
        assert_eq!(ObjectKey::parse(&hex_key).unwrap(), key);
    }

    #[test]
    fn base64_roundtrip() {
        let key = ObjectKey::digest_of(b"base64");
        let encoded = key.to_base64();
        assert!(encoded.starts_with('G'));
        assert_eq!(encoded.len(), 29);
        assert_eq!(ObjectKey::parse(&encoded).unwrap(), key);
    }

    #[test]
    fn known_digests() {
        assert_eq!(
            ObjectKey::digest_of(b"").to_hex(),
            "da39a3ee5e6b4b0d3255bfef95601890afd80709"
        );
        assert_eq!(
            ObjectKey::digest_of(b"a").to_hex(),
            "86f7e437faa5a7fce15d1ddcb9eaeaea377667b8"
        );
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(ObjectKey::from_hex("da39").is_err());
        assert!(ObjectKey::from_hex(&"z".repeat(40)).is_err());
        assert!(ObjectKey::parse("").is_err());
        assert!(ObjectKey::parse("Gnot-base64!!!").is_err());
        assert!(ObjectKey::from_bytes(&[0u8; 19]).is_err());
    }

    #[test]
    fn inline_key_roundtrip() {
        let key = inline_key(b"hello");
        assert!(is_inline_key(&key));
        assert!(!key.contains('='));
        assert_eq!(decode_inline_key(&key).unwrap(), b"hello");

        let empty = inline_key(b"");
        assert_eq!(decode_inline_key(&empty).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn prefix_is_big_endian() {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[0] = 0xab;
        bytes[7] = 0x01;
        let key = ObjectKey::from_bytes(&bytes).unwrap();
        assert_eq!(key.prefix(), 0xab00_0000_0000_0001);
    }
}
