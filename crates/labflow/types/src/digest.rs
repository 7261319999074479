//! Content digests (BLAKE3, rendered as lowercase hex)

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A 32-byte BLAKE3 digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(pub [u8; 32]);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestParseError {
    #[error("digest is not valid hex: {0}")]
    InvalidHex(String),

    #[error("digest must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

impl Digest {
    /// Fixed genesis value used as the previous hash of a stream's first event.
    pub const ZERO: Digest = Digest([0u8; 32]);

    pub fn of(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }

    /// Digest of the canonical JSON encoding of `value`.
    ///
    /// `serde_json` maps are ordered by key, so structurally equal values
    /// always produce the same digest.
    pub fn of_json<T: Serialize>(domain: &str, value: &T) -> Result<Self, serde_json::Error> {
        let encoded = serde_json::to_vec(value)?;
        let mut hasher = blake3::Hasher::new();
        hasher.update(domain.as_bytes());
        hasher.update(b":");
        hasher.update(&encoded);
        Ok(Self(*hasher.finalize().as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self, DigestParseError> {
        let bytes = hex::decode(value).map_err(|e| DigestParseError::InvalidHex(e.to_string()))?;
        let array: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| DigestParseError::InvalidLength(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::from_hex(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_through_serde() {
        let digest = Digest::of(b"labflow");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json.len(), 66);
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn rejects_short_digest() {
        assert_eq!(
            Digest::from_hex("abcd"),
            Err(DigestParseError::InvalidLength(2))
        );
        assert!(matches!(
            Digest::from_hex("zz"),
            Err(DigestParseError::InvalidHex(_))
        ));
    }

    #[test]
    fn json_digest_is_domain_separated() {
        let a = Digest::of_json("a", &1u32).unwrap();
        let b = Digest::of_json("b", &1u32).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, Digest::of_json("a", &1u32).unwrap());
    }
}
