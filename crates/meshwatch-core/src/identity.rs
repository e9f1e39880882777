//! Node identity resolution
//!
//! A node's stable protocol identity is its 32-bit numeric address. The
//! canonical string id (`!xxxxxxxx`) and the MAC-like representation are pure
//! functions of that number; this module owns both derivations plus the
//! reverse parse used when identities arrive as strings.

use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;

/// The reserved "all nodes" address.
pub const BROADCAST_NUM: u32 = 0xFFFF_FFFF;
/// Canonical string form of the broadcast address.
pub const BROADCAST_ID: &str = "!ffffffff";

/// Identity conversion failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum IdentityError {
    /// String id is not of the form `!xxxxxxxx`.
    #[error("invalid node identifier: {0:?}")]
    InvalidIdentifier(String),
}

/// Canonical string id for a numeric node address: `!%08x`.
pub fn canonical_id(node_num: u32) -> String {
    format!("!{:08x}", node_num)
}

/// MAC-like representation of a numeric node address: a fixed `FF:FF`
/// prefix followed by the four address bytes, uppercased.
pub fn mac_repr(node_num: u32) -> String {
    let b = node_num.to_be_bytes();
    format!("FF:FF:{:02X}:{:02X}:{:02X}:{:02X}", b[0], b[1], b[2], b[3])
}

/// Parse a canonical `!xxxxxxxx` id back to its numeric address.
///
/// Callers walking hop lists catch this per-hop so one malformed id does
/// not drop the rest of the route.
pub fn parse_id(id: &str) -> Result<u32, IdentityError> {
    let hex = id
        .strip_prefix('!')
        .ok_or_else(|| IdentityError::InvalidIdentifier(id.to_string()))?;
    if hex.len() != 8 {
        return Err(IdentityError::InvalidIdentifier(id.to_string()));
    }
    u32::from_str_radix(hex, 16).map_err(|_| IdentityError::InvalidIdentifier(id.to_string()))
}

/// Whether an address is the broadcast sentinel.
pub fn is_broadcast(node_num: u32) -> bool {
    node_num == BROADCAST_NUM
}

/// Digest set of public-key material known to be weak or widely shared.
///
/// Keys are compared by the SHA-256 of their decoded bytes, so the set can
/// be extended with observed material without storing the keys themselves.
pub struct LowEntropyKeySet {
    digests: HashSet<[u8; 32]>,
}

impl LowEntropyKeySet {
    /// The built-in set: every 32-byte key consisting of a single repeated
    /// byte value. These show up when devices ship with zeroed or
    /// test-pattern key material.
    pub fn builtin() -> Self {
        let mut digests = HashSet::with_capacity(256);
        for byte in 0..=255u8 {
            digests.insert(Sha256::digest([byte; 32]).into());
        }
        Self { digests }
    }

    /// Build a set from raw key material (used by tests and operators
    /// loading an external blocklist).
    pub fn from_materials<I, B>(materials: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let digests = materials
            .into_iter()
            .map(|m| Sha256::digest(m.as_ref()).into())
            .collect();
        Self { digests }
    }

    /// Check base64 key material against the set. Empty or undecodable
    /// input is never flagged.
    pub fn contains_b64(&self, public_key: &str) -> bool {
        if public_key.is_empty() {
            return false;
        }
        let Ok(material) = base64::engine::general_purpose::STANDARD.decode(public_key) else {
            return false;
        };
        let digest: [u8; 32] = Sha256::digest(&material).into();
        self.digests.contains(&digest)
    }
}

impl Default for LowEntropyKeySet {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD as B64;

    #[test]
    fn canonical_id_roundtrip() {
        for num in [0u32, 1, 0x1234_5678, 0xDEAD_BEEF, BROADCAST_NUM] {
            assert_eq!(parse_id(&canonical_id(num)).unwrap(), num);
        }
    }

    #[test]
    fn broadcast_forms_agree() {
        assert_eq!(canonical_id(BROADCAST_NUM), BROADCAST_ID);
        assert!(is_broadcast(parse_id(BROADCAST_ID).unwrap()));
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(parse_id("12345678").is_err());
        assert!(parse_id("!1234").is_err());
        assert!(parse_id("!gggggggg").is_err());
        assert!(parse_id("").is_err());
    }

    #[test]
    fn mac_repr_is_deterministic() {
        assert_eq!(mac_repr(0x1234_5678), "FF:FF:12:34:56:78");
        assert_eq!(mac_repr(0xDEAD_BEEF), "FF:FF:DE:AD:BE:EF");
    }

    #[test]
    fn low_entropy_detects_listed_material() {
        let set = LowEntropyKeySet::from_materials([b"suspicious-key".as_slice()]);
        let encoded = B64.encode(b"suspicious-key");
        assert!(set.contains_b64(&encoded));
        assert!(!set.contains_b64(&B64.encode(b"legit-key")));
    }

    #[test]
    fn low_entropy_builtin_flags_repeated_byte_keys() {
        let set = LowEntropyKeySet::builtin();
        assert!(set.contains_b64(&B64.encode([0u8; 32])));
        assert!(set.contains_b64(&B64.encode([0xAAu8; 32])));
        assert!(!set.contains_b64(&B64.encode(b"0123456789abcdef0123456789abcdef")));
    }

    #[test]
    fn low_entropy_handles_empty_and_garbage() {
        let set = LowEntropyKeySet::builtin();
        assert!(!set.contains_b64(""));
        assert!(!set.contains_b64("not base64!!!"));
    }
}
