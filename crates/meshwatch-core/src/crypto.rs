//! Channel encryption
//!
//! Symmetric channel traffic uses AES in CTR mode. The keystream is bound to
//! the packet: the 16-byte nonce is the packet id as a little-endian u64,
//! the sender's numeric address as a little-endian u32, then four zero bytes.
//! Encrypt and decrypt are the same transform.
//!
//! Key material travels as base64. A one-byte decoded value is an index form
//! selecting the well-known default key (index 1 is the default verbatim,
//! higher indexes bump the last byte). 16 bytes selects AES-128, 32 bytes
//! AES-256.
//!
//! The channel number carried on the wire is a one-byte xor fold of the
//! channel name xored with the fold of the expanded key. PKI traffic never
//! hashes; it always rides channel 0.
//!
//! Asymmetric (PKI) encryption is consumed as a capability; this module only
//! defines its contract.

use aes::{Aes128, Aes256};
use base64::Engine;
use cipher::{KeyIvInit, StreamCipher};
use thiserror::Error;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// The well-known default channel key (index 1).
pub const DEFAULT_PSK: [u8; 16] = [
    0xd4, 0xf1, 0xbb, 0x3a, 0x20, 0x29, 0x07, 0x59, 0xf0, 0xbc, 0xff, 0xab, 0xcf, 0x4e, 0x69,
    0x01,
];

/// Base64 index form of the default key.
pub const DEFAULT_CHANNEL_KEY: &str = "AQ==";

/// The channel number reserved for PKI-encrypted traffic.
pub const PKI_CHANNEL: u32 = 0;

/// Crypto layer failures.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// Key material is not valid base64 or has an unsupported length.
    #[error("invalid channel key: {0}")]
    InvalidKey(String),

    /// Ciphertext decrypted but the inner message did not parse.
    #[error("decrypted payload did not parse: {0}")]
    Malformed(#[from] prost::DecodeError),

    /// The PKI capability reported a failure.
    #[error("PKI operation failed: {0}")]
    PkiFailed(String),
}

/// An expanded symmetric channel key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl ChannelKey {
    /// Expand base64 key material into a usable key.
    ///
    /// URL-safe base64 variants are normalized first since operators paste
    /// keys from both alphabets.
    pub fn from_b64(material: &str) -> Result<Self, CryptoError> {
        let normalized = material.replace('-', "+").replace('_', "/");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(normalized.as_bytes())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        match bytes.len() {
            1 => {
                let index = bytes[0];
                if index == 0 {
                    return Err(CryptoError::InvalidKey("key index 0 disables crypto".into()));
                }
                let mut key = DEFAULT_PSK;
                // Index 1 is the default key verbatim; higher indexes bump
                // the last byte so each slot gets a distinct key.
                key[15] = key[15].wrapping_add(index - 1);
                Ok(ChannelKey::Aes128(key))
            }
            16 => {
                let mut key = [0u8; 16];
                key.copy_from_slice(&bytes);
                Ok(ChannelKey::Aes128(key))
            }
            32 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(&bytes);
                Ok(ChannelKey::Aes256(key))
            }
            n => Err(CryptoError::InvalidKey(format!(
                "unsupported key length {n}"
            ))),
        }
    }

    /// Raw key bytes, used by the channel hash.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ChannelKey::Aes128(k) => k,
            ChannelKey::Aes256(k) => k,
        }
    }
}

/// Nonce binding the keystream to one packet from one sender.
fn make_nonce(packet_id: u32, from_num: u32) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[0..8].copy_from_slice(&(packet_id as u64).to_le_bytes());
    nonce[8..12].copy_from_slice(&from_num.to_le_bytes());
    nonce
}

/// Apply the channel keystream in place semantics over a copy.
/// One transform serves both directions.
pub fn transform(key: &ChannelKey, packet_id: u32, from_num: u32, data: &[u8]) -> Vec<u8> {
    let nonce = make_nonce(packet_id, from_num);
    let mut buf = data.to_vec();
    match key {
        ChannelKey::Aes128(k) => {
            let mut cipher = Aes128Ctr::new(k.into(), &nonce.into());
            cipher.apply_keystream(&mut buf);
        }
        ChannelKey::Aes256(k) => {
            let mut cipher = Aes256Ctr::new(k.into(), &nonce.into());
            cipher.apply_keystream(&mut buf);
        }
    }
    buf
}

/// Encrypt a serialized inner payload for a channel.
pub fn encrypt_payload(key: &ChannelKey, packet_id: u32, from_num: u32, plaintext: &[u8]) -> Vec<u8> {
    transform(key, packet_id, from_num, plaintext)
}

/// Decrypt ciphertext and parse the inner payload.
///
/// A wrong key produces garbage that almost always fails the parse; the
/// caller logs and moves on, it never aborts ingestion.
pub fn decrypt_payload(
    key: &ChannelKey,
    packet_id: u32,
    from_num: u32,
    ciphertext: &[u8],
) -> Result<crate::proto::Data, CryptoError> {
    let plaintext = transform(key, packet_id, from_num, ciphertext);
    let data = <crate::proto::Data as prost::Message>::decode(plaintext.as_slice())?;
    Ok(data)
}

fn xor_fold(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Channel number for a named channel: xor fold of the UTF-8 name xored
/// with the fold of the expanded key bytes.
pub fn channel_hash(channel_name: &str, key_material: &str) -> Result<u32, CryptoError> {
    let key = ChannelKey::from_b64(key_material)?;
    Ok((xor_fold(channel_name.as_bytes()) ^ xor_fold(key.as_bytes())) as u32)
}

/// Inputs for an asymmetric encrypt call.
#[derive(Debug, Clone)]
pub struct PkiEncryptInputs {
    pub plaintext: Vec<u8>,
    pub from_num: u32,
    pub to_num: u32,
    pub packet_id: u32,
    /// Recipient public key, base64.
    pub recipient_public_key: String,
}

/// Result of a successful asymmetric encrypt.
#[derive(Debug, Clone)]
pub struct PkiCiphertext {
    pub ciphertext: Vec<u8>,
    /// Sender public key bytes to place on the envelope.
    pub public_key: Vec<u8>,
}

/// External asymmetric-crypto capability. The engine decides when to call
/// it (the envelope's PKI flag) but never implements the curve math.
pub trait PkiCapability: Send + Sync {
    /// Decrypt a PKI envelope for the given recipient private key (base64).
    fn decrypt(
        &self,
        packet: &crate::proto::MeshPacket,
        recipient_private_key: &str,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Encrypt a plaintext for a recipient using the sender private key
    /// (base64).
    fn encrypt(
        &self,
        inputs: &PkiEncryptInputs,
        sender_private_key: &str,
    ) -> Result<PkiCiphertext, CryptoError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{port, Data};
    use prost::Message;

    #[test]
    fn default_key_index_expands_to_default_psk() {
        let key = ChannelKey::from_b64(DEFAULT_CHANNEL_KEY).unwrap();
        assert_eq!(key, ChannelKey::Aes128(DEFAULT_PSK));
    }

    #[test]
    fn key_index_two_bumps_last_byte() {
        let key = ChannelKey::from_b64("Ag==").unwrap();
        let mut expected = DEFAULT_PSK;
        expected[15] += 1;
        assert_eq!(key, ChannelKey::Aes128(expected));
    }

    #[test]
    fn rejects_bad_key_material() {
        assert!(ChannelKey::from_b64("AA==").is_err()); // index 0
        assert!(ChannelKey::from_b64("AAECAw==").is_err()); // 4 bytes
        assert!(ChannelKey::from_b64("!!!").is_err());
    }

    #[test]
    fn url_safe_base64_accepted() {
        let standard = ChannelKey::from_b64("abc+def/hij0klm+nop/qw==");
        let url_safe = ChannelKey::from_b64("abc-def_hij0klm-nop_qw==");
        let key = standard.unwrap();
        assert!(matches!(key, ChannelKey::Aes128(_)));
        assert_eq!(key, url_safe.unwrap());
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = ChannelKey::from_b64(DEFAULT_CHANNEL_KEY).unwrap();
        let inner = Data {
            portnum: port::TEXT_MESSAGE_APP,
            payload: b"hello mesh".to_vec(),
            bitfield: 1,
            ..Default::default()
        };
        let plaintext = inner.encode_to_vec();

        let ciphertext = encrypt_payload(&key, 0xCAFE, 0x1234_5678, &plaintext);
        assert_ne!(ciphertext, plaintext);

        let decoded = decrypt_payload(&key, 0xCAFE, 0x1234_5678, &ciphertext).unwrap();
        assert_eq!(decoded, inner);
    }

    #[test]
    fn keystream_depends_on_packet_and_sender() {
        let key = ChannelKey::from_b64(DEFAULT_CHANNEL_KEY).unwrap();
        let plaintext = vec![0u8; 32];
        let a = encrypt_payload(&key, 1, 100, &plaintext);
        let b = encrypt_payload(&key, 2, 100, &plaintext);
        let c = encrypt_payload(&key, 1, 101, &plaintext);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn wrong_key_does_not_yield_plaintext() {
        let key = ChannelKey::from_b64(DEFAULT_CHANNEL_KEY).unwrap();
        let other = ChannelKey::from_b64("Ag==").unwrap();
        let inner = Data {
            portnum: port::POSITION_APP,
            payload: vec![7; 24],
            ..Default::default()
        };
        let ciphertext = encrypt_payload(&key, 9, 9, &inner.encode_to_vec());
        match decrypt_payload(&other, 9, 9, &ciphertext) {
            Ok(data) => assert_ne!(data, inner),
            Err(_) => {}
        }
    }

    #[test]
    fn primary_channel_hash_matches_deployment() {
        // The deployed network's default channel rides channel number 8.
        assert_eq!(channel_hash("LongFast", DEFAULT_CHANNEL_KEY).unwrap(), 8);
    }
}
