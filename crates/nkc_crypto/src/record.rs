//! At-rest record envelopes.
//!
//! Every stored record is encrypted under its own record key
//! (`kdf::record_key(vk, id, type)`) with a fresh nonce, and the associated
//! data is bound to `{schema: "NKC", type, id}`. Ciphertext copied onto another
//! record id or type fails authentication instead of decrypting.
//!
//! Stored form: base64( canonical JSON of [`RecordEnvelope`] ).
//!
//! Errors are split so callers can tell corrupt input from a wrong key:
//!   - `Format`             - not base64 / not JSON / bad field encoding
//!   - `UnsupportedVersion` - well-formed but from a newer writer
//!   - `Authentication`     - AAD mismatch, tampering, or wrong vault key

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::aead;
use crate::canonical::to_canonical_bytes;
use crate::error::CryptoError;
use crate::kdf::{record_key, VaultKey};

pub const RECORD_SCHEMA: &str = "NKC";
pub const RECORD_VERSION: u32 = 1;
pub const RECORD_ALG: &str = "xchacha20poly1305";

/// Associated data bound into every record envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAad {
    pub schema: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub id: String,
}

impl RecordAad {
    pub fn new(record_type: &str, id: &str) -> Self {
        Self {
            schema: RECORD_SCHEMA.to_string(),
            record_type: record_type.to_string(),
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub v: u32,
    pub alg: String,
    pub nonce: String,
    pub ct: String,
    pub ad: RecordAad,
}

/// Encrypt `data` for storage under `(id, record_type)`.
pub fn encrypt_record(
    vk: &VaultKey,
    id: &str,
    record_type: &str,
    data: &[u8],
) -> Result<String, CryptoError> {
    let ad = RecordAad::new(record_type, id);
    let aad = to_canonical_bytes(&ad)?;
    let key = record_key(vk, id, record_type);
    let (nonce, ct) = aead::seal(&key, data, &aad)?;
    let envelope = RecordEnvelope {
        v: RECORD_VERSION,
        alg: RECORD_ALG.to_string(),
        nonce: STANDARD.encode(nonce),
        ct: STANDARD.encode(ct),
        ad,
    };
    Ok(STANDARD.encode(to_canonical_bytes(&envelope)?))
}

/// Parse an envelope without decrypting it.
pub fn parse_record(stored: &str) -> Result<RecordEnvelope, CryptoError> {
    let trimmed = stored.trim();
    if trimmed.is_empty() {
        return Err(CryptoError::Format("empty input"));
    }
    let raw = STANDARD
        .decode(trimmed)
        .map_err(|_| CryptoError::Format("invalid encoding"))?;
    let envelope: RecordEnvelope =
        serde_json::from_slice(&raw).map_err(|_| CryptoError::Format("invalid structure"))?;
    if envelope.v != RECORD_VERSION {
        return Err(CryptoError::UnsupportedVersion(envelope.v));
    }
    if envelope.alg != RECORD_ALG {
        return Err(CryptoError::Format("unknown algorithm"));
    }
    Ok(envelope)
}

/// Decrypt a stored envelope that is expected to belong to `(id, record_type)`.
pub fn decrypt_record(
    vk: &VaultKey,
    id: &str,
    record_type: &str,
    stored: &str,
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let envelope = parse_record(stored)?;
    let expected = RecordAad::new(record_type, id);
    if envelope.ad != expected {
        return Err(CryptoError::Authentication);
    }
    let nonce = STANDARD
        .decode(&envelope.nonce)
        .map_err(|_| CryptoError::Format("invalid nonce encoding"))?;
    let ct = STANDARD
        .decode(&envelope.ct)
        .map_err(|_| CryptoError::Format("invalid body encoding"))?;
    let aad = to_canonical_bytes(&expected)?;
    let key = record_key(vk, id, record_type);
    aead::open(&key, &nonce, &ct, &aad)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vk(byte: u8) -> VaultKey {
        VaultKey::from_bytes([byte; 32])
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let stored = encrypt_record(&vk(1), "msg-1", "message", b"{\"text\":\"hi\"}").unwrap();
        let data = decrypt_record(&vk(1), "msg-1", "message", &stored).unwrap();
        assert_eq!(data.as_slice(), b"{\"text\":\"hi\"}");
    }

    #[test]
    fn aad_binds_record_id() {
        let stored = encrypt_record(&vk(1), "msg-1", "message", b"data").unwrap();
        assert!(matches!(
            decrypt_record(&vk(1), "msg-2", "message", &stored),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn aad_binds_record_type() {
        let stored = encrypt_record(&vk(1), "x", "profile", b"data").unwrap();
        assert!(matches!(
            decrypt_record(&vk(1), "x", "conversation", &stored),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn wrong_key_is_authentication_error() {
        let stored = encrypt_record(&vk(1), "x", "profile", b"data").unwrap();
        assert!(matches!(
            decrypt_record(&vk(2), "x", "profile", &stored),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn forged_aad_fails_even_when_fields_rewritten() {
        // Rewrite the visible AD to the target id; the tag still binds the original.
        let stored = encrypt_record(&vk(1), "a", "message", b"data").unwrap();
        let mut env = parse_record(&stored).unwrap();
        env.ad.id = "b".into();
        let forged = STANDARD.encode(serde_json::to_vec(&env).unwrap());
        assert!(matches!(
            decrypt_record(&vk(1), "b", "message", &forged),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn malformed_inputs_are_format_errors_without_detail() {
        for input in ["", "%%%", "not-base64!"] {
            let err = decrypt_record(&vk(1), "x", "message", input).unwrap_err();
            assert!(matches!(err, CryptoError::Format(_)), "input {input:?}");
            assert!(!err.to_string().to_lowercase().contains("ciphertext"));
        }
    }

    #[test]
    fn unknown_version_rejected() {
        let stored = encrypt_record(&vk(1), "x", "message", b"data").unwrap();
        let mut env = parse_record(&stored).unwrap();
        env.v = 9;
        let bumped = STANDARD.encode(serde_json::to_vec(&env).unwrap());
        assert!(matches!(
            decrypt_record(&vk(1), "x", "message", &bumped),
            Err(CryptoError::UnsupportedVersion(9))
        ));
    }
}
