//! Authenticated Encryption with Associated Data
//!
//! Uses XChaCha20-Poly1305 (192-bit nonce).
//! Key size: 32 bytes.  Nonce: 24 bytes (random per call).  Tag: 16 bytes.
//!
//! Both envelope formats (at-rest records and wire events) carry the nonce in
//! its own field, so these helpers return it separately instead of prefixing.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Encrypt `plaintext` under a fresh random nonce.
/// `aad` - additional associated data (authenticated but not encrypted).
pub fn seal(
    key: &[u8; 32],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CryptoError> {
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Authentication)?;
    let mut out = [0u8; NONCE_LEN];
    out.copy_from_slice(&nonce);
    Ok((out, ciphertext))
}

/// Decrypt and authenticate. Any tag mismatch (wrong key, wrong AAD, tampered
/// bytes) yields [`CryptoError::Authentication`] without further detail.
pub fn open(
    key: &[u8; 32],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::Format("bad nonce length"));
    }
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Format("payload too short"));
    }
    let cipher =
        XChaCha20Poly1305::new_from_slice(key).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Authentication)?;
    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_with_aad() {
        let key = [7u8; 32];
        let (nonce, ct) = seal(&key, b"hello", b"aad").unwrap();
        let pt = open(&key, &nonce, &ct, b"aad").unwrap();
        assert_eq!(pt.as_slice(), b"hello");
    }

    #[test]
    fn wrong_aad_fails_authentication() {
        let key = [7u8; 32];
        let (nonce, ct) = seal(&key, b"hello", b"aad-1").unwrap();
        assert!(matches!(
            open(&key, &nonce, &ct, b"aad-2"),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn nonces_are_fresh() {
        let key = [1u8; 32];
        let (n1, _) = seal(&key, b"x", b"").unwrap();
        let (n2, _) = seal(&key, b"x", b"").unwrap();
        assert_ne!(n1, n2);
    }
}
