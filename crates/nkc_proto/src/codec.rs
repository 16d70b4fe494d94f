//! Body padding.
//!
//! Padding is added inside the plaintext before encryption, so transports
//! and relays only ever see bucket-sized ciphertext.
//!
//! Layout: [body_len: u32 LE] [body] [random fill]
//!
//! Bucket sizes (bytes): 256, 512, 1024, 4096, 16384, 65536.
//! Bodies larger than the biggest bucket are length-prefixed but not padded.

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ProtoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingMode {
    /// Length prefix only.
    None,
    /// Next bucket up.
    #[default]
    Buckets,
    /// Always the largest bucket.
    Maximum,
}

const BUCKET_SIZES: &[usize] = &[256, 512, 1024, 4096, 16384, 65536];
const MAX_BUCKET: usize = 65536;
const LEN_PREFIX: usize = 4;

pub fn pad(body: &[u8], mode: PaddingMode) -> Vec<u8> {
    let needed = LEN_PREFIX + body.len();
    let target = match mode {
        PaddingMode::None => needed,
        PaddingMode::Buckets => BUCKET_SIZES
            .iter()
            .copied()
            .find(|&b| b >= needed)
            .unwrap_or(needed),
        PaddingMode::Maximum => MAX_BUCKET.max(needed),
    };

    let mut out = Vec::with_capacity(target);
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(body);
    let remaining = target - out.len();
    if remaining > 0 {
        // Random, not zeros: keeps the fill from compressing.
        let mut fill = vec![0u8; remaining];
        rand::rngs::OsRng.fill_bytes(&mut fill);
        out.extend_from_slice(&fill);
    }
    out
}

pub fn unpad(padded: &[u8]) -> Result<&[u8], ProtoError> {
    let prefix: [u8; LEN_PREFIX] = padded
        .get(..LEN_PREFIX)
        .and_then(|p| p.try_into().ok())
        .ok_or(ProtoError::InvalidPadding("too short for length prefix"))?;
    let len = u32::from_le_bytes(prefix) as usize;
    LEN_PREFIX
        .checked_add(len)
        .and_then(|end| padded.get(LEN_PREFIX..end))
        .ok_or(ProtoError::InvalidPadding("length prefix exceeds data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_body_fills_smallest_bucket() {
        let padded = pad(b"hello", PaddingMode::Buckets);
        assert_eq!(padded.len(), 256);
        assert_eq!(unpad(&padded).unwrap(), b"hello");
    }

    #[test]
    fn mid_size_body_picks_next_bucket() {
        let body = vec![0x42u8; 5000];
        let padded = pad(&body, PaddingMode::Buckets);
        assert_eq!(padded.len(), 16384);
        assert_eq!(unpad(&padded).unwrap(), body.as_slice());
    }

    #[test]
    fn none_and_maximum() {
        assert_eq!(pad(b"abc", PaddingMode::None).len(), 7);
        assert_eq!(pad(b"abc", PaddingMode::Maximum).len(), 65536);
    }

    #[test]
    fn oversized_body_is_not_truncated() {
        let body = vec![1u8; 70_000];
        let padded = pad(&body, PaddingMode::Buckets);
        assert_eq!(padded.len(), 70_004);
        assert_eq!(unpad(&padded).unwrap().len(), 70_000);
    }

    #[test]
    fn corrupt_prefix_rejected() {
        assert!(unpad(&[1, 2]).is_err());
        assert!(unpad(&[0xff, 0xff, 0, 0, 1]).is_err());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut padded = u32::MAX.to_le_bytes().to_vec();
        padded.extend_from_slice(b"short");
        assert!(matches!(unpad(&padded), Err(ProtoError::InvalidPadding(_))));
    }
}
