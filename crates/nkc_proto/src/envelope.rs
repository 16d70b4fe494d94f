//! Signed, encrypted event envelope - what transports carry.
//!
//! A transport or relay sees only the header and opaque bytes:
//!   - `v`               format version
//!   - `convId`          conversation (log) the event belongs to
//!   - `eventId`         random UUID, used for dedup (legacy senders: `msgId`)
//!   - `authorDeviceId`  authoring device; its pinned identity key signs
//!   - `ts`, `lamport`   wall clock (ms) and logical clock
//!   - `rk`              optional ratchet header; absent = legacy static key
//!   - `prev`            optional hash of the previous event in this log
//!
//! Body: padded event JSON sealed with XChaCha20-Poly1305 under the message
//! key, AAD = canonical header bytes. Signature: Ed25519 over the canonical
//! encoding of `{header, ciphertext, nonce}`.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use nkc_crypto::canonical::to_canonical_bytes;
use nkc_crypto::identity::{IdentityKeyPair, PublicKeyBytes};
use nkc_crypto::ratchet::RatchetHeader;
use nkc_crypto::{aead, hash, Key32};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::body::EventBody;
use crate::codec::{self, PaddingMode};
use crate::error::ProtoError;

pub const WIRE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    pub v: u32,
    pub conv_id: String,
    #[serde(alias = "msgId")]
    pub event_id: String,
    pub author_device_id: String,
    /// Unix milliseconds.
    pub ts: i64,
    pub lamport: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rk: Option<RatchetHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<String>,
}

impl EnvelopeHeader {
    /// Header for a new event with a fresh id and the current time.
    pub fn new(conv_id: &str, author_device_id: &str, lamport: u64) -> Self {
        Self {
            v: WIRE_VERSION,
            conv_id: conv_id.to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            author_device_id: author_device_id.to_string(),
            ts: Utc::now().timestamp_millis(),
            lamport,
            rk: None,
            prev: None,
        }
    }

    pub fn with_ratchet(mut self, rk: RatchetHeader) -> Self {
        self.rk = Some(rk);
        self
    }

    pub fn with_prev(mut self, prev: Option<String>) -> Self {
        self.prev = prev;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub header: EnvelopeHeader,
    /// Base64 AEAD output (ct || tag).
    pub ciphertext: String,
    /// Base64 24-byte nonce.
    pub nonce: String,
    /// Base64 Ed25519 signature.
    pub sig: String,
}

#[derive(Serialize)]
struct SignedPart<'a> {
    header: &'a EnvelopeHeader,
    ciphertext: &'a str,
    nonce: &'a str,
}

impl WireEnvelope {
    /// Encrypt `body` under `message_key` and sign the result.
    pub fn seal(
        header: EnvelopeHeader,
        body: &EventBody,
        message_key: &Key32,
        signer: &IdentityKeyPair,
        padding: PaddingMode,
    ) -> Result<Self, ProtoError> {
        let json = Zeroizing::new(serde_json::to_vec(body)?);
        let padded = Zeroizing::new(codec::pad(&json, padding));
        let aad = to_canonical_bytes(&header)?;
        let (nonce, ct) = aead::seal(message_key, &padded, &aad)?;

        let mut envelope = Self {
            header,
            ciphertext: STANDARD.encode(ct),
            nonce: STANDARD.encode(nonce),
            sig: String::new(),
        };
        envelope.sig = STANDARD.encode(signer.sign(&envelope.signed_bytes()?));
        Ok(envelope)
    }

    /// Exact bytes covered by the signature and the event hash.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        Ok(to_canonical_bytes(&SignedPart {
            header: &self.header,
            ciphertext: &self.ciphertext,
            nonce: &self.nonce,
        })?)
    }

    pub fn check_version(&self) -> Result<(), ProtoError> {
        if self.header.v != WIRE_VERSION {
            return Err(ProtoError::UnsupportedVersion(self.header.v));
        }
        Ok(())
    }

    /// Verify the detached signature against the author's pinned key.
    pub fn verify_signature(&self, author: &PublicKeyBytes) -> Result<(), ProtoError> {
        self.check_version()?;
        let sig = STANDARD
            .decode(&self.sig)
            .map_err(|_| ProtoError::Format("signature encoding"))?;
        IdentityKeyPair::verify(author, &self.signed_bytes()?, &sig)?;
        Ok(())
    }

    /// Decrypt and decode the body. Authenticates the header as AAD.
    pub fn open(&self, message_key: &Key32) -> Result<EventBody, ProtoError> {
        self.check_version()?;
        let nonce = STANDARD
            .decode(&self.nonce)
            .map_err(|_| ProtoError::Format("nonce encoding"))?;
        let ct = STANDARD
            .decode(&self.ciphertext)
            .map_err(|_| ProtoError::Format("body encoding"))?;
        let aad = to_canonical_bytes(&self.header)?;
        let padded = aead::open(message_key, &nonce, &ct, &aad)?;
        let json = codec::unpad(&padded)?;
        serde_json::from_slice(json).map_err(|_| ProtoError::Format("body structure"))
    }

    /// H(prev || signed bytes), hex. `prev` is the header's link, empty for
    /// the first event of a log.
    pub fn event_hash(&self) -> Result<String, ProtoError> {
        let prev = self.header.prev.as_deref().unwrap_or("");
        Ok(hash::event_hash(prev, &self.signed_bytes()?))
    }

    pub fn to_json(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(s).map_err(|_| ProtoError::Format("envelope structure"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ChatMessage;

    fn body(text: &str) -> EventBody {
        EventBody::Message(ChatMessage {
            id: "m1".into(),
            text: text.into(),
            reply_to: None,
        })
    }

    fn sealed(ik: &IdentityKeyPair) -> WireEnvelope {
        let header = EnvelopeHeader::new("conv-1", "dev-a", 1)
            .with_ratchet(RatchetHeader::Symmetric { i: 0 });
        WireEnvelope::seal(header, &body("hello"), &[7u8; 32], ik, PaddingMode::Buckets).unwrap()
    }

    #[test]
    fn seal_verify_open() {
        let ik = IdentityKeyPair::generate();
        let env = sealed(&ik);
        env.verify_signature(&ik.public).unwrap();
        assert_eq!(env.open(&[7u8; 32]).unwrap(), body("hello"));
    }

    #[test]
    fn tampered_header_fails_signature_and_aead() {
        let ik = IdentityKeyPair::generate();
        let mut env = sealed(&ik);
        env.header.lamport = 99;
        assert!(env.verify_signature(&ik.public).is_err());
        assert!(matches!(
            env.open(&[7u8; 32]),
            Err(ProtoError::Crypto(nkc_crypto::CryptoError::Authentication))
        ));
    }

    #[test]
    fn wrong_author_key_rejected() {
        let env = sealed(&IdentityKeyPair::generate());
        let other = IdentityKeyPair::generate();
        assert!(env.verify_signature(&other.public).is_err());
    }

    #[test]
    fn legacy_msg_id_is_accepted() {
        let json = r#"{"header":{"v":1,"convId":"c","msgId":"old-1","authorDeviceId":"d","ts":5,"lamport":1},
                       "ciphertext":"","nonce":"","sig":""}"#;
        let env = WireEnvelope::from_json(json).unwrap();
        assert_eq!(env.header.event_id, "old-1");
        assert!(env.header.rk.is_none());
    }

    #[test]
    fn event_hash_depends_on_prev() {
        let ik = IdentityKeyPair::generate();
        let env = sealed(&ik);
        let mut linked = env.clone();
        linked.header.prev = Some(env.event_hash().unwrap());
        assert_ne!(env.event_hash().unwrap(), linked.event_hash().unwrap());
    }

    #[test]
    fn unknown_version_rejected() {
        let ik = IdentityKeyPair::generate();
        let mut env = sealed(&ik);
        env.header.v = 3;
        assert!(matches!(env.open(&[7u8; 32]), Err(ProtoError::UnsupportedVersion(3))));
    }
}
