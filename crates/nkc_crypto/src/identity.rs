//! Identity key management
//!
//! Each *device* has one long-term `IdentityKeyPair` (Ed25519) used to sign
//! every wire envelope it authors, and one `DhKeyPair` (X25519) advertised to
//! peers so a DH ratchet can be bootstrapped.
//!
//! Key-change policy
//! -----------------
//! Peers pin the identity and DH public keys of a friend on first contact.
//! A later change flips that contact to `Blocked`; it is never silently
//! accepted. Pinning lives in `nkc_sync`; this module only produces and checks
//! key material.
//!
//! Device approvals
//! ----------------
//! A `DeviceApproval` is an expiring statement "device A approves device B",
//! signed by A's identity key. Device-to-device sync requires one in either
//! direction.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::canonical::to_canonical_bytes;
use crate::error::CryptoError;

// ── Newtype wrappers ──────────────────────────────────────────────────────────

/// 32-byte public key, base64url-encoded on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKeyBytes(#[serde(with = "b64_32")] pub [u8; 32]);

impl PublicKeyBytes {
    pub fn to_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn from_b64(s: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| CryptoError::Format("public key is not base64url"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("public key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Human-readable fingerprint: BLAKE3 of the public key, truncated to
    /// 20 bytes, hex-encoded in groups of 4 for display.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let hex = hex::encode(&hash.as_bytes()[..20]);
        hex.as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Long-term signing key.  Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicKeyBytes(signing_key.verifying_key().to_bytes()),
            secret_bytes: signing_key.to_bytes(),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey(format!("identity key must be 32 bytes, got {}", bytes.len())))?;
        let signing_key = SigningKey::from_bytes(&arr);
        Ok(Self {
            public: PublicKeyBytes(signing_key.verifying_key().to_bytes()),
            secret_bytes: arr,
        })
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.secret_bytes).sign(msg).to_bytes()
    }

    /// Verify a signature made by any Ed25519 public key.
    pub fn verify(public: &PublicKeyBytes, msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&public.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig_arr: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| CryptoError::SignatureVerification)?;
        vk.verify(msg, &Signature::from_bytes(&sig_arr))
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

// ── DH keypair ────────────────────────────────────────────────────────────────

/// X25519 keypair. The secret is stored as raw bytes so it can be persisted in
/// the keystore and zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DhKeyPair {
    #[zeroize(skip)]
    pub public: PublicKeyBytes,
    secret_bytes: [u8; 32],
}

impl DhKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self::from_secret(&secret)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("DH secret must be 32 bytes".into()))?;
        Ok(Self::from_secret(&StaticSecret::from(arr)))
    }

    fn from_secret(secret: &StaticSecret) -> Self {
        Self {
            public: PublicKeyBytes(X25519Public::from(secret).to_bytes()),
            secret_bytes: secret.to_bytes(),
        }
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    /// X25519(self.secret, remote).
    pub fn diffie_hellman(&self, remote: &PublicKeyBytes) -> [u8; 32] {
        let secret = StaticSecret::from(self.secret_bytes);
        secret.diffie_hellman(&X25519Public::from(remote.0)).to_bytes()
    }
}

impl std::fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhKeyPair").field("public", &self.public.to_b64()).finish()
    }
}

// ── Device approval ───────────────────────────────────────────────────────────

/// Signed, expiring approval of `subject_device_id` by `approver_device_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceApproval {
    pub version: u8,
    pub approver_device_id: String,
    pub approver_pub: PublicKeyBytes,
    pub subject_device_id: String,
    pub subject_pub: PublicKeyBytes,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Base64url Ed25519 signature over the canonical encoding of the fields above.
    pub signature: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalPayload<'a> {
    version: u8,
    approver_device_id: &'a str,
    approver_pub: &'a PublicKeyBytes,
    subject_device_id: &'a str,
    subject_pub: &'a PublicKeyBytes,
    issued_at: i64,
    expires_at: i64,
}

impl DeviceApproval {
    pub fn issue(
        approver: &IdentityKeyPair,
        approver_device_id: &str,
        subject_device_id: &str,
        subject_pub: &PublicKeyBytes,
        valid_for: Duration,
    ) -> Result<Self, CryptoError> {
        let issued_at = Utc::now();
        let mut approval = Self {
            version: 1,
            approver_device_id: approver_device_id.to_string(),
            approver_pub: approver.public.clone(),
            subject_device_id: subject_device_id.to_string(),
            subject_pub: subject_pub.clone(),
            issued_at,
            expires_at: issued_at + valid_for,
            signature: String::new(),
        };
        let sig = approver.sign(&approval.signing_bytes()?);
        approval.signature = URL_SAFE_NO_PAD.encode(sig);
        Ok(approval)
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        to_canonical_bytes(&ApprovalPayload {
            version: self.version,
            approver_device_id: &self.approver_device_id,
            approver_pub: &self.approver_pub,
            subject_device_id: &self.subject_device_id,
            subject_pub: &self.subject_pub,
            issued_at: self.issued_at.timestamp_millis(),
            expires_at: self.expires_at.timestamp_millis(),
        })
    }

    /// Verify signature and expiry against the approver key the caller trusts.
    pub fn verify(&self, trusted_approver: &PublicKeyBytes, now: DateTime<Utc>) -> Result<(), CryptoError> {
        if &self.approver_pub != trusted_approver {
            return Err(CryptoError::Approval("approver key mismatch".into()));
        }
        let sig = URL_SAFE_NO_PAD
            .decode(&self.signature)
            .map_err(|_| CryptoError::Format("signature is not base64url"))?;
        IdentityKeyPair::verify(trusted_approver, &self.signing_bytes()?, &sig)?;
        if now > self.expires_at {
            return Err(CryptoError::Approval("approval has expired".into()));
        }
        Ok(())
    }
}

// ── Serde helpers ─────────────────────────────────────────────────────────────

mod b64_32 {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&URL_SAFE_NO_PAD.encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = URL_SAFE_NO_PAD.decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}
