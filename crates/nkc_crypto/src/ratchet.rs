//! Per-conversation message ratchet.
//!
//! Three key tiers, tried in order when sending and selected by the envelope's
//! ratchet header when receiving:
//!
//!   v2 DH ratchet   - header `{v:2, i, dh, pn}`; root key mixed with X25519
//!                     output on every step, fresh sender key per step
//!   v1 symmetric    - header `{v:1, i}`; one hash chain per author device,
//!                     seeded from the conversation base key
//!   legacy static   - no header; one fixed key, decode-only
//!
//! State separation:
//!   RK  - root key (DH tier, updated on every DH step)
//!   CKs - sending chain key (updated per message)
//!   CKr - receiving chain key (updated per message)
//!   MK  - message key (derived from CK, used once, then dropped)
//!
//! DH steps happen when the remote DH key first becomes known (bootstrap from
//! both sides' advertised keys), before the first send after a new remote key
//! arrived, and every [`DH_ROTATION_INTERVAL`] messages on one sending chain.
//! `pn` in the header tells the peer where the sender's previous chain ended.
//!
//! Receiving never mutates: [`ConversationRatchet::receive`] returns a
//! [`PendingReceive`] holding the message key and the successor state. The
//! caller authenticates the envelope with the key and only then calls
//! [`ConversationRatchet::commit`]. A tampered or misrouted envelope therefore
//! never advances a chain.
//!
//! Out-of-order delivery is tolerated up to [`MAX_SKIP`] positions ahead of a
//! chain. Keys walked past are cached in memory (never persisted, bounded);
//! anything further ahead is reported as `Deferred`.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::hash::{self, domain};
use crate::identity::{DhKeyPair, PublicKeyBytes};
use crate::kdf;
use crate::Key32;

/// Maximum distance a receiver walks ahead of its chain position.
pub const MAX_SKIP: u64 = 50;

/// Sending-chain length after which a fresh DH step is forced.
pub const DH_ROTATION_INTERVAL: u64 = 50;

const SKIPPED_CACHE_LIMIT: usize = (MAX_SKIP as usize) * 2;

pub type MessageKey = Zeroizing<Key32>;

// ── Ratchet header (sent in clear inside the signed envelope header) ─────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRatchetHeader", into = "RawRatchetHeader")]
pub enum RatchetHeader {
    Symmetric { i: u64 },
    Dh { i: u64, dh: PublicKeyBytes, pn: Option<u64> },
}

#[derive(Serialize, Deserialize)]
struct RawRatchetHeader {
    v: u8,
    i: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dh: Option<PublicKeyBytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pn: Option<u64>,
}

impl TryFrom<RawRatchetHeader> for RatchetHeader {
    type Error = String;

    fn try_from(raw: RawRatchetHeader) -> Result<Self, Self::Error> {
        match raw.v {
            1 => Ok(Self::Symmetric { i: raw.i }),
            2 => {
                let dh = raw.dh.ok_or_else(|| "v2 ratchet header without dh".to_string())?;
                Ok(Self::Dh { i: raw.i, dh, pn: raw.pn })
            }
            v => Err(format!("unsupported ratchet header version {v}")),
        }
    }
}

impl From<RatchetHeader> for RawRatchetHeader {
    fn from(h: RatchetHeader) -> Self {
        match h {
            RatchetHeader::Symmetric { i } => Self { v: 1, i, dh: None, pn: None },
            RatchetHeader::Dh { i, dh, pn } => Self { v: 2, i, dh: Some(dh), pn },
        }
    }
}

/// Which key schedule produced (or must decrypt) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTier {
    Dh,
    Symmetric,
    Legacy,
}

impl KeyTier {
    pub fn of(header: Option<&RatchetHeader>) -> Self {
        match header {
            Some(RatchetHeader::Dh { .. }) => Self::Dh,
            Some(RatchetHeader::Symmetric { .. }) => Self::Symmetric,
            None => Self::Legacy,
        }
    }
}

// ── Chains ───────────────────────────────────────────────────────────────────

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct Chain {
    key: Key32,
    index: u64,
}

impl Chain {
    fn new(key: Key32) -> Self {
        Self { key, index: 0 }
    }

    /// One-way step: returns the key for `self.index`, then moves past it.
    fn advance(&mut self) -> Result<MessageKey, CryptoError> {
        let (next, mk) = kdf::chain_step(&self.key)?;
        self.key = next;
        self.index += 1;
        Ok(Zeroizing::new(mk))
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct SymmetricRatchet {
    send: Chain,
    recv: Chain,
}

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct DhRatchet {
    root_key: Key32,
    local_secret: Key32,
    #[zeroize(skip)]
    local_pub: PublicKeyBytes,
    #[zeroize(skip)]
    remote: Option<PublicKeyBytes>,
    send: Option<Chain>,
    recv: Option<Chain>,
    previous_counter: u64,
    needs_send_step: bool,
    sends_since_step: u64,
}

impl DhRatchet {
    fn can_send(&self) -> bool {
        self.remote.is_some() && (self.send.is_some() || self.needs_send_step)
    }

    fn next_send_key(&mut self) -> Result<(RatchetHeader, MessageKey), CryptoError> {
        if self.needs_send_step || self.send.is_none() || self.sends_since_step >= DH_ROTATION_INTERVAL {
            self.send_step()?;
        }
        let chain = self
            .send
            .as_mut()
            .ok_or(CryptoError::RatchetNotReady("no sending chain"))?;
        let i = chain.index;
        let mk = chain.advance()?;
        self.sends_since_step += 1;
        let header = RatchetHeader::Dh {
            i,
            dh: self.local_pub.clone(),
            pn: Some(self.previous_counter),
        };
        Ok((header, mk))
    }

    /// Generate a fresh local key and derive a new sending chain against the
    /// last known remote key.
    fn send_step(&mut self) -> Result<(), CryptoError> {
        let remote = self
            .remote
            .clone()
            .ok_or(CryptoError::RatchetNotReady("remote DH key unknown"))?;
        let fresh = DhKeyPair::generate();
        let (rk, ck) = kdf::ratchet_keys(&self.root_key, &fresh.diffie_hellman(&remote))?;
        self.previous_counter = self.send.as_ref().map(|c| c.index).unwrap_or(0);
        self.root_key = rk;
        self.send = Some(Chain::new(ck));
        self.local_secret = *fresh.secret_bytes();
        self.local_pub = fresh.public.clone();
        self.needs_send_step = false;
        self.sends_since_step = 0;
        debug!(pn = self.previous_counter, "dh ratchet sending step");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SkipId {
    Symmetric(u64),
    Dh(PublicKeyBytes, u64),
}

// ── Conversation ratchet ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatchetMode {
    Symmetric,
    Dh,
}

/// Ratchet state for one conversation as seen from one local device towards
/// one remote device. Stored vault-encrypted between sessions.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConversationRatchet {
    local_device_id: String,
    remote_device_id: String,
    symmetric: SymmetricRatchet,
    dh_seed: Key32,
    dh: Option<DhRatchet>,
    legacy_key: Option<Key32>,
    messages_sent: u64,
    #[serde(skip)]
    skipped: VecDeque<(SkipId, Key32)>,
}

impl Drop for ConversationRatchet {
    fn drop(&mut self) {
        self.dh_seed.zeroize();
        if let Some(k) = self.legacy_key.as_mut() {
            k.zeroize();
        }
        for (_, mk) in self.skipped.iter_mut() {
            mk.zeroize();
        }
    }
}

impl std::fmt::Debug for ConversationRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationRatchet")
            .field("local_device_id", &self.local_device_id)
            .field("remote_device_id", &self.remote_device_id)
            .field("mode", &self.mode())
            .field("messages_sent", &self.messages_sent)
            .finish()
    }
}

/// Result of a non-mutating receive.
pub enum ReceiveOutcome {
    Ready(PendingReceive),
    /// The key is further ahead than the skip window allows, or the DH tier is
    /// not bootstrapped yet. Retry once more of the chain is known.
    Deferred,
}

/// A derived message key plus the state to adopt once the envelope it opens
/// has authenticated.
pub struct PendingReceive {
    pub key: MessageKey,
    pub tier: KeyTier,
    next: Option<Box<ConversationRatchet>>,
}

impl ConversationRatchet {
    /// Fresh symmetric-only state from the conversation base key.
    ///
    /// Each author's chain starts at `H(H(base) || author_device_id)`, so the
    /// two directions never share message keys.
    pub fn new(local_device_id: &str, remote_device_id: &str, base_key: &Key32) -> Self {
        let seed = Zeroizing::new(hash::hash(base_key));
        let send = hash::derive(domain::SYMMETRIC_CHAIN, &[&seed[..], local_device_id.as_bytes()]);
        let recv = hash::derive(domain::SYMMETRIC_CHAIN, &[&seed[..], remote_device_id.as_bytes()]);
        Self {
            local_device_id: local_device_id.to_string(),
            remote_device_id: remote_device_id.to_string(),
            symmetric: SymmetricRatchet {
                send: Chain::new(send),
                recv: Chain::new(recv),
            },
            dh_seed: hash::derive(domain::DH_ROOT, &[&base_key[..]]),
            dh: None,
            legacy_key: None,
            messages_sent: 0,
            skipped: VecDeque::new(),
        }
    }

    /// Attach the static key used by conversations that predate ratchets.
    pub fn with_legacy_key(mut self, key: Key32) -> Self {
        self.legacy_key = Some(key);
        self
    }

    pub fn mode(&self) -> RatchetMode {
        match &self.dh {
            Some(dh) if dh.can_send() || dh.recv.is_some() => RatchetMode::Dh,
            _ => RatchetMode::Symmetric,
        }
    }

    pub fn remote_device_id(&self) -> &str {
        &self.remote_device_id
    }

    /// Total messages keyed for sending across all tiers.
    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    /// True once this side can key outgoing messages with the DH tier.
    pub fn dh_can_send(&self) -> bool {
        self.dh.as_ref().map(DhRatchet::can_send).unwrap_or(false)
    }

    /// Bootstrap the DH tier from both devices' advertised DH keys.
    ///
    /// Both sides compute the same initial root from `X25519(local, remote)`.
    /// The side with the lower public key steps first; the other side keeps
    /// using the symmetric tier until the first v2 message arrives.
    /// Returns `false` when the DH tier was already bootstrapped.
    pub fn enable_dh(&mut self, local: &DhKeyPair, remote: &PublicKeyBytes) -> Result<bool, CryptoError> {
        if self.dh.is_some() {
            return Ok(false);
        }
        if &local.public == remote {
            return Err(CryptoError::InvalidKey("remote DH key equals local key".into()));
        }
        let root = hash::keyed_hash(&self.dh_seed, &local.diffie_hellman(remote));
        let initiator = local.public < *remote;
        self.dh = Some(DhRatchet {
            root_key: root,
            local_secret: *local.secret_bytes(),
            local_pub: local.public.clone(),
            remote: initiator.then(|| remote.clone()),
            send: None,
            recv: None,
            previous_counter: 0,
            needs_send_step: initiator,
            sends_since_step: 0,
        });
        debug!(
            conv_peer = %self.remote_device_id,
            initiator,
            "dh ratchet bootstrapped"
        );
        Ok(true)
    }

    // ── Send ─────────────────────────────────────────────────────────────

    /// Derive the key for the next outgoing message. Never returns the same
    /// key twice.
    pub fn next_send_key(&mut self) -> Result<(RatchetHeader, MessageKey), CryptoError> {
        self.messages_sent += 1;
        if let Some(dh) = self.dh.as_mut() {
            if dh.can_send() {
                return dh.next_send_key();
            }
        }
        let i = self.symmetric.send.index;
        let mk = self.symmetric.send.advance()?;
        Ok((RatchetHeader::Symmetric { i }, mk))
    }

    // ── Receive ──────────────────────────────────────────────────────────

    /// Derive the key for an incoming message without touching `self`.
    pub fn receive(&self, header: Option<&RatchetHeader>) -> Result<ReceiveOutcome, CryptoError> {
        let tier = KeyTier::of(header);
        let mut next = self.clone();
        let key = match header {
            None => {
                let key = self
                    .legacy_key
                    .ok_or(CryptoError::RatchetNotReady("no legacy key for conversation"))?;
                return Ok(ReceiveOutcome::Ready(PendingReceive {
                    key: Zeroizing::new(key),
                    tier,
                    next: None,
                }));
            }
            Some(RatchetHeader::Symmetric { i }) => next.receive_symmetric(*i)?,
            Some(RatchetHeader::Dh { i, dh, pn }) => next.receive_dh(*i, dh, *pn)?,
        };
        Ok(match key {
            Some(key) => ReceiveOutcome::Ready(PendingReceive {
                key,
                tier,
                next: Some(Box::new(next)),
            }),
            None => ReceiveOutcome::Deferred,
        })
    }

    /// Adopt the state computed by [`Self::receive`]. Call only after the
    /// envelope authenticated under `pending.key`.
    pub fn commit(&mut self, pending: PendingReceive) {
        if let Some(next) = pending.next {
            *self = *next;
        }
    }

    fn receive_symmetric(&mut self, i: u64) -> Result<Option<MessageKey>, CryptoError> {
        if let Some(mk) = self.take_skipped(&SkipId::Symmetric(i)) {
            return Ok(Some(mk));
        }
        let chain = &mut self.symmetric.recv;
        if i < chain.index {
            return Err(CryptoError::KeyConsumed(i));
        }
        if i - chain.index > MAX_SKIP {
            return Ok(None);
        }
        let mut walked = Vec::new();
        while chain.index < i {
            let idx = chain.index;
            let mk = chain.advance()?;
            walked.push((SkipId::Symmetric(idx), *mk));
        }
        let mk = chain.advance()?;
        for (id, key) in walked {
            self.remember_skipped(id, key);
        }
        Ok(Some(mk))
    }

    fn receive_dh(
        &mut self,
        i: u64,
        dh: &PublicKeyBytes,
        pn: Option<u64>,
    ) -> Result<Option<MessageKey>, CryptoError> {
        if self.dh.is_none() {
            return Ok(None);
        }
        if let Some(mk) = self.take_skipped(&SkipId::Dh(dh.clone(), i)) {
            return Ok(Some(mk));
        }
        let mut walked = Vec::new();
        let Some(state) = self.dh.as_mut() else {
            return Ok(None);
        };

        if state.remote.as_ref() != Some(dh) {
            // Close out the chain of the previous remote key up to `pn`.
            if let (Some(old_remote), Some(chain), Some(pn)) =
                (state.remote.clone(), state.recv.as_mut(), pn)
            {
                if pn > chain.index {
                    if pn - chain.index > MAX_SKIP {
                        return Ok(None);
                    }
                    while chain.index < pn {
                        let idx = chain.index;
                        let mk = chain.advance()?;
                        walked.push((SkipId::Dh(old_remote.clone(), idx), *mk));
                    }
                }
            }
            let local = DhKeyPair::from_bytes(&state.local_secret)?;
            let (rk, ck) = kdf::ratchet_keys(&state.root_key, &local.diffie_hellman(dh))?;
            state.root_key = rk;
            state.recv = Some(Chain::new(ck));
            state.remote = Some(dh.clone());
            state.needs_send_step = true;
        }

        let chain = state
            .recv
            .as_mut()
            .ok_or(CryptoError::RatchetNotReady("no receiving chain"))?;
        if i < chain.index {
            return Err(CryptoError::KeyConsumed(i));
        }
        if i - chain.index > MAX_SKIP {
            return Ok(None);
        }
        while chain.index < i {
            let idx = chain.index;
            let mk = chain.advance()?;
            walked.push((SkipId::Dh(dh.clone(), idx), *mk));
        }
        let mk = chain.advance()?;
        for (id, key) in walked {
            self.remember_skipped(id, key);
        }
        Ok(Some(mk))
    }

    fn take_skipped(&mut self, id: &SkipId) -> Option<MessageKey> {
        let pos = self.skipped.iter().position(|(k, _)| k == id)?;
        let (_, mut key) = self.skipped.remove(pos)?;
        let out = Zeroizing::new(key);
        key.zeroize();
        Some(out)
    }

    fn remember_skipped(&mut self, id: SkipId, key: Key32) {
        self.skipped.push_back((id, key));
        while self.skipped.len() > SKIPPED_CACHE_LIMIT {
            if let Some((_, mut evicted)) = self.skipped.pop_front() {
                evicted.zeroize();
            }
        }
    }
}
