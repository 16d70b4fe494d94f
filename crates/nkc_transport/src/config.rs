//! Network configuration and retry policy.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    #[serde(rename = "directP2P")]
    DirectP2P,
    /// Internal multi-hop relay.
    #[serde(rename = "selfOnion")]
    SelfOnion,
    /// External anonymity network reached through a local SOCKS proxy.
    #[serde(rename = "onionRouter")]
    OnionRouter,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DirectP2P => "directP2P",
            Self::SelfOnion => "selfOnion",
            Self::OnionRouter => "onionRouter",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The preferred route. Onion-router mode forbids every other kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NetworkMode {
    #[default]
    #[serde(rename = "directP2P")]
    DirectP2P,
    SelfOnion,
    OnionRouter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnionProvider {
    #[default]
    Tor,
    Lokinet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    /// Refuse every non-onion-router transport regardless of mode.
    pub onion_required: bool,
    pub onion_provider: OnionProvider,
    pub attempt_timeout_ms: u64,
    /// Upper bound for one full fail-over ladder.
    pub send_deadline_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mode: NetworkMode::default(),
            onion_required: false,
            onion_provider: OnionProvider::default(),
            attempt_timeout_ms: 10_000,
            send_deadline_ms: 30_000,
        }
    }
}

impl NetworkConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn send_deadline(&self) -> Duration {
        Duration::from_millis(self.send_deadline_ms)
    }

    /// True when only the onion router may carry traffic.
    pub fn onion_only(&self) -> bool {
        self.onion_required || self.mode == NetworkMode::OnionRouter
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::for_mode(self.mode)
    }
}

/// Outbox backoff, per network mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Delivery rounds before a record is purged as failed.
    pub max_attempts: u32,
    /// Lifetime of an outbox record.
    pub ttl: Duration,
}

impl RetryPolicy {
    pub fn for_mode(mode: NetworkMode) -> Self {
        match mode {
            NetworkMode::DirectP2P => Self {
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(5 * 60),
                factor: 2.0,
                max_attempts: 12,
                ttl: Duration::from_secs(3 * 24 * 3600),
            },
            // Circuits take longer to build and fail more transiently.
            NetworkMode::SelfOnion | NetworkMode::OnionRouter => Self {
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(15 * 60),
                factor: 1.5,
                max_attempts: 20,
                ttl: Duration::from_secs(7 * 24 * 3600),
            },
        }
    }

    /// Wait before retry number `attempts` (1-based).
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}
