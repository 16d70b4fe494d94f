//! Transport selection, privacy policy and the fail-over ladder.
//!
//! All three are pure functions of the configuration and route signals so
//! the router's decisions can be tested without any I/O.

use nkc_store::models::RoutingHints;

use crate::config::{NetworkConfig, NetworkMode, TransportKind};
use crate::error::TransportError;
use crate::health::RouteHealth;

/// Pick the first transport to try for one destination.
pub fn select_transport(
    config: &NetworkConfig,
    routing: &RoutingHints,
    health: &dyn RouteHealth,
    device_id: &str,
) -> TransportKind {
    if config.onion_only() {
        return TransportKind::OnionRouter;
    }
    match config.mode {
        NetworkMode::DirectP2P => {
            if routing.direct_addr.is_some() && health.is_healthy(TransportKind::DirectP2P, device_id) {
                TransportKind::DirectP2P
            } else if routing.onion_addr.is_some() && health.is_healthy(TransportKind::OnionRouter, device_id) {
                TransportKind::OnionRouter
            } else {
                TransportKind::SelfOnion
            }
        }
        NetworkMode::SelfOnion => {
            if health.is_healthy(TransportKind::SelfOnion, device_id) {
                TransportKind::SelfOnion
            } else {
                TransportKind::OnionRouter
            }
        }
        NetworkMode::OnionRouter => TransportKind::OnionRouter,
    }
}

/// Enforced before every attempt, whatever selection returned.
pub fn check_policy(config: &NetworkConfig, kind: TransportKind) -> Result<(), TransportError> {
    if kind == TransportKind::OnionRouter || !config.onion_only() {
        return Ok(());
    }
    let reason = if config.mode == NetworkMode::OnionRouter {
        "onion-router mode is active"
    } else {
        "onion routing is required"
    };
    Err(TransportError::Policy { kind, reason })
}

/// `first` followed by its fallbacks, in attempt order.
pub fn failover_ladder(config: &NetworkConfig, first: TransportKind) -> Vec<TransportKind> {
    match first {
        TransportKind::DirectP2P => vec![
            TransportKind::DirectP2P,
            TransportKind::OnionRouter,
            TransportKind::SelfOnion,
        ],
        TransportKind::SelfOnion if config.mode == NetworkMode::SelfOnion => {
            vec![TransportKind::SelfOnion, TransportKind::OnionRouter]
        }
        TransportKind::SelfOnion => vec![TransportKind::SelfOnion],
        TransportKind::OnionRouter => vec![TransportKind::OnionRouter],
    }
}
