//! nkc_transport - Moving wire envelopes between devices
//!
//! # Modules
//! - `config`    - transport kinds, network mode, retry policy
//! - `policy`    - pure selection, privacy policy check, fail-over ladder
//! - `router`    - outbox-first sending with per-attempt timeout, deadline
//!                 and cancellation
//! - `scheduler` - background re-delivery, acks, terminal purge
//! - `health`    - route-health signals
//! - `bridge`    - onion bridge status contract
//! - `tcp`       - direct TCP and SOCKS5 stream transports

pub mod bridge;
pub mod config;
pub mod error;
pub mod health;
pub mod policy;
pub mod router;
pub mod scheduler;
pub mod tcp;
pub mod transport;

pub use bridge::{BridgeState, BridgeStatus, ExternalProxyBridge, OnionBridge};
pub use config::{NetworkConfig, NetworkMode, OnionProvider, RetryPolicy, TransportKind};
pub use error::TransportError;
pub use health::{MemoryRouteHealth, RouteHealth};
pub use policy::{check_policy, failover_ladder, select_transport};
pub use router::{Router, SendOutcome, SendRequest};
pub use scheduler::{DeliveryScheduler, SchedulerReport};
pub use tcp::{DirectTcpTransport, InboundSink, Socks5Transport};
pub use transport::{AttemptOutcome, AttemptRecord, OutgoingMessage, Transport};
pub use tokio_util::sync::CancellationToken;
