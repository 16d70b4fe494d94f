//! The transport router: outbox first, then the fail-over ladder.
//!
//! Every send writes its `OutboxRecord` before the first attempt. A delivery
//! round walks the ladder rung by rung. Each rung is checked against the
//! privacy policy, bounded by the per-attempt timeout and the round deadline,
//! and recorded before the next rung starts. When the round ends, its
//! cancellation token fires so no losing attempt keeps running.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nkc_store::models::{OutboxRecord, OutboxStatus, RoutingHints};
use nkc_store::EncryptedStore;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{NetworkConfig, TransportKind};
use crate::error::TransportError;
use crate::health::RouteHealth;
use crate::policy::{check_policy, failover_ladder, select_transport};
use crate::transport::{AttemptOutcome, AttemptRecord, OutgoingMessage, Transport};

const ATTEMPT_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub id: String,
    pub conv_id: String,
    pub to_device_id: String,
    pub ciphertext: String,
    pub routing: RoutingHints,
}

impl SendRequest {
    pub fn new(conv_id: &str, to_device_id: &str, ciphertext: String, routing: RoutingHints) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conv_id: conv_id.to_string(),
            to_device_id: to_device_id.to_string(),
            ciphertext,
            routing,
        }
    }

    /// Use an existing id (usually the event id) so acknowledgements match.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered {
        message_id: String,
        transport: TransportKind,
        attempts: Vec<AttemptRecord>,
    },
    /// Every rung failed. The outbox record stays for the scheduler.
    Failed {
        message_id: String,
        last_transport: TransportKind,
        error: String,
        attempts: Vec<AttemptRecord>,
    },
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::Delivered { message_id, .. } | Self::Failed { message_id, .. } => message_id,
        }
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Self::Delivered { attempts, .. } | Self::Failed { attempts, .. } => attempts,
        }
    }
}

pub struct Router {
    store: EncryptedStore,
    config: RwLock<NetworkConfig>,
    health: Arc<dyn RouteHealth>,
    transports: HashMap<TransportKind, Arc<dyn Transport>>,
    attempt_log: Mutex<VecDeque<AttemptRecord>>,
    /// Serializes acknowledgements against the end-of-round write-back.
    outbox_writes: tokio::sync::Mutex<()>,
}

impl Router {
    pub fn new(store: EncryptedStore, config: NetworkConfig, health: Arc<dyn RouteHealth>) -> Self {
        Self {
            store,
            config: RwLock::new(config),
            health,
            transports: HashMap::new(),
            attempt_log: Mutex::new(VecDeque::with_capacity(ATTEMPT_LOG_CAPACITY)),
            outbox_writes: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.insert(transport.kind(), transport);
        self
    }

    pub fn config(&self) -> NetworkConfig {
        self.config.read().clone()
    }

    pub fn set_config(&self, config: NetworkConfig) {
        info!(mode = ?config.mode, onion_required = config.onion_required, "network config updated");
        *self.config.write() = config;
    }

    pub fn store(&self) -> &EncryptedStore {
        &self.store
    }

    pub fn health(&self) -> &Arc<dyn RouteHealth> {
        &self.health
    }

    /// Most recent attempts, oldest first.
    pub fn recent_attempts(&self) -> Vec<AttemptRecord> {
        self.attempt_log.lock().iter().cloned().collect()
    }

    /// Persist the ciphertext to the outbox, then run one delivery round.
    pub async fn send_ciphertext(
        &self,
        req: SendRequest,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, TransportError> {
        let now = Utc::now();
        let policy = self.config().retry_policy();
        let record = OutboxRecord {
            id: req.id,
            conv_id: req.conv_id,
            to_device_id: req.to_device_id,
            ciphertext: req.ciphertext,
            routing: req.routing,
            attempts: 0,
            status: OutboxStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: now + to_chrono(policy.ttl),
            next_attempt_at: now,
            last_error: None,
            last_transport: None,
        };
        self.store.save_outbox(&record).await?;
        debug!(id = %record.id, conv_id = %record.conv_id, to = %record.to_device_id, "outbox record written");
        self.deliver(record, cancel).await
    }

    /// One delivery round for an existing outbox record.
    pub async fn deliver(
        &self,
        mut record: OutboxRecord,
        cancel: CancellationToken,
    ) -> Result<SendOutcome, TransportError> {
        let config = self.config();
        let msg = OutgoingMessage::from(&record);
        let first = select_transport(&config, &msg.routing, self.health.as_ref(), &msg.to_device_id);
        let deadline = Instant::now() + config.send_deadline();
        let round = cancel.child_token();

        let mut attempts = Vec::new();
        let mut delivered = None;
        let mut last = first;
        let mut last_error = String::new();
        for kind in failover_ladder(&config, first) {
            last = kind;
            let attempt = self.run_attempt(kind, &msg, &config, deadline, &round).await;
            attempts.push(attempt.0);
            match attempt.1 {
                Ok(()) => {
                    delivered = Some(kind);
                    break;
                }
                Err(e) => {
                    let stop = matches!(e, TransportError::Cancelled | TransportError::DeadlineExceeded);
                    last_error = e.to_string();
                    if stop {
                        break;
                    }
                }
            }
        }
        round.cancel();

        let now = Utc::now();
        record.attempts += 1;
        record.updated_at = now;
        record.last_transport = Some(last.as_str().to_string());
        match delivered {
            Some(transport) => {
                record.status = OutboxStatus::Delivered;
                record.last_error = None;
                self.store.save_outbox(&record).await?;
                info!(id = %record.id, transport = %transport, rounds = record.attempts, "message delivered");
                Ok(SendOutcome::Delivered {
                    message_id: record.id,
                    transport,
                    attempts,
                })
            }
            None => {
                let _writes = self.outbox_writes.lock().await;
                let acked = matches!(
                    self.store.load_outbox(&record.id).await?,
                    Some(stored) if stored.status == OutboxStatus::Delivered
                );
                if acked {
                    debug!(id = %record.id, last_transport = %last, "acknowledged during the round; status kept");
                } else {
                    let backoff = config.retry_policy().delay_for(record.attempts);
                    record.status = OutboxStatus::Failed;
                    record.last_error = Some(last_error.clone());
                    record.next_attempt_at = now + to_chrono(backoff);
                    self.store.save_outbox(&record).await?;
                    warn!(
                        id = %record.id,
                        last_transport = %last,
                        rounds = record.attempts,
                        retry_in_secs = backoff.as_secs(),
                        "all transports failed"
                    );
                }
                Ok(SendOutcome::Failed {
                    message_id: record.id,
                    last_transport: last,
                    error: last_error,
                    attempts,
                })
            }
        }
    }

    /// Mark a record delivered on a transport-level ack. Returns `false` when
    /// the record is unknown or was already acknowledged.
    pub async fn acknowledge(&self, message_id: &str) -> Result<bool, TransportError> {
        let _writes = self.outbox_writes.lock().await;
        let Some(mut record) = self.store.load_outbox(message_id).await? else {
            debug!(id = message_id, "ack for unknown outbox record");
            return Ok(false);
        };
        if record.status == OutboxStatus::Delivered {
            return Ok(false);
        }
        record.status = OutboxStatus::Delivered;
        record.updated_at = Utc::now();
        self.store.save_outbox(&record).await?;
        info!(id = message_id, "outbox record acknowledged");
        Ok(true)
    }

    /// A single attempt on one transport, outside the ladder. Policy is
    /// enforced exactly as in a delivery round.
    pub async fn try_transport(
        &self,
        kind: TransportKind,
        msg: &OutgoingMessage,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let config = self.config();
        let deadline = Instant::now() + config.send_deadline();
        let round = cancel.child_token();
        let (_, result) = self.run_attempt(kind, msg, &config, deadline, &round).await;
        round.cancel();
        result
    }

    async fn run_attempt(
        &self,
        kind: TransportKind,
        msg: &OutgoingMessage,
        config: &NetworkConfig,
        deadline: Instant,
        round: &CancellationToken,
    ) -> (AttemptRecord, Result<(), TransportError>) {
        let started_at = Utc::now();
        let started = Instant::now();
        let result = self.attempt(kind, msg, config, deadline, round).await;
        let record = AttemptRecord {
            message_id: msg.id.clone(),
            transport: kind,
            outcome: AttemptOutcome::from_result(&result),
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.observe(&record, &msg.to_device_id);
        (record, result)
    }

    async fn attempt(
        &self,
        kind: TransportKind,
        msg: &OutgoingMessage,
        config: &NetworkConfig,
        deadline: Instant,
        round: &CancellationToken,
    ) -> Result<(), TransportError> {
        check_policy(config, kind)?;
        let transport = self
            .transports
            .get(&kind)
            .ok_or(TransportError::Unavailable(kind))?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(TransportError::DeadlineExceeded);
        }
        let capped_by_deadline = remaining < config.attempt_timeout();
        let budget = remaining.min(config.attempt_timeout());

        let token = round.child_token();
        let result = tokio::select! {
            _ = round.cancelled() => Err(TransportError::Cancelled),
            r = tokio::time::timeout(budget, transport.send(msg, token.clone())) => match r {
                Ok(r) => r,
                Err(_) if capped_by_deadline => Err(TransportError::DeadlineExceeded),
                Err(_) => Err(TransportError::Timeout { kind }),
            },
        };
        if result.is_err() {
            token.cancel();
        }
        result
    }

    fn observe(&self, record: &AttemptRecord, device_id: &str) {
        match &record.outcome {
            AttemptOutcome::Sent => {
                self.health.record_success(record.transport, device_id);
                debug!(id = %record.message_id, transport = %record.transport, elapsed_ms = record.elapsed_ms, "attempt sent");
            }
            AttemptOutcome::PolicyDenied { reason } => {
                warn!(id = %record.message_id, transport = %record.transport, reason = %reason, "attempt refused by policy");
            }
            AttemptOutcome::Cancelled => {
                debug!(id = %record.message_id, transport = %record.transport, "attempt cancelled");
            }
            outcome => {
                self.health.record_failure(record.transport, device_id);
                warn!(id = %record.message_id, transport = %record.transport, ?outcome, elapsed_ms = record.elapsed_ms, "attempt failed");
            }
        }
        let mut log = self.attempt_log.lock();
        if log.len() == ATTEMPT_LOG_CAPACITY {
            log.pop_front();
        }
        log.push_back(record.clone());
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}
