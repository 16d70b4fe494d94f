//! Background re-delivery of the outbox.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nkc_store::models::{OutboxRecord, OutboxStatus};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::router::{Router, SendOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Acknowledged records removed from the outbox.
    pub cleared: usize,
    /// Records dropped as terminally failed (expired or over the retry
    /// ceiling).
    pub purged: Vec<String>,
}

impl SchedulerReport {
    pub fn is_idle(&self) -> bool {
        self == &Self::default()
    }
}

pub struct DeliveryScheduler {
    router: Arc<Router>,
}

impl DeliveryScheduler {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    pub async fn outbox(&self) -> Result<Vec<OutboxRecord>, TransportError> {
        Ok(self.router.store().list_outbox().await?)
    }

    /// Mark a record delivered on a transport-level ack. Returns `false` when
    /// the record is unknown or was already acknowledged.
    pub async fn acknowledge(&self, message_id: &str) -> Result<bool, TransportError> {
        self.router.acknowledge(message_id).await
    }

    /// One pass over the outbox: clear acknowledged records, purge terminal
    /// ones and retry whatever is due. A record whose round fails with an
    /// error counts as failed; the pass goes on with the next record.
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SchedulerReport, TransportError> {
        let store = self.router.store();
        let policy = self.router.config().retry_policy();
        let mut report = SchedulerReport::default();

        for record in store.list_outbox().await? {
            if record.status == OutboxStatus::Delivered {
                store.delete_outbox(&record.id).await?;
                report.cleared += 1;
                continue;
            }
            if record.expires_at <= now || record.attempts >= policy.max_attempts {
                warn!(
                    id = %record.id,
                    attempts = record.attempts,
                    last_error = ?record.last_error,
                    "outbox record terminally failed"
                );
                store.delete_outbox(&record.id).await?;
                report.purged.push(record.id);
                continue;
            }
            if record.next_attempt_at > now {
                continue;
            }
            if cancel.is_cancelled() {
                break;
            }
            report.attempted += 1;
            let id = record.id.clone();
            match self.router.deliver(record, cancel.clone()).await {
                Ok(SendOutcome::Delivered { .. }) => report.delivered += 1,
                Ok(SendOutcome::Failed { .. }) => report.failed += 1,
                Err(err) => {
                    warn!(id = %id, error = %err, "delivery round errored");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.run_once(Utc::now(), &cancel).await {
                    Ok(report) if report.is_idle() => {}
                    Ok(report) => debug!(?report, "delivery round"),
                    Err(err) => warn!(error = %err, "delivery round failed"),
                }
            }
            info!("delivery scheduler stopped");
        })
    }
}
