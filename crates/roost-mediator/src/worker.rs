//! Background delivery worker.
//!
//! Periodic sweep over the durable queue: claim due messages, attempt
//! delivery through the registry, mark delivered or reschedule. The sweep
//! never blocks the inbound route path; it only ever touches messages it
//! has claimed, so it cannot collide with a connect-triggered drain.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{MediatorConfig, RetryPolicy};
use crate::metrics;
use crate::queue::{DeliveryQueue, MessageStatus};
use crate::registry::ConnectionRegistry;

/// Periodic due-message sweeper.
///
/// Dropping the returned task or cancelling the token stops the worker
/// after the batch in flight completes; no new batch is started.
pub struct DeliveryWorker {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<dyn DeliveryQueue>,
    retry: RetryPolicy,
    sweep_interval: Duration,
    batch_limit: usize,
    shutdown: CancellationToken,
}

impl DeliveryWorker {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue: Arc<dyn DeliveryQueue>,
        config: &MediatorConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            queue,
            retry: config.retry,
            sweep_interval: config.sweep_interval,
            batch_limit: config.sweep_batch_limit,
            shutdown,
        }
    }

    /// Run the sweep loop until cancelled.
    pub async fn run(self) {
        info!(
            interval_secs = self.sweep_interval.as_secs(),
            batch_limit = self.batch_limit,
            "Delivery worker started"
        );

        let mut ticker = interval(self.sweep_interval);
        // A late tick means the previous sweep ran long; sweeping twice
        // back-to-back would claim nothing anyway.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval() fires immediately; the first real sweep waits.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Delivery worker shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Sweep cycle failed");
                    }
                }
            }
        }
    }

    /// One sweep cycle: claim due messages and attempt each
    /// independently. One message's failure never blocks the rest of the
    /// batch.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> crate::error::Result<usize> {
        let claimed = self.queue.claim_due(self.batch_limit).await?;
        if claimed.is_empty() {
            return Ok(0);
        }
        debug!(claimed = claimed.len(), "Sweeping due messages");

        let mut delivered = 0;
        for message in claimed {
            if self.registry.is_active(&message.recipient)
                && self
                    .registry
                    .send(&message.recipient, message.envelope.clone())
                    .is_sent()
            {
                // A store error here leaves the row claimed for the next
                // restart; the rest of the batch still runs.
                match self.queue.mark_delivered(&message.queue_id).await {
                    Ok(()) => {
                        metrics::record_message_delivered();
                        delivered += 1;
                    }
                    Err(e) => {
                        error!(queue_id = %message.queue_id, error = %e, "Failed to record delivery");
                    }
                }
                continue;
            }

            match self.queue.mark_retry(&message.queue_id, &self.retry).await {
                Ok(MessageStatus::Failed) => {
                    metrics::record_message_retried();
                    metrics::record_message_failed();
                    warn!(
                        queue_id = %message.queue_id,
                        recipient = %message.recipient,
                        attempts = message.attempts + 1,
                        "Message failed terminally"
                    );
                }
                Ok(_) => {
                    metrics::record_message_retried();
                    debug!(queue_id = %message.queue_id, "Delivery rescheduled");
                }
                Err(e) => {
                    error!(queue_id = %message.queue_id, error = %e, "Failed to record retry");
                }
            }
        }

        if delivered > 0 {
            info!(delivered, "Sweep delivered messages");
        }
        Ok(delivered)
    }
}
