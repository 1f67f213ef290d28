//! Message routing.
//!
//! The router is the decision engine between a live channel and the
//! durable queue: deliver now if the recipient is reachable and has no
//! backlog, otherwise enqueue. It also owns the push-on-connect drain.
//!
//! Per-recipient operations are serialized through a lock map so a fresh
//! `route` call can never overtake a drain in progress for the same
//! recipient. Correctness of concurrent delivery attempts comes from the
//! queue's claim machine, not from timing.

use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::RetryPolicy;
use crate::envelope::Envelope;
use crate::error::{MediatorError, Result};
use crate::metrics;
use crate::policy::MediationPolicy;
use crate::queue::{DeliveryQueue, MessageStatus};
use crate::registry::ConnectionRegistry;

/// What happened to a routed message.
///
/// Every outcome means the message was accepted: `Enqueued` is success
/// from the sender's point of view (at-least-once semantics), and only
/// `Dropped` carries a reason the caller may want to surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RouteOutcome {
    /// Handed to a live channel; never persisted as pending.
    Delivered,
    /// Stored durably for later delivery.
    Enqueued { queue_id: String },
    /// Not accepted: mediation denied or a per-recipient broadcast error.
    Dropped { reason: String },
}

/// Router over the registry, the queue, and (optionally) the mediation
/// policy gate.
pub struct Router {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<dyn DeliveryQueue>,
    /// Present only when mediation gating is enabled.
    gate: Option<Arc<MediationPolicy>>,
    retry: RetryPolicy,
    /// Per-recipient serialization for route vs drain.
    recipient_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Router {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue: Arc<dyn DeliveryQueue>,
        gate: Option<Arc<MediationPolicy>>,
        retry: RetryPolicy,
    ) -> Self {
        info!(gating = gate.is_some(), "Router initialized");
        Self {
            registry,
            queue,
            gate,
            retry,
            recipient_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, did: &str) -> Arc<Mutex<()>> {
        self.recipient_locks
            .entry(did.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Route one envelope: direct delivery if the recipient is live and
    /// has no pending backlog, durable enqueue otherwise.
    ///
    /// A recipient with backlog always enqueues, so the initial FIFO
    /// order is preserved until a drain empties the queue.
    #[instrument(skip(self, envelope), fields(message_id = %envelope.id, to = %envelope.to))]
    pub async fn route(&self, envelope: &Envelope) -> Result<RouteOutcome> {
        metrics::record_message_routed();

        let lock = self.lock_for(&envelope.to);
        let _guard = lock.lock().await;

        if let Some(gate) = &self.gate {
            if !gate.decide(&envelope.to).await?.is_granted() {
                warn!("Mediation not granted, dropping message");
                return Ok(RouteOutcome::Dropped {
                    reason: format!("mediation not granted for {}", envelope.to),
                });
            }
        }

        if self.registry.is_active(&envelope.to)
            && self.queue.pending_count(&envelope.to).await? == 0
        {
            if self.registry.send(&envelope.to, envelope.clone()).is_sent() {
                debug!("Delivered directly");
                metrics::record_message_delivered();
                return Ok(RouteOutcome::Delivered);
            }
            // Channel disappeared mid-send; fall through to enqueue.
            debug!("Direct send failed, falling back to enqueue");
        }

        let queue_id = self.queue.enqueue(envelope).await?;
        metrics::record_message_enqueued();
        debug!(queue_id = %queue_id, "Enqueued for later delivery");
        Ok(RouteOutcome::Enqueued { queue_id })
    }

    /// Fan out one envelope to many recipients.
    ///
    /// Each recipient gets a fresh envelope id and is routed
    /// independently; one recipient's failure never rolls back another's
    /// delivery. An empty recipient set is rejected before any state is
    /// created.
    #[instrument(skip(self, recipients, envelope), fields(message_id = %envelope.id, count = recipients.len()))]
    pub async fn broadcast(
        &self,
        recipients: &[String],
        envelope: &Envelope,
    ) -> Result<Vec<(String, RouteOutcome)>> {
        if recipients.is_empty() {
            return Err(MediatorError::EmptyRecipients);
        }
        metrics::record_broadcast();

        let mut outcomes = Vec::with_capacity(recipients.len());
        for did in recipients {
            let copy = envelope.for_recipient(did);
            let outcome = match self.route(&copy).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(did = %did, error = %e, "Broadcast recipient failed");
                    RouteOutcome::Dropped {
                        reason: e.to_string(),
                    }
                }
            };
            outcomes.push((did.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Push-on-connect: drain the recipient's pending backlog oldest
    /// first over its freshly live channel.
    ///
    /// Stops at the first failed send; the failed message is rescheduled
    /// and the rest stay pending for the next sweep or connect event.
    /// Returns the number of messages delivered.
    #[instrument(skip(self), fields(did = %did))]
    pub async fn on_connect(&self, did: &str) -> Result<usize> {
        let lock = self.lock_for(did);
        let _guard = lock.lock().await;

        let mut drained = 0;
        while let Some(message) = self.queue.claim_next_for(did).await? {
            if self
                .registry
                .send(did, message.envelope.clone())
                .is_sent()
            {
                self.queue.mark_delivered(&message.queue_id).await?;
                metrics::record_message_delivered();
                drained += 1;
                continue;
            }

            // Channel went away mid-drain; record the attempt and stop.
            let status = self.queue.mark_retry(&message.queue_id, &self.retry).await?;
            metrics::record_message_retried();
            if status == MessageStatus::Failed {
                metrics::record_message_failed();
            }
            debug!(queue_id = %message.queue_id, "Drain send failed, stopping");
            break;
        }

        if drained > 0 {
            info!(drained, "Drained pending backlog on connect");
        }
        Ok(drained)
    }
}
