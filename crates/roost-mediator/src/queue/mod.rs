//! Durable delivery queue.
//!
//! Messages accepted for an offline recipient live here until delivered or
//! terminally failed. The queue is the only transactional resource in the
//! core: the router, the connect-triggered drain, and the delivery worker
//! all claim messages through it, and the claim is what makes a delivery
//! attempt exclusive.

mod storage;

pub use storage::{LibSqlDeliveryQueue, QUEUE_SCHEMA};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::config::RetryPolicy;
use crate::envelope::Envelope;
use crate::error::{MediatorError, Result};

/// Delivery status of a queued message.
///
/// `Delivered` and `Failed` are terminal; only administrative requeue moves
/// a message out of `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Delivered,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = MediatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(MediatorError::Serialization(format!(
                "unknown message status: {other}"
            ))),
        }
    }
}

/// A message held for later delivery.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessage {
    /// Queue row id (UUID v7, time-sortable). Distinct from the envelope id.
    pub queue_id: String,
    /// Recipient DID the row is keyed by.
    pub recipient: String,
    /// The original envelope, body untouched.
    pub envelope: Envelope,
    /// Delivery attempts made so far.
    pub attempts: u32,
    pub status: MessageStatus,
    /// Earliest time the next attempt may run; None means due now.
    pub next_retry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Counts per status, for the stats/admin surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.delivered + self.failed
    }
}

/// Storage contract for the delivery queue. Any durable keyed store works;
/// the shipped implementation is libSQL.
///
/// Claim semantics: `claim_due` and `claim_next_for` mark returned messages
/// in-flight so no two callers ever attempt the same message concurrently.
/// A claim is released by `mark_delivered`, `mark_retry`, or `release`.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Persist a message as pending. Durable before this returns. If an
    /// envelope with the same id is already pending for the same recipient
    /// the existing queue id is returned instead of a second row.
    async fn enqueue(&self, envelope: &Envelope) -> Result<String>;

    /// Claim up to `limit` due messages (pending, unclaimed, backoff
    /// elapsed), oldest first. Sole admission point for sweep attempts.
    async fn claim_due(&self, limit: usize) -> Result<Vec<QueuedMessage>>;

    /// Claim the oldest pending, unclaimed message for one recipient,
    /// ignoring backoff (a live channel is a fresh opportunity).
    async fn claim_next_for(&self, recipient: &str) -> Result<Option<QueuedMessage>>;

    /// Drop a claim without recording an attempt.
    async fn release(&self, queue_id: &str) -> Result<()>;

    /// Terminal success. Idempotent for a known id.
    async fn mark_delivered(&self, queue_id: &str) -> Result<()>;

    /// Record a failed attempt: increments attempts and either reschedules
    /// (linear backoff) or fails the message terminally once the retry
    /// budget is spent. Returns the resulting status.
    async fn mark_retry(&self, queue_id: &str, policy: &RetryPolicy) -> Result<MessageStatus>;

    /// Pending messages for one recipient, oldest first.
    async fn pending_for(&self, recipient: &str) -> Result<Vec<QueuedMessage>>;

    /// Number of pending messages for one recipient (claimed ones included).
    async fn pending_count(&self, recipient: &str) -> Result<u64>;

    /// Administrative resurrection of a failed message: back to pending
    /// with a fresh attempt budget.
    async fn requeue_failed(&self, queue_id: &str) -> Result<()>;

    /// Fetch one message by queue id.
    async fn get(&self, queue_id: &str) -> Result<Option<QueuedMessage>>;

    /// Counts per status across all recipients.
    async fn stats(&self) -> Result<QueueStats>;

    /// Counts per status for one recipient.
    async fn stats_for(&self, recipient: &str) -> Result<QueueStats>;

    /// Newest-first page across all statuses, for the admin surface.
    async fn history(&self, limit: usize, offset: usize) -> Result<Vec<QueuedMessage>>;
}
