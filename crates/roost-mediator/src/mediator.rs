//! Mediator facade.
//!
//! Composes the registry, the queue, the router, and the policy behind
//! the narrow interface transport adapters and the admin surface consume.
//! Inbound envelopes are validated, classified by [`dispatch`], and the
//! resulting [`Action`] is executed here.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::MediatorConfig;
use crate::dispatch::{dispatch, Action};
use crate::envelope::{kinds, Envelope};
use crate::error::Result;
use crate::metrics;
use crate::policy::{MediationGrant, MediationPolicy};
use crate::queue::{DeliveryQueue, QueueStats, QueuedMessage};
use crate::registry::{ConnectionInfo, ConnectionRegistry, ConnectionStore, OutboundMessage};
use crate::router::{RouteOutcome, Router};
use crate::worker::DeliveryWorker;

/// What the mediator did with an accepted inbound envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum InboundReceipt {
    /// Routed (directly or via the forward re-address) to its recipient.
    Routed { outcome: RouteOutcome },
    /// Mediation decided and a grant/deny reply issued.
    MediationDecided {
        requester: String,
        granted: bool,
        /// Whether the reply landed on a live channel.
        replied: bool,
    },
    /// Pickup status-request answered with the pending count.
    StatusReported {
        requester: String,
        pending: u64,
        replied: bool,
    },
    /// Pickup delivery-request drained the requester's backlog.
    PendingDelivered { requester: String, drained: usize },
}

/// The mediator core, composed and ready for a transport adapter.
pub struct Mediator {
    config: MediatorConfig,
    registry: Arc<ConnectionRegistry>,
    queue: Arc<dyn DeliveryQueue>,
    router: Arc<Router>,
    policy: Arc<MediationPolicy>,
    connections: Option<ConnectionStore>,
}

impl Mediator {
    /// Wire up the core. The mediation gate is handed to the router only
    /// when gating is enabled; otherwise every recipient is implicitly
    /// granted on the route path.
    pub fn new(
        config: MediatorConfig,
        queue: Arc<dyn DeliveryQueue>,
        policy: MediationPolicy,
        connections: Option<ConnectionStore>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let policy = Arc::new(policy);
        let gate = config
            .require_mediation_grant
            .then(|| Arc::clone(&policy));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            gate,
            config.retry,
        ));

        info!(
            gating = config.require_mediation_grant,
            default_grant_all = config.default_grant_all,
            "Mediator initialized"
        );

        Self {
            config,
            registry,
            queue,
            router,
            policy,
            connections,
        }
    }

    /// Build the background sweeper sharing this mediator's components.
    pub fn delivery_worker(&self, shutdown: CancellationToken) -> DeliveryWorker {
        DeliveryWorker::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.queue),
            &self.config,
            shutdown,
        )
    }

    /// Handle one inbound envelope: validate, classify, execute.
    ///
    /// Malformed envelopes are rejected here and never reach the queue.
    #[instrument(skip(self, envelope), fields(message_id = %envelope.id, message_type = %envelope.kind))]
    pub async fn handle_inbound(&self, envelope: Envelope) -> Result<InboundReceipt> {
        envelope.validate()?;

        match dispatch(&envelope)? {
            Action::Route => {
                let outcome = self.router.route(&envelope).await?;
                Ok(InboundReceipt::Routed { outcome })
            }
            Action::Forward { next } => {
                // Re-address the opaque payload to the wrapped recipient;
                // `next` is the only routing field read from the body.
                debug!(next = %next, "Unwrapping forward");
                let mut inner = envelope;
                inner.to = next;
                let outcome = self.router.route(&inner).await?;
                Ok(InboundReceipt::Routed { outcome })
            }
            Action::Mediate { requester } => self.process_mediation(&envelope, requester).await,
            Action::PickupStatus { requester } => {
                let pending = self.queue.pending_count(&requester).await?;
                let reply = Envelope::new(kinds::PICKUP_STATUS, &requester)
                    .with_body(json!({ "message_count": pending }))
                    .in_reply_to(&envelope.id);
                let replied = self.reply(&requester, reply);
                Ok(InboundReceipt::StatusReported {
                    requester,
                    pending,
                    replied,
                })
            }
            Action::PickupDelivery { requester } => {
                let drained = self.router.on_connect(&requester).await?;
                Ok(InboundReceipt::PendingDelivered { requester, drained })
            }
        }
    }

    async fn process_mediation(
        &self,
        request: &Envelope,
        requester: String,
    ) -> Result<InboundReceipt> {
        let decision = self.policy.decide(&requester).await?;
        let granted = decision.is_granted();

        let kind = if granted {
            kinds::MEDIATE_GRANT
        } else {
            kinds::MEDIATE_DENY
        };
        let reply = Envelope::new(kind, &requester).in_reply_to(&request.id);

        // Protocol replies go best-effort over the live channel; a grant
        // for an offline requester is queued so it is not lost, a denial
        // is not held on behalf of an agent we refuse to mediate for.
        let mut replied = self.reply(&requester, reply.clone());
        if !replied && granted {
            self.queue.enqueue(&reply).await?;
            replied = true;
        }

        if !granted {
            warn!(requester = %requester, "Mediation request denied");
        }
        Ok(InboundReceipt::MediationDecided {
            requester,
            granted,
            replied,
        })
    }

    fn reply(&self, did: &str, envelope: Envelope) -> bool {
        self.registry.send(did, envelope).is_sent()
    }

    /// Register a live channel for a recipient and drain its backlog
    /// (push-on-connect). Returns the number of messages drained.
    #[instrument(skip(self, sender), fields(did = %did))]
    pub async fn register_channel(
        &self,
        did: &str,
        sender: tokio::sync::mpsc::Sender<OutboundMessage>,
    ) -> Result<usize> {
        let was_active = self.registry.register(did, sender);
        if !was_active {
            metrics::increment_active_connections();
        }
        if let Some(store) = &self.connections {
            store.record_connected(did).await?;
        }
        self.router.on_connect(did).await
    }

    /// Tear down a recipient's channel. History is retained.
    #[instrument(skip(self), fields(did = %did))]
    pub async fn close_channel(&self, did: &str) -> Result<()> {
        if self.registry.unregister(did) {
            metrics::decrement_active_connections();
        }
        if let Some(store) = &self.connections {
            store.record_disconnected(did).await?;
        }
        Ok(())
    }

    /// Fan an envelope out to many recipients; see [`Router::broadcast`].
    pub async fn broadcast(
        &self,
        recipients: &[String],
        envelope: &Envelope,
    ) -> Result<Vec<(String, RouteOutcome)>> {
        envelope.validate()?;
        self.router.broadcast(recipients, envelope).await
    }

    /// Drain a recipient's backlog over its live channel, if any.
    pub async fn drain_pending(&self, did: &str) -> Result<usize> {
        self.router.on_connect(did).await
    }

    /// Administrative resurrection of a terminally failed message.
    pub async fn requeue_failed(&self, queue_id: &str) -> Result<()> {
        self.queue.requeue_failed(queue_id).await
    }

    /// Counts per status across all recipients.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    /// Counts per status for one recipient.
    pub async fn stats_for(&self, did: &str) -> Result<QueueStats> {
        self.queue.stats_for(did).await
    }

    /// Pending messages for one recipient, oldest first.
    pub async fn pending_for(&self, did: &str) -> Result<Vec<QueuedMessage>> {
        self.queue.pending_for(did).await
    }

    /// Newest-first page across all statuses.
    pub async fn history(&self, limit: usize, offset: usize) -> Result<Vec<QueuedMessage>> {
        self.queue.history(limit, offset).await
    }

    /// In-memory registry snapshot for the admin surface.
    pub fn registry_snapshot(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    /// Number of currently live channels.
    pub fn active_connections(&self) -> usize {
        self.registry.connection_count()
    }

    /// Recorded mediation grants.
    pub async fn mediation_grants(&self) -> Result<Vec<MediationGrant>> {
        self.policy.list().await
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<dyn DeliveryQueue> {
        &self.queue
    }

    pub fn policy(&self) -> &Arc<MediationPolicy> {
        &self.policy
    }

    pub fn connection_store(&self) -> Option<&ConnectionStore> {
        self.connections.as_ref()
    }

    pub fn config(&self) -> &MediatorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::MediatorError;
    use crate::policy::GrantStore;
    use crate::queue::LibSqlDeliveryQueue;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn build_mediator(config: MediatorConfig) -> Mediator {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .expect("build db");
        let conn = Arc::new(tokio::sync::Mutex::new(db.connect().expect("connect")));

        let queue = LibSqlDeliveryQueue::from_shared(Arc::clone(&conn));
        queue.initialize().await.expect("init queue");
        let grants = GrantStore::from_shared(Arc::clone(&conn));
        grants.initialize().await.expect("init grants");
        let connections = ConnectionStore::from_shared(conn);
        connections.initialize().await.expect("init connections");

        let policy = MediationPolicy::new(grants, config.default_grant_all);
        Mediator::new(config, Arc::new(queue), policy, Some(connections))
    }

    fn fast_config() -> MediatorConfig {
        MediatorConfig::default().with_retry(RetryPolicy::new(Duration::ZERO, 3))
    }

    fn basic_envelope(to: &str) -> Envelope {
        Envelope::new(kinds::BASIC_MESSAGE, to).with_from("did:example:sender")
    }

    #[tokio::test]
    async fn test_malformed_envelope_never_enters_queue() {
        let mediator = build_mediator(fast_config()).await;

        let mut envelope = basic_envelope("did:example:alice");
        envelope.id = String::new();

        let result = mediator.handle_inbound(envelope).await;
        assert!(matches!(result, Err(MediatorError::Malformed(_))));
        assert_eq!(mediator.queue_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_inbound_basic_message_enqueued_when_offline() {
        let mediator = build_mediator(fast_config()).await;

        let receipt = mediator
            .handle_inbound(basic_envelope("did:example:alice"))
            .await
            .unwrap();
        assert!(matches!(
            receipt,
            InboundReceipt::Routed {
                outcome: RouteOutcome::Enqueued { .. }
            }
        ));
        assert_eq!(mediator.stats_for("did:example:alice").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_forward_readdresses_to_next() {
        let mediator = build_mediator(fast_config()).await;
        let (tx, mut rx) = mpsc::channel(16);
        mediator.register_channel("did:example:bob", tx).await.unwrap();

        let forward = Envelope::new(kinds::FORWARD, "did:example:mediator")
            .with_from("did:example:sender")
            .with_body(json!({ "next": "did:example:bob" }));

        let receipt = mediator.handle_inbound(forward).await.unwrap();
        assert!(matches!(
            receipt,
            InboundReceipt::Routed {
                outcome: RouteOutcome::Delivered
            }
        ));
        assert_eq!(rx.recv().await.unwrap().envelope.to, "did:example:bob");
    }

    #[tokio::test]
    async fn test_forward_with_blank_next_never_enters_queue() {
        let mediator = build_mediator(fast_config()).await;

        let forward = Envelope::new(kinds::FORWARD, "did:example:mediator")
            .with_from("did:example:sender")
            .with_body(json!({ "next": "" }));

        let result = mediator.handle_inbound(forward).await;
        assert!(matches!(result, Err(MediatorError::Malformed(_))));
        assert_eq!(mediator.queue_stats().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_register_channel_pushes_backlog() {
        let mediator = build_mediator(fast_config()).await;

        let first = basic_envelope("did:example:alice");
        let second = basic_envelope("did:example:alice");
        mediator.handle_inbound(first.clone()).await.unwrap();
        mediator.handle_inbound(second.clone()).await.unwrap();

        // Push-on-connect: no worker involved.
        let (tx, mut rx) = mpsc::channel(16);
        let drained = mediator.register_channel("did:example:alice", tx).await.unwrap();
        assert_eq!(drained, 2);

        assert_eq!(rx.recv().await.unwrap().envelope.id, first.id);
        assert_eq!(rx.recv().await.unwrap().envelope.id, second.id);

        let stats = mediator.stats_for("did:example:alice").await.unwrap();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_reregistration_replaces_channel_without_double_count() {
        let mediator = build_mediator(fast_config()).await;

        let (tx1, _rx1) = mpsc::channel(16);
        let (tx2, mut rx2) = mpsc::channel(16);
        mediator.register_channel("did:example:alice", tx1).await.unwrap();
        // Reconnect before disconnect.
        mediator.register_channel("did:example:alice", tx2).await.unwrap();
        assert_eq!(mediator.active_connections(), 1);

        // Traffic flows over the replacement channel.
        mediator
            .handle_inbound(basic_envelope("did:example:alice"))
            .await
            .unwrap();
        assert!(rx2.recv().await.is_some());

        // One close fully retires the connection.
        mediator.close_channel("did:example:alice").await.unwrap();
        assert_eq!(mediator.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_close_channel_records_history() {
        let mediator = build_mediator(fast_config()).await;
        let (tx, _rx) = mpsc::channel(16);

        mediator.register_channel("did:example:alice", tx).await.unwrap();
        assert_eq!(mediator.active_connections(), 1);

        mediator.close_channel("did:example:alice").await.unwrap();
        assert_eq!(mediator.active_connections(), 0);

        let record = mediator
            .connection_store()
            .unwrap()
            .get("did:example:alice")
            .await
            .unwrap()
            .unwrap();
        assert!(!record.online);
    }

    #[tokio::test]
    async fn test_mediate_request_grants_and_replies() {
        let mediator = build_mediator(fast_config()).await;
        let (tx, mut rx) = mpsc::channel(16);
        mediator.register_channel("did:example:alice", tx).await.unwrap();

        let request = Envelope::new(kinds::MEDIATE_REQUEST, "did:example:mediator")
            .with_from("did:example:alice");
        let request_id = request.id.clone();

        let receipt = mediator.handle_inbound(request).await.unwrap();
        assert!(matches!(
            receipt,
            InboundReceipt::MediationDecided {
                granted: true,
                replied: true,
                ..
            }
        ));

        let reply = rx.recv().await.unwrap().envelope;
        assert_eq!(reply.kind, kinds::MEDIATE_GRANT);
        assert_eq!(reply.thread.unwrap().thid.as_deref(), Some(request_id.as_str()));
    }

    #[tokio::test]
    async fn test_mediate_request_denied_under_deny_all() {
        let mediator = build_mediator(fast_config().with_default_grant_all(false)).await;
        let (tx, mut rx) = mpsc::channel(16);
        mediator.register_channel("did:example:alice", tx).await.unwrap();

        let request = Envelope::new(kinds::MEDIATE_REQUEST, "did:example:mediator")
            .with_from("did:example:alice");
        let receipt = mediator.handle_inbound(request).await.unwrap();
        assert!(matches!(
            receipt,
            InboundReceipt::MediationDecided { granted: false, .. }
        ));
        assert_eq!(rx.recv().await.unwrap().envelope.kind, kinds::MEDIATE_DENY);
    }

    #[tokio::test]
    async fn test_grant_reply_queued_for_offline_requester() {
        let mediator = build_mediator(fast_config()).await;

        let request = Envelope::new(kinds::MEDIATE_REQUEST, "did:example:mediator")
            .with_from("did:example:alice");
        let receipt = mediator.handle_inbound(request).await.unwrap();
        assert!(matches!(
            receipt,
            InboundReceipt::MediationDecided {
                granted: true,
                replied: true,
                ..
            }
        ));

        // The grant waits in the queue for the next connect.
        let pending = mediator.pending_for("did:example:alice").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].envelope.kind, kinds::MEDIATE_GRANT);
    }

    #[tokio::test]
    async fn test_pickup_status_reports_pending_count() {
        let mediator = build_mediator(fast_config()).await;

        mediator.handle_inbound(basic_envelope("did:example:alice")).await.unwrap();
        mediator.handle_inbound(basic_envelope("did:example:alice")).await.unwrap();

        // Status requests do not drain; connect after enqueue would. Use
        // a raw registry registration to keep the backlog intact.
        let (tx, mut rx) = mpsc::channel(16);
        mediator.registry().register("did:example:alice", tx);

        let request = Envelope::new(kinds::PICKUP_STATUS_REQUEST, "did:example:mediator")
            .with_from("did:example:alice");
        let receipt = mediator.handle_inbound(request).await.unwrap();
        assert!(matches!(
            receipt,
            InboundReceipt::StatusReported {
                pending: 2,
                replied: true,
                ..
            }
        ));

        let reply = rx.recv().await.unwrap().envelope;
        assert_eq!(reply.kind, kinds::PICKUP_STATUS);
        assert_eq!(reply.body["message_count"], 2);
    }

    #[tokio::test]
    async fn test_pickup_delivery_drains_backlog() {
        let mediator = build_mediator(fast_config()).await;

        mediator.handle_inbound(basic_envelope("did:example:alice")).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        mediator.registry().register("did:example:alice", tx);

        let request = Envelope::new(kinds::PICKUP_DELIVERY_REQUEST, "did:example:mediator")
            .with_from("did:example:alice");
        let receipt = mediator.handle_inbound(request).await.unwrap();
        assert!(matches!(
            receipt,
            InboundReceipt::PendingDelivered { drained: 1, .. }
        ));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_through_facade() {
        let mediator = build_mediator(fast_config()).await;
        let (tx, _rx) = mpsc::channel(16);
        mediator.register_channel("did:example:b", tx).await.unwrap();

        let recipients = vec!["did:example:a".to_string(), "did:example:b".to_string()];
        let outcomes = mediator
            .broadcast(&recipients, &basic_envelope("did:example:template"))
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);

        assert!(matches!(
            mediator.broadcast(&[], &basic_envelope("did:example:x")).await,
            Err(MediatorError::EmptyRecipients)
        ));
    }

    #[tokio::test]
    async fn test_requeue_failed_through_facade() {
        let config = fast_config().with_retry(RetryPolicy::new(Duration::ZERO, 1));
        let mediator = build_mediator(config).await;

        mediator.handle_inbound(basic_envelope("did:example:alice")).await.unwrap();

        // One sweep against an offline recipient fails it terminally.
        let worker = mediator.delivery_worker(CancellationToken::new());
        worker.sweep().await.unwrap();

        let stats = mediator.stats_for("did:example:alice").await.unwrap();
        assert_eq!(stats.failed, 1);

        let failed = mediator.history(10, 0).await.unwrap();
        mediator.requeue_failed(&failed[0].queue_id).await.unwrap();

        let stats = mediator.stats_for("did:example:alice").await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 0);
    }
}
