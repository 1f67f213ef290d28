//! Store-and-forward message mediator for DID agents.
//!
//! Accepts routing envelopes on behalf of recipients that are frequently
//! offline, persists them durably, and delivers them when the recipient
//! connects. Delivery is at-least-once with ordered drains per recipient;
//! senders get an immediate receipt, never a delivery guarantee.
//!
//! The transport-facing entry point is [`Mediator`]; the background
//! retry loop is [`DeliveryWorker`].

pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod mediator;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod registry;
pub mod router;
pub mod worker;

pub use config::{MediatorConfig, RetryPolicy};
pub use dispatch::{dispatch, Action};
pub use envelope::{kinds, Envelope, MessageKind, Thread};
pub use error::{MediatorError, Result};
pub use mediator::{InboundReceipt, Mediator};
pub use policy::{GrantState, GrantStore, MediationDecision, MediationGrant, MediationPolicy};
pub use queue::{
    DeliveryQueue, LibSqlDeliveryQueue, MessageStatus, QueueStats, QueuedMessage,
};
pub use registry::{
    ConnectionCounts, ConnectionInfo, ConnectionRecord, ConnectionRegistry, ConnectionStore,
    OutboundMessage, SendResult,
};
pub use router::{RouteOutcome, Router};
pub use worker::DeliveryWorker;
