//! Inbound message dispatch.
//!
//! One place decides what an inbound envelope means: a pure function from
//! envelope to an [`Action`] plan. The mediator executes the plan; nothing
//! here touches the registry, the queue, or the network.

use crate::envelope::{Envelope, MessageKind};
use crate::error::{MediatorError, Result};

/// What the mediator should do with an inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Deliver or queue the envelope for its `to` recipient.
    Route,
    /// Re-address the envelope to the wrapped recipient, then route.
    Forward { next: String },
    /// Decide mediation for the sender and reply with grant or deny.
    Mediate { requester: String },
    /// Reply to the sender with its pending message count.
    PickupStatus { requester: String },
    /// Drain the sender's queue over its live channel.
    PickupDelivery { requester: String },
}

/// Classify an envelope into an action. Protocol messages that need a reply
/// address are malformed without a sender.
pub fn dispatch(envelope: &Envelope) -> Result<Action> {
    match envelope.message_kind() {
        MessageKind::Basic => Ok(Action::Route),
        MessageKind::Forward => {
            let next = envelope
                .forward_next()
                .ok_or_else(|| MediatorError::malformed("forward message without a next recipient"))?;
            Ok(Action::Forward { next: next.to_string() })
        }
        MessageKind::MediateRequest => Ok(Action::Mediate {
            requester: reply_address(envelope, "mediate-request")?,
        }),
        MessageKind::PickupStatusRequest => Ok(Action::PickupStatus {
            requester: reply_address(envelope, "status-request")?,
        }),
        MessageKind::PickupDeliveryRequest => Ok(Action::PickupDelivery {
            requester: reply_address(envelope, "delivery-request")?,
        }),
    }
}

fn reply_address(envelope: &Envelope, what: &str) -> Result<String> {
    match envelope.from.as_deref() {
        Some(from) if !from.trim().is_empty() => Ok(from.to_string()),
        _ => Err(MediatorError::malformed(format!(
            "{what} requires a sender to reply to"
        ))),
    }
}
