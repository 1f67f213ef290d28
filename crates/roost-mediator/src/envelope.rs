//! Message envelope types.
//!
//! The envelope is the routing metadata wrapped around an opaque payload:
//! the core reads `id`, `type`, `to`, `from` and the timestamps, and
//! forwards `body` unexamined. The only exception is the `next` field of a
//! routing forward, which names the recipient the payload should be
//! re-addressed to.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MediatorError, Result};

/// DIDComm message type URIs understood by the mediator.
pub mod kinds {
    /// Routing protocol: wrap-and-forward to another recipient
    pub const FORWARD: &str = "https://didcomm.org/routing/2.0/forward";
    /// Coordinate-mediation: request a mediation relationship
    pub const MEDIATE_REQUEST: &str =
        "https://didcomm.org/coordinate-mediation/3.0/mediate-request";
    /// Coordinate-mediation: grant reply
    pub const MEDIATE_GRANT: &str =
        "https://didcomm.org/coordinate-mediation/3.0/mediate-grant";
    /// Coordinate-mediation: deny reply
    pub const MEDIATE_DENY: &str =
        "https://didcomm.org/coordinate-mediation/3.0/mediate-deny";
    /// Message pickup: how many messages are waiting
    pub const PICKUP_STATUS_REQUEST: &str =
        "https://didcomm.org/messagepickup/3.0/status-request";
    /// Message pickup: status reply
    pub const PICKUP_STATUS: &str = "https://didcomm.org/messagepickup/3.0/status";
    /// Message pickup: deliver waiting messages now
    pub const PICKUP_DELIVERY_REQUEST: &str =
        "https://didcomm.org/messagepickup/3.0/delivery-request";
    /// Plain user-to-user message
    pub const BASIC_MESSAGE: &str = "https://didcomm.org/basicmessage/2.0/message";
}

/// Thread correlation for request/reply flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pthid: Option<String>,
}

/// Routing envelope around an opaque (typically encrypted) body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Caller-supplied unique id, also used for dedup on enqueue.
    pub id: String,
    /// DIDComm message type URI.
    #[serde(rename = "type")]
    pub kind: String,
    /// Recipient DID.
    pub to: String,
    /// Sender DID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Opaque payload; never interpreted by the core.
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
}

impl Envelope {
    /// Build an envelope with a fresh id and current timestamp.
    pub fn new(kind: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            to: to.into(),
            from: None,
            body: serde_json::Value::Null,
            created_time: Some(Utc::now().to_rfc3339()),
            expires_time: None,
            thread: None,
        }
    }

    /// Set the sender.
    pub fn with_from(mut self, from: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = body;
        self
    }

    /// Reply threading: correlate this envelope to a request id.
    pub fn in_reply_to(mut self, thid: impl Into<String>) -> Self {
        self.thread = Some(Thread {
            thid: Some(thid.into()),
            pthid: None,
        });
        self
    }

    /// Copy for a single broadcast recipient. Each copy gets a fresh id so
    /// per-recipient dedup never collides across the fan-out.
    pub fn for_recipient(&self, to: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.to = to.into();
        copy
    }

    /// Classify by type URI.
    pub fn message_kind(&self) -> MessageKind {
        MessageKind::from_uri(&self.kind)
    }

    /// The `next` recipient of a routing forward. Empty and whitespace
    /// values count as absent; a forward cannot re-address to nowhere.
    pub fn forward_next(&self) -> Option<&str> {
        self.body
            .get("next")
            .and_then(serde_json::Value::as_str)
            .filter(|next| !next.trim().is_empty())
    }

    /// Reject envelopes missing the fields routing needs. Runs before the
    /// router; a malformed envelope never enters the queue.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(MediatorError::malformed("missing message id"));
        }
        if self.kind.trim().is_empty() {
            return Err(MediatorError::malformed("missing message type"));
        }
        if self.to.trim().is_empty() {
            return Err(MediatorError::malformed("missing recipient"));
        }
        if self.message_kind() == MessageKind::Forward && self.forward_next().is_none() {
            return Err(MediatorError::malformed(
                "forward message without a next recipient",
            ));
        }
        Ok(())
    }
}

/// Tagged classification of inbound messages. Anything the mediator has no
/// special handling for is `Basic` and is routed by its `to` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Re-address the payload to the `next` recipient in the body
    Forward,
    /// Sender asks this mediator to hold messages for it
    MediateRequest,
    /// Sender asks how many messages are waiting for it
    PickupStatusRequest,
    /// Sender asks for its waiting messages
    PickupDeliveryRequest,
    /// Everything else: delivered or queued as-is
    Basic,
}

impl MessageKind {
    pub fn from_uri(uri: &str) -> Self {
        match uri {
            kinds::FORWARD => Self::Forward,
            kinds::MEDIATE_REQUEST => Self::MediateRequest,
            kinds::PICKUP_STATUS_REQUEST => Self::PickupStatusRequest,
            kinds::PICKUP_DELIVERY_REQUEST => Self::PickupDeliveryRequest,
            _ => Self::Basic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_envelope_has_id_and_timestamp() {
        let env = Envelope::new(kinds::BASIC_MESSAGE, "did:example:alice");
        assert!(!env.id.is_empty());
        assert!(env.created_time.is_some());
        assert!(env.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut env = Envelope::new(kinds::BASIC_MESSAGE, "did:example:alice");
        env.id = String::new();
        assert!(matches!(env.validate(), Err(MediatorError::Malformed(_))));

        let mut env = Envelope::new(kinds::BASIC_MESSAGE, "");
        env.id = "m1".into();
        assert!(matches!(env.validate(), Err(MediatorError::Malformed(_))));

        let mut env = Envelope::new("", "did:example:alice");
        env.id = "m2".into();
        assert!(matches!(env.validate(), Err(MediatorError::Malformed(_))));
    }

    #[test]
    fn test_validate_forward_requires_next() {
        let env = Envelope::new(kinds::FORWARD, "did:example:mediator");
        assert!(env.validate().is_err());

        let env = env.with_body(json!({ "next": "did:example:bob" }));
        assert!(env.validate().is_ok());
        assert_eq!(env.forward_next(), Some("did:example:bob"));
    }

    #[test]
    fn test_validate_forward_rejects_blank_next() {
        let env = Envelope::new(kinds::FORWARD, "did:example:mediator")
            .with_body(json!({ "next": "" }));
        assert!(env.forward_next().is_none());
        assert!(matches!(env.validate(), Err(MediatorError::Malformed(_))));

        let env = Envelope::new(kinds::FORWARD, "did:example:mediator")
            .with_body(json!({ "next": "   " }));
        assert!(matches!(env.validate(), Err(MediatorError::Malformed(_))));
    }

    #[test]
    fn test_message_kind_classification() {
        assert_eq!(MessageKind::from_uri(kinds::FORWARD), MessageKind::Forward);
        assert_eq!(
            MessageKind::from_uri(kinds::MEDIATE_REQUEST),
            MessageKind::MediateRequest
        );
        assert_eq!(
            MessageKind::from_uri(kinds::PICKUP_STATUS_REQUEST),
            MessageKind::PickupStatusRequest
        );
        assert_eq!(
            MessageKind::from_uri(kinds::PICKUP_DELIVERY_REQUEST),
            MessageKind::PickupDeliveryRequest
        );
        assert_eq!(
            MessageKind::from_uri("https://didcomm.org/some-other/1.0/thing"),
            MessageKind::Basic
        );
    }

    #[test]
    fn test_broadcast_copy_gets_fresh_id() {
        let env = Envelope::new(kinds::BASIC_MESSAGE, "did:example:template")
            .with_body(json!({ "note": "hello" }));
        let copy = env.for_recipient("did:example:bob");
        assert_ne!(copy.id, env.id);
        assert_eq!(copy.to, "did:example:bob");
        assert_eq!(copy.body, env.body);
    }

    #[test]
    fn test_wire_format_uses_type_field() {
        let env = Envelope::new(kinds::BASIC_MESSAGE, "did:example:alice")
            .with_from("did:example:bob");
        let wire = serde_json::to_value(&env).unwrap();
        assert_eq!(wire["type"], kinds::BASIC_MESSAGE);
        assert_eq!(wire["to"], "did:example:alice");
        assert_eq!(wire["from"], "did:example:bob");

        let parsed: Envelope = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.id, env.id);
        assert_eq!(parsed.kind, env.kind);
    }
}
