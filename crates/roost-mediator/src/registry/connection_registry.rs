//! Connection Registry implementation.
//!
//! Tracks live channels by recipient DID for message routing. Entries are
//! never removed on disconnect; the channel handle is cleared and the
//! last-seen timestamp retained, so liveness history survives in-process.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::envelope::Envelope;

/// An envelope to be written to a recipient's channel.
///
/// This is the message type sent through the outbound channel; the
/// transport adapter on the other end serializes it onto the wire.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// The envelope to deliver
    pub envelope: Envelope,
}

impl OutboundMessage {
    /// Create a new outbound message.
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope }
    }
}

/// Connection state stored in the registry.
#[derive(Debug)]
struct ConnectionEntry {
    /// Channel to the recipient's transport; None after disconnect.
    sender: Option<mpsc::Sender<OutboundMessage>>,
    /// When the current channel was registered.
    connected_at: Option<DateTime<Utc>>,
    /// Last registration or disconnection.
    last_seen: DateTime<Utc>,
}

impl ConnectionEntry {
    fn is_active(&self) -> bool {
        matches!(&self.sender, Some(sender) if !sender.is_closed())
    }
}

/// Snapshot of one registry entry, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub did: String,
    pub active: bool,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
}

/// Result of attempting to send a message through a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Message was queued onto the recipient's channel
    Sent,
    /// The recipient has no live channel
    NotConnected,
    /// The channel to the recipient is full (backpressure)
    ChannelFull,
    /// The channel to the recipient is closed
    ChannelClosed,
}

impl SendResult {
    /// Every non-`Sent` result is the channel-unavailable condition the
    /// router falls back to enqueue on.
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }
}

/// Registry for tracking live recipient channels.
///
/// Thread-safe registry that maps recipient DIDs to connection entries.
/// Uses DashMap for concurrent access without explicit locking; writes
/// (register/unregister) are rare relative to liveness reads.
///
/// No retry logic lives here. Sends are non-blocking `try_send` calls:
/// a full or closed channel is reported, never waited on.
pub struct ConnectionRegistry {
    connections: DashMap<String, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create a new connection registry.
    pub fn new() -> Self {
        info!("Creating connection registry");
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a channel for a recipient.
    ///
    /// Replaces any prior channel for the same DID. This handles
    /// reconnection scenarios where an agent reconnects before the old
    /// channel is cleaned up. Push-on-connect is the caller's job; the
    /// registry only records the channel. Returns true when a live
    /// channel was replaced, so callers tracking connection counts do
    /// not double-count a reconnect.
    #[instrument(skip(self, sender), fields(did = %did))]
    pub fn register(&self, did: &str, sender: mpsc::Sender<OutboundMessage>) -> bool {
        let was_active = self.is_active(did);
        let now = Utc::now();
        self.connections.insert(
            did.to_string(),
            ConnectionEntry {
                sender: Some(sender),
                connected_at: Some(now),
                last_seen: now,
            },
        );
        if was_active {
            debug!("Replaced live channel registration");
        } else {
            debug!("Registered new channel");
        }
        was_active
    }

    /// Mark a recipient's channel gone.
    ///
    /// The entry is retained with its last-seen timestamp; only the
    /// channel handle is cleared. Returns false if the DID was never
    /// registered.
    #[instrument(skip(self), fields(did = %did))]
    pub fn unregister(&self, did: &str) -> bool {
        match self.connections.get_mut(did) {
            Some(mut entry) => {
                entry.sender = None;
                entry.last_seen = Utc::now();
                debug!("Unregistered channel");
                true
            }
            None => {
                debug!("Channel was not registered");
                false
            }
        }
    }

    /// Check if a recipient currently has a live channel.
    pub fn is_active(&self, did: &str) -> bool {
        self.connections
            .get(did)
            .map(|entry| entry.is_active())
            .unwrap_or(false)
    }

    /// Number of currently active channels.
    pub fn connection_count(&self) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Send an envelope to a recipient's channel.
    ///
    /// Fire-and-forget at the channel layer: `Sent` means the message was
    /// handed to the transport, not that the agent received it.
    #[instrument(skip(self, envelope), fields(did = %did, message_id = %envelope.id))]
    pub fn send(&self, did: &str, envelope: Envelope) -> SendResult {
        let sender = match self.connections.get(did) {
            Some(entry) => match &entry.sender {
                Some(sender) => sender.clone(),
                None => {
                    debug!("Recipient has no live channel");
                    return SendResult::NotConnected;
                }
            },
            None => {
                debug!("Recipient not registered");
                return SendResult::NotConnected;
            }
        };

        match sender.try_send(OutboundMessage::new(envelope)) {
            Ok(()) => {
                debug!("Message queued onto channel");
                SendResult::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound channel full, applying backpressure");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound channel closed, clearing stale handle");
                if let Some(mut entry) = self.connections.get_mut(did) {
                    entry.sender = None;
                    entry.last_seen = Utc::now();
                }
                SendResult::ChannelClosed
            }
        }
    }

    /// Snapshot of currently active recipient DIDs.
    ///
    /// Not required to reflect concurrent registration changes.
    pub fn active_recipients(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|entry| entry.value().is_active())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Snapshot of all known entries, active or not.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|entry| ConnectionInfo {
                did: entry.key().clone(),
                active: entry.value().is_active(),
                last_seen: entry.value().last_seen,
                connected_at: entry.value().connected_at,
            })
            .collect()
    }

    /// Look up one entry.
    pub fn get(&self, did: &str) -> Option<ConnectionInfo> {
        self.connections.get(did).map(|entry| ConnectionInfo {
            did: did.to_string(),
            active: entry.value().is_active(),
            last_seen: entry.value().last_seen,
            connected_at: entry.value().connected_at,
        })
    }

    /// Clear channel handles whose receiving side has gone away.
    ///
    /// Entries are kept (history), only the dead handles are dropped.
    /// Can be called periodically for channels that were not properly
    /// unregistered.
    pub fn cleanup_stale(&self) -> usize {
        let mut cleared = 0;
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|entry| {
                matches!(&entry.value().sender, Some(sender) if sender.is_closed())
            })
            .map(|entry| entry.key().clone())
            .collect();

        for did in stale {
            if let Some(mut entry) = self.connections.get_mut(&did) {
                entry.sender = None;
                entry.last_seen = Utc::now();
                debug!(did = %did, "Cleared stale channel handle");
                cleared += 1;
            }
        }

        if cleared > 0 {
            info!(count = cleared, "Cleaned up stale channels");
        }

        cleared
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connection_count", &self.connection_count())
            .finish()
    }
}
