//! Mediation policy.
//!
//! Decides whether this mediator holds messages on behalf of a requester.
//! Per-requester state machine: unknown (no record) → requested →
//! {granted, denied}. Granted and denied are stable until an explicit
//! administrative change; nothing expires silently.

mod storage;

pub use storage::{GrantStore, MediationGrant, GRANTS_SCHEMA};

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::{MediatorError, Result};

/// Recorded state of a mediation relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantState {
    /// Request seen, no decision recorded yet.
    Requested,
    Granted,
    Denied,
}

impl GrantState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Granted => "granted",
            Self::Denied => "denied",
        }
    }
}

impl FromStr for GrantState {
    type Err = MediatorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "requested" => Ok(Self::Requested),
            "granted" => Ok(Self::Granted),
            "denied" => Ok(Self::Denied),
            other => Err(MediatorError::Serialization(format!(
                "unknown grant state: {other}"
            ))),
        }
    }
}

/// Outcome of a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationDecision {
    Granted,
    Denied,
}

impl MediationDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Grant/deny policy over a durable grant store.
///
/// The boot-time default (`default_grant_all`) applies only to requesters
/// with no recorded grant; the resulting decision is written back so it is
/// stable and auditable even if the default changes on a later boot.
pub struct MediationPolicy {
    store: GrantStore,
    default_grant_all: bool,
}

impl MediationPolicy {
    pub fn new(store: GrantStore, default_grant_all: bool) -> Self {
        Self {
            store,
            default_grant_all,
        }
    }

    /// Decide mediation for a requester, recording the decision on first
    /// contact.
    #[instrument(skip(self), fields(did = %did))]
    pub async fn decide(&self, did: &str) -> Result<MediationDecision> {
        if let Some(grant) = self.store.get(did).await? {
            return Ok(match grant.state {
                GrantState::Granted => MediationDecision::Granted,
                // A request with no decision is not a grant.
                GrantState::Requested | GrantState::Denied => MediationDecision::Denied,
            });
        }

        // First contact: apply the boot default and record it.
        let (state, decision) = if self.default_grant_all {
            (GrantState::Granted, MediationDecision::Granted)
        } else {
            (GrantState::Denied, MediationDecision::Denied)
        };
        self.store.upsert(did, state, Some("default policy")).await?;
        info!(state = state.as_str(), "Recorded default mediation decision");
        Ok(decision)
    }

    /// Administrative grant. Reverses a denial if one was recorded.
    #[instrument(skip(self, reason), fields(did = %did))]
    pub async fn grant(&self, did: &str, reason: Option<&str>) -> Result<()> {
        self.store.upsert(did, GrantState::Granted, reason).await?;
        info!("Mediation granted");
        Ok(())
    }

    /// Administrative denial. Reverses a grant if one was recorded.
    #[instrument(skip(self, reason), fields(did = %did))]
    pub async fn deny(&self, did: &str, reason: Option<&str>) -> Result<()> {
        self.store.upsert(did, GrantState::Denied, reason).await?;
        info!("Mediation denied");
        Ok(())
    }

    /// Recorded grant for one requester; None means unknown.
    pub async fn status(&self, did: &str) -> Result<Option<MediationGrant>> {
        self.store.get(did).await
    }

    /// All recorded grants.
    pub async fn list(&self) -> Result<Vec<MediationGrant>> {
        self.store.list().await
    }

    /// Whether unknown requesters are granted by default.
    pub fn default_grant_all(&self) -> bool {
        self.default_grant_all
    }

    /// Record that a mediation request was seen without deciding it.
    ///
    /// Used when an operator wants manual review: the requester shows up
    /// as `requested` in the admin surface and routes as denied until
    /// granted.
    pub async fn record_request(&self, did: &str) -> Result<()> {
        if self.store.get(did).await?.is_none() {
            self.store
                .upsert(did, GrantState::Requested, Some("awaiting review"))
                .await?;
            debug!(did = %did, "Mediation request recorded for review");
        }
        Ok(())
    }
}
