//! libSQL-backed grant store.

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::Connection;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::GrantState;
use crate::error::{MediatorError, Result};

/// SQL schema for mediation grants.
pub const GRANTS_SCHEMA: &str = r#"
-- Mediation relationships, one row per requester DID
CREATE TABLE IF NOT EXISTS mediation_grants (
    -- Requester DID
    did TEXT PRIMARY KEY,
    -- requested | granted | denied
    state TEXT NOT NULL,
    reason TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// One recorded mediation relationship.
#[derive(Debug, Clone, Serialize)]
pub struct MediationGrant {
    pub did: String,
    pub state: GrantState,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// libSQL-backed store of mediation grants.
#[derive(Clone)]
pub struct GrantStore {
    conn: Arc<Mutex<Connection>>,
    initialized: Arc<AtomicBool>,
}

impl GrantStore {
    /// Create a new store over the given connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create from a connection shared with other stores.
    pub fn from_shared(conn: Arc<Mutex<Connection>>) -> Self {
        Self {
            conn,
            initialized: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Initialize the schema if not already done.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        conn.execute_batch(GRANTS_SCHEMA).await?;

        self.initialized.store(true, Ordering::Release);
        debug!("Grant store schema initialized");
        Ok(())
    }

    /// Insert or update the grant for a requester.
    pub async fn upsert(&self, did: &str, state: GrantState, reason: Option<&str>) -> Result<()> {
        self.initialize().await?;

        let now = ts(Utc::now());
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO mediation_grants (did, state, reason, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(did) DO UPDATE SET
                state = ?2, reason = ?3, updated_at = ?4
            "#,
            (did, state.as_str(), reason, now.as_str()),
        )
        .await?;
        Ok(())
    }

    /// Look up the grant for one requester.
    pub async fn get(&self, did: &str) -> Result<Option<MediationGrant>> {
        self.initialize().await?;

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT did, state, reason, created_at, updated_at
                FROM mediation_grants WHERE did = ?1
                "#,
                [did],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_grant(&row)?)),
            None => Ok(None),
        }
    }

    /// All grants, most recently updated first.
    pub async fn list(&self) -> Result<Vec<MediationGrant>> {
        self.initialize().await?;

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                r#"
                SELECT did, state, reason, created_at, updated_at
                FROM mediation_grants ORDER BY updated_at DESC
                "#,
                (),
            )
            .await?;

        let mut grants = Vec::new();
        while let Some(row) = rows.next().await? {
            grants.push(row_to_grant(&row)?);
        }
        Ok(grants)
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_grant(row: &libsql::Row) -> Result<MediationGrant> {
    let did: String = row.get(0)?;
    let state: String = row.get(1)?;
    let reason: Option<String> = row.get(2).ok();
    let created_at: String = row.get(3)?;
    let updated_at: String = row.get(4)?;

    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| MediatorError::Serialization(format!("invalid timestamp: {e}")))
    };

    Ok(MediationGrant {
        did,
        state: state.parse()?,
        reason,
        created_at: parse(&created_at)?,
        updated_at: parse(&updated_at)?,
    })
}
