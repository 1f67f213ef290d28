//! Durable connection history.
//!
//! One row per recipient DID, recording online/offline status and the
//! last-seen timestamp across process restarts. The in-memory registry
//! answers liveness; this store answers "when was this agent last here"
//! for the admin surface.

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::Connection;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{MediatorError, Result};

/// SQL schema for connection history.
pub const CONNECTIONS_SCHEMA: &str = r#"
-- Connection history, one row per recipient DID
CREATE TABLE IF NOT EXISTS connections (
    -- Recipient DID
    did TEXT PRIMARY KEY,
    -- online | offline
    status TEXT NOT NULL DEFAULT 'offline',
    -- When the current/last session was registered
    connected_at TEXT,
    -- Last registration or disconnection
    last_seen TEXT NOT NULL
);
"#;

/// One durable connection record.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub did: String,
    pub online: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

/// Online/offline totals for the admin surface.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConnectionCounts {
    pub online: u64,
    pub offline: u64,
}

/// libSQL-backed connection history store.
#[derive(Clone)]
pub struct ConnectionStore {
    conn: Arc<Mutex<Connection>>,
    initialized: Arc<AtomicBool>,
}

impl ConnectionStore {
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

    /// Initialize the schema if not already done. A fresh process marks
    /// every row offline: any "online" rows are leftovers from a crash.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        conn.execute_batch(CONNECTIONS_SCHEMA).await?;
        conn.execute(
            "UPDATE connections SET status = 'offline' WHERE status = 'online'",
            (),
        )
        .await?;

        self.initialized.store(true, Ordering::Release);
        debug!("Connection store schema initialized");
        Ok(())
    }

    /// Record a registration: upsert the row as online with fresh
    /// connected-at and last-seen timestamps.
    #[instrument(skip(self), fields(did = %did))]
    pub async fn record_connected(&self, did: &str) -> Result<()> {
        self.initialize().await?;

        let now = ts(Utc::now());
        let conn = self.conn.lock().await;
        conn.execute(
            r#"
            INSERT INTO connections (did, status, connected_at, last_seen)
            VALUES (?1, 'online', ?2, ?2)
            ON CONFLICT(did) DO UPDATE SET
                status = 'online', connected_at = ?2, last_seen = ?2
            "#,
            (did, now.as_str()),
        )
        .await?;
        Ok(())
    }

    /// Record a disconnection. The row is kept; only status and last-seen
    /// change.
    #[instrument(skip(self), fields(did = %did))]
    pub async fn record_disconnected(&self, did: &str) -> Result<()> {
        self.initialize().await?;

        let now = ts(Utc::now());
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE connections SET status = 'offline', last_seen = ?2 WHERE did = ?1",
            (did, now.as_str()),
        )
        .await?;
        Ok(())
    }

    /// Look up one record.
    pub async fn get(&self, did: &str) -> Result<Option<ConnectionRecord>> {
        self.initialize().await?;

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT did, status, connected_at, last_seen FROM connections WHERE did = ?1",
                [did],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// All records, most recently seen first.
    pub async fn list(&self) -> Result<Vec<ConnectionRecord>> {
        self.initialize().await?;

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT did, status, connected_at, last_seen FROM connections ORDER BY last_seen DESC",
                (),
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_record(&row)?);
        }
        Ok(records)
    }

    /// Online/offline totals.
    pub async fn counts(&self) -> Result<ConnectionCounts> {
        self.initialize().await?;

        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT status, COUNT(*) FROM connections GROUP BY status", ())
            .await?;

        let mut counts = ConnectionCounts::default();
        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            match status.as_str() {
                "online" => counts.online = count as u64,
                _ => counts.offline = count as u64,
            }
        }
        Ok(counts)
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_record(row: &libsql::Row) -> Result<ConnectionRecord> {
    let did: String = row.get(0)?;
    let status: String = row.get(1)?;
    let connected_at: Option<String> = row.get(2).ok();
    let last_seen: String = row.get(3)?;

    let parse = |s: &str| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| MediatorError::Serialization(format!("invalid timestamp: {e}")))
    };

    Ok(ConnectionRecord {
        did,
        online: status == "online",
        connected_at: connected_at.as_deref().map(parse).transpose()?,
        last_seen: parse(&last_seen)?,
    })
}
