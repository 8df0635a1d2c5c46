//! Append-only, time-indexed interaction store
//!
//! Every completed user exchange is recorded here with its measured metrics.
//! Records are immutable once written; corrections are modeled as new
//! interactions so the history stays auditable. Appends are serialized
//! through one connection, and recording is safe to call from many concurrent
//! request handlers.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

/// One completed user exchange with its measured outcomes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// When the exchange completed
    pub recorded_at: DateTime<Utc>,
    /// Digest of the user input (sha256 hex)
    pub input_digest: String,
    /// Digest of the agent output
    pub output_digest: String,
    /// Measured metrics, supplied by the conversational path
    pub metrics: HashMap<String, f64>,
    /// Free-form context tags
    pub context: HashMap<String, String>,
}

impl Interaction {
    /// Build an interaction from raw input/output text, digesting both
    pub fn from_exchange(
        input: &str,
        output: &str,
        metrics: HashMap<String, f64>,
        context: HashMap<String, String>,
    ) -> Self {
        Self {
            recorded_at: Utc::now(),
            input_digest: digest(input.as_bytes()),
            output_digest: digest(output.as_bytes()),
            metrics,
            context,
        }
    }
}

/// Sha256 hex digest used for interaction input/output fingerprints
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// A time range inclusive at both ends; `None` bounds are open-ended
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn new(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        Self { start, end }
    }

    /// Everything recorded in the last `window`
    pub fn last(window: std::time::Duration) -> Self {
        let start = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }
}

/// Durable, append-only metrics store backed by SQLite
#[derive(Clone)]
pub struct MetricsStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetricsStore {
    /// Open (or create) the store at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory store, used by tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL,
                input_digest TEXT NOT NULL,
                output_digest TEXT NOT NULL,
                metrics TEXT NOT NULL,
                context TEXT NOT NULL DEFAULT '{}'
            );

            CREATE INDEX IF NOT EXISTS idx_interactions_recorded
                ON interactions(recorded_at ASC);
            "#,
        )?;
        Ok(())
    }

    /// Append one interaction. Fails only on storage errors, which are
    /// surfaced to the caller rather than retried here.
    pub async fn record(&self, interaction: &Interaction) -> Result<()> {
        let metrics_json = serde_json::to_string(&interaction.metrics)?;
        let context_json = serde_json::to_string(&interaction.context)?;

        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO interactions
               (recorded_at, input_digest, output_digest, metrics, context)
               VALUES (?1, ?2, ?3, ?4, ?5)"#,
            params![
                interaction.recorded_at.to_rfc3339(),
                interaction.input_digest,
                interaction.output_digest,
                metrics_json,
                context_json,
            ],
        )?;
        debug!("Recorded interaction at {}", interaction.recorded_at);
        Ok(())
    }

    /// Query interactions in a time range, ordered by timestamp ascending
    pub async fn query(&self, range: TimeRange) -> Result<Vec<Interaction>> {
        let start = range
            .start
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "0000-01-01T00:00:00Z".to_string());
        let end = range
            .end
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "9999-12-31T23:59:59Z".to_string());

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT recorded_at, input_digest, output_digest, metrics, context
               FROM interactions
               WHERE recorded_at >= ?1 AND recorded_at <= ?2
               ORDER BY recorded_at ASC, id ASC"#,
        )?;

        let rows = stmt.query_map(params![start, end], |row| {
            let recorded_at: String = row.get(0)?;
            let metrics_json: String = row.get(3)?;
            let context_json: String = row.get(4)?;
            // A row that no longer parses is corruption, not data; refuse to
            // invent a timestamp or an empty metrics map in its place.
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .map(|d| d.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                })?;
            let metrics = serde_json::from_str(&metrics_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e))
            })?;
            let context = serde_json::from_str(&context_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e))
            })?;
            Ok(Interaction {
                recorded_at,
                input_digest: row.get(1)?,
                output_digest: row.get(2)?,
                metrics,
                context,
            })
        })?;

        let mut interactions = Vec::new();
        for row in rows {
            interactions.push(row?);
        }
        Ok(interactions)
    }

    /// Count interactions in a time range
    pub async fn count(&self, range: TimeRange) -> Result<usize> {
        let start = range
            .start
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "0000-01-01T00:00:00Z".to_string());
        let end = range
            .end
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "9999-12-31T23:59:59Z".to_string());

        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM interactions WHERE recorded_at >= ?1 AND recorded_at <= ?2",
            params![start, end],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Drop interactions older than the cutoff. Operator-invoked retention;
    /// rows are never edited in place, only dropped whole.
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM interactions WHERE recorded_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(removed)
    }
}
