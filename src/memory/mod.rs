//! Learning memory - durable record of past improvement attempts
//!
//! Every resolved action leaves an experience behind: what the situation
//! looked like, what was tried, and whether it held up. Experiences are
//! append-only and queried by context similarity so that previously-failed
//! improvements of the same shape get deprioritized instead of retried
//! blindly.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::actions::ActionKind;
use crate::error::Result;

/// Outcome of a recorded improvement attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
        }
    }
}

/// One recorded improvement attempt. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    /// Context snapshot from the plan that produced the action
    pub context: HashMap<String, String>,
    /// Variant of the action that was attempted
    pub kind: ActionKind,
    /// What the action targeted, e.g. "prompt:system"
    pub target: String,
    /// Human-readable action summary
    pub summary: String,
    pub outcome: Outcome,
    /// Failure reason, when there is one
    pub reason: Option<String>,
}

/// An experience with its similarity score, as returned by
/// [`LearningMemory::query_similar`]
#[derive(Debug, Clone)]
pub struct ScoredExperience {
    pub experience: Experience,
    pub score: f64,
}

/// Durable, append-only experience store backed by SQLite
#[derive(Clone)]
pub struct LearningMemory {
    conn: Arc<Mutex<Connection>>,
}

impl LearningMemory {
    /// Open (or create) the memory at the given path
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
            CREATE TABLE IF NOT EXISTS experiences (
                id TEXT PRIMARY KEY,
                recorded_at TEXT NOT NULL,
                context TEXT NOT NULL,
                kind TEXT NOT NULL,
                target TEXT NOT NULL,
                summary TEXT NOT NULL,
                outcome TEXT NOT NULL,
                reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_experiences_recorded
                ON experiences(recorded_at DESC);
            CREATE INDEX IF NOT EXISTS idx_experiences_target
                ON experiences(target);
            "#,
        )?;
        Ok(())
    }

    /// Record a successful improvement attempt. Always appends; the
    /// orchestrator guarantees at-most-one record per action outcome.
    pub async fn record_success(
        &self,
        context: &HashMap<String, String>,
        kind: ActionKind,
        target: &str,
        summary: &str,
    ) -> Result<Experience> {
        let experience = Experience {
            id: Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            context: context.clone(),
            kind,
            target: target.to_string(),
            summary: summary.to_string(),
            outcome: Outcome::Success,
            reason: None,
        };
        self.append(&experience).await?;
        info!("Recorded success experience for {}", target);
        Ok(experience)
    }

    /// Record a failed improvement attempt with its reason
    pub async fn record_failure(
        &self,
        context: &HashMap<String, String>,
        kind: ActionKind,
        target: &str,
        summary: &str,
        reason: &str,
    ) -> Result<Experience> {
        let experience = Experience {
            id: Uuid::new_v4().to_string(),
            recorded_at: Utc::now(),
            context: context.clone(),
            kind,
            target: target.to_string(),
            summary: summary.to_string(),
            outcome: Outcome::Failure,
            reason: Some(reason.to_string()),
        };
        self.append(&experience).await?;
        info!("Recorded failure experience for {}: {}", target, reason);
        Ok(experience)
    }

    async fn append(&self, experience: &Experience) -> Result<()> {
        let context_json = serde_json::to_string(&experience.context)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO experiences
               (id, recorded_at, context, kind, target, summary, outcome, reason)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                experience.id,
                experience.recorded_at.to_rfc3339(),
                context_json,
                experience.kind.to_string(),
                experience.target,
                experience.summary,
                experience.outcome.to_string(),
                experience.reason,
            ],
        )?;
        Ok(())
    }

    /// Rank experiences by similarity to the given context. Scoring is a
    /// weighted key overlap (half credit for a shared key, full credit when
    /// the value matches too), which gives a deterministic total order; equal
    /// scores are broken by recency, most recent first.
    pub async fn query_similar(
        &self,
        context: &HashMap<String, String>,
        limit: usize,
    ) -> Result<Vec<ScoredExperience>> {
        let all = self.load_recent(500).await?;
        let mut scored: Vec<ScoredExperience> = all
            .into_iter()
            .map(|experience| {
                let score = similarity(context, &experience.context);
                ScoredExperience { experience, score }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.experience.recorded_at.cmp(&a.experience.recorded_at))
                .then(b.experience.id.cmp(&a.experience.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    /// Failure experiences for a target within the lookback window, newest
    /// first. Used to penalize opportunities that already failed recently.
    pub async fn recent_failures(&self, target: &str, lookback: Duration) -> Result<Vec<Experience>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(lookback).unwrap_or_default();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT id, recorded_at, context, kind, target, summary, outcome, reason
               FROM experiences
               WHERE target = ?1 AND outcome = 'failure' AND recorded_at >= ?2
               ORDER BY recorded_at DESC"#,
        )?;
        let rows = stmt.query_map(params![target, cutoff.to_rfc3339()], row_to_experience)?;
        let mut failures = Vec::new();
        for row in rows {
            failures.push(row?);
        }
        Ok(failures)
    }

    /// Total number of stored experiences
    pub async fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM experiences", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn load_recent(&self, limit: usize) -> Result<Vec<Experience>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT id, recorded_at, context, kind, target, summary, outcome, reason
               FROM experiences
               ORDER BY recorded_at DESC
               LIMIT ?1"#,
        )?;
        let rows = stmt.query_map(params![limit as i64], row_to_experience)?;
        let mut experiences = Vec::new();
        for row in rows {
            experiences.push(row?);
        }
        Ok(experiences)
    }
}

fn row_to_experience(row: &rusqlite::Row<'_>) -> rusqlite::Result<Experience> {
    let id: String = row.get(0)?;
    let recorded_at: String = row.get(1)?;
    let context_json: String = row.get(2)?;
    let kind: String = row.get(3)?;
    let target: String = row.get(4)?;
    let summary: String = row.get(5)?;
    let outcome: String = row.get(6)?;
    let reason: Option<String> = row.get(7)?;
    // Corrupt rows are an error, not a default-valued experience
    let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let context = serde_json::from_str(&context_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
    let kind = kind
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, e.into()))?;
    Ok(Experience {
        id,
        recorded_at,
        context,
        kind,
        target,
        summary,
        outcome: if outcome == "success" {
            Outcome::Success
        } else {
            Outcome::Failure
        },
        reason,
    })
}

/// Weighted key-overlap similarity over two context mappings, in [0, 1].
/// A shared key scores 0.5, a shared key with an equal value scores 1.0,
/// normalized by the size of the key union.
fn similarity(a: &HashMap<String, String>, b: &HashMap<String, String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let union: std::collections::HashSet<&String> = a.keys().chain(b.keys()).collect();
    let mut score = 0.0;
    for (key, value) in a {
        if let Some(other) = b.get(key) {
            score += if other == value { 1.0 } else { 0.5 };
        }
    }
    score / union.len() as f64
}
