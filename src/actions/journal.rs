//! Action journal - durable record of action state transitions
//!
//! Every state change of every action is written here before the cycle moves
//! on, so that a crash mid-rollout cannot lose track of an applied change.
//! On restart, any action left in a non-terminal state is resolved to
//! RolledBack (the fail-safe default) before new cycles begin.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::Result;

use super::profile::RuntimeProfile;
use super::{ActionState, ImprovementAction};

/// Outcome of startup recovery
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryStats {
    /// Non-terminal actions resolved to RolledBack
    pub resolved: usize,
    /// Actions whose rollback failed; the caller must halt automatic cycles
    pub failed: usize,
}

/// SQLite-backed journal of action lifecycles
#[derive(Clone)]
pub struct ActionJournal {
    conn: Arc<Mutex<Connection>>,
}

impl ActionJournal {
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

    /// In-memory journal, used by tests
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
            CREATE TABLE IF NOT EXISTS actions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL,
                state TEXT NOT NULL,
                executed INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_actions_state ON actions(state);
            "#,
        )?;
        Ok(())
    }

    /// Record the action's current state, inserting or replacing its row
    pub async fn record(&self, action: &ImprovementAction) -> Result<()> {
        let payload = serde_json::to_string(action)?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT OR REPLACE INTO actions
               (id, created_at, state, executed, payload, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                action.id,
                action.created_at.to_rfc3339(),
                action.state.to_string(),
                action.executed as i64,
                payload,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load actions left in a non-terminal state
    pub async fn load_unresolved(&self) -> Result<Vec<ImprovementAction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT payload FROM actions WHERE state IN ('proposed', 'validated')
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let payload: String = row.get(0)?;
            Ok(payload)
        })?;

        let mut actions = Vec::new();
        for row in rows {
            let payload = row?;
            match serde_json::from_str::<ImprovementAction>(&payload) {
                Ok(action) => actions.push(action),
                Err(e) => warn!("Skipping undecodable journal entry: {}", e),
            }
        }
        Ok(actions)
    }

    /// Resolve actions left non-terminal by a previous process to RolledBack,
    /// reverting any that had already applied their change. Runs before the
    /// first cycle of a new process.
    pub async fn recover(&self, profile: &RuntimeProfile) -> Result<RecoveryStats> {
        let unresolved = self.load_unresolved().await?;
        let mut stats = RecoveryStats::default();

        for mut action in unresolved {
            if action.executed {
                warn!(
                    "Action {} was left mid-rollout ({}); rolling back",
                    action.id,
                    action.describe()
                );
                if !action.rollback(profile).await {
                    stats.failed += 1;
                    // Keep the journal truthful: the change may still be live
                    self.record(&action).await?;
                    continue;
                }
            } else {
                action.state = ActionState::RolledBack;
            }
            self.record(&action).await?;
            stats.resolved += 1;
        }

        if stats.resolved > 0 || stats.failed > 0 {
            info!(
                "Journal recovery: {} resolved, {} failed",
                stats.resolved, stats.failed
            );
        }
        Ok(stats)
    }

    /// Count journal entries by state, for the operator status view
    pub async fn count_state(&self, state: ActionState) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM actions WHERE state = ?1",
            params![state.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionChange;
    use tempfile::TempDir;

    fn sample_action() -> ImprovementAction {
        ImprovementAction::new(
            "parameter:temperature",
            "test",
            ActionChange::ParameterAdjustment {
                parameter: "temperature".to_string(),
                old_value: 0.7,
                new_value: 0.5,
            },
        )
    }

    #[tokio::test]
    async fn test_record_and_count() {
        let journal = ActionJournal::open_in_memory().unwrap();
        let mut action = sample_action();

        journal.record(&action).await.unwrap();
        assert_eq!(journal.count_state(ActionState::Proposed).await.unwrap(), 1);

        action.state = ActionState::Committed;
        journal.record(&action).await.unwrap();
        assert_eq!(journal.count_state(ActionState::Proposed).await.unwrap(), 0);
        assert_eq!(journal.count_state(ActionState::Committed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_recover_rolls_back_executed_nonterminal_actions() {
        let dir = TempDir::new().unwrap();
        let profile = RuntimeProfile::open(dir.path()).await.unwrap();
        let journal = ActionJournal::open_in_memory().unwrap();

        // Simulate a crash after execute but before resolution
        let mut action = sample_action();
        action.state = ActionState::Validated;
        action.execute(&profile).await.unwrap();
        journal.record(&action).await.unwrap();
        assert_eq!(profile.get_parameter("temperature").await, Some(0.5));

        let stats = journal.recover(&profile).await.unwrap();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.failed, 0);
        // The change was reverted and the journal shows a terminal state
        assert_eq!(profile.get_parameter("temperature").await, Some(0.7));
        assert_eq!(
            journal.count_state(ActionState::RolledBack).await.unwrap(),
            1
        );
        assert!(journal.load_unresolved().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_resolves_unexecuted_actions_without_touching_profile() {
        let dir = TempDir::new().unwrap();
        let profile = RuntimeProfile::open(dir.path()).await.unwrap();
        let journal = ActionJournal::open_in_memory().unwrap();

        let action = sample_action();
        journal.record(&action).await.unwrap();

        let stats = journal.recover(&profile).await.unwrap();
        assert_eq!(stats.resolved, 1);
        assert_eq!(profile.get_parameter("temperature").await, Some(0.7));
    }

    #[tokio::test]
    async fn test_terminal_states_are_left_alone() {
        let dir = TempDir::new().unwrap();
        let profile = RuntimeProfile::open(dir.path()).await.unwrap();
        let journal = ActionJournal::open_in_memory().unwrap();

        let mut action = sample_action();
        action.state = ActionState::Committed;
        journal.record(&action).await.unwrap();

        let stats = journal.recover(&profile).await.unwrap();
        assert_eq!(stats.resolved, 0);
        assert_eq!(journal.count_state(ActionState::Committed).await.unwrap(), 1);
    }
}
