//! Improvement actions - typed, reversible units of change
//!
//! Four variants (prompt, code, parameter, tool) behind one execute/rollback
//! contract. Every action captures the pre-image of whatever it touches at
//! proposal time, so rollback restores byte-identical prior state from the
//! action's own stored data even if the target has drifted since.

pub mod journal;
pub mod profile;

pub use journal::{ActionJournal, RecoveryStats};
pub use profile::{CanaryState, RuntimeProfile, ToolDefinition};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ImprovementError, Result};

/// Action variant tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    PromptTuning,
    CodeModification,
    ParameterAdjustment,
    ToolOptimization,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::PromptTuning => write!(f, "prompt_tuning"),
            ActionKind::CodeModification => write!(f, "code_modification"),
            ActionKind::ParameterAdjustment => write!(f, "parameter_adjustment"),
            ActionKind::ToolOptimization => write!(f, "tool_optimization"),
        }
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "prompt_tuning" => Ok(ActionKind::PromptTuning),
            "code_modification" => Ok(ActionKind::CodeModification),
            "parameter_adjustment" => Ok(ActionKind::ParameterAdjustment),
            "tool_optimization" => Ok(ActionKind::ToolOptimization),
            other => Err(format!("unknown action kind '{other}'")),
        }
    }
}

/// Lifecycle state. Rejected, Committed, and RolledBack are terminal, though
/// a committed action may still transition to RolledBack if the soak monitor
/// catches a late regression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Proposed,
    Validated,
    Rejected,
    Committed,
    RolledBack,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionState::Rejected | ActionState::Committed | ActionState::RolledBack
        )
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionState::Proposed => write!(f, "proposed"),
            ActionState::Validated => write!(f, "validated"),
            ActionState::Rejected => write!(f, "rejected"),
            ActionState::Committed => write!(f, "committed"),
            ActionState::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// The concrete change an action applies, with everything needed to invert it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionChange {
    PromptTuning {
        prompt: String,
        old_text: String,
        new_text: String,
    },
    ParameterAdjustment {
        parameter: String,
        old_value: f64,
        new_value: f64,
    },
    CodeModification {
        path: String,
        /// File content before the change; None when the file did not exist
        pre_image: Option<String>,
        new_content: String,
        /// Whether a test suite signal was available at proposal time
        test_signal: bool,
    },
    ToolOptimization {
        tool: String,
        /// Definition before the change; None when the tool was new
        old_def: Option<ToolDefinition>,
        new_def: ToolDefinition,
    },
}

/// Result of one execute call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub success: bool,
    /// Metrics measured right after execution, when any were taken
    pub metrics: HashMap<String, f64>,
    pub error: Option<String>,
}

impl ActionResult {
    fn ok() -> Self {
        Self {
            success: true,
            metrics: HashMap::new(),
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            metrics: HashMap::new(),
            error: Some(error.into()),
        }
    }
}

/// One reversible unit of change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementAction {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// What the action targets, e.g. "prompt:system" or "tool:shell"
    pub target: String,
    pub rationale: String,
    pub change: ActionChange,
    pub state: ActionState,
    /// Set once execute has applied the change; guards reentrancy and makes
    /// rollback a no-op for never-executed actions
    pub executed: bool,
}

impl ImprovementAction {
    pub fn new(target: &str, rationale: &str, change: ActionChange) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            target: target.to_string(),
            rationale: rationale.to_string(),
            change,
            state: ActionState::Proposed,
            executed: false,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self.change {
            ActionChange::PromptTuning { .. } => ActionKind::PromptTuning,
            ActionChange::ParameterAdjustment { .. } => ActionKind::ParameterAdjustment,
            ActionChange::CodeModification { .. } => ActionKind::CodeModification,
            ActionChange::ToolOptimization { .. } => ActionKind::ToolOptimization,
        }
    }

    /// One-line human-readable summary
    pub fn describe(&self) -> String {
        match &self.change {
            ActionChange::PromptTuning { prompt, .. } => {
                format!("tune prompt '{}'", prompt)
            }
            ActionChange::ParameterAdjustment {
                parameter,
                old_value,
                new_value,
            } => format!("adjust parameter '{}' {} -> {}", parameter, old_value, new_value),
            ActionChange::CodeModification { path, .. } => {
                format!("modify code '{}'", path)
            }
            ActionChange::ToolOptimization { tool, .. } => {
                format!("optimize tool '{}'", tool)
            }
        }
    }

    /// Apply the change to the runtime profile. Not reentrant: a second call
    /// on the same instance is a programming error, reported as an error
    /// rather than silently repeated.
    pub async fn execute(&mut self, profile: &RuntimeProfile) -> Result<ActionResult> {
        if self.executed {
            return Err(ImprovementError::Execution {
                detail: format!("execute invoked twice on action {}", self.id),
            });
        }

        let result = match &self.change {
            ActionChange::PromptTuning { prompt, new_text, .. } => {
                if profile.get_prompt(prompt).await.is_none() {
                    ActionResult::failed(format!("prompt '{}' not found", prompt))
                } else {
                    profile.set_prompt(prompt, new_text).await?;
                    ActionResult::ok()
                }
            }
            ActionChange::ParameterAdjustment {
                parameter,
                new_value,
                ..
            } => {
                if profile.get_parameter(parameter).await.is_none() {
                    ActionResult::failed(format!("unknown parameter '{}'", parameter))
                } else {
                    profile.set_parameter(parameter, *new_value).await?;
                    ActionResult::ok()
                }
            }
            ActionChange::CodeModification {
                path, new_content, ..
            } => {
                profile.write_overlay(path, new_content).await?;
                ActionResult::ok()
            }
            ActionChange::ToolOptimization { tool, new_def, .. } => {
                profile.set_tool(tool, new_def.clone()).await?;
                ActionResult::ok()
            }
        };

        if result.success {
            self.executed = true;
            info!("Executed action {}: {}", self.id, self.describe());
        }
        Ok(result)
    }

    /// Restore the pre-image captured at proposal time. A no-op success when
    /// the action never executed or is already rolled back; attempted work
    /// happens at most once per call and the caller must not loop on failure.
    pub async fn rollback(&mut self, profile: &RuntimeProfile) -> bool {
        if self.state == ActionState::RolledBack || !self.executed {
            return true;
        }

        let restored = match &self.change {
            ActionChange::PromptTuning { prompt, old_text, .. } => {
                profile.set_prompt(prompt, old_text).await
            }
            ActionChange::ParameterAdjustment {
                parameter,
                old_value,
                ..
            } => profile.set_parameter(parameter, *old_value).await,
            ActionChange::CodeModification { path, pre_image, .. } => match pre_image {
                Some(content) => profile.write_overlay(path, content).await,
                None => profile.remove_overlay(path).await,
            },
            ActionChange::ToolOptimization { tool, old_def, .. } => match old_def {
                Some(def) => profile.set_tool(tool, def.clone()).await,
                None => profile.remove_tool(tool).await,
            },
        };

        match restored {
            Ok(()) => {
                self.state = ActionState::RolledBack;
                info!("Rolled back action {}: {}", self.id, self.describe());
                true
            }
            Err(e) => {
                warn!("Rollback of action {} failed: {}", self.id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn profile() -> (TempDir, RuntimeProfile) {
        let dir = TempDir::new().unwrap();
        let profile = RuntimeProfile::open(dir.path()).await.unwrap();
        (dir, profile)
    }

    fn prompt_action(old: &str, new: &str) -> ImprovementAction {
        ImprovementAction::new(
            "prompt:system",
            "satisfaction declining",
            ActionChange::PromptTuning {
                prompt: "system".to_string(),
                old_text: old.to_string(),
                new_text: new.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_execute_and_rollback_restores_byte_identical_state() {
        let (_dir, profile) = profile().await;
        let original = profile.get_prompt("system").await.unwrap();

        let mut action = prompt_action(&original, "Be warmer and more thorough.");
        let result = action.execute(&profile).await.unwrap();
        assert!(result.success);
        assert_eq!(
            profile.get_prompt("system").await.unwrap(),
            "Be warmer and more thorough."
        );

        assert!(action.rollback(&profile).await);
        assert_eq!(profile.get_prompt("system").await.unwrap(), original);
        assert_eq!(action.state, ActionState::RolledBack);
    }

    #[tokio::test]
    async fn test_execute_is_not_reentrant() {
        let (_dir, profile) = profile().await;
        let original = profile.get_prompt("system").await.unwrap();

        let mut action = prompt_action(&original, "new text");
        action.execute(&profile).await.unwrap();

        let second = action.execute(&profile).await;
        assert!(matches!(
            second,
            Err(ImprovementError::Execution { .. })
        ));
    }

    #[tokio::test]
    async fn test_rollback_is_noop_when_never_executed() {
        let (_dir, profile) = profile().await;
        let before = profile.get_prompt("system").await.unwrap();

        let mut action = prompt_action(&before, "unused");
        assert!(action.rollback(&profile).await);
        assert_eq!(profile.get_prompt("system").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_rollback_is_idempotent() {
        let (_dir, profile) = profile().await;
        let original = profile.get_prompt("system").await.unwrap();

        let mut action = prompt_action(&original, "changed");
        action.execute(&profile).await.unwrap();
        assert!(action.rollback(&profile).await);

        // Second rollback: no-op success, not a second reversal
        profile.set_prompt("system", "operator edit").await.unwrap();
        assert!(action.rollback(&profile).await);
        assert_eq!(profile.get_prompt("system").await.unwrap(), "operator edit");
    }

    #[tokio::test]
    async fn test_failed_execute_reports_failure_without_marking_executed() {
        let (_dir, profile) = profile().await;

        let mut action = ImprovementAction::new(
            "parameter:does_not_exist",
            "test",
            ActionChange::ParameterAdjustment {
                parameter: "does_not_exist".to_string(),
                old_value: 1.0,
                new_value: 2.0,
            },
        );
        let result = action.execute(&profile).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("unknown parameter"));
        assert!(!action.executed);
    }

    #[tokio::test]
    async fn test_tool_optimization_rollback_removes_new_tool() {
        let (_dir, profile) = profile().await;

        let mut action = ImprovementAction::new(
            "tool:summarizer",
            "register new tool",
            ActionChange::ToolOptimization {
                tool: "summarizer".to_string(),
                old_def: None,
                new_def: ToolDefinition {
                    command: "summarize".to_string(),
                    timeout_ms: 5000,
                    max_retries: 1,
                    enabled: true,
                },
            },
        );
        action.execute(&profile).await.unwrap();
        assert!(profile.get_tool("summarizer").await.is_some());

        assert!(action.rollback(&profile).await);
        assert!(profile.get_tool("summarizer").await.is_none());
    }

    #[tokio::test]
    async fn test_code_modification_rollback_restores_pre_image() {
        let (_dir, profile) = profile().await;
        profile.write_overlay("patch.rs", "fn old() {}").await.unwrap();

        let mut action = ImprovementAction::new(
            "code:patch.rs",
            "rewrite",
            ActionChange::CodeModification {
                path: "patch.rs".to_string(),
                pre_image: Some("fn old() {}".to_string()),
                new_content: "fn new() {}".to_string(),
                test_signal: true,
            },
        );
        action.execute(&profile).await.unwrap();
        assert_eq!(
            profile.read_overlay("patch.rs").await.unwrap().as_deref(),
            Some("fn new() {}")
        );

        assert!(action.rollback(&profile).await);
        assert_eq!(
            profile.read_overlay("patch.rs").await.unwrap().as_deref(),
            Some("fn old() {}")
        );
    }
}
