//! Runtime profile - the mutable surface improvement actions act on
//!
//! Holds the agent's prompt templates, tunable parameters, tool definitions,
//! and a managed code overlay directory. The conversational path reads this
//! profile; the improvement loop is its only writer. Every mutation is
//! persisted immediately so a restart never observes a half-applied change
//! that the action journal does not know about.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ImprovementError, Result};

/// Definition of one callable tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Command or endpoint backing the tool
    pub command: String,
    /// Per-invocation timeout
    pub timeout_ms: u64,
    /// Retries on transient failure
    pub max_retries: u32,
    pub enabled: bool,
}

/// Canary routing state consulted by the conversational path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanaryState {
    /// Action currently under canary
    pub action_id: String,
    /// Fraction of traffic routed through the changed behavior (0-1)
    pub fraction: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ProfileData {
    #[serde(default)]
    prompts: BTreeMap<String, String>,
    #[serde(default)]
    parameters: BTreeMap<String, f64>,
    #[serde(default)]
    tools: BTreeMap<String, ToolDefinition>,
    #[serde(default)]
    canary: Option<CanaryState>,
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer concisely, \
use tools when they help, and say so when you do not know.";

impl ProfileData {
    fn seeded() -> Self {
        let mut prompts = BTreeMap::new();
        prompts.insert("system".to_string(), DEFAULT_SYSTEM_PROMPT.to_string());

        let mut parameters = BTreeMap::new();
        parameters.insert("temperature".to_string(), 0.7);
        parameters.insert("max_output_tokens".to_string(), 1024.0);
        parameters.insert("retrieval_depth".to_string(), 4.0);

        let mut tools = BTreeMap::new();
        tools.insert(
            "web_search".to_string(),
            ToolDefinition {
                command: "search".to_string(),
                timeout_ms: 10_000,
                max_retries: 1,
                enabled: true,
            },
        );
        tools.insert(
            "shell".to_string(),
            ToolDefinition {
                command: "sh".to_string(),
                timeout_ms: 30_000,
                max_retries: 0,
                enabled: true,
            },
        );

        Self {
            prompts,
            parameters,
            tools,
            canary: None,
        }
    }
}

/// Durable, JSON-backed runtime profile
#[derive(Clone)]
pub struct RuntimeProfile {
    data: Arc<RwLock<ProfileData>>,
    path: PathBuf,
    overlay_dir: PathBuf,
}

impl RuntimeProfile {
    /// Open the profile under the given data directory, seeding defaults on
    /// first use
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let path = data_dir.join("profile.json");
        let overlay_dir = data_dir.join("overlay");
        tokio::fs::create_dir_all(&overlay_dir).await?;

        let data = if path.exists() {
            let json = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&json)?
        } else {
            ProfileData::seeded()
        };

        let profile = Self {
            data: Arc::new(RwLock::new(data)),
            path,
            overlay_dir,
        };
        profile.persist().await?;
        Ok(profile)
    }

    async fn persist(&self) -> Result<()> {
        let data = self.data.read().await;
        let json = serde_json::to_string_pretty(&*data)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    // --- Prompts ---

    pub async fn get_prompt(&self, name: &str) -> Option<String> {
        self.data.read().await.prompts.get(name).cloned()
    }

    pub async fn set_prompt(&self, name: &str, text: &str) -> Result<()> {
        {
            let mut data = self.data.write().await;
            data.prompts.insert(name.to_string(), text.to_string());
        }
        debug!("Updated prompt '{}'", name);
        self.persist().await
    }

    // --- Parameters ---

    pub async fn get_parameter(&self, name: &str) -> Option<f64> {
        self.data.read().await.parameters.get(name).copied()
    }

    pub async fn set_parameter(&self, name: &str, value: f64) -> Result<()> {
        {
            let mut data = self.data.write().await;
            data.parameters.insert(name.to_string(), value);
        }
        debug!("Updated parameter '{}' to {}", name, value);
        self.persist().await
    }

    // --- Tools ---

    pub async fn get_tool(&self, name: &str) -> Option<ToolDefinition> {
        self.data.read().await.tools.get(name).cloned()
    }

    pub async fn set_tool(&self, name: &str, def: ToolDefinition) -> Result<()> {
        {
            let mut data = self.data.write().await;
            data.tools.insert(name.to_string(), def);
        }
        debug!("Updated tool '{}'", name);
        self.persist().await
    }

    pub async fn remove_tool(&self, name: &str) -> Result<()> {
        {
            let mut data = self.data.write().await;
            data.tools.remove(name);
        }
        self.persist().await
    }

    // --- Canary routing ---

    pub async fn canary(&self) -> Option<CanaryState> {
        self.data.read().await.canary.clone()
    }

    pub async fn set_canary(&self, action_id: &str, fraction: f64) -> Result<()> {
        {
            let mut data = self.data.write().await;
            data.canary = Some(CanaryState {
                action_id: action_id.to_string(),
                fraction: fraction.clamp(0.0, 1.0),
            });
        }
        self.persist().await
    }

    /// Clear canary routing; the applied change becomes fully live
    pub async fn clear_canary(&self) -> Result<()> {
        {
            let mut data = self.data.write().await;
            data.canary = None;
        }
        self.persist().await
    }

    // --- Code overlay ---

    fn overlay_path(&self, rel: &str) -> Result<PathBuf> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ImprovementError::Execution {
                detail: format!("overlay path escapes the managed directory: {rel}"),
            });
        }
        Ok(self.overlay_dir.join(rel_path))
    }

    pub async fn overlay_exists(&self, rel: &str) -> bool {
        match self.overlay_path(rel) {
            Ok(path) => path.exists(),
            Err(_) => false,
        }
    }

    pub async fn read_overlay(&self, rel: &str) -> Result<Option<String>> {
        let path = self.overlay_path(rel)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(tokio::fs::read_to_string(&path).await?))
    }

    pub async fn write_overlay(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.overlay_path(rel)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        debug!("Wrote overlay file '{}'", rel);
        Ok(())
    }

    pub async fn remove_overlay(&self, rel: &str) -> Result<()> {
        let path = self.overlay_path(rel)?;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_seeds_defaults_and_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let profile = RuntimeProfile::open(dir.path()).await.unwrap();
            assert!(profile.get_prompt("system").await.is_some());
            assert_eq!(profile.get_parameter("temperature").await, Some(0.7));
            profile.set_parameter("temperature", 0.4).await.unwrap();
        }
        let reopened = RuntimeProfile::open(dir.path()).await.unwrap();
        assert_eq!(reopened.get_parameter("temperature").await, Some(0.4));
    }

    #[tokio::test]
    async fn test_canary_roundtrip() {
        let dir = TempDir::new().unwrap();
        let profile = RuntimeProfile::open(dir.path()).await.unwrap();
        assert!(profile.canary().await.is_none());

        profile.set_canary("a-1", 0.25).await.unwrap();
        let canary = profile.canary().await.unwrap();
        assert_eq!(canary.action_id, "a-1");
        assert_eq!(canary.fraction, 0.25);

        profile.clear_canary().await.unwrap();
        assert!(profile.canary().await.is_none());
    }

    #[tokio::test]
    async fn test_overlay_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let profile = RuntimeProfile::open(dir.path()).await.unwrap();

        assert!(profile.write_overlay("../escape.rs", "x").await.is_err());
        assert!(profile.write_overlay("/etc/passwd", "x").await.is_err());

        profile.write_overlay("mod/patch.rs", "fn x() {}").await.unwrap();
        assert_eq!(
            profile.read_overlay("mod/patch.rs").await.unwrap().as_deref(),
            Some("fn x() {}")
        );
        profile.remove_overlay("mod/patch.rs").await.unwrap();
        assert!(profile.read_overlay("mod/patch.rs").await.unwrap().is_none());
    }
}
