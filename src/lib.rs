//! Kaizen - self-improvement control loop for a conversational agent
//!
//! Observes interaction metrics, reflects on trends, and applies small,
//! reversible changes to the agent's runtime profile:
//! - Metrics store and trend analysis over recorded interactions
//! - Learning memory of past improvement attempts
//! - Reflection engine that turns reports into bounded action plans
//! - Safety guardrails: validation, canary/soak monitoring, emergency rollback
//! - Durable action journal with crash recovery
//!
//! # Example
//!
//! ```ignore
//! use kaizen::config::Config;
//! use kaizen::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let orchestrator = Orchestrator::open(&config).await?;
//!     let outcome = orchestrator.trigger_manual_cycle().await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod memory; // Must come before reflection since reflection depends on it
pub mod actions;
pub mod reflection;
pub mod safety;
pub mod orchestrator;
pub mod cli;

// Re-export commonly used types for convenience
pub use actions::{ActionJournal, ImprovementAction, RuntimeProfile};
pub use config::Config;
pub use error::{ImprovementError, Result};
pub use memory::LearningMemory;
pub use metrics::{Interaction, MetricsStore, PerformanceReport, TrendAnalyzer};
pub use orchestrator::{CycleOutcome, CycleStats, Orchestrator, StatusReport};
pub use reflection::ReflectionEngine;
pub use safety::SafetyGuardrails;

pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name and version string for logs and the status view
pub fn info() -> String {
    format!("{} {}", NAME, VERSION)
}
