//! Configuration management
//!
//! Loads the improvement-loop configuration from a TOML file. Every option
//! has a default; a missing file or section is equivalent to all defaults and
//! is never a startup failure.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Improvement loop settings
    #[serde(default)]
    pub improvement: ImprovementConfig,
    /// Storage locations
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Which direction a metric degrades in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricDirection {
    /// Larger values are worse (e.g. response_time, error_rate)
    HigherIsWorse,
    /// Smaller values are worse (e.g. satisfaction)
    LowerIsWorse,
}

/// Per-metric alert threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricThreshold {
    /// Absolute value beyond which the metric is considered degraded
    pub threshold: f64,
    /// Degrading direction for this metric
    pub direction: MetricDirection,
}

/// Settings governing the self-improvement control loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementConfig {
    /// Master switch for automatic cycles
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds between scheduled improvement cycles
    #[serde(default = "default_reflection_interval")]
    pub reflection_interval_secs: u64,
    /// Minimum opportunity score worth acting on
    #[serde(default = "default_improvement_threshold")]
    pub improvement_threshold: f64,
    /// Hard cap on actions per cycle
    #[serde(default = "default_max_actions")]
    pub max_actions_per_cycle: usize,
    /// Reject code modifications that carry no test signal
    #[serde(default)]
    pub require_test_suite: bool,
    /// Roll back automatically when the monitor detects a regression
    #[serde(default = "default_rollback_on_regression")]
    pub rollback_on_regression: bool,
    /// Fraction of traffic routed through a change during canary (0-1)
    #[serde(default = "default_canary_fraction")]
    pub canary_fraction: f64,
    /// Seconds a change stays in canary before the commit decision
    #[serde(default = "default_canary_window")]
    pub canary_window_secs: u64,
    /// Seconds of post-commit observation during which regressions still
    /// trigger rollback
    #[serde(default = "default_soak_period")]
    pub soak_period_secs: u64,
    /// Wall-clock budget for one cycle; unreached actions are deferred
    #[serde(default = "default_cycle_budget")]
    pub cycle_budget_secs: u64,
    /// Minimum recorded interactions before a cycle is attempted
    #[serde(default = "default_min_interactions")]
    pub min_interactions: usize,
    /// Seconds between degradation-monitor comparisons
    #[serde(default = "default_monitor_poll")]
    pub monitor_poll_secs: u64,
    /// Number of time buckets used for trend-slope estimation
    #[serde(default = "default_trend_buckets")]
    pub trend_buckets: usize,
    /// Multiplier tightening thresholds during canary/soak monitoring
    #[serde(default = "default_canary_threshold_factor")]
    pub canary_threshold_factor: f64,
    /// Maximum relative parameter change accepted by validation
    #[serde(default = "default_max_parameter_delta")]
    pub max_parameter_delta: f64,
    /// Maximum code-modification size in lines
    #[serde(default = "default_max_diff_lines")]
    pub max_diff_lines: usize,
    /// Maximum bytes a prompt may grow by in one action
    #[serde(default = "default_max_prompt_growth")]
    pub max_prompt_growth: usize,
    /// Seconds of history analyzed per cycle
    #[serde(default = "default_analysis_window")]
    pub analysis_window_secs: u64,
    /// Per-metric alert thresholds
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<String, MetricThreshold>,
}

fn default_enabled() -> bool {
    true
}

fn default_reflection_interval() -> u64 {
    3600
}

fn default_improvement_threshold() -> f64 {
    0.05
}

fn default_max_actions() -> usize {
    3
}

fn default_rollback_on_regression() -> bool {
    true
}

fn default_canary_fraction() -> f64 {
    0.1
}

fn default_canary_window() -> u64 {
    300
}

fn default_soak_period() -> u64 {
    600
}

fn default_cycle_budget() -> u64 {
    1800
}

fn default_min_interactions() -> usize {
    10
}

fn default_monitor_poll() -> u64 {
    30
}

fn default_trend_buckets() -> usize {
    20
}

fn default_canary_threshold_factor() -> f64 {
    0.8
}

fn default_max_parameter_delta() -> f64 {
    0.5
}

fn default_max_diff_lines() -> usize {
    200
}

fn default_max_prompt_growth() -> usize {
    4096
}

fn default_analysis_window() -> u64 {
    86_400
}

fn default_thresholds() -> BTreeMap<String, MetricThreshold> {
    let mut map = BTreeMap::new();
    map.insert(
        "response_time".to_string(),
        MetricThreshold {
            threshold: 5000.0,
            direction: MetricDirection::HigherIsWorse,
        },
    );
    map.insert(
        "error_rate".to_string(),
        MetricThreshold {
            threshold: 0.05,
            direction: MetricDirection::HigherIsWorse,
        },
    );
    map.insert(
        "satisfaction".to_string(),
        MetricThreshold {
            threshold: 3.0,
            direction: MetricDirection::LowerIsWorse,
        },
    );
    map
}

impl Default for ImprovementConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            reflection_interval_secs: default_reflection_interval(),
            improvement_threshold: default_improvement_threshold(),
            max_actions_per_cycle: default_max_actions(),
            require_test_suite: false,
            rollback_on_regression: default_rollback_on_regression(),
            canary_fraction: default_canary_fraction(),
            canary_window_secs: default_canary_window(),
            soak_period_secs: default_soak_period(),
            cycle_budget_secs: default_cycle_budget(),
            min_interactions: default_min_interactions(),
            monitor_poll_secs: default_monitor_poll(),
            trend_buckets: default_trend_buckets(),
            canary_threshold_factor: default_canary_threshold_factor(),
            max_parameter_delta: default_max_parameter_delta(),
            max_diff_lines: default_max_diff_lines(),
            max_prompt_growth: default_max_prompt_growth(),
            analysis_window_secs: default_analysis_window(),
            thresholds: default_thresholds(),
        }
    }
}

impl ImprovementConfig {
    pub fn reflection_interval(&self) -> Duration {
        Duration::from_secs(self.reflection_interval_secs)
    }

    pub fn canary_window(&self) -> Duration {
        Duration::from_secs(self.canary_window_secs)
    }

    pub fn soak_period(&self) -> Duration {
        Duration::from_secs(self.soak_period_secs)
    }

    pub fn cycle_budget(&self) -> Duration {
        Duration::from_secs(self.cycle_budget_secs)
    }

    pub fn monitor_poll(&self) -> Duration {
        Duration::from_secs(self.monitor_poll_secs)
    }

    pub fn analysis_window(&self) -> Duration {
        Duration::from_secs(self.analysis_window_secs)
    }
}

/// Storage locations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Override for the data directory; defaults to the platform data dir
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the data directory, creating it if needed
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        let dir = match &self.data_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("kaizen"),
        };
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        Ok(dir)
    }
}

/// Default config file location
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kaizen")
        .join("config.toml")
}

impl Config {
    /// Load configuration from the given path, or the default location.
    /// A missing file yields all defaults.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let path = path.map(PathBuf::from).unwrap_or_else(config_path);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config =
            Config::load(Some(std::path::Path::new("/nonexistent/config.toml"))).unwrap();
        assert!(config.improvement.enabled);
        assert_eq!(config.improvement.max_actions_per_cycle, 3);
        assert_eq!(config.improvement.improvement_threshold, 0.05);
        assert_eq!(config.improvement.reflection_interval_secs, 3600);
        assert!(config.improvement.rollback_on_regression);
    }

    #[test]
    fn test_default_thresholds() {
        let config = ImprovementConfig::default();
        let rt = config.thresholds.get("response_time").unwrap();
        assert_eq!(rt.threshold, 5000.0);
        assert_eq!(rt.direction, MetricDirection::HigherIsWorse);
        let sat = config.thresholds.get("satisfaction").unwrap();
        assert_eq!(sat.direction, MetricDirection::LowerIsWorse);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [improvement]
            max_actions_per_cycle = 5
            "#,
        )
        .unwrap();
        assert_eq!(parsed.improvement.max_actions_per_cycle, 5);
        assert!(parsed.improvement.enabled);
        assert!(parsed.improvement.thresholds.contains_key("error_rate"));
    }
}
