//! Safety guardrails - validation, degradation monitoring, emergency rollback
//!
//! Every proposed action passes through validation before it may execute.
//! While a change is live under canary or soak, a background monitor polls
//! recent metrics against the pre-change baseline with tightened thresholds
//! and streams alerts back to the cycle. A rollback that fails raises a
//! persistent halt flag; automatic cycles stay disabled until an operator
//! clears it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionChange, ImprovementAction, RuntimeProfile};
use crate::config::ImprovementConfig;
use crate::error::{ImprovementError, Result};
use crate::metrics::{PerformanceReport, RegressionAlert, TrendAnalyzer};

/// Verdict of pre-execution validation
#[derive(Debug, Clone)]
pub struct Validation {
    pub approved: bool,
    /// Why the verdict came out this way; populated for approvals too
    pub reason: String,
    /// Relative scope of the change: 1 prompt/parameter, 2 tool, 3 code
    pub blast_radius: u8,
}

impl Validation {
    fn approve(blast_radius: u8) -> Self {
        Self {
            approved: true,
            reason: "within configured limits".to_string(),
            blast_radius,
        }
    }

    fn reject(blast_radius: u8, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
            blast_radius,
        }
    }
}

/// Handle to a running degradation monitor. Dropping it without calling
/// [`MonitorHandle::stop`] aborts the task.
pub struct MonitorHandle {
    /// Alerts stream in as the monitor detects them
    pub alerts: mpsc::Receiver<RegressionAlert>,
    cancel: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Cancel the monitor and wait for its task to finish
    pub async fn stop(mut self) {
        let _ = self.cancel.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}

/// Persistent marker that disables automatic cycles after a failed rollback.
/// Survives restarts; only an explicit operator action clears it.
#[derive(Clone)]
pub struct HaltFlag {
    path: PathBuf,
}

impl HaltFlag {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("halted.flag"),
        }
    }

    pub async fn raise(&self, reason: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, reason).await?;
        error!("Improvement loop halted: {}", reason);
        Ok(())
    }

    pub async fn is_raised(&self) -> bool {
        self.path.exists()
    }

    pub async fn reason(&self) -> Option<String> {
        tokio::fs::read_to_string(&self.path).await.ok()
    }

    /// Operator acknowledgment; clears the flag so cycles may resume
    pub async fn clear(&self) -> Result<()> {
        if self.path.exists() {
            tokio::fs::remove_file(&self.path).await?;
            info!("Halt flag cleared");
        }
        Ok(())
    }
}

/// Pre-execution validation and live degradation monitoring
#[derive(Clone)]
pub struct SafetyGuardrails {
    config: Arc<ImprovementConfig>,
    analyzer: TrendAnalyzer,
    halt: HaltFlag,
}

impl SafetyGuardrails {
    pub fn new(config: Arc<ImprovementConfig>, analyzer: TrendAnalyzer, halt: HaltFlag) -> Self {
        Self {
            config,
            analyzer,
            halt,
        }
    }

    pub fn halt_flag(&self) -> &HaltFlag {
        &self.halt
    }

    /// Check a proposed action against the configured safety limits. Pure
    /// with respect to the action; never mutates it.
    pub fn validate_improvement(&self, action: &ImprovementAction) -> Validation {
        match &action.change {
            ActionChange::ParameterAdjustment {
                parameter,
                old_value,
                new_value,
            } => {
                let relative = (new_value - old_value).abs() / old_value.abs().max(f64::EPSILON);
                if relative > self.config.max_parameter_delta {
                    return Validation::reject(
                        1,
                        format!(
                            "parameter '{}' change of {:.0}% exceeds the {:.0}% limit",
                            parameter,
                            relative * 100.0,
                            self.config.max_parameter_delta * 100.0
                        ),
                    );
                }
                Validation::approve(1)
            }
            ActionChange::PromptTuning {
                prompt,
                old_text,
                new_text,
            } => {
                let growth = new_text.len().saturating_sub(old_text.len());
                if growth > self.config.max_prompt_growth {
                    return Validation::reject(
                        1,
                        format!(
                            "prompt '{}' would grow by {} bytes, over the {} byte limit",
                            prompt, growth, self.config.max_prompt_growth
                        ),
                    );
                }
                Validation::approve(1)
            }
            ActionChange::ToolOptimization { new_def, .. } => {
                if new_def.timeout_ms == 0 {
                    return Validation::reject(2, "tool timeout of zero would hang invocations");
                }
                Validation::approve(2)
            }
            ActionChange::CodeModification {
                pre_image,
                new_content,
                test_signal,
                ..
            } => {
                if self.config.require_test_suite && !test_signal {
                    return Validation::reject(3, "missing test suite");
                }
                let diff = diff_line_count(pre_image.as_deref().unwrap_or(""), new_content);
                if diff > self.config.max_diff_lines {
                    return Validation::reject(
                        3,
                        format!(
                            "change touches {} lines, over the {} line limit",
                            diff, self.config.max_diff_lines
                        ),
                    );
                }
                Validation::approve(3)
            }
        }
    }

    /// Spawn a background task that polls recent metrics against the given
    /// baseline with thresholds tightened by the canary factor, streaming any
    /// alerts to the returned handle. The monitor stops when cancelled or
    /// when the receiver is dropped.
    pub fn monitor_degradation(
        &self,
        baseline: PerformanceReport,
        lookback: Duration,
        poll: Duration,
    ) -> MonitorHandle {
        let (alert_tx, alert_rx) = mpsc::channel(16);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let analyzer = self.analyzer.clone();
        let factor = self.config.canary_threshold_factor;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so the change has at
            // least one poll interval to accumulate samples
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        debug!("Degradation monitor cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = match analyzer.analyze(lookback).await {
                            Ok(report) => report,
                            Err(e) => {
                                warn!("Degradation monitor query failed: {}", e);
                                continue;
                            }
                        };
                        for alert in analyzer.detect_with_factor(&report, &baseline, factor) {
                            warn!(
                                "Degradation while monitoring: {} at {:.2}",
                                alert.metric, alert.current
                            );
                            if alert_tx.send(alert).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        MonitorHandle {
            alerts: alert_rx,
            cancel: cancel_tx,
            task: Some(task),
        }
    }

    /// Roll back a live action once. On failure the halt flag is raised and
    /// the error is returned; the caller must not retry.
    pub async fn emergency_rollback(
        &self,
        action: &mut ImprovementAction,
        profile: &RuntimeProfile,
    ) -> Result<()> {
        if action.rollback(profile).await {
            return Ok(());
        }
        let detail = format!(
            "rollback of '{}' did not restore prior state",
            action.describe()
        );
        self.halt
            .raise(&format!("action {}: {}", action.id, detail))
            .await?;
        Err(ImprovementError::RollbackFailed {
            action_id: action.id.clone(),
            detail,
        })
    }
}

/// Positional line diff size: changed lines plus the length difference
fn diff_line_count(old: &str, new: &str) -> usize {
    let old: Vec<&str> = old.lines().collect();
    let new: Vec<&str> = new.lines().collect();
    let shared = old.len().min(new.len());
    let mut changed = old.len().abs_diff(new.len());
    for i in 0..shared {
        if old[i] != new[i] {
            changed += 1;
        }
    }
    changed
}
