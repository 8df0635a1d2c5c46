//! Reflection engine - turns performance reports into bounded plans
//!
//! Three stages: synthesize insights from a report, map insights to scored
//! improvement opportunities (consulting learning memory so that recently
//! failed attempts of the same shape are penalized), and greedily materialize
//! the best opportunities into concrete, reversible actions. Plan generation
//! is deterministic: identical report and memory contents always produce the
//! same plan, so cycles are reproducible.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::actions::{ActionChange, ActionKind, ImprovementAction, RuntimeProfile};
use crate::config::{ImprovementConfig, MetricDirection};
use crate::error::Result;
use crate::memory::LearningMemory;
use crate::metrics::{PerformanceReport, Severity};

/// How far back a failure experience suppresses a similar opportunity
const FAILURE_LOOKBACK: Duration = Duration::from_secs(7 * 24 * 3600);

/// Score multiplier applied once per recent failure on the same target
const FAILURE_PENALTY: f64 = 0.5;

/// Guidance block appended to the system prompt by a prompt-tuning action
const PROMPT_GUIDANCE: &str = "Before answering, restate the user's goal in one \
sentence and check that the answer addresses it directly.";

/// One synthesized observation about the report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    pub kind: InsightKind,
    /// Metric this insight is about, when it is about one
    pub metric: Option<String>,
    pub severity: Option<Severity>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    /// A metric crossed its threshold
    Regression,
    /// A metric is sliding in its degrading direction
    DegradingTrend,
    /// A metric is moving the right way
    ImprovingTrend,
    /// General commentary on the window
    Summary,
}

/// Per-cycle reflection over one report. Ephemeral.
#[derive(Debug, Clone)]
pub struct Reflection {
    pub report: PerformanceReport,
    pub insights: Vec<Insight>,
}

/// A candidate change, scored by expected impact weighted by confidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImprovementOpportunity {
    /// e.g. "prompt:system", "parameter:max_output_tokens"
    pub target: String,
    pub kind: ActionKind,
    pub rationale: String,
    pub expected_impact: String,
    pub score: f64,
}

/// A bounded, ordered sequence of concrete actions for one cycle
#[derive(Debug, Clone)]
pub struct Plan {
    pub actions: Vec<ImprovementAction>,
    /// Context snapshot recorded with every experience from this cycle
    pub context: HashMap<String, String>,
    pub max_actions: usize,
}

/// Synthesizes insights, opportunities, and plans
#[derive(Clone)]
pub struct ReflectionEngine {
    config: Arc<ImprovementConfig>,
    memory: LearningMemory,
    profile: RuntimeProfile,
}

impl ReflectionEngine {
    pub fn new(
        config: Arc<ImprovementConfig>,
        memory: LearningMemory,
        profile: RuntimeProfile,
    ) -> Self {
        Self {
            config,
            memory,
            profile,
        }
    }

    /// Pure function of the report: one insight per regression alert plus
    /// trend commentary. No side effects.
    pub fn analyze_performance(&self, report: &PerformanceReport) -> Reflection {
        let mut insights = Vec::new();

        for alert in &report.alerts {
            insights.push(Insight {
                kind: InsightKind::Regression,
                metric: Some(alert.metric.clone()),
                severity: Some(alert.severity),
                text: format!(
                    "{} is at {:.1}, past its threshold of {:.1} ({} regression)",
                    alert.metric, alert.current, alert.threshold, alert.severity
                ),
            });
        }

        for (metric, stats) in &report.stats {
            let slope_epsilon = stats.mean.abs().max(1.0) * 0.01 / self.config.trend_buckets as f64;
            if stats.slope.abs() <= slope_epsilon {
                continue;
            }
            let degrading = match self.config.thresholds.get(metric).map(|t| t.direction) {
                Some(MetricDirection::HigherIsWorse) => stats.slope > 0.0,
                Some(MetricDirection::LowerIsWorse) => stats.slope < 0.0,
                // Untracked metrics get commentary only, never a degrading call
                None => false,
            };
            insights.push(Insight {
                kind: if degrading {
                    InsightKind::DegradingTrend
                } else {
                    InsightKind::ImprovingTrend
                },
                metric: Some(metric.clone()),
                severity: None,
                text: format!(
                    "{} is trending {} (slope {:+.3} per bucket over {} samples)",
                    metric,
                    if stats.slope > 0.0 { "up" } else { "down" },
                    stats.slope,
                    stats.samples
                ),
            });
        }

        insights.push(Insight {
            kind: InsightKind::Summary,
            metric: None,
            severity: None,
            text: format!(
                "{} interactions between {} and {}",
                report.interaction_count, report.window_start, report.window_end
            ),
        });

        Reflection {
            report: report.clone(),
            insights,
        }
    }

    /// Map insights to scored opportunities. An opportunity whose target has
    /// recent failure experiences is penalized in score, not discarded.
    pub async fn identify_improvement_opportunities(
        &self,
        reflection: &Reflection,
    ) -> Result<Vec<ImprovementOpportunity>> {
        // Deduplicate by target, keeping the highest-scoring proposal
        let mut by_target: BTreeMap<String, ImprovementOpportunity> = BTreeMap::new();

        for insight in &reflection.insights {
            let Some(metric) = &insight.metric else {
                continue;
            };
            let base = match insight.kind {
                InsightKind::Regression => match insight.severity {
                    Some(Severity::Severe) => 0.9,
                    Some(Severity::Moderate) => 0.6,
                    _ => 0.35,
                },
                InsightKind::DegradingTrend => 0.2,
                _ => continue,
            };
            let confidence = reflection
                .report
                .stats
                .get(metric)
                .map(|s| (s.samples as f64 / 50.0).clamp(0.2, 1.0))
                .unwrap_or(0.2);

            let Some(mut opportunity) = proposal_for(metric, &insight.text) else {
                continue;
            };
            opportunity.score = base * confidence;

            match by_target.get(&opportunity.target) {
                Some(existing) if existing.score >= opportunity.score => {}
                _ => {
                    by_target.insert(opportunity.target.clone(), opportunity);
                }
            }
        }

        let mut opportunities: Vec<ImprovementOpportunity> = by_target.into_values().collect();

        for opportunity in &mut opportunities {
            let failures = self
                .memory
                .recent_failures(&opportunity.target, FAILURE_LOOKBACK)
                .await?;
            if !failures.is_empty() {
                let penalty = FAILURE_PENALTY.powi(failures.len().min(3) as i32);
                debug!(
                    "Penalizing {} by {:.3} for {} recent failures",
                    opportunity.target,
                    penalty,
                    failures.len()
                );
                opportunity.score *= penalty;
            }
        }

        sort_opportunities(&mut opportunities);
        Ok(opportunities)
    }

    /// Greedily select opportunities by descending score until the per-cycle
    /// cap is reached or scores fall below the improvement threshold, then
    /// materialize each into a concrete action with its pre-image captured
    /// now, at proposal time.
    pub async fn generate_improvement_plan(
        &self,
        opportunities: Vec<ImprovementOpportunity>,
    ) -> Result<Plan> {
        let mut opportunities = opportunities;
        sort_opportunities(&mut opportunities);

        let mut context = HashMap::new();
        context.insert(
            "triggers".to_string(),
            opportunities
                .iter()
                .map(|o| o.target.as_str())
                .collect::<Vec<_>>()
                .join(","),
        );

        let mut actions = Vec::new();
        for opportunity in opportunities {
            if actions.len() >= self.config.max_actions_per_cycle {
                break;
            }
            if opportunity.score < self.config.improvement_threshold {
                break;
            }
            match self.materialize(&opportunity).await? {
                Some(action) => actions.push(action),
                None => debug!("Opportunity {} not materializable, skipped", opportunity.target),
            }
        }

        Ok(Plan {
            actions,
            context,
            max_actions: self.config.max_actions_per_cycle,
        })
    }

    /// Turn an opportunity into a concrete action, or None when the change
    /// is not applicable right now (e.g. guidance already present)
    async fn materialize(
        &self,
        opportunity: &ImprovementOpportunity,
    ) -> Result<Option<ImprovementAction>> {
        let change = match (opportunity.kind, opportunity.target.as_str()) {
            (ActionKind::ParameterAdjustment, target) => {
                let Some(name) = target.strip_prefix("parameter:") else {
                    return Ok(None);
                };
                let Some(old_value) = self.profile.get_parameter(name).await else {
                    warn!("Parameter '{}' missing from profile, skipping", name);
                    return Ok(None);
                };
                let new_value = match name {
                    "max_output_tokens" => (old_value * 0.8).round().max(128.0),
                    _ => old_value * 0.9,
                };
                if new_value == old_value {
                    return Ok(None);
                }
                ActionChange::ParameterAdjustment {
                    parameter: name.to_string(),
                    old_value,
                    new_value,
                }
            }
            (ActionKind::PromptTuning, target) => {
                let Some(name) = target.strip_prefix("prompt:") else {
                    return Ok(None);
                };
                let Some(old_text) = self.profile.get_prompt(name).await else {
                    warn!("Prompt '{}' missing from profile, skipping", name);
                    return Ok(None);
                };
                if old_text.contains(PROMPT_GUIDANCE) {
                    return Ok(None);
                }
                let new_text = format!("{old_text}\n\n{PROMPT_GUIDANCE}");
                ActionChange::PromptTuning {
                    prompt: name.to_string(),
                    old_text,
                    new_text,
                }
            }
            (ActionKind::ToolOptimization, target) => {
                let Some(name) = target.strip_prefix("tool:") else {
                    return Ok(None);
                };
                let Some(old_def) = self.profile.get_tool(name).await else {
                    warn!("Tool '{}' missing from profile, skipping", name);
                    return Ok(None);
                };
                let mut new_def = old_def.clone();
                new_def.timeout_ms = old_def.timeout_ms.saturating_mul(3) / 2;
                new_def.max_retries = (old_def.max_retries + 1).min(3);
                if new_def == old_def {
                    return Ok(None);
                }
                ActionChange::ToolOptimization {
                    tool: name.to_string(),
                    old_def: Some(old_def),
                    new_def,
                }
            }
            (ActionKind::CodeModification, target) => {
                let Some(path) = target.strip_prefix("code:") else {
                    return Ok(None);
                };
                let pre_image = self.profile.read_overlay(path).await?;
                let new_content = format!(
                    "{}# tightened: reject answers that skip the stated task\n",
                    pre_image.clone().unwrap_or_default()
                );
                let test_signal = self.profile.overlay_exists("tests").await;
                ActionChange::CodeModification {
                    path: path.to_string(),
                    pre_image,
                    new_content,
                    test_signal,
                }
            }
        };

        Ok(Some(ImprovementAction::new(
            &opportunity.target,
            &opportunity.rationale,
            change,
        )))
    }
}

/// Fixed mapping from a degraded metric to the change most likely to move it
fn proposal_for(metric: &str, rationale: &str) -> Option<ImprovementOpportunity> {
    let (target, kind, expected_impact) = match metric {
        "response_time" => (
            "parameter:max_output_tokens",
            ActionKind::ParameterAdjustment,
            "response_time down ~20%",
        ),
        "satisfaction" => (
            "prompt:system",
            ActionKind::PromptTuning,
            "satisfaction up via more goal-directed answers",
        ),
        "error_rate" => (
            "tool:shell",
            ActionKind::ToolOptimization,
            "error_rate down via retries and longer timeouts",
        ),
        "task_success" => (
            "code:postprocess.rules",
            ActionKind::CodeModification,
            "task_success up via stricter answer checking",
        ),
        _ => (
            "parameter:temperature",
            ActionKind::ParameterAdjustment,
            "output variance down",
        ),
    };
    Some(ImprovementOpportunity {
        target: target.to_string(),
        kind,
        rationale: rationale.to_string(),
        expected_impact: expected_impact.to_string(),
        score: 0.0,
    })
}

/// Descending score, ties broken by target name so ordering is total and
/// reproducible
fn sort_opportunities(opportunities: &mut [ImprovementOpportunity]) {
    opportunities.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.target.cmp(&b.target))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricStats, RegressionAlert};
    use chrono::Utc;
    use tempfile::TempDir;

    async fn engine() -> (TempDir, ReflectionEngine) {
        let dir = TempDir::new().unwrap();
        let profile = RuntimeProfile::open(dir.path()).await.unwrap();
        let memory = LearningMemory::open_in_memory().unwrap();
        let config = Arc::new(ImprovementConfig::default());
        (dir, ReflectionEngine::new(config, memory, profile))
    }

    fn report_with_alerts(alerts: Vec<RegressionAlert>) -> PerformanceReport {
        let mut stats = BTreeMap::new();
        for alert in &alerts {
            stats.insert(
                alert.metric.clone(),
                MetricStats {
                    mean: alert.current,
                    p50: alert.current,
                    p95: alert.current,
                    slope: 0.0,
                    samples: 40,
                },
            );
        }
        PerformanceReport {
            window_start: Utc::now() - chrono::Duration::hours(24),
            window_end: Utc::now(),
            interaction_count: 40,
            stats,
            alerts,
        }
    }

    fn alert(metric: &str, current: f64, threshold: f64, severity: Severity) -> RegressionAlert {
        RegressionAlert {
            metric: metric.to_string(),
            baseline: threshold,
            current,
            threshold,
            severity,
        }
    }

    #[tokio::test]
    async fn test_one_insight_per_alert_plus_summary() {
        let (_dir, engine) = engine().await;
        let report = report_with_alerts(vec![
            alert("response_time", 6000.0, 5000.0, Severity::Moderate),
            alert("satisfaction", 2.5, 3.0, Severity::Moderate),
        ]);

        let reflection = engine.analyze_performance(&report);
        let regressions = reflection
            .insights
            .iter()
            .filter(|i| i.kind == InsightKind::Regression)
            .count();
        assert_eq!(regressions, 2);
        assert!(reflection
            .insights
            .iter()
            .any(|i| i.kind == InsightKind::Summary));
    }

    #[tokio::test]
    async fn test_plan_respects_action_cap_and_threshold() {
        let (_dir, engine) = engine().await;
        let report = report_with_alerts(vec![
            alert("response_time", 9000.0, 5000.0, Severity::Severe),
            alert("satisfaction", 2.0, 3.0, Severity::Severe),
            alert("error_rate", 0.2, 0.05, Severity::Severe),
            alert("other_metric", 10.0, 5.0, Severity::Severe),
        ]);

        let reflection = engine.analyze_performance(&report);
        let opportunities = engine
            .identify_improvement_opportunities(&reflection)
            .await
            .unwrap();
        assert!(opportunities.len() >= 4);
        // Ordered by descending score
        assert!(opportunities.windows(2).all(|w| w[0].score >= w[1].score));

        let plan = engine.generate_improvement_plan(opportunities).await.unwrap();
        assert!(plan.actions.len() <= plan.max_actions);
        assert_eq!(plan.actions.len(), 3);
    }

    #[tokio::test]
    async fn test_plan_generation_is_deterministic() {
        let (_dir, engine) = engine().await;
        let report = report_with_alerts(vec![
            alert("response_time", 9000.0, 5000.0, Severity::Severe),
            alert("satisfaction", 2.0, 3.0, Severity::Severe),
            alert("error_rate", 0.2, 0.05, Severity::Severe),
        ]);

        let reflection = engine.analyze_performance(&report);
        let opps_a = engine
            .identify_improvement_opportunities(&reflection)
            .await
            .unwrap();
        let opps_b = engine
            .identify_improvement_opportunities(&reflection)
            .await
            .unwrap();

        let plan_a = engine.generate_improvement_plan(opps_a).await.unwrap();
        let plan_b = engine.generate_improvement_plan(opps_b).await.unwrap();

        let shape_a: Vec<_> = plan_a.actions.iter().map(|a| a.describe()).collect();
        let shape_b: Vec<_> = plan_b.actions.iter().map(|a| a.describe()).collect();
        assert_eq!(shape_a, shape_b);
    }

    #[tokio::test]
    async fn test_recent_failure_penalizes_but_does_not_discard() {
        let (_dir, engine) = engine().await;
        let report = report_with_alerts(vec![alert(
            "response_time",
            9000.0,
            5000.0,
            Severity::Severe,
        )]);
        let reflection = engine.analyze_performance(&report);

        let before = engine
            .identify_improvement_opportunities(&reflection)
            .await
            .unwrap();
        let baseline_score = before[0].score;

        engine
            .memory
            .record_failure(
                &HashMap::new(),
                ActionKind::ParameterAdjustment,
                "parameter:max_output_tokens",
                "reduced budget",
                "regressed in soak",
            )
            .await
            .unwrap();

        let after = engine
            .identify_improvement_opportunities(&reflection)
            .await
            .unwrap();
        let penalized = after
            .iter()
            .find(|o| o.target == "parameter:max_output_tokens")
            .unwrap();
        assert!(penalized.score < baseline_score);
        assert!(penalized.score > 0.0);
    }

    #[tokio::test]
    async fn test_materialized_prompt_action_captures_pre_image() {
        let (_dir, engine) = engine().await;
        let current = engine.profile.get_prompt("system").await.unwrap();

        let report = report_with_alerts(vec![alert("satisfaction", 2.0, 3.0, Severity::Severe)]);
        let reflection = engine.analyze_performance(&report);
        let opportunities = engine
            .identify_improvement_opportunities(&reflection)
            .await
            .unwrap();
        let plan = engine.generate_improvement_plan(opportunities).await.unwrap();

        let action = &plan.actions[0];
        match &action.change {
            ActionChange::PromptTuning { old_text, new_text, .. } => {
                assert_eq!(old_text, &current);
                assert!(new_text.starts_with(&current));
                assert!(new_text.contains(PROMPT_GUIDANCE));
            }
            other => panic!("expected prompt tuning, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_report_produces_empty_plan() {
        let (_dir, engine) = engine().await;
        let report = PerformanceReport {
            window_start: Utc::now() - chrono::Duration::hours(1),
            window_end: Utc::now(),
            interaction_count: 0,
            stats: BTreeMap::new(),
            alerts: Vec::new(),
        };
        let reflection = engine.analyze_performance(&report);
        let opportunities = engine
            .identify_improvement_opportunities(&reflection)
            .await
            .unwrap();
        assert!(opportunities.is_empty());

        let plan = engine.generate_improvement_plan(opportunities).await.unwrap();
        assert!(plan.actions.is_empty());
    }
}
