//! Improvement orchestrator - owns the cycle loop and action rollout
//!
//! Wires the stores, analyzer, reflection engine, and guardrails together and
//! drives the periodic improvement cycle: analyze, reflect, plan, then roll
//! each approved action out through canary and soak monitoring. Cycles are
//! single-flight (an overlapping trigger is skipped, never queued) and bounded
//! by a wall-clock budget; actions the budget does not reach are deferred to
//! the next cycle's fresh analysis.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::actions::{ActionJournal, ActionResult, ActionState, ImprovementAction, RuntimeProfile};
use crate::config::{Config, ImprovementConfig};
use crate::error::Result;
use crate::memory::LearningMemory;
use crate::metrics::{Interaction, MetricsStore, PerformanceReport, TimeRange, TrendAnalyzer};
use crate::reflection::ReflectionEngine;
use crate::safety::{HaltFlag, MonitorHandle, SafetyGuardrails};

/// Why a triggered cycle did not run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another cycle holds the gate
    InFlight,
    /// The halt flag is raised; an operator must resume first
    Halted,
    /// Not enough interactions recorded in the analysis window
    InsufficientData { have: usize, need: usize },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::InFlight => write!(f, "a cycle is already in flight"),
            SkipReason::Halted => write!(f, "the improvement loop is halted"),
            SkipReason::InsufficientData { have, need } => {
                write!(f, "only {} of {} required interactions", have, need)
            }
        }
    }
}

/// Outcome of one cycle trigger
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed(CycleStats),
    Skipped(SkipReason),
}

/// Counters from one completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleStats {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub interactions_analyzed: usize,
    pub alerts: usize,
    pub proposed: usize,
    pub rejected: usize,
    /// Actions that ended the cycle committed
    pub committed: usize,
    pub rolled_back: usize,
    /// Execution failures that applied nothing
    pub failed: usize,
    /// Actions the cycle budget never reached
    pub deferred: usize,
}

impl CycleStats {
    fn start(report: &PerformanceReport, proposed: usize) -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            interactions_analyzed: report.interaction_count,
            alerts: report.alerts.len(),
            proposed,
            rejected: 0,
            committed: 0,
            rolled_back: 0,
            failed: 0,
            deferred: 0,
        }
    }
}

/// Operator-facing snapshot of the loop's state
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub halted: bool,
    pub halt_reason: Option<String>,
    pub interactions_recorded: usize,
    pub experiences_recorded: usize,
    pub actions_committed: usize,
    pub actions_rolled_back: usize,
    pub skipped_cycles: u64,
    pub last_cycle: Option<CycleStats>,
}

enum PhaseEnd {
    Clean,
    Alert(crate::metrics::RegressionAlert),
    Deadline,
}

/// Wait out one monitoring phase, whichever comes first: an alert, the phase
/// end, or the cycle deadline
async fn watch_phase(monitor: &mut MonitorHandle, phase_end: Instant, deadline: Instant) -> PhaseEnd {
    let truncated = deadline < phase_end;
    let wake = if truncated { deadline } else { phase_end };
    tokio::select! {
        alert = monitor.alerts.recv() => match alert {
            Some(alert) => PhaseEnd::Alert(alert),
            None => PhaseEnd::Clean,
        },
        _ = sleep_until(wake) => {
            if truncated {
                PhaseEnd::Deadline
            } else {
                PhaseEnd::Clean
            }
        }
    }
}

/// Drives scheduled and manual improvement cycles
#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<ImprovementConfig>,
    store: MetricsStore,
    analyzer: TrendAnalyzer,
    memory: LearningMemory,
    profile: RuntimeProfile,
    journal: ActionJournal,
    engine: ReflectionEngine,
    guardrails: SafetyGuardrails,
    cycle_gate: Arc<Mutex<()>>,
    skipped_cycles: Arc<AtomicU64>,
    last_cycle: Arc<RwLock<Option<CycleStats>>>,
}

impl Orchestrator {
    /// Open all components under the configured data directory and run
    /// journal recovery before any cycle can start
    pub async fn open(config: &Config) -> Result<Self> {
        let data_dir = config
            .storage
            .resolve_data_dir()
            .map_err(|e| crate::error::ImprovementError::Execution {
                detail: e.to_string(),
            })?;
        Self::open_at(config.improvement.clone(), &data_dir).await
    }

    /// Open with an explicit data directory
    pub async fn open_at(improvement: ImprovementConfig, data_dir: &Path) -> Result<Self> {
        let config = Arc::new(improvement);
        let store = MetricsStore::open(data_dir.join("metrics.db")).await?;
        let analyzer = TrendAnalyzer::new(store.clone(), &config);
        let memory = LearningMemory::open(data_dir.join("memory.db")).await?;
        let profile = RuntimeProfile::open(data_dir).await?;
        let journal = ActionJournal::open(data_dir.join("actions.db")).await?;
        let halt = HaltFlag::new(data_dir);
        let guardrails = SafetyGuardrails::new(config.clone(), analyzer.clone(), halt);
        let engine = ReflectionEngine::new(config.clone(), memory.clone(), profile.clone());

        // A previous process may have died mid-rollout
        let recovery = journal.recover(&profile).await?;
        if recovery.failed > 0 {
            guardrails
                .halt_flag()
                .raise(&format!(
                    "startup recovery could not roll back {} action(s)",
                    recovery.failed
                ))
                .await?;
        }

        Ok(Self {
            config,
            store,
            analyzer,
            memory,
            profile,
            journal,
            engine,
            guardrails,
            cycle_gate: Arc::new(Mutex::new(())),
            skipped_cycles: Arc::new(AtomicU64::new(0)),
            last_cycle: Arc::new(RwLock::new(None)),
        })
    }

    pub fn store(&self) -> &MetricsStore {
        &self.store
    }

    pub fn memory(&self) -> &LearningMemory {
        &self.memory
    }

    pub fn profile(&self) -> &RuntimeProfile {
        &self.profile
    }

    pub fn journal(&self) -> &ActionJournal {
        &self.journal
    }

    /// Record one conversational interaction
    pub async fn ingest(&self, interaction: &Interaction) -> Result<()> {
        self.store.record(interaction).await
    }

    /// Performance report over the trailing window
    pub async fn report(&self, window: std::time::Duration) -> Result<PerformanceReport> {
        self.analyzer.analyze(window).await
    }

    /// Clear the halt flag after operator review
    pub async fn resume(&self) -> Result<()> {
        self.guardrails.halt_flag().clear().await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let halt = self.guardrails.halt_flag();
        Ok(StatusReport {
            halted: halt.is_raised().await,
            halt_reason: halt.reason().await,
            interactions_recorded: self.store.count(TimeRange::all()).await?,
            experiences_recorded: self.memory.len().await?,
            actions_committed: self.journal.count_state(ActionState::Committed).await?,
            actions_rolled_back: self.journal.count_state(ActionState::RolledBack).await?,
            skipped_cycles: self.skipped_cycles.load(Ordering::Relaxed),
            last_cycle: self.last_cycle.read().await.clone(),
        })
    }

    /// Run scheduled cycles until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.config.enabled {
            info!("Automatic improvement cycles are disabled by configuration");
        }
        let mut ticker = tokio::time::interval(self.config.reflection_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately; the first cycle should wait one period
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Improvement loop shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if !self.config.enabled {
                        continue;
                    }
                    match self.run_cycle().await {
                        Ok(CycleOutcome::Completed(stats)) => debug!(
                            "Cycle done: {} committed, {} rolled back, {} deferred",
                            stats.committed, stats.rolled_back, stats.deferred
                        ),
                        Ok(CycleOutcome::Skipped(reason)) => debug!("Cycle skipped: {}", reason),
                        Err(e) => warn!("Improvement cycle failed: {}", e),
                    }
                }
            }
        }
    }

    /// Operator-triggered cycle; subject to the same gate, halt flag, and
    /// data requirements as scheduled ones
    pub async fn trigger_manual_cycle(&self) -> Result<CycleOutcome> {
        info!("Manual improvement cycle requested");
        self.run_cycle().await
    }

    /// One full improvement cycle. Returns without doing work when the gate
    /// is held, the loop is halted, or there is too little data.
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Ok(_gate) = self.cycle_gate.try_lock() else {
            self.skipped_cycles.fetch_add(1, Ordering::Relaxed);
            info!("Improvement cycle already in flight; skipping this trigger");
            return Ok(CycleOutcome::Skipped(SkipReason::InFlight));
        };

        if self.guardrails.halt_flag().is_raised().await {
            warn!("Improvement loop is halted; skipping cycle");
            return Ok(CycleOutcome::Skipped(SkipReason::Halted));
        }

        let window = self.config.analysis_window();
        let have = self.store.count(TimeRange::last(window)).await?;
        if have < self.config.min_interactions {
            debug!(
                "Only {} of {} required interactions; skipping cycle",
                have, self.config.min_interactions
            );
            return Ok(CycleOutcome::Skipped(SkipReason::InsufficientData {
                have,
                need: self.config.min_interactions,
            }));
        }

        let deadline = Instant::now() + self.config.cycle_budget();
        let report = self.analyzer.analyze(window).await?;
        let reflection = self.engine.analyze_performance(&report);
        let opportunities = self
            .engine
            .identify_improvement_opportunities(&reflection)
            .await?;
        let plan = self.engine.generate_improvement_plan(opportunities).await?;

        let total = plan.actions.len();
        let mut stats = CycleStats::start(&report, total);
        info!(
            "Cycle started: {} interactions, {} alerts, {} actions planned",
            report.interaction_count,
            report.alerts.len(),
            total
        );

        for (index, mut action) in plan.actions.into_iter().enumerate() {
            if Instant::now() >= deadline {
                stats.deferred = total - index;
                warn!(
                    "Cycle budget exhausted; deferring {} action(s)",
                    stats.deferred
                );
                break;
            }

            self.journal.record(&action).await?;
            let verdict = self.guardrails.validate_improvement(&action);
            if !verdict.approved {
                action.state = ActionState::Rejected;
                self.journal.record(&action).await?;
                info!(
                    "Rejected action {} ({}): {}",
                    action.id,
                    action.describe(),
                    verdict.reason
                );
                stats.rejected += 1;
                continue;
            }
            action.state = ActionState::Validated;
            self.journal.record(&action).await?;

            // Fresh baseline right before the change goes live
            let baseline = self.analyzer.analyze(window).await?;

            // An action that cannot be applied is its own failure, not the
            // cycle's: revert, record the experience, and move on.
            let result = match action.execute(&self.profile).await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Action {} failed to execute: {}", action.id, e);
                    ActionResult {
                        success: false,
                        metrics: HashMap::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            if !result.success {
                let reason = result
                    .error
                    .unwrap_or_else(|| "execution failed".to_string());
                action.rollback(&self.profile).await;
                action.state = ActionState::RolledBack;
                self.journal.record(&action).await?;
                self.memory
                    .record_failure(
                        &plan.context,
                        action.kind(),
                        &action.target,
                        &action.describe(),
                        &reason,
                    )
                    .await?;
                stats.failed += 1;
                continue;
            }
            self.journal.record(&action).await?;

            let deadline_hit = self
                .rollout(&mut action, baseline, deadline, &plan.context, &mut stats)
                .await?;
            if deadline_hit && index + 1 < total {
                stats.deferred = total - index - 1;
                warn!(
                    "Cycle budget exhausted; deferring {} action(s)",
                    stats.deferred
                );
                break;
            }
            if deadline_hit {
                break;
            }
        }

        stats.finished_at = Utc::now();
        *self.last_cycle.write().await = Some(stats.clone());
        info!(
            "Cycle finished: {} committed, {} rejected, {} rolled back, {} failed, {} deferred",
            stats.committed, stats.rejected, stats.rolled_back, stats.failed, stats.deferred
        );
        Ok(CycleOutcome::Completed(stats))
    }

    /// Canary-then-soak rollout of one executed action. Returns whether the
    /// cycle deadline was hit along the way.
    async fn rollout(
        &self,
        action: &mut ImprovementAction,
        baseline: PerformanceReport,
        deadline: Instant,
        context: &HashMap<String, String>,
        stats: &mut CycleStats,
    ) -> Result<bool> {
        self.profile
            .set_canary(&action.id, self.config.canary_fraction)
            .await?;
        let lookback = self.config.monitor_poll() * 4;
        let mut monitor =
            self.guardrails
                .monitor_degradation(baseline, lookback, self.config.monitor_poll());

        // Canary: the change serves a traffic fraction; any regression here
        // means abort before commit
        let canary_end = Instant::now() + self.config.canary_window();
        let mut canary_failure: Option<String> = None;
        let mut deadline_hit = false;
        loop {
            match watch_phase(&mut monitor, canary_end, deadline).await {
                PhaseEnd::Alert(alert) => {
                    if self.config.rollback_on_regression {
                        canary_failure = Some(format!(
                            "regressed in canary: {} at {:.2}",
                            alert.metric, alert.current
                        ));
                        break;
                    }
                    warn!(
                        "Regression during canary of {} ({} at {:.2}), continuing: automatic rollback is off",
                        action.id, alert.metric, alert.current
                    );
                }
                PhaseEnd::Deadline => {
                    deadline_hit = true;
                    canary_failure = Some("cycle budget exhausted during canary".to_string());
                    break;
                }
                PhaseEnd::Clean => break,
            }
        }
        self.profile.clear_canary().await?;

        if let Some(reason) = canary_failure {
            monitor.stop().await;
            let rolled_back = self
                .guardrails
                .emergency_rollback(action, &self.profile)
                .await;
            self.journal.record(action).await?;
            self.memory
                .record_failure(
                    context,
                    action.kind(),
                    &action.target,
                    &action.describe(),
                    &reason,
                )
                .await?;
            stats.rolled_back += 1;
            rolled_back?;
            return Ok(deadline_hit);
        }

        action.state = ActionState::Committed;
        self.journal.record(action).await?;
        info!("Committed action {}: {}", action.id, action.describe());

        // Soak: fully live, but a regression here still reverts the change
        let soak_end = Instant::now() + self.config.soak_period();
        let mut soak_failure = false;
        loop {
            match watch_phase(&mut monitor, soak_end, deadline).await {
                PhaseEnd::Alert(alert) => {
                    if self.config.rollback_on_regression {
                        warn!(
                            "Regression during soak of {}: {} at {:.2}",
                            action.id, alert.metric, alert.current
                        );
                        soak_failure = true;
                        break;
                    }
                    warn!(
                        "Regression during soak of {} ({} at {:.2}), keeping commit: automatic rollback is off",
                        action.id, alert.metric, alert.current
                    );
                }
                PhaseEnd::Deadline => {
                    deadline_hit = true;
                    warn!("Cycle budget exhausted; truncating soak of {}", action.id);
                    break;
                }
                PhaseEnd::Clean => break,
            }
        }
        monitor.stop().await;

        if soak_failure {
            let rolled_back = self
                .guardrails
                .emergency_rollback(action, &self.profile)
                .await;
            self.journal.record(action).await?;
            self.memory
                .record_failure(
                    context,
                    action.kind(),
                    &action.target,
                    &action.describe(),
                    "post-hoc regression",
                )
                .await?;
            stats.rolled_back += 1;
            rolled_back?;
            return Ok(deadline_hit);
        }

        self.memory
            .record_success(context, action.kind(), &action.target, &action.describe())
            .await?;
        stats.committed += 1;
        Ok(deadline_hit)
    }
}
