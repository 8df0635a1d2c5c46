//! Sliding-window trend analysis and regression detection
//!
//! Aggregates the interaction store into per-metric statistics (mean,
//! percentiles, trend slope) and compares reports against a baseline to
//! raise regression alerts. A window with no interactions yields a report
//! with no aggregates at all; downstream consumers must treat a missing
//! metric as insufficient data, never as zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::config::{ImprovementConfig, MetricDirection, MetricThreshold};
use crate::error::Result;

use super::store::{MetricsStore, TimeRange};

/// Aggregate statistics for one metric over a window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    /// Change in bucketed mean per bucket, from simple linear regression
    pub slope: f64,
    pub samples: usize,
}

/// How far past its threshold a degraded metric has gone
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Minor,
    Moderate,
    Severe,
}

impl Severity {
    /// Grade by relative overshoot past the threshold
    fn from_overshoot(overshoot: f64) -> Self {
        if overshoot >= 0.5 {
            Severity::Severe
        } else if overshoot >= 0.1 {
            Severity::Moderate
        } else {
            Severity::Minor
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Minor => write!(f, "minor"),
            Severity::Moderate => write!(f, "moderate"),
            Severity::Severe => write!(f, "severe"),
        }
    }
}

/// One metric that crossed its threshold in the degrading direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionAlert {
    pub metric: String,
    pub baseline: f64,
    pub current: f64,
    pub threshold: f64,
    pub severity: Severity,
}

/// Derived performance snapshot over one window; never mutated after
/// construction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub interaction_count: usize,
    /// Per-metric aggregates; a metric absent here had no samples
    pub stats: BTreeMap<String, MetricStats>,
    pub alerts: Vec<RegressionAlert>,
}

impl PerformanceReport {
    pub fn has_sufficient_data(&self) -> bool {
        !self.stats.is_empty()
    }

    pub fn mean(&self, metric: &str) -> Option<f64> {
        self.stats.get(metric).map(|s| s.mean)
    }
}

/// Computes reports and detects regressions against a baseline
#[derive(Clone)]
pub struct TrendAnalyzer {
    store: MetricsStore,
    thresholds: BTreeMap<String, MetricThreshold>,
    buckets: usize,
}

impl TrendAnalyzer {
    pub fn new(store: MetricsStore, config: &ImprovementConfig) -> Self {
        Self {
            store,
            thresholds: config.thresholds.clone(),
            buckets: config.trend_buckets.max(1),
        }
    }

    /// Aggregate all interactions in the trailing window into a report.
    /// Alerts against absolute thresholds are attached; baseline comparison
    /// happens separately via [`detect_regression`](Self::detect_regression).
    pub async fn analyze(&self, window: Duration) -> Result<PerformanceReport> {
        let end = Utc::now();
        let start = end - chrono::Duration::from_std(window).unwrap_or_default();
        self.analyze_between(start, end).await
    }

    /// Aggregate interactions between two instants
    pub async fn analyze_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<PerformanceReport> {
        let interactions = self
            .store
            .query(TimeRange::new(Some(start), Some(end)))
            .await?;

        // Collect (offset-in-window, value) pairs per metric
        let mut series: BTreeMap<String, Vec<(f64, f64)>> = BTreeMap::new();
        let span_secs = (end - start).num_milliseconds().max(1) as f64 / 1000.0;
        for interaction in &interactions {
            let offset =
                (interaction.recorded_at - start).num_milliseconds().max(0) as f64 / 1000.0;
            for (name, value) in &interaction.metrics {
                series.entry(name.clone()).or_default().push((offset, *value));
            }
        }

        let mut stats = BTreeMap::new();
        for (name, points) in series {
            stats.insert(name, Self::summarize(&points, span_secs, self.buckets));
        }

        debug!(
            "Analyzed {} interactions across {} metrics",
            interactions.len(),
            stats.len()
        );

        let mut report = PerformanceReport {
            window_start: start,
            window_end: end,
            interaction_count: interactions.len(),
            stats,
            alerts: Vec::new(),
        };
        report.alerts = self.threshold_alerts(&report);
        Ok(report)
    }

    fn summarize(points: &[(f64, f64)], span_secs: f64, buckets: usize) -> MetricStats {
        let mut values: Vec<f64> = points.iter().map(|(_, v)| *v).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let p50 = percentile(&values, 50.0);
        let p95 = percentile(&values, 95.0);
        let slope = bucketed_slope(points, span_secs, buckets);

        MetricStats {
            mean,
            p50,
            p95,
            slope,
            samples: values.len(),
        }
    }

    /// Alerts for metrics currently past their absolute threshold. Used for
    /// the report itself; direction-aware, strict inequality.
    fn threshold_alerts(&self, report: &PerformanceReport) -> Vec<RegressionAlert> {
        let mut alerts = Vec::new();
        for (metric, threshold) in &self.thresholds {
            let Some(stats) = report.stats.get(metric) else {
                continue;
            };
            if let Some(alert) = fire(metric, stats.mean, stats.mean, threshold) {
                alerts.push(alert);
            }
        }
        alerts
    }

    /// Compare a current report against a baseline. An alert fires only when
    /// the metric moved in the degrading direction relative to the baseline
    /// AND sits strictly past its configured threshold. Near-threshold ties
    /// are not flagged, so repeated comparisons do not oscillate.
    pub fn detect_regression(
        &self,
        report: &PerformanceReport,
        baseline: &PerformanceReport,
    ) -> Vec<RegressionAlert> {
        self.detect_with_factor(report, baseline, 1.0)
    }

    /// Regression detection with tightened thresholds, used during canary
    /// rollout and post-commit soak monitoring. `factor` < 1 pulls a
    /// higher-is-worse threshold down and a lower-is-worse threshold up.
    pub fn detect_with_factor(
        &self,
        report: &PerformanceReport,
        baseline: &PerformanceReport,
        factor: f64,
    ) -> Vec<RegressionAlert> {
        let mut alerts = Vec::new();
        for (metric, threshold) in &self.thresholds {
            // A metric absent on either side means insufficient data, not zero
            let (Some(current), Some(base)) = (report.mean(metric), baseline.mean(metric)) else {
                continue;
            };
            let effective = match threshold.direction {
                MetricDirection::HigherIsWorse => threshold.threshold * factor,
                MetricDirection::LowerIsWorse => {
                    if factor > 0.0 {
                        threshold.threshold / factor
                    } else {
                        threshold.threshold
                    }
                }
            };
            let tightened = MetricThreshold {
                threshold: effective,
                direction: threshold.direction,
            };
            if let Some(alert) = fire(metric, base, current, &tightened) {
                alerts.push(alert);
            }
        }
        alerts
    }
}

/// Build an alert if `current` is strictly worse than both the baseline and
/// the threshold, in the metric's degrading direction.
fn fire(
    metric: &str,
    baseline: f64,
    current: f64,
    threshold: &MetricThreshold,
) -> Option<RegressionAlert> {
    let (degraded, overshoot) = match threshold.direction {
        MetricDirection::HigherIsWorse => (
            current > threshold.threshold && current >= baseline,
            (current - threshold.threshold) / threshold.threshold.abs().max(f64::EPSILON),
        ),
        MetricDirection::LowerIsWorse => (
            current < threshold.threshold && current <= baseline,
            (threshold.threshold - current) / threshold.threshold.abs().max(f64::EPSILON),
        ),
    };
    if !degraded {
        return None;
    }
    Some(RegressionAlert {
        metric: metric.to_string(),
        baseline,
        current,
        threshold: threshold.threshold,
        severity: Severity::from_overshoot(overshoot),
    })
}

/// Nearest-rank percentile over an already-sorted slice
fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (pct / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Least-squares slope over time-bucketed means. Buckets without samples are
/// skipped; fewer than two populated buckets yields a slope of zero.
fn bucketed_slope(points: &[(f64, f64)], span_secs: f64, buckets: usize) -> f64 {
    let width = span_secs / buckets as f64;
    if width <= 0.0 {
        return 0.0;
    }

    let mut sums = vec![0.0f64; buckets];
    let mut counts = vec![0usize; buckets];
    for (offset, value) in points {
        let idx = ((offset / width) as usize).min(buckets - 1);
        sums[idx] += value;
        counts[idx] += 1;
    }

    let means: Vec<(f64, f64)> = (0..buckets)
        .filter(|&i| counts[i] > 0)
        .map(|i| (i as f64, sums[i] / counts[i] as f64))
        .collect();
    if means.len() < 2 {
        return 0.0;
    }

    let n = means.len() as f64;
    let sum_x: f64 = means.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = means.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = means.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = means.iter().map(|(x, _)| x * x).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < f64::EPSILON {
        0.0
    } else {
        (n * sum_xy - sum_x * sum_y) / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::store::{digest, Interaction};
    use std::collections::HashMap;

    fn analyzer_with(store: MetricsStore) -> TrendAnalyzer {
        TrendAnalyzer::new(store, &ImprovementConfig::default())
    }

    async fn seed(store: &MetricsStore, offset_secs: i64, metric: &str, value: f64) {
        let mut metrics = HashMap::new();
        metrics.insert(metric.to_string(), value);
        let interaction = Interaction {
            recorded_at: Utc::now() - chrono::Duration::seconds(offset_secs),
            input_digest: digest(b"in"),
            output_digest: digest(b"out"),
            metrics,
            context: HashMap::new(),
        };
        store.record(&interaction).await.unwrap();
    }

    fn report_with(metric: &str, mean: f64) -> PerformanceReport {
        let mut stats = BTreeMap::new();
        stats.insert(
            metric.to_string(),
            MetricStats {
                mean,
                p50: mean,
                p95: mean,
                slope: 0.0,
                samples: 10,
            },
        );
        PerformanceReport {
            window_start: Utc::now() - chrono::Duration::hours(1),
            window_end: Utc::now(),
            interaction_count: 10,
            stats,
            alerts: Vec::new(),
        }
    }

    // An empty window must not alert
    #[tokio::test]
    async fn test_empty_window_yields_undefined_aggregates() {
        let store = MetricsStore::open_in_memory().unwrap();
        let analyzer = analyzer_with(store);

        let report = analyzer.analyze(Duration::from_secs(3600)).await.unwrap();
        assert!(!report.has_sufficient_data());
        assert!(report.stats.is_empty());
        assert_eq!(report.interaction_count, 0);

        let baseline = report.clone();
        assert!(analyzer.detect_regression(&report, &baseline).is_empty());
    }

    // baseline 1000ms, current 6000ms, threshold 5000ms
    #[tokio::test]
    async fn test_response_time_regression_fires_with_severity() {
        let store = MetricsStore::open_in_memory().unwrap();
        let analyzer = analyzer_with(store);

        let baseline = report_with("response_time", 1000.0);
        let current = report_with("response_time", 6000.0);

        let alerts = analyzer.detect_regression(&current, &baseline);
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.metric, "response_time");
        assert_eq!(alert.baseline, 1000.0);
        assert_eq!(alert.current, 6000.0);
        // 20% overshoot past the 5000ms threshold
        assert_eq!(alert.severity, Severity::Moderate);
    }

    #[tokio::test]
    async fn test_threshold_is_strict_inequality() {
        let store = MetricsStore::open_in_memory().unwrap();
        let analyzer = analyzer_with(store);

        // Exactly at threshold: not flagged, to avoid oscillation
        let baseline = report_with("response_time", 1000.0);
        let at_threshold = report_with("response_time", 5000.0);
        assert!(analyzer.detect_regression(&at_threshold, &baseline).is_empty());
    }

    #[tokio::test]
    async fn test_improving_direction_never_alerts() {
        let store = MetricsStore::open_in_memory().unwrap();
        let analyzer = analyzer_with(store);

        // Satisfaction rising stays quiet even far from its threshold
        let baseline = report_with("satisfaction", 3.5);
        let current = report_with("satisfaction", 4.8);
        assert!(analyzer.detect_regression(&current, &baseline).is_empty());

        // Satisfaction falling below 3.0 fires
        let dropped = report_with("satisfaction", 2.4);
        let alerts = analyzer.detect_regression(&dropped, &baseline);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric, "satisfaction");
    }

    #[tokio::test]
    async fn test_tightened_thresholds_fire_earlier() {
        let store = MetricsStore::open_in_memory().unwrap();
        let analyzer = analyzer_with(store);

        let baseline = report_with("response_time", 1000.0);
        let current = report_with("response_time", 4500.0);

        // Below the normal 5000ms threshold
        assert!(analyzer.detect_regression(&current, &baseline).is_empty());
        // But past the canary-tightened 4000ms threshold
        let alerts = analyzer.detect_with_factor(&current, &baseline, 0.8);
        assert_eq!(alerts.len(), 1);
    }

    #[tokio::test]
    async fn test_slope_detects_rising_series() {
        let store = MetricsStore::open_in_memory().unwrap();
        let analyzer = analyzer_with(store.clone());

        // Latency climbing steadily over the last hour
        for i in 0..30 {
            seed(&store, 3600 - i * 120, "response_time", 100.0 + i as f64 * 10.0).await;
        }

        let report = analyzer.analyze(Duration::from_secs(4000)).await.unwrap();
        let stats = report.stats.get("response_time").unwrap();
        assert!(stats.slope > 0.0, "expected positive slope, got {}", stats.slope);
        assert_eq!(stats.samples, 30);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 50.0), 51.0);
        assert_eq!(percentile(&values, 95.0), 95.0);
        assert_eq!(percentile(&[42.0], 95.0), 42.0);
    }

    #[test]
    fn test_severity_grading() {
        assert_eq!(Severity::from_overshoot(0.05), Severity::Minor);
        assert_eq!(Severity::from_overshoot(0.2), Severity::Moderate);
        assert_eq!(Severity::from_overshoot(0.8), Severity::Severe);
    }
}
