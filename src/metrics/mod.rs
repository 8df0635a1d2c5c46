//! Interaction metrics: durable recording and trend analysis
//!
//! The store is the append-only record of what the agent did and how well it
//! went; the analyzer turns that record into performance reports and
//! regression alerts that drive the improvement loop.

pub mod store;
pub mod trends;

pub use store::{digest, Interaction, MetricsStore, TimeRange};
pub use trends::{
    MetricStats, PerformanceReport, RegressionAlert, Severity, TrendAnalyzer,
};
