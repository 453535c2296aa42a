//! ---
//! rl_section: "03-log-storage"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Prometheus metrics for the log ring."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{self, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

use crate::Result;

/// Metrics published by the log allocator.
#[derive(Clone)]
pub struct LogMetrics {
    appends: IntCounter,
    rejected: IntCounter,
    records: IntGauge,
    recovery: Histogram,
    #[allow(dead_code)]
    registry: Arc<Registry>,
}

impl LogMetrics {
    /// Register all log metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let appends = IntCounter::with_opts(Opts::new(
            "roomlink_log_appends_total",
            "Total number of records appended to the master log ring",
        ))?;
        registry.register(Box::new(appends.clone()))?;

        let rejected = IntCounter::with_opts(Opts::new(
            "roomlink_log_append_rejected_total",
            "Total number of appends refused because the log ring was full",
        ))?;
        registry.register(Box::new(rejected.clone()))?;

        let records = IntGauge::with_opts(Opts::new(
            "roomlink_log_records",
            "Records currently held in the master log ring",
        ))?;
        registry.register(Box::new(records.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "roomlink_log_recovery_seconds",
            "Duration of the startup probe scan of the log region",
        )
        .buckets(prometheus::exponential_buckets(0.0005, 2.0, 12)?);
        let recovery = Histogram::with_opts(histogram_opts)?;
        registry.register(Box::new(recovery.clone()))?;

        Ok(Self {
            appends,
            rejected,
            records,
            recovery,
            registry,
        })
    }

    /// Count a successful append.
    pub fn record_append(&self) {
        self.appends.inc();
    }

    /// Count an append refused by a full ring.
    pub fn record_rejected(&self) {
        self.rejected.inc();
    }

    /// Publish the current record count.
    pub fn set_records(&self, count: usize) {
        self.records.set(count as i64);
    }

    /// Observe the recovery scan duration.
    pub fn observe_recovery(&self, seconds: f64) {
        self.recovery.observe(seconds);
    }
}

impl std::fmt::Debug for LogMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_and_exports() {
        let registry = Arc::new(Registry::new());
        let metrics = LogMetrics::new(registry.clone()).unwrap();
        metrics.record_append();
        metrics.record_rejected();
        metrics.set_records(7);
        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();
        assert!(names.contains(&"roomlink_log_records".to_string()));
        assert!(names.contains(&"roomlink_log_append_rejected_total".to_string()));
        assert!(LogMetrics::new(registry).is_err());
    }
}
