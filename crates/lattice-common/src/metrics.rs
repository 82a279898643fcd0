//! Metrics registry for Lattice observability
//!
//! Provides OpenTelemetry metrics for the volume autoscaler:
//! - Reconciliation duration per policy
//! - Observed PVC usage
//! - Expansions performed
//! - Telemetry and API failures by category

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for Lattice metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("lattice"));

/// Histogram of VolumeAutoscaler reconciliation duration
///
/// Labels:
/// - `policy`: namespace/name of the VolumeAutoscaler
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("lattice_volume_autoscaler_reconcile_duration_seconds")
        .with_description("Duration of VolumeAutoscaler reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Gauge of observed PVC usage
///
/// Labels:
/// - `policy`: namespace/name of the VolumeAutoscaler
/// - `namespace`: PVC namespace
/// - `pvc`: PVC name
pub static VOLUME_USAGE_PERCENT: Lazy<Gauge<f64>> = Lazy::new(|| {
    METER
        .f64_gauge("lattice_volume_autoscaler_usage_percent")
        .with_description("Observed PVC usage as a percentage of capacity")
        .with_unit("%")
        .build()
});

/// Counter of PVC expansions
///
/// Labels:
/// - `policy`: namespace/name of the VolumeAutoscaler
/// - `namespace`: PVC namespace
/// - `pvc`: PVC name
pub static SCALE_EVENTS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_volume_autoscaler_scale_events_total")
        .with_description("Total number of PVC expansions")
        .with_unit("{expansions}")
        .build()
});

/// Counter of polling failures
///
/// Labels:
/// - `policy`: namespace/name of the VolumeAutoscaler
/// - `category`: see [`PollErrorCategory`]
pub static POLL_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_volume_autoscaler_poll_errors_total")
        .with_description("Total number of failures while polling and expanding PVCs")
        .with_unit("{errors}")
        .build()
});

/// Labels for the poll-errors counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollErrorCategory {
    /// Used-bytes query failed
    UsedBytes,
    /// Capacity-bytes query failed
    CapacityBytes,
    /// Volume health query failed
    Health,
    /// Inode queries failed
    Inodes,
    /// StorageClass lookup failed
    StorageClass,
    /// PVC capacity patch failed
    Patch,
    /// Status persist failed
    Status,
}

impl PollErrorCategory {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UsedBytes => "used_bytes",
            Self::CapacityBytes => "capacity_bytes",
            Self::Health => "health",
            Self::Inodes => "inodes",
            Self::StorageClass => "storage_class",
            Self::Patch => "patch",
            Self::Status => "status",
        }
    }
}

/// Record a reconciliation with timing
pub struct ReconcileTimer {
    policy: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        self.record("success");
    }

    /// Record error completion
    pub fn error(self) {
        self.record("error");
    }

    fn record(self, result: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("policy", self.policy),
                KeyValue::new("result", result),
            ],
        );
    }
}

/// Update the usage gauge for a PVC
pub fn set_volume_usage(policy: &str, namespace: &str, pvc: &str, usage_percent: f64) {
    VOLUME_USAGE_PERCENT.record(
        usage_percent,
        &[
            KeyValue::new("policy", policy.to_string()),
            KeyValue::new("namespace", namespace.to_string()),
            KeyValue::new("pvc", pvc.to_string()),
        ],
    );
}

/// Count one PVC expansion
pub fn record_scale_event(policy: &str, namespace: &str, pvc: &str) {
    SCALE_EVENTS.add(
        1,
        &[
            KeyValue::new("policy", policy.to_string()),
            KeyValue::new("namespace", namespace.to_string()),
            KeyValue::new("pvc", pvc.to_string()),
        ],
    );
}

/// Count one polling failure
pub fn record_poll_error(policy: &str, category: PollErrorCategory) {
    POLL_ERRORS.add(
        1,
        &[
            KeyValue::new("policy", policy.to_string()),
            KeyValue::new("category", category.as_str()),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_error_category_as_str() {
        assert_eq!(PollErrorCategory::UsedBytes.as_str(), "used_bytes");
        assert_eq!(PollErrorCategory::CapacityBytes.as_str(), "capacity_bytes");
        assert_eq!(PollErrorCategory::StorageClass.as_str(), "storage_class");
        assert_eq!(PollErrorCategory::Patch.as_str(), "patch");
        assert_eq!(PollErrorCategory::Status.as_str(), "status");
    }

    #[test]
    fn test_reconcile_timer() {
        let timer = ReconcileTimer::start("default/data");
        assert_eq!(timer.policy, "default/data");
        // Just ensure it doesn't panic without a meter provider
        timer.success();
        ReconcileTimer::start("default/data").error();
    }

    #[test]
    fn test_recording_helpers_do_not_panic() {
        set_volume_usage("default/data", "default", "data-0", 42.0);
        record_scale_event("default/data", "default", "data-0");
        record_poll_error("default/data", PollErrorCategory::Health);
    }
}
