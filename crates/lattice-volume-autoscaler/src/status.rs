//! Status, condition and event bookkeeping for one reconciliation cycle
//!
//! A [`StatusManager`] starts from the status persisted by the previous
//! cycle, accumulates per-volume observations and decisions, and produces
//! the status to write back once the cycle ends. Events go out as soon as a
//! decision is made; the status is only built at the end.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use lattice_common::crd::{
    Condition, ConditionStatus, VolumeAutoscaler, VolumeAutoscalerStatus, VolumeStatus,
};
use lattice_common::events::{actions, reasons, EventPublisher};
use lattice_common::metrics::{self, PollErrorCategory};
use lattice_common::quantity::format_quantity;

use crate::safety::BlockReason;

/// Condition type summarizing the autoscaler's health
pub const READY: &str = "Ready";

/// Reason recorded while every volume is being polled successfully
pub const POLLING: &str = "Polling";

/// Cycle-level outcome reflected in the Ready condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyState {
    /// Every governed volume was polled
    Polling { volumes: usize },
    /// Telemetry failed for at least one volume
    PrometheusUnavailable { failed: usize, total: usize },
    /// The target resolved to no claims
    NoPvcsFound { target: String },
    /// The spec could not be interpreted
    Misconfigured { message: String },
}

impl ReadyState {
    /// Condition reason
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Polling { .. } => POLLING,
            Self::PrometheusUnavailable { .. } => reasons::PROMETHEUS_UNAVAILABLE,
            Self::NoPvcsFound { .. } => reasons::NO_PVCS_FOUND,
            Self::Misconfigured { .. } => reasons::MISCONFIGURED,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Polling { volumes } => format!("polling {volumes} volume(s)"),
            Self::PrometheusUnavailable { failed, total } => {
                format!("telemetry unavailable for {failed} of {total} volume(s)")
            }
            Self::NoPvcsFound { target } => format!("no PersistentVolumeClaims match {target}"),
            Self::Misconfigured { message } => message.clone(),
        }
    }

    /// Build the Ready condition for this state
    pub fn condition(&self, now: DateTime<Utc>) -> Condition {
        let status = match self {
            Self::Polling { .. } => ConditionStatus::True,
            _ => ConditionStatus::False,
        };
        Condition::new(READY, status, self.reason(), self.message()).at(now)
    }
}

/// Insert or replace a condition by type.
///
/// The transition time only moves when the status value changes. Returns
/// true if the status or reason differs from what was there before.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let changed =
                existing.status != condition.status || existing.reason != condition.reason;
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time;
            }
            *existing = condition;
            changed
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

/// Per-volume status entries keyed by PVC name
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeStatusMap(BTreeMap<String, VolumeStatus>);

impl VolumeStatusMap {
    /// Index persisted entries by name; later duplicates win
    pub fn from_entries(entries: &[VolumeStatus]) -> Self {
        Self(
            entries
                .iter()
                .map(|v| (v.name.clone(), v.clone()))
                .collect(),
        )
    }

    /// Entry for `name`, if one exists
    pub fn get(&self, name: &str) -> Option<&VolumeStatus> {
        self.0.get(name)
    }

    /// Entry for `name`, created empty if missing
    pub fn entry(&mut self, name: &str) -> &mut VolumeStatus {
        self.0
            .entry(name.to_string())
            .or_insert_with(|| VolumeStatus {
                name: name.to_string(),
                ..Default::default()
            })
    }

    /// Drop entries whose names are not in `keep`
    pub fn retain(&mut self, keep: &BTreeSet<String>) {
        self.0.retain(|name, _| keep.contains(name));
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries sorted by name
    pub fn into_vec(self) -> Vec<VolumeStatus> {
        self.0.into_values().collect()
    }
}

/// Accumulates one cycle's observations, decisions and events
pub struct StatusManager<'a> {
    events: &'a dyn EventPublisher,
    object_ref: ObjectReference,
    policy: String,
    namespace: String,
    conditions: Vec<Condition>,
    total_scale_events: i64,
    volumes: VolumeStatusMap,
}

impl<'a> StatusManager<'a> {
    /// Start from the autoscaler's persisted status
    pub fn new(events: &'a dyn EventPublisher, autoscaler: &VolumeAutoscaler) -> Self {
        let namespace = autoscaler.namespace().unwrap_or_default();
        let previous = autoscaler.status.clone().unwrap_or_default();
        Self {
            events,
            object_ref: autoscaler.object_ref(&()),
            policy: format!("{}/{}", namespace, autoscaler.name_any()),
            namespace,
            conditions: previous.conditions,
            total_scale_events: previous.total_scale_events,
            volumes: VolumeStatusMap::from_entries(&previous.volumes),
        }
    }

    /// `namespace/name` of the autoscaler, used as the metrics label
    pub fn policy(&self) -> &str {
        &self.policy
    }

    /// Last expansion time recorded for a claim
    pub fn last_scale_time(&self, pvc: &str) -> Option<DateTime<Utc>> {
        self.volumes.get(pvc).and_then(|v| v.last_scale_time)
    }

    /// Record the usage observed for a claim this cycle
    pub fn observe(&mut self, pvc: &str, current_size: u128, used_bytes: u128, usage_percent: i32) {
        metrics::set_volume_usage(&self.policy, &self.namespace, pvc, f64::from(usage_percent));
        let entry = self.volumes.entry(pvc);
        entry.current_size = format_quantity(current_size);
        entry.used_bytes = i64::try_from(used_bytes).unwrap_or(i64::MAX);
        entry.usage_percent = usage_percent;
    }

    /// Record inode usage; warns when it reaches `threshold`
    pub async fn observe_inodes(&mut self, pvc: &str, usage_percent: i32, threshold: u32) {
        self.volumes.entry(pvc).inode_usage_percent = Some(usage_percent);
        if i64::from(usage_percent) >= i64::from(threshold) {
            warn!(policy = %self.policy, pvc, usage_percent, threshold, "Inode usage above threshold");
            self.publish(
                EventType::Warning,
                reasons::INODE_THRESHOLD_EXCEEDED,
                actions::EVALUATE,
                format!("{pvc}: inode usage {usage_percent}% is at or above {threshold}%"),
            )
            .await;
        }
    }

    /// Forget inode usage for a claim whose policy no longer tracks it
    pub fn clear_inodes(&mut self, pvc: &str) {
        self.volumes.entry(pvc).inode_usage_percent = None;
    }

    /// Record a successful expansion
    pub async fn record_expansion(&mut self, pvc: &str, from: u128, to: u128, now: DateTime<Utc>) {
        let entry = self.volumes.entry(pvc);
        entry.last_scale_time = Some(now);
        entry.last_scale_size = Some(format_quantity(to));
        self.total_scale_events += 1;
        metrics::record_scale_event(&self.policy, &self.namespace, pvc);

        info!(
            policy = %self.policy,
            pvc,
            from = %format_quantity(from),
            to = %format_quantity(to),
            "Expanded volume"
        );
        self.publish(
            EventType::Normal,
            reasons::EXPANDED,
            actions::EXPAND,
            format!("{pvc}: expanded from {} to {}", format_quantity(from), format_quantity(to)),
        )
        .await;
    }

    /// Record a rejected or failed expansion patch
    pub async fn record_expand_failed(&mut self, pvc: &str, to: u128, error: &str) {
        metrics::record_poll_error(&self.policy, PollErrorCategory::Patch);
        warn!(policy = %self.policy, pvc, error, "Failed to expand volume");
        self.publish(
            EventType::Warning,
            reasons::EXPAND_FAILED,
            actions::EXPAND,
            format!("{pvc}: failed to request {}: {error}", format_quantity(to)),
        )
        .await;
    }

    /// Record that a safety check stopped the expansion
    pub async fn record_blocked(&mut self, pvc: &str, block: &BlockReason) {
        let message = block.message();
        let type_ = if block.is_warning() {
            warn!(policy = %self.policy, pvc, reason = block.reason(), %message, "Expansion blocked");
            EventType::Warning
        } else {
            debug!(policy = %self.policy, pvc, reason = block.reason(), %message, "Expansion deferred");
            EventType::Normal
        };
        self.publish(type_, block.reason(), actions::EVALUATE, format!("{pvc}: {message}"))
            .await;
    }

    /// Record that the kubelet reports the volume as abnormal
    pub async fn record_unhealthy(&mut self, pvc: &str) {
        warn!(policy = %self.policy, pvc, "Volume reported abnormal, skipping expansion");
        self.publish(
            EventType::Warning,
            reasons::VOLUME_UNHEALTHY,
            actions::EVALUATE,
            format!("{pvc}: kubelet reports the volume as abnormal"),
        )
        .await;
    }

    /// Count a failed query or API call
    pub fn record_error(&self, category: PollErrorCategory) {
        metrics::record_poll_error(&self.policy, category);
    }

    /// Forget claims that are no longer governed
    pub fn prune(&mut self, resolved: &BTreeSet<String>) {
        let before = self.volumes.len();
        self.volumes.retain(resolved);
        let removed = before - self.volumes.len();
        if removed > 0 {
            debug!(policy = %self.policy, removed, "Pruned status for ungoverned volumes");
        }
    }

    /// Close the cycle and build the status to persist.
    ///
    /// Emits an event when the Ready condition moves into a degraded state.
    pub async fn finish(
        mut self,
        ready: ReadyState,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) -> VolumeAutoscalerStatus {
        let condition = ready.condition(now);
        let message = condition.message.clone();
        let changed = set_condition(&mut self.conditions, condition);

        if changed && !matches!(ready, ReadyState::Polling { .. }) {
            self.publish(EventType::Warning, ready.reason(), actions::RECONCILE, message)
                .await;
        }

        VolumeAutoscalerStatus {
            observed_generation: generation,
            last_poll_time: Some(now),
            conditions: self.conditions,
            total_scale_events: self.total_scale_events,
            volumes: self.volumes.into_vec(),
        }
    }

    async fn publish(&self, type_: EventType, reason: &str, action: &str, note: String) {
        self.events
            .publish(&self.object_ref, type_, reason, action, Some(note))
            .await;
    }
}


#[cfg(test)]
mod tests {
    use kube::api::ObjectMeta;
    use lattice_common::crd::VolumeAutoscalerSpec;
    use lattice_common::quantity::GI;

    use super::testing::RecordingEventPublisher;
    use super::*;

    fn autoscaler(status: Option<VolumeAutoscalerStatus>) -> VolumeAutoscaler {
        let spec: VolumeAutoscalerSpec =
            serde_yaml::from_str("pvcName: data-0\nmaxSize: 100Gi\n").unwrap();
        VolumeAutoscaler {
            metadata: ObjectMeta {
                name: Some("pg".into()),
                namespace: Some("db".into()),
                ..Default::default()
            },
            spec,
            status,
        }
    }

    fn volume(name: &str) -> VolumeStatus {
        VolumeStatus {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn condition_transition_time_is_kept_while_status_holds() {
        let t0 = Utc::now() - chrono::Duration::minutes(10);
        let t1 = Utc::now();
        let mut conditions = vec![ReadyState::Polling { volumes: 1 }.condition(t0)];

        let changed = set_condition(&mut conditions, ReadyState::Polling { volumes: 2 }.condition(t1));
        assert!(!changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, t0);
        assert_eq!(conditions[0].message, "polling 2 volume(s)");

        let changed = set_condition(
            &mut conditions,
            ReadyState::NoPvcsFound { target: "pvc/x".into() }.condition(t1),
        );
        assert!(changed);
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_eq!(conditions[0].last_transition_time, t1);
    }

    #[test]
    fn reason_change_within_false_counts_as_change() {
        let t0 = Utc::now();
        let mut conditions = vec![ReadyState::NoPvcsFound { target: "x".into() }.condition(t0)];
        let changed = set_condition(
            &mut conditions,
            ReadyState::PrometheusUnavailable { failed: 1, total: 1 }.condition(Utc::now()),
        );
        assert!(changed);
        assert_eq!(conditions[0].reason, "PrometheusUnavailable");
        assert_eq!(conditions[0].last_transition_time, t0);
    }

    #[test]
    fn volume_map_is_keyed_and_sorted_by_name() {
        let mut map = VolumeStatusMap::from_entries(&[volume("b"), volume("a")]);
        map.entry("c").usage_percent = 5;
        map.entry("a").usage_percent = 7;
        assert_eq!(map.len(), 3);

        let names: Vec<_> = map.clone().into_vec().into_iter().map(|v| v.name).collect();
        assert_eq!(names, ["a", "b", "c"]);
        assert_eq!(map.get("a").map(|v| v.usage_percent), Some(7));

        map.retain(&BTreeSet::from(["a".to_string()]));
        assert_eq!(map.len(), 1);
        assert!(map.get("b").is_none());
    }

    #[tokio::test]
    async fn expansion_updates_entry_counter_and_emits_event() {
        let events = RecordingEventPublisher::default();
        let prior = VolumeAutoscalerStatus {
            total_scale_events: 3,
            ..Default::default()
        };
        let vas = autoscaler(Some(prior));
        let now = Utc::now();

        let mut manager = StatusManager::new(&events, &vas);
        assert_eq!(manager.policy(), "db/pg");
        manager.observe("data-0", 10 * GI, 9 * GI, 90);
        manager.record_expansion("data-0", 10 * GI, 12 * GI, now).await;
        assert_eq!(manager.last_scale_time("data-0"), Some(now));

        let status = manager.finish(ReadyState::Polling { volumes: 1 }, Some(4), now).await;
        assert_eq!(status.total_scale_events, 4);
        assert_eq!(status.observed_generation, Some(4));
        assert_eq!(status.last_poll_time, Some(now));
        assert_eq!(status.volumes[0].current_size, "10Gi");
        assert_eq!(status.volumes[0].usage_percent, 90);
        assert_eq!(status.volumes[0].last_scale_size.as_deref(), Some("12Gi"));

        let recorded = events.events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].reason, "Expanded");
        assert!(!recorded[0].warning);
        assert!(recorded[0].note.contains("from 10Gi to 12Gi"));
    }

    #[tokio::test]
    async fn degraded_state_emits_event_only_on_transition() {
        let events = RecordingEventPublisher::default();
        let vas = autoscaler(None);
        let now = Utc::now();

        let status = StatusManager::new(&events, &vas)
            .finish(ReadyState::NoPvcsFound { target: "pvc/data-0".into() }, None, now)
            .await;
        assert_eq!(events.reasons(), ["NoPVCsFound"]);

        let vas = autoscaler(Some(status));
        StatusManager::new(&events, &vas)
            .finish(ReadyState::NoPvcsFound { target: "pvc/data-0".into() }, None, now)
            .await;
        assert_eq!(events.reasons(), ["NoPVCsFound"]);
    }

    #[tokio::test]
    async fn inode_breach_is_advisory_warning() {
        let events = RecordingEventPublisher::default();
        let vas = autoscaler(None);
        let mut manager = StatusManager::new(&events, &vas);

        manager.observe_inodes("data-0", 50, 90).await;
        assert!(events.events().is_empty());

        manager.observe_inodes("data-0", 95, 90).await;
        let recorded = events.events();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].reason, "InodeThresholdExceeded");
        assert!(recorded[0].warning);

        let status = manager.finish(ReadyState::Polling { volumes: 1 }, None, Utc::now()).await;
        assert_eq!(status.volumes[0].inode_usage_percent, Some(95));
        assert_eq!(status.total_scale_events, 0);
    }

    #[tokio::test]
    async fn blocks_map_to_event_severity() {
        let events = RecordingEventPublisher::default();
        let vas = autoscaler(None);
        let mut manager = StatusManager::new(&events, &vas);

        manager.record_blocked("data-0", &BlockReason::ResizeInProgress).await;
        manager
            .record_blocked(
                "data-0",
                &BlockReason::MaxSizeReached {
                    current: 100 * GI,
                    max: 100 * GI,
                },
            )
            .await;

        let recorded = events.events();
        assert_eq!(recorded[0].reason, "ResizeInProgress");
        assert!(!recorded[0].warning);
        assert_eq!(recorded[1].reason, "MaxSizeReached");
        assert!(recorded[1].warning);
    }

    #[tokio::test]
    async fn prune_keeps_only_resolved_claims() {
        let events = RecordingEventPublisher::default();
        let prior = VolumeAutoscalerStatus {
            volumes: vec![volume("data-0"), volume("data-1")],
            ..Default::default()
        };
        let vas = autoscaler(Some(prior));
        let mut manager = StatusManager::new(&events, &vas);
        manager.prune(&BTreeSet::from(["data-1".to_string()]));

        let status = manager.finish(ReadyState::Polling { volumes: 1 }, None, Utc::now()).await;
        assert_eq!(status.volumes.len(), 1);
        assert_eq!(status.volumes[0].name, "data-1");
    }
}
