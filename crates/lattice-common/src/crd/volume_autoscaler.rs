//! VolumeAutoscaler Custom Resource Definition
//!
//! A VolumeAutoscaler grows PersistentVolumeClaims in place when kubelet
//! volume statistics show they are filling up. It targets either a single
//! PVC by name or every PVC in its namespace matching a label selector.
//!
//! The status keeps one entry per governed PVC. Those entries carry the
//! cooldown bookkeeping (`lastScaleTime`) between cycles, so they are keyed
//! by PVC name and survive controller restarts.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::quantity::{parse_duration, parse_quantity, GI};
use crate::Error;

/// Default usage percentage that triggers an expansion
pub const DEFAULT_THRESHOLD_PERCENT: u32 = 80;
/// Default growth applied per expansion, as a percentage of current capacity
pub const DEFAULT_INCREASE_PERCENT: u32 = 20;
/// Default floor on the absolute growth per expansion
pub const DEFAULT_INCREASE_MINIMUM: u128 = GI;
/// Default control loop cadence
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Default minimum time between two expansions of the same PVC
pub const DEFAULT_COOLDOWN_PERIOD: Duration = Duration::from_secs(300);

const KIND: &str = "VolumeAutoscaler";

fn default_threshold_percent() -> u32 {
    DEFAULT_THRESHOLD_PERCENT
}

fn default_increase_percent() -> u32 {
    DEFAULT_INCREASE_PERCENT
}

/// Operator for label selector requirements
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LabelSelectorOperator {
    /// Label value must be in the specified set
    In,
    /// Label value must not be in the specified set
    NotIn,
    /// Label must exist (value ignored)
    Exists,
    /// Label must not exist (value ignored)
    DoesNotExist,
}

/// A label selector requirement (mirrors Kubernetes LabelSelectorRequirement)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    /// The label key that the selector applies to
    pub key: String,

    /// Operator representing the relationship between label and values
    pub operator: LabelSelectorOperator,

    /// Values for `In` and `NotIn`; empty for `Exists` and `DoesNotExist`
    #[serde(default)]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    /// The API server rejects `in ()` and values on existence checks
    fn validate(&self) -> Result<(), String> {
        if self.key.is_empty() {
            return Err("key must not be empty".to_string());
        }
        match self.operator {
            LabelSelectorOperator::In | LabelSelectorOperator::NotIn if self.values.is_empty() => {
                Err(format!(
                    "{}: operator {:?} requires at least one value",
                    self.key, self.operator
                ))
            }
            LabelSelectorOperator::Exists | LabelSelectorOperator::DoesNotExist
                if !self.values.is_empty() =>
            {
                Err(format!(
                    "{}: operator {:?} takes no values",
                    self.key, self.operator
                ))
            }
            _ => Ok(()),
        }
    }

    fn to_selector_term(&self) -> String {
        match self.operator {
            LabelSelectorOperator::In => format!("{} in ({})", self.key, self.values.join(",")),
            LabelSelectorOperator::NotIn => {
                format!("{} notin ({})", self.key, self.values.join(","))
            }
            LabelSelectorOperator::Exists => self.key.clone(),
            LabelSelectorOperator::DoesNotExist => format!("!{}", self.key),
        }
    }
}

/// Label selector for PVCs in the autoscaler's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSelector {
    /// Map of label key-value pairs for exact matching
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    /// List of label selector requirements (all must match)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl VolumeSelector {
    /// Check if this selector is empty (matches every PVC in the namespace)
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    /// Render as a label selector string for list calls
    /// (e.g. `app=postgres,tier in (db,cache)`).
    pub fn to_label_selector(&self) -> String {
        self.match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(self.match_expressions.iter().map(|r| r.to_selector_term()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// What a VolumeAutoscaler governs: one named PVC, or every PVC matching a selector.
#[derive(Clone, Debug, PartialEq)]
pub enum VolumeTarget {
    /// A single PVC by name
    Named(String),
    /// All PVCs in the namespace matching the selector
    Selector(VolumeSelector),
}

impl std::fmt::Display for VolumeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Named(name) => write!(f, "pvc/{name}"),
            Self::Selector(sel) if sel.is_empty() => write!(f, "selector(<all>)"),
            Self::Selector(sel) => write!(f, "selector({})", sel.to_label_selector()),
        }
    }
}

/// Specification for a VolumeAutoscaler
///
/// Exactly one of `pvcName` or `selector` must be set.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "VolumeAutoscaler",
    plural = "volumeautoscalers",
    shortname = "vas",
    namespaced,
    status = "VolumeAutoscalerStatus",
    printcolumn = r#"{"name":"PVC","type":"string","jsonPath":".spec.pvcName"}"#,
    printcolumn = r#"{"name":"Threshold","type":"integer","jsonPath":".spec.thresholdPercent"}"#,
    printcolumn = r#"{"name":"MaxSize","type":"string","jsonPath":".spec.maxSize"}"#,
    printcolumn = r#"{"name":"Scaled","type":"integer","jsonPath":".status.totalScaleEvents"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAutoscalerSpec {
    /// Name of a single PVC to govern (mutually exclusive with `selector`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_name: Option<String>,

    /// Label selector for the PVCs to govern (mutually exclusive with `pvcName`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<VolumeSelector>,

    /// Usage percentage that triggers an expansion attempt
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: u32,

    /// Inode usage percentage that is reported as a warning (advisory only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode_threshold_percent: Option<u32>,

    /// Growth applied per expansion, as a percentage of current capacity
    #[serde(default = "default_increase_percent")]
    pub increase_percent: u32,

    /// Floor on the absolute growth per expansion (quantity, default 1Gi)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub increase_minimum: Option<String>,

    /// Hard ceiling for PVC capacity (quantity, e.g. "100Gi")
    pub max_size: String,

    /// Control loop cadence (duration, default 60s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,

    /// Minimum time between two expansions of the same PVC (duration, default 300s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_period: Option<String>,

    /// Prometheus endpoint; falls back to the operator's default
    #[serde(
        default,
        rename = "prometheusURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub prometheus_url: Option<String>,
}

impl VolumeAutoscalerSpec {
    /// Resolve the declared target into its tagged form.
    ///
    /// Fails when neither or both of `pvcName` and `selector` are set.
    pub fn target(&self) -> Result<VolumeTarget, Error> {
        let name = self.pvc_name.as_deref().filter(|n| !n.is_empty());
        match (name, &self.selector) {
            (Some(name), None) => Ok(VolumeTarget::Named(name.to_string())),
            (None, Some(selector)) => Ok(VolumeTarget::Selector(selector.clone())),
            (Some(_), Some(_)) => Err(Error::validation_for_field(
                KIND,
                "spec.pvcName",
                "pvcName and selector are mutually exclusive; set exactly one",
            )),
            (None, None) => Err(Error::validation_for_field(
                KIND,
                "spec.pvcName",
                "one of pvcName or selector must be set",
            )),
        }
    }

    /// Parsed `maxSize` in bytes
    pub fn max_size_bytes(&self) -> Result<u128, Error> {
        parse_quantity(&self.max_size)
            .map_err(|e| Error::validation_for_field(KIND, "spec.maxSize", e))
    }

    /// Parsed `increaseMinimum` in bytes, defaulting to 1Gi
    pub fn increase_minimum_bytes(&self) -> Result<u128, Error> {
        match &self.increase_minimum {
            Some(q) => parse_quantity(q)
                .map_err(|e| Error::validation_for_field(KIND, "spec.increaseMinimum", e)),
            None => Ok(DEFAULT_INCREASE_MINIMUM),
        }
    }

    /// Parsed `pollInterval`, defaulting to 60s
    pub fn poll_interval(&self) -> Result<Duration, Error> {
        parse_optional_duration(self.poll_interval.as_deref(), "spec.pollInterval")
            .map(|d| d.unwrap_or(DEFAULT_POLL_INTERVAL))
    }

    /// Parsed `cooldownPeriod`, defaulting to 300s
    pub fn cooldown_period(&self) -> Result<Duration, Error> {
        parse_optional_duration(self.cooldown_period.as_deref(), "spec.cooldownPeriod")
            .map(|d| d.unwrap_or(DEFAULT_COOLDOWN_PERIOD))
    }

    /// Validate the spec without touching the cluster
    pub fn validate(&self) -> Result<(), Error> {
        if let VolumeTarget::Selector(selector) = self.target()? {
            for (i, requirement) in selector.match_expressions.iter().enumerate() {
                requirement.validate().map_err(|e| {
                    Error::validation_for_field(
                        KIND,
                        format!("spec.selector.matchExpressions[{i}]"),
                        e,
                    )
                })?;
            }
        }

        if self.threshold_percent == 0 || self.threshold_percent > 100 {
            return Err(Error::validation_for_field(
                KIND,
                "spec.thresholdPercent",
                format!("must be between 1 and 100, got {}", self.threshold_percent),
            ));
        }
        if let Some(inode) = self.inode_threshold_percent {
            if inode == 0 || inode > 100 {
                return Err(Error::validation_for_field(
                    KIND,
                    "spec.inodeThresholdPercent",
                    format!("must be between 1 and 100, got {inode}"),
                ));
            }
        }
        if self.increase_percent == 0 {
            return Err(Error::validation_for_field(
                KIND,
                "spec.increasePercent",
                "must be greater than 0",
            ));
        }
        if self.max_size_bytes()? == 0 {
            return Err(Error::validation_for_field(
                KIND,
                "spec.maxSize",
                "must be greater than 0",
            ));
        }
        self.increase_minimum_bytes()?;
        if self.poll_interval()?.is_zero() {
            return Err(Error::validation_for_field(
                KIND,
                "spec.pollInterval",
                "must be greater than 0",
            ));
        }
        self.cooldown_period()?;
        Ok(())
    }
}

fn parse_optional_duration(value: Option<&str>, field: &str) -> Result<Option<Duration>, Error> {
    value
        .map(|v| parse_duration(v).map_err(|e| Error::validation_for_field(KIND, field, e)))
        .transpose()
}

/// Observed state for one governed PVC
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeStatus {
    /// PVC name
    pub name: String,

    /// Current capacity (quantity)
    #[serde(default)]
    pub current_size: String,

    /// Last observed used bytes
    #[serde(default)]
    pub used_bytes: i64,

    /// Last observed usage percentage
    #[serde(default)]
    pub usage_percent: i32,

    /// Last observed inode usage percentage (when an inode threshold is set)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inode_usage_percent: Option<i32>,

    /// When this PVC was last expanded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<DateTime<Utc>>,

    /// Size requested by the last expansion (quantity)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_size: Option<String>,
}

/// Status of a VolumeAutoscaler
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeAutoscalerStatus {
    /// Generation of the spec this status reflects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When the last cycle finished polling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_poll_time: Option<DateTime<Utc>>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Total expansions performed by this autoscaler
    #[serde(default)]
    pub total_scale_events: i64,

    /// One entry per governed PVC, sorted by name.
    ///
    /// Always serialized: status is a merge patch, and an omitted key would
    /// leave pruned entries behind.
    #[serde(default)]
    pub volumes: Vec<VolumeStatus>,
}
