//! Custom Resource Definitions for Lattice
//!
//! This module contains the CRDs served by the volume autoscaler.

mod types;
mod volume_autoscaler;

pub use types::{Condition, ConditionStatus};
pub use volume_autoscaler::{
    LabelSelectorOperator, LabelSelectorRequirement, VolumeAutoscaler, VolumeAutoscalerSpec,
    VolumeAutoscalerStatus, VolumeSelector, VolumeStatus, VolumeTarget, DEFAULT_COOLDOWN_PERIOD,
    DEFAULT_INCREASE_MINIMUM, DEFAULT_INCREASE_PERCENT, DEFAULT_POLL_INTERVAL,
    DEFAULT_THRESHOLD_PERCENT,
};
