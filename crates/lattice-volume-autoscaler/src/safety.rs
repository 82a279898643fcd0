//! Pre-expansion safety checks
//!
//! Checks run in a fixed order and stop at the first that blocks:
//! resize in progress, cooldown, maximum size, storage class expandability.
//! Only the storage class check talks to the API server.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use lattice_common::events::reasons;
use lattice_common::quantity::{format_duration, format_quantity};

use crate::client::VolumeClient;
use crate::error::AutoscalerError;
use crate::pvc::{is_resizing, storage_class_name};

/// Why an expansion was not attempted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    /// A previous resize has not completed
    ResizeInProgress,
    /// The claim was expanded less than one cooldown period ago
    CooldownActive { remaining: Duration },
    /// The claim is already at or above the configured maximum
    MaxSizeReached { current: u128, max: u128 },
    /// The claim's StorageClass does not allow expansion, or cannot be found
    StorageClassNotExpandable { class: Option<String> },
}

impl BlockReason {
    /// Event reason recorded for this block
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ResizeInProgress => reasons::RESIZE_IN_PROGRESS,
            Self::CooldownActive { .. } => reasons::COOLDOWN_ACTIVE,
            Self::MaxSizeReached { .. } => reasons::MAX_SIZE_REACHED,
            Self::StorageClassNotExpandable { .. } => reasons::STORAGE_CLASS_NOT_EXPANDABLE,
        }
    }

    /// Whether the block needs operator attention
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::MaxSizeReached { .. } | Self::StorageClassNotExpandable { .. }
        )
    }

    /// Human-readable explanation
    pub fn message(&self) -> String {
        match self {
            Self::ResizeInProgress => "a previous resize is still in progress".to_string(),
            Self::CooldownActive { remaining } => format!(
                "last expansion was too recent, {} of cooldown remaining",
                format_duration(*remaining)
            ),
            Self::MaxSizeReached { current, max } => format!(
                "volume is {} and cannot grow past maxSize {}",
                format_quantity(*current),
                format_quantity(*max)
            ),
            Self::StorageClassNotExpandable { class: Some(class) } => {
                format!("StorageClass {class} does not allow volume expansion")
            }
            Self::StorageClassNotExpandable { class: None } => {
                "claim has no StorageClass and the cluster has no default".to_string()
            }
        }
    }
}

/// Inputs for evaluating one claim
#[derive(Debug, Clone)]
pub struct SafetyInput<'a> {
    pub pvc: &'a PersistentVolumeClaim,
    pub current_size: u128,
    pub max_size: u128,
    pub last_scale_time: Option<DateTime<Utc>>,
    pub cooldown: Duration,
    pub now: DateTime<Utc>,
}

/// Time left in the cooldown window, or `None` once it has elapsed.
///
/// A last-scale time in the future counts as "just now".
pub fn cooldown_remaining(
    last_scale_time: Option<DateTime<Utc>>,
    cooldown: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let last = last_scale_time?;
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
}

/// Run every check in order; `Ok(None)` means expansion may proceed.
pub async fn check(
    client: &dyn VolumeClient,
    input: &SafetyInput<'_>,
    timeout: Duration,
) -> Result<Option<BlockReason>, AutoscalerError> {
    if is_resizing(input.pvc) {
        return Ok(Some(BlockReason::ResizeInProgress));
    }

    if let Some(remaining) = cooldown_remaining(input.last_scale_time, input.cooldown, input.now) {
        return Ok(Some(BlockReason::CooldownActive { remaining }));
    }

    if input.current_size >= input.max_size {
        return Ok(Some(BlockReason::MaxSizeReached {
            current: input.current_size,
            max: input.max_size,
        }));
    }

    let class = match storage_class_name(input.pvc) {
        Some(name) => tokio::time::timeout(timeout, client.get_storage_class(name))
            .await
            .map_err(|_| AutoscalerError::timeout("get StorageClass", timeout))??,
        None => tokio::time::timeout(timeout, client.default_storage_class())
            .await
            .map_err(|_| AutoscalerError::timeout("find default StorageClass", timeout))??,
    };

    let expandable = class
        .as_ref()
        .is_some_and(|c| c.allow_volume_expansion == Some(true));
    if !expandable {
        let name = class
            .and_then(|c| c.metadata.name)
            .or_else(|| storage_class_name(input.pvc).map(str::to_string));
        return Ok(Some(BlockReason::StorageClassNotExpandable { class: name }));
    }

    Ok(None)
}
