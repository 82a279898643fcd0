//! VolumeAutoscaler reconciliation
//!
//! One cycle per policy: interpret the spec, resolve the governed claims,
//! poll each claim's usage, expand the ones over threshold that pass the
//! safety checks, and write the accumulated status once at the end.
//!
//! Failures are contained per volume. A failed query or patch on one claim
//! is recorded and the cycle moves on; only a broken spec or an unreachable
//! API server turns the cycle into a reconcile error.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use lattice_common::crd::{VolumeAutoscaler, VolumeAutoscalerSpec, VolumeAutoscalerStatus, VolumeTarget};
use lattice_common::events::{EventPublisher, KubeEventPublisher};
use lattice_common::metrics::{self, PollErrorCategory, ReconcileTimer};
use lattice_common::quantity::format_quantity;
use lattice_common::REQUEUE_ERROR_SECS;

use crate::client::{KubeVolumeClient, VolumeClient};
use crate::error::AutoscalerError;
use crate::prometheus::{
    queries, MetricsBackend, MetricsError, PrometheusClientRegistry, DEFAULT_QUERY_TIMEOUT,
};
use crate::pvc::bound_capacity;
use crate::safety::{self, SafetyInput};
use crate::sizing::{next_size, usage_percent, whole_sample};
use crate::status::{ReadyState, StatusManager};
use crate::{resolver, FIELD_MANAGER, STATUS_RETRY_SECS};

/// Prometheus used by policies that do not set `prometheusURL`
pub const DEFAULT_PROMETHEUS_URL: &str = "http://prometheus-operated.monitoring.svc:9090";
/// Per-call timeout for Kubernetes API requests
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(15);
/// Upper bound on a whole reconciliation cycle
pub const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Operator-wide settings shared by every cycle
#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    /// Prometheus endpoint for policies without `prometheusURL`
    pub default_prometheus_url: String,
    /// Timeout for a single telemetry query
    pub query_timeout: Duration,
    /// Timeout for a single Kubernetes API call
    pub api_timeout: Duration,
    /// Deadline for an entire cycle
    pub cycle_timeout: Duration,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            default_prometheus_url: DEFAULT_PROMETHEUS_URL.to_string(),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            api_timeout: DEFAULT_API_TIMEOUT,
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
        }
    }
}

/// Controller context shared by all reconciliations
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client)
///     .config(config)
///     .cancellation(shutdown.clone())
///     .build()?;
/// ```
pub struct Context {
    /// Kubernetes access (trait object for testability)
    pub kube: Arc<dyn VolumeClient>,
    /// Telemetry access, normally the shared Prometheus client registry
    pub metrics: Arc<dyn MetricsBackend>,
    /// Kubernetes Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Operator-wide settings
    pub config: AutoscalerConfig,
    /// Cancelled when the process is shutting down
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn VolumeClient>,
        metrics: Arc<dyn MetricsBackend>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            metrics,
            events,
            config: AutoscalerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn VolumeClient>>,
    metrics: Option<Arc<dyn MetricsBackend>>,
    events: Option<Arc<dyn EventPublisher>>,
    config: AutoscalerConfig,
    cancel: CancellationToken,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            metrics: None,
            events: None,
            config: AutoscalerConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Set operator-wide settings
    pub fn config(mut self, config: AutoscalerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a shutdown token with the rest of the process
    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn VolumeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the telemetry backend
    pub fn metrics_backend(mut self, metrics: Arc<dyn MetricsBackend>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, AutoscalerError> {
        let metrics: Arc<dyn MetricsBackend> = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(PrometheusClientRegistry::new(self.config.query_timeout)?),
        };
        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeVolumeClient::new(self.client.clone()))),
            metrics,
            events: self
                .events
                .unwrap_or_else(|| Arc::new(KubeEventPublisher::new(self.client.clone(), FIELD_MANAGER))),
            config: self.config,
            cancel: self.cancel,
        })
    }
}

/// Spec values resolved for one cycle
#[derive(Debug, Clone)]
struct PolicySettings {
    target: VolumeTarget,
    threshold_percent: u32,
    inode_threshold_percent: Option<u32>,
    increase_percent: u32,
    increase_minimum: u128,
    max_size: u128,
    poll_interval: Duration,
    cooldown: Duration,
    prometheus_url: String,
}

impl PolicySettings {
    fn from_spec(spec: &VolumeAutoscalerSpec, default_url: &str) -> Result<Self, AutoscalerError> {
        let misconfigured = |e: lattice_common::Error| AutoscalerError::Misconfigured(e.to_string());
        spec.validate().map_err(misconfigured)?;

        Ok(Self {
            target: spec.target().map_err(misconfigured)?,
            threshold_percent: spec.threshold_percent,
            inode_threshold_percent: spec.inode_threshold_percent,
            increase_percent: spec.increase_percent,
            increase_minimum: spec.increase_minimum_bytes().map_err(misconfigured)?,
            max_size: spec.max_size_bytes().map_err(misconfigured)?,
            poll_interval: spec.poll_interval().map_err(misconfigured)?,
            cooldown: spec.cooldown_period().map_err(misconfigured)?,
            prometheus_url: spec
                .prometheus_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .unwrap_or(default_url)
                .to_string(),
        })
    }
}

/// Error policy: log and requeue with a fixed delay
pub fn error_policy(
    autoscaler: Arc<VolumeAutoscaler>,
    error: &AutoscalerError,
    _ctx: Arc<Context>,
) -> Action {
    warn!(
        policy = %autoscaler.name_any(),
        namespace = %autoscaler.namespace().unwrap_or_default(),
        error = %error,
        "VolumeAutoscaler reconcile error, will retry"
    );
    Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
}

/// Run one cycle for a VolumeAutoscaler.
///
/// The cycle is abandoned without writing status if the process shuts down
/// or the cycle deadline passes.
#[instrument(
    skip(autoscaler, ctx),
    fields(
        policy = %autoscaler.name_any(),
        namespace = %autoscaler.namespace().unwrap_or_default()
    )
)]
pub async fn reconcile(
    autoscaler: Arc<VolumeAutoscaler>,
    ctx: Arc<Context>,
) -> Result<Action, AutoscalerError> {
    let policy = format!(
        "{}/{}",
        autoscaler.namespace().unwrap_or_default(),
        autoscaler.name_any()
    );
    let timer = ReconcileTimer::start(policy);
    let deadline = ctx.config.cycle_timeout;

    let result = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(AutoscalerError::Cancelled),
        outcome = tokio::time::timeout(deadline, run_cycle(&autoscaler, &ctx)) => {
            outcome.unwrap_or_else(|_| Err(AutoscalerError::timeout("reconcile cycle", deadline)))
        }
    };

    match &result {
        Ok(_) => timer.success(),
        Err(_) => timer.error(),
    }
    result
}

async fn run_cycle(
    autoscaler: &VolumeAutoscaler,
    ctx: &Context,
) -> Result<Action, AutoscalerError> {
    let name = autoscaler.name_any();
    let namespace = autoscaler
        .namespace()
        .ok_or(AutoscalerError::MissingNamespace)?;
    let generation = autoscaler.metadata.generation;
    let now = Utc::now();
    let mut status = StatusManager::new(ctx.events.as_ref(), autoscaler);

    let settings =
        match PolicySettings::from_spec(&autoscaler.spec, &ctx.config.default_prometheus_url) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(error = %e, "VolumeAutoscaler is misconfigured");
                let report = status
                    .finish(
                        ReadyState::Misconfigured {
                            message: e.to_string(),
                        },
                        generation,
                        now,
                    )
                    .await;
                if let Err(persist_err) = write_status(ctx, &namespace, &name, &report).await {
                    warn!(error = %persist_err, "Failed to record misconfiguration in status");
                }
                return Err(e);
            }
        };

    let pvcs = match resolver::resolve_target(
        ctx.kube.as_ref(),
        &namespace,
        &settings.target,
        ctx.config.api_timeout,
    )
    .await
    {
        Ok(pvcs) => pvcs,
        Err(AutoscalerError::VolumeNotFound { .. }) => Vec::new(),
        Err(e) => return Err(e),
    };

    let ready = if pvcs.is_empty() {
        debug!(volume_target = %settings.target, "No PersistentVolumeClaims matched");
        ReadyState::NoPvcsFound {
            target: settings.target.to_string(),
        }
    } else {
        let mut failed = 0;
        for pvc in &pvcs {
            if ctx.cancel.is_cancelled() {
                return Err(AutoscalerError::Cancelled);
            }
            if let Err(e) = poll_volume(ctx, &settings, &namespace, pvc, &mut status, now).await {
                failed += 1;
                warn!(pvc = %pvc.name_any(), error = %e, "Telemetry unavailable for volume");
            }
        }

        let resolved: BTreeSet<String> = pvcs.iter().map(|p| p.name_any()).collect();
        status.prune(&resolved);

        if failed > 0 {
            ReadyState::PrometheusUnavailable {
                failed,
                total: pvcs.len(),
            }
        } else {
            ReadyState::Polling {
                volumes: pvcs.len(),
            }
        }
    };

    let report = status.finish(ready, generation, now).await;
    persist(ctx, &namespace, &name, &report, settings.poll_interval).await
}

/// Observe one claim and expand it if warranted.
///
/// Returns an error only when the usage telemetry itself is unavailable;
/// everything after that is recorded through `status` and never fails.
async fn poll_volume(
    ctx: &Context,
    settings: &PolicySettings,
    namespace: &str,
    pvc: &PersistentVolumeClaim,
    status: &mut StatusManager<'_>,
    now: DateTime<Utc>,
) -> Result<(), MetricsError> {
    let pvc_name = pvc.name_any();
    let url = settings.prometheus_url.as_str();

    let used = query(ctx, url, &queries::used_bytes(namespace, &pvc_name))
        .await
        .inspect_err(|_| status.record_error(PollErrorCategory::UsedBytes))?;
    let capacity = query(ctx, url, &queries::capacity_bytes(namespace, &pvc_name))
        .await
        .inspect_err(|_| status.record_error(PollErrorCategory::CapacityBytes))?;

    let used = whole_sample(used);
    let telemetry_capacity = whole_sample(capacity);
    let Some(usage) = usage_percent(used, telemetry_capacity) else {
        warn!(pvc = %pvc_name, "Volume reports no capacity, skipping");
        return Ok(());
    };

    let current_size = bound_capacity(pvc).unwrap_or(telemetry_capacity);
    status.observe(&pvc_name, current_size, used, usage);
    debug!(
        pvc = %pvc_name,
        usage_percent = usage,
        threshold = settings.threshold_percent,
        "Observed volume usage"
    );

    match settings.inode_threshold_percent {
        Some(threshold) => observe_inodes(ctx, url, namespace, &pvc_name, threshold, status).await,
        None => status.clear_inodes(&pvc_name),
    }

    if i64::from(usage) < i64::from(settings.threshold_percent) {
        return Ok(());
    }

    let input = SafetyInput {
        pvc,
        current_size,
        max_size: settings.max_size,
        last_scale_time: status.last_scale_time(&pvc_name),
        cooldown: settings.cooldown,
        now,
    };
    match safety::check(ctx.kube.as_ref(), &input, ctx.config.api_timeout).await {
        Ok(None) => {}
        Ok(Some(block)) => {
            status.record_blocked(&pvc_name, &block).await;
            return Ok(());
        }
        Err(e) => {
            status.record_error(PollErrorCategory::StorageClass);
            warn!(pvc = %pvc_name, error = %e, "Could not check StorageClass, skipping expansion");
            return Ok(());
        }
    }

    match query(ctx, url, &queries::health_abnormal(namespace, &pvc_name)).await {
        Ok(abnormal) if abnormal >= 1.0 => {
            status.record_unhealthy(&pvc_name).await;
            return Ok(());
        }
        // kubelets without volume health monitoring export nothing here
        Ok(_) | Err(MetricsError::NoData { .. }) => {}
        Err(e) => {
            status.record_error(PollErrorCategory::Health);
            warn!(pvc = %pvc_name, error = %e, "Volume health query failed, assuming healthy");
        }
    }

    let new_size = next_size(
        current_size,
        settings.increase_percent,
        Some(settings.increase_minimum),
        settings.max_size,
    );
    if new_size <= current_size {
        return Ok(());
    }

    let patch = with_api_timeout(
        ctx,
        "patch PVC",
        ctx.kube.patch_pvc_storage(
            namespace,
            &pvc_name,
            pvc.metadata.resource_version.clone(),
            &format_quantity(new_size),
        ),
    )
    .await;

    match patch {
        Ok(()) => {
            status
                .record_expansion(&pvc_name, current_size, new_size, now)
                .await
        }
        Err(e) if e.is_conflict() => {
            status
                .record_expand_failed(
                    &pvc_name,
                    new_size,
                    "claim changed since it was read, retrying next cycle",
                )
                .await
        }
        Err(e) => {
            status
                .record_expand_failed(&pvc_name, new_size, &e.to_string())
                .await
        }
    }
    Ok(())
}

async fn observe_inodes(
    ctx: &Context,
    url: &str,
    namespace: &str,
    pvc: &str,
    threshold: u32,
    status: &mut StatusManager<'_>,
) {
    let used = query(ctx, url, &queries::inodes_used(namespace, pvc)).await;
    let total = query(ctx, url, &queries::inodes(namespace, pvc)).await;

    match (used, total) {
        (Ok(used), Ok(total)) => match usage_percent(whole_sample(used), whole_sample(total)) {
            Some(pct) => status.observe_inodes(pvc, pct, threshold).await,
            None => debug!(pvc, "Volume reports no inodes"),
        },
        (Err(e), _) | (_, Err(e)) => {
            status.record_error(PollErrorCategory::Inodes);
            debug!(pvc, error = %e, "Inode query failed");
        }
    }
}

async fn query(ctx: &Context, url: &str, expr: &str) -> Result<f64, MetricsError> {
    tokio::time::timeout(ctx.config.query_timeout, ctx.metrics.query(url, expr))
        .await
        .unwrap_or_else(|_| {
            Err(MetricsError::Timeout {
                url: url.to_string(),
            })
        })
}

async fn with_api_timeout<T>(
    ctx: &Context,
    operation: &'static str,
    call: impl Future<Output = Result<T, lattice_common::Error>>,
) -> Result<T, AutoscalerError> {
    let timeout = ctx.config.api_timeout;
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| AutoscalerError::timeout(operation, timeout))?
        .map_err(AutoscalerError::from)
}

async fn write_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &VolumeAutoscalerStatus,
) -> Result<(), AutoscalerError> {
    if ctx.cancel.is_cancelled() {
        return Err(AutoscalerError::Cancelled);
    }
    with_api_timeout(ctx, "status patch", ctx.kube.patch_status(namespace, name, status)).await
}

/// Write the cycle's status and schedule the next cycle
async fn persist(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &VolumeAutoscalerStatus,
    poll_interval: Duration,
) -> Result<Action, AutoscalerError> {
    match write_status(ctx, namespace, name, status).await {
        Ok(()) => Ok(Action::requeue(poll_interval)),
        Err(AutoscalerError::Cancelled) => Err(AutoscalerError::Cancelled),
        Err(e) if e.is_not_found() => {
            debug!("VolumeAutoscaler deleted during cycle");
            Ok(Action::await_change())
        }
        Err(e) => {
            metrics::record_poll_error(&format!("{namespace}/{name}"), PollErrorCategory::Status);
            warn!(error = %e, retry_secs = STATUS_RETRY_SECS, "Failed to persist status");
            Ok(Action::requeue(Duration::from_secs(STATUS_RETRY_SECS)))
        }
    }
}
