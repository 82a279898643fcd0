//! Controller runner - builds the VolumeAutoscaler controller future
//!
//! Construction is kept separate from `main` so the watch scope and
//! concurrency settings are decided in one place.
//!
//! Only spec changes (a new `metadata.generation`) trigger a reconcile from
//! the watch. Status writes made by the cycle itself are filtered out, so the
//! cadence is set by the `pollInterval` requeue returned from each cycle.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::runtime::controller::{self, Action};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{predicates, reflector, watcher, Controller, WatchStreamExt};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;

use lattice_common::crd::VolumeAutoscaler;
use lattice_volume_autoscaler::{error_policy, reconcile, AutoscalerConfig, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// so the watcher reconnects cleanly instead of erroring.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// How the controller watches and schedules VolumeAutoscalers
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Maximum concurrent reconciliations
    pub concurrency: u16,
    /// Restrict the watch to one namespace
    pub watch_namespace: Option<String>,
}

/// Build the VolumeAutoscaler controller future
///
/// Reconciliations observe `shutdown` and stop before writing status once it
/// is cancelled.
pub fn build_volume_autoscaler_controller(
    client: Client,
    config: AutoscalerConfig,
    options: &RunnerOptions,
    shutdown: CancellationToken,
) -> anyhow::Result<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let ctx = Context::builder(client.clone())
        .config(config)
        .cancellation(shutdown)
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build autoscaler context: {}", e))?;

    let api: Api<VolumeAutoscaler> = match options.watch_namespace.as_deref() {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };

    tracing::info!(
        concurrency = options.concurrency,
        namespace = options.watch_namespace.as_deref().unwrap_or("<all>"),
        "- VolumeAutoscaler controller"
    );

    let (reader, writer) = reflector::store();
    let stream = reflector(
        writer,
        watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)),
    )
    .default_backoff()
    .applied_objects();

    Ok(Box::pin(
        Controller::for_stream(spec_changes(stream), reader)
            .with_config(controller::Config::default().concurrency(options.concurrency))
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::new(ctx))
            .for_each(log_reconcile_result("VolumeAutoscaler")),
    ))
}

/// Drop watch events that carry no spec change (status-only updates)
fn spec_changes<S>(stream: S) -> impl Stream<Item = Result<VolumeAutoscaler, watcher::Error>>
where
    S: Stream<Item = Result<VolumeAutoscaler, watcher::Error>>,
{
    stream.predicate_filter(predicates::generation)
}

fn log_reconcile_result<E: std::fmt::Display>(
    controller_name: &'static str,
) -> impl Fn(Result<(ObjectRef<VolumeAutoscaler>, Action), E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok((obj, action)) => tracing::debug!(
                object = %obj,
                ?action,
                "{} reconciliation completed",
                controller_name
            ),
            Err(e) => tracing::warn!(error = %e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
