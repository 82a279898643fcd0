use std::time::Duration;

use clap::Parser;

use lattice_volume_autoscaler::controller::DEFAULT_PROMETHEUS_URL;
use lattice_volume_autoscaler::AutoscalerConfig;

/// Lattice VolumeAutoscaler - grows PersistentVolumeClaims before they fill up
#[derive(Parser, Debug, Clone)]
#[command(name = "lattice-volume-autoscaler", version, about, long_about = None)]
pub struct Cli {
    /// Print the VolumeAutoscaler CRD as YAML and exit
    #[arg(long)]
    pub crd: bool,

    /// Server-side apply the CRD on startup
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub install_crds: bool,

    /// Maximum number of VolumeAutoscalers reconciled at once
    #[arg(long, env = "LATTICE_AUTOSCALER_CONCURRENCY", default_value_t = 4)]
    pub concurrency: u16,

    /// Prometheus used by policies that do not set prometheusURL
    #[arg(long, env = "LATTICE_PROMETHEUS_URL", default_value = DEFAULT_PROMETHEUS_URL)]
    pub default_prometheus_url: String,

    /// Timeout for a single Prometheus query
    #[arg(long, default_value_t = 10)]
    pub query_timeout_secs: u64,

    /// Timeout for a single Kubernetes API call
    #[arg(long, default_value_t = 15)]
    pub api_timeout_secs: u64,

    /// Deadline for one reconciliation cycle
    #[arg(long, default_value_t = 120)]
    pub cycle_timeout_secs: u64,

    /// Only watch VolumeAutoscalers in this namespace (default: all namespaces)
    #[arg(long)]
    pub watch_namespace: Option<String>,

    /// Log human-readable text instead of JSON
    #[arg(long)]
    pub text_logs: bool,
}

impl Cli {
    /// Settings handed to every reconciliation
    pub fn autoscaler_config(&self) -> AutoscalerConfig {
        AutoscalerConfig {
            default_prometheus_url: self.default_prometheus_url.clone(),
            query_timeout: Duration::from_secs(self.query_timeout_secs),
            api_timeout: Duration::from_secs(self.api_timeout_secs),
            cycle_timeout: Duration::from_secs(self.cycle_timeout_secs),
        }
    }

    /// Reject settings that would stall or disable the controller
    pub fn validate(&self) -> Result<(), String> {
        if self.concurrency == 0 {
            return Err("--concurrency must be at least 1".to_string());
        }
        for (flag, value) in [
            ("--query-timeout-secs", self.query_timeout_secs),
            ("--api-timeout-secs", self.api_timeout_secs),
            ("--cycle-timeout-secs", self.cycle_timeout_secs),
        ] {
            if value == 0 {
                return Err(format!("{flag} must be greater than 0"));
            }
        }
        Ok(())
    }
}
