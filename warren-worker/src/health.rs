//! Per-container health monitor (spec §4.11). Grounded on the reconciler's
//! tick-based task shape (`warren-manager/src/reconciler.rs`), specialized
//! to one independent task per health-checked container rather than one
//! shared tick.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use warren_proto::pb::{HealthCheckSpec, HealthProbeKind};

use crate::runtime::ContainerRuntime;

/// Tracks consecutive failures/successes for one container, independent of
/// the probe kind (spec §4.11: "healthy flag ... flipped to false after
/// `retries` consecutive failures; flipped back to true after one success").
pub struct HealthState {
    consecutive_failures: u32,
    consecutive_successes: u32,
    healthy: bool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self { consecutive_failures: 0, consecutive_successes: 0, healthy: true }
    }
}

impl HealthState {
    /// Returns `Some(new_healthy)` only when the flag actually flips, so the
    /// caller knows when a `ReportContainerHealth` transition matters versus
    /// a repeated check of an already-settled state. Every check is still
    /// reported regardless (spec: "every check, healthy or not, is
    /// reported").
    pub fn record(&mut self, ok: bool, retries: u32) -> bool {
        if ok {
            self.consecutive_failures = 0;
            self.consecutive_successes += 1;
            if !self.healthy {
                self.healthy = true;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.healthy && self.consecutive_failures >= retries.max(1) {
                self.healthy = false;
            }
        }
        self.healthy
    }
}

/// Runs one probe against the endpoint described by `spec.target`, per
/// `spec.kind`. `container_ip` is used for HTTP/TCP probes when the target
/// doesn't already carry a host.
pub async fn probe_once(
    runtime: &ContainerRuntime,
    runtime_container_id: &str,
    spec: &HealthCheckSpec,
) -> bool {
    let timeout_duration = Duration::from_secs(spec.timeout_seconds.max(1) as u64);
    let kind = HealthProbeKind::try_from(spec.kind).unwrap_or(HealthProbeKind::Unspecified);

    let result = match kind {
        HealthProbeKind::Http => timeout(timeout_duration, probe_http(spec)).await,
        HealthProbeKind::Tcp => timeout(timeout_duration, probe_tcp(&spec.target)).await,
        HealthProbeKind::Exec => {
            let command: Vec<String> = spec.target.split_whitespace().map(str::to_string).collect();
            timeout(timeout_duration, async { runtime.exec(runtime_container_id, command).await.unwrap_or(false) }).await
        }
        HealthProbeKind::Unspecified => return true,
    };

    match result {
        Ok(ok) => ok,
        Err(_) => {
            debug!(runtime_container_id, "health probe timed out");
            false
        }
    }
}

async fn probe_http(spec: &HealthCheckSpec) -> bool {
    let min = if spec.success_status_min == 0 { 200 } else { spec.success_status_min };
    let max = if spec.success_status_max == 0 { 399 } else { spec.success_status_max };
    match reqwest::get(&spec.target).await {
        Ok(response) => {
            let status = response.status().as_u16() as u32;
            status >= min && status <= max
        }
        Err(e) => {
            warn!(target = %spec.target, error = %e, "http health probe failed");
            false
        }
    }
}

async fn probe_tcp(target: &str) -> bool {
    TcpStream::connect(target).await.is_ok()
}
