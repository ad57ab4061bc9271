//! Heartbeat Generator (E): a single cooperative task that emits a liveness
//! frame every 5 seconds (and one immediately on start), carrying the
//! aggregate cluster status computed fresh per tick.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use bridge_proto::{ClusterStatus, HeartbeatPayload, OutboundFrame, WorkloadStatus};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::warn;
use uuid::Uuid;

use crate::identity::{HeartbeatSeq, UpdateState};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const STALENESS_THRESHOLD: Duration = Duration::from_secs(10);

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A point-in-time read of the data-plane health probe.
#[derive(Debug, Clone)]
pub struct HealthObservation {
    pub at: Instant,
    pub error: Option<String>,
}

/// The data-plane health probe: an external collaborator the bridge polls
/// for liveness, never owns.
pub trait HealthProbe: Send + Sync {
    fn observe<'a>(&'a self) -> BoxFuture<'a, HealthObservation>;
}

/// Production `HealthProbe` that polls a local data-plane status endpoint
/// over HTTP, the same way the Registration Machine's `HttpEnrollmentClient`
/// talks to the cloud: a plain `reqwest` GET, no retries at this layer.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    status_url: String,
}

impl HttpHealthProbe {
    pub fn new(status_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            status_url,
        }
    }
}

impl HealthProbe for HttpHealthProbe {
    fn observe<'a>(&'a self) -> BoxFuture<'a, HealthObservation> {
        Box::pin(async move {
            let error = match self.client.get(&self.status_url).send().await {
                Ok(resp) if resp.status().is_success() => None,
                Ok(resp) => Some(format!("data plane returned {}", resp.status())),
                Err(e) => Some(e.to_string()),
            };
            HealthObservation {
                at: Instant::now(),
                error,
            }
        })
    }
}

/// Static configuration fields published on every heartbeat.
#[derive(Debug, Clone)]
pub struct HeartbeatContext {
    pub vizier_id: Uuid,
    pub address: String,
    pub port: u16,
    pub bootstrap_mode: bool,
    pub bootstrap_version: String,
}

/// Workload/node snapshot supplied by the orchestrator for a single
/// heartbeat.
#[derive(Debug, Clone, Default)]
pub struct WorkloadSnapshot {
    pub num_nodes: u32,
    pub workloads: Vec<WorkloadStatus>,
}

/// Compute the aggregate cluster status by priority, highest first:
/// updating > update-failed (sticky) > unknown (stale probe) > unhealthy >
/// healthy.
pub fn aggregate_status(
    update: &UpdateState,
    probe_observation: &HealthObservation,
    now: Instant,
) -> ClusterStatus {
    if update.is_running() && !update.is_failed() {
        return ClusterStatus::Updating;
    }
    if update.is_failed() {
        return ClusterStatus::UpdateFailed;
    }
    if now.saturating_duration_since(probe_observation.at) > STALENESS_THRESHOLD {
        return ClusterStatus::Unknown;
    }
    if probe_observation.error.is_some() {
        return ClusterStatus::Unhealthy;
    }
    ClusterStatus::Healthy
}

fn build_payload(
    ctx: &HeartbeatContext,
    seq: u64,
    now_unix_secs: i64,
    workloads: &WorkloadSnapshot,
    status: ClusterStatus,
) -> HeartbeatPayload {
    HeartbeatPayload {
        vizier_id: ctx.vizier_id,
        time_unix_secs: now_unix_secs,
        sequence_number: seq,
        address: ctx.address.clone(),
        port: ctx.port,
        num_nodes: workloads.num_nodes,
        workloads: workloads.workloads.clone(),
        status,
        bootstrap_mode: ctx.bootstrap_mode,
        bootstrap_version: ctx.bootstrap_version.clone(),
    }
}

/// Run the heartbeat loop until `shutdown` fires. Callers supply
/// `now_unix_secs` and `fetch_workloads` as closures so the loop itself has
/// no direct dependency on wall-clock or orchestrator types beyond what it
/// needs to publish.
pub async fn run_heartbeat_generator<F>(
    ctx: HeartbeatContext,
    seq: HeartbeatSeq,
    update: UpdateState,
    probe: &dyn HealthProbe,
    orchestrator: &dyn crate::update::Orchestrator,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    session_id: i64,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    now_unix_secs: F,
) where
    F: Fn() -> i64,
{
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    // First tick fires immediately; `interval` already does this by default.
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = ticker.tick() => {
                let observation = probe.observe().await;
                let status = aggregate_status(&update, &observation, Instant::now());
                let workloads = match orchestrator.workload_state().await {
                    Ok((num_nodes, workloads)) => WorkloadSnapshot { num_nodes, workloads },
                    Err(e) => {
                        warn!(error = %e, "failed to fetch workload state, publishing heartbeat without it");
                        WorkloadSnapshot::default()
                    }
                };
                let payload = build_payload(&ctx, seq.get(), now_unix_secs(), &workloads, status);

                let frame = OutboundFrame {
                    topic: bridge_proto::topics::HEARTBEAT.to_owned(),
                    session_id,
                    payload: match serde_json::to_value(&payload) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!(error = %e, "failed to encode heartbeat payload");
                            continue;
                        }
                    },
                };

                match outbound_tx.try_send(frame) {
                    Ok(()) => {
                        seq.advance();
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("dropping heartbeat: outbound channel full");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(age: Duration, error: Option<&str>) -> HealthObservation {
        HealthObservation {
            at: Instant::now() - age,
            error: error.map(str::to_owned),
        }
    }

    #[test]
    fn updating_takes_priority_over_everything() {
        let update = UpdateState::new();
        update.set_running(true);
        let status = aggregate_status(&update, &observation(Duration::ZERO, None), Instant::now());
        assert_eq!(status, ClusterStatus::Updating);
    }

    #[test]
    fn update_failed_is_sticky_even_when_not_running() {
        let update = UpdateState::new();
        update.set_running(true);
        update.mark_failed();
        update.set_running(false);
        let status = aggregate_status(&update, &observation(Duration::ZERO, None), Instant::now());
        assert_eq!(status, ClusterStatus::UpdateFailed);
    }

    #[test]
    fn stale_probe_reports_unknown() {
        let update = UpdateState::new();
        let status = aggregate_status(&update, &observation(Duration::from_secs(11), None), Instant::now());
        assert_eq!(status, ClusterStatus::Unknown);
    }

    #[test]
    fn probe_error_reports_unhealthy_when_fresh() {
        let update = UpdateState::new();
        let status = aggregate_status(
            &update,
            &observation(Duration::from_secs(1), Some("probe failed")),
            Instant::now(),
        );
        assert_eq!(status, ClusterStatus::Unhealthy);
    }

    #[test]
    fn healthy_when_nothing_else_applies() {
        let update = UpdateState::new();
        let status = aggregate_status(&update, &observation(Duration::ZERO, None), Instant::now());
        assert_eq!(status, ClusterStatus::Healthy);
    }
}
