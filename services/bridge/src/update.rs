//! Update Controller (F): receives `VizierUpdate` commands, renders and
//! launches the updater job, observes completion, and keeps the update
//! flags the Heartbeat Generator reads in sync.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bridge_proto::{OutboundFrame, VizierUpdateRequest, VizierUpdateResponse, WorkloadStatus};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::BridgeError;
use crate::identity::UpdateState;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Cluster metadata the orchestrator reports about the cluster it runs in.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    pub uid: String,
    pub name: String,
    pub version: String,
}

/// Whether the job that just finished is considered a success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure,
}

/// Every collaborator the update flow and the heartbeat generator need from
/// the in-cluster workload orchestrator. Kept as a single trait, rather than
/// split per consumer, because the production adapter shares one
/// `kube::Client` across all of it.
pub trait Orchestrator: Send + Sync {
    fn local_address<'a>(&'a self) -> BoxFuture<'a, Result<(String, u16), BridgeError>>;
    fn cluster_metadata<'a>(&'a self) -> BoxFuture<'a, Result<ClusterMetadata, BridgeError>>;
    fn workload_state<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<(u32, Vec<WorkloadStatus>), BridgeError>>;
    fn render_job_manifest<'a>(
        &'a self,
        template: &'a str,
        substitutions: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String, BridgeError>>;
    fn launch_job<'a>(&'a self, manifest: &'a str) -> BoxFuture<'a, Result<(), BridgeError>>;
    fn get_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, BridgeError>>;
    fn wait_job_completion<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<JobOutcome, BridgeError>>;
    fn delete_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BridgeError>>;
    fn create_secret<'a>(
        &'a self,
        name: &'a str,
        data: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, Result<(), BridgeError>>;
    fn persist_cluster_id<'a>(&'a self, id: uuid::Uuid) -> BoxFuture<'a, Result<(), BridgeError>>;
}

pub const UPDATE_JOB_NAME: &str = "pl-update-job";
pub const UPDATE_SECRET_NAME: &str = "pl-update-job-secrets";
const UPDATE_SECRET_TOKEN_KEY: &str = "cloud-token";

/// Minimal `{KEY}`-token template substitution over a caller-supplied
/// template string — the narrowest faithful stand-in for the real YAML
/// templating engine, which is out of scope here.
pub fn render_template(template: &str, substitutions: &HashMap<String, String>) -> String {
    let mut out = template.to_owned();
    for (key, value) in substitutions {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Run the full update flow for one `VizierUpdate` command. Each step fails
/// independently: a failure here aborts the update and marks it failed, but
/// never tears down the cloud connection.
///
/// Takes an owned `Arc<dyn Orchestrator>` rather than a borrow because a
/// successful launch hands a clone of it to a spawned `watch_job` task that
/// outlives this call — the routing loop that calls this function can't
/// afford to block on the job's completion.
pub async fn handle_vizier_update(
    orchestrator: Arc<dyn Orchestrator>,
    update_state: &UpdateState,
    payload: serde_json::Value,
    job_template: &str,
    session_id: i64,
    outbound_tx: &mpsc::Sender<OutboundFrame>,
) -> Result<(), BridgeError> {
    let request: VizierUpdateRequest =
        serde_json::from_value(payload).map_err(|e| BridgeError::UpdateDecode(e.to_string()))?;

    update_state.set_running(true);
    update_state.clear_failed();

    let result = run_update(orchestrator.as_ref(), &request, job_template).await;

    if let Err(e) = &result {
        error!(error = %e, "update failed");
        update_state.mark_failed();
        update_state.set_running(false);
        return Err(BridgeError::UpdateLaunch(e.to_string()));
    }

    let watch_state = update_state.clone();
    tokio::spawn(async move {
        watch_job(orchestrator.as_ref(), watch_state).await;
    });

    let response = VizierUpdateResponse {
        update_started: true,
    };
    let frame = OutboundFrame {
        topic: bridge_proto::topics::VIZIER_UPDATE_RESPONSE.to_owned(),
        session_id,
        payload: serde_json::to_value(response).map_err(|e| BridgeError::UpdateLaunch(e.to_string()))?,
    };
    if outbound_tx.send(frame).await.is_err() {
        warn!("failed to publish VizierUpdateResponse: outbound channel closed");
    }

    Ok(())
}

async fn run_update(
    orchestrator: &dyn Orchestrator,
    request: &VizierUpdateRequest,
    job_template: &str,
) -> Result<(), BridgeError> {
    let mut substitutions = HashMap::new();
    substitutions.insert("PL_VIZIER_VERSION".to_owned(), request.version.clone());
    substitutions.insert(
        "PL_REDEPLOY_ETCD".to_owned(),
        request.redeploy_etcd.to_string(),
    );
    substitutions.insert("updater".to_owned(), request.version.clone());

    let manifest = orchestrator
        .render_job_manifest(job_template, &substitutions)
        .await
        .map_err(|e| BridgeError::UpdateRender(e.to_string()))?;

    let mut secret_data = HashMap::new();
    secret_data.insert(UPDATE_SECRET_TOKEN_KEY.to_owned(), request.token.clone());
    orchestrator
        .create_secret(UPDATE_SECRET_NAME, &secret_data)
        .await
        .map_err(|e| BridgeError::UpdateSecret(e.to_string()))?;

    orchestrator
        .launch_job(&manifest)
        .await
        .map_err(|e| BridgeError::UpdateLaunch(e.to_string()))
}

/// Startup job-recovery watcher: if an update job with `UPDATE_JOB_NAME`
/// already exists when the process starts, set `running := true` and block
/// on its completion, then set `failed` according to the outcome and
/// delete the job. `running` transitions to `false` in all cases.
pub async fn recover_existing_job(orchestrator: &dyn Orchestrator, update_state: UpdateState) {
    match orchestrator.get_job(UPDATE_JOB_NAME).await {
        Ok(true) => {
            info!("found existing update job at startup, resuming watch");
            update_state.set_running(true);
            watch_job(orchestrator, update_state).await;
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "failed to probe for existing update job"),
    }
}

async fn watch_job(orchestrator: &dyn Orchestrator, update_state: UpdateState) {
    let outcome = orchestrator.wait_job_completion(UPDATE_JOB_NAME).await;
    match outcome {
        Ok(JobOutcome::Success) => {}
        Ok(JobOutcome::Failure) => update_state.mark_failed(),
        Err(e) => {
            warn!(error = %e, "failed waiting for update job completion");
            update_state.mark_failed();
        }
    }
    if let Err(e) = orchestrator.delete_job(UPDATE_JOB_NAME).await {
        warn!(error = %e, "failed to delete completed update job");
    }
    update_state.set_running(false);
}
