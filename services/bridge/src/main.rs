// bridge: Relays cluster-local bus traffic to the cloud over a persistent
// RPC stream, handling enrollment, registration, heartbeats, and updates.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bridge::bus::NatsBus;
use bridge::error::BridgeError;
use bridge::heartbeat::HttpHealthProbe;
use bridge::identity::{ClusterIdentity, HeartbeatSeq, UpdateState};
use bridge::orchestrator::{load_persisted_identity, KubeOrchestrator};
use bridge::registration::{EnrollmentClient, HttpEnrollmentClient};
use bridge::supervisor::{BridgeSupervisor, ChannelFactory};
use bridge::transport::{CloudChannel, WsCloudChannel};
use bridge::update::{recover_existing_job, Orchestrator};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "bridge")]
struct Cli {
    /// Path to the bridge's TOML config file.
    #[arg(long, default_value = "/etc/pl/vzconn-bridge.toml")]
    config: std::path::PathBuf,
}

struct WsChannelFactory {
    stream_url: String,
}

impl ChannelFactory for WsChannelFactory {
    fn connect<'a>(
        &'a self,
        jwt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn CloudChannel>, BridgeError>> + Send + 'a>> {
        Box::pin(async move {
            let channel = WsCloudChannel::connect(&self.stream_url, jwt).await?;
            Ok(Arc::new(channel) as Arc<dyn CloudChannel>)
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "bridge starting");

    let cli = Cli::parse();
    let cfg = match bridge::config::load_config_from_path(&cli.config) {
        Ok(cfg) => {
            info!(stream_url = %cfg.cloud.stream_url, "config loaded");
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cfg).await {
        error!(error = %e, "bridge exiting fatally");
        std::process::exit(1);
    }
}

async fn run(cfg: bridge::config::BridgeConfig) -> Result<(), BridgeError> {
    let bus = Arc::new(NatsBus::connect(&cfg.bus.nats_url).await?);

    let local_port = 50300u16;
    let local_address = local_pod_ip().unwrap_or_else(|| "0.0.0.0".to_owned());

    let orchestrator = Arc::new(
        KubeOrchestrator::new(
            cfg.orchestrator.namespace.clone(),
            cfg.orchestrator.cluster_name.clone(),
            local_address,
            local_port,
            cfg.orchestrator.identity_configmap.clone(),
        )
        .await?,
    );

    let persisted_id = load_persisted_identity(&orchestrator).await?;
    let vizier_id = match persisted_id {
        Some(id) => id,
        None => {
            let metadata = orchestrator.cluster_metadata().await?;
            let enrollment_client = HttpEnrollmentClient::new(cfg.cloud.enroll_url.clone());
            let response = enrollment_client
                .enroll(
                    &cfg.deploy_key,
                    bridge_proto::EnrollRequest {
                        k8s_cluster_uid: metadata.uid,
                        k8s_cluster_name: metadata.name,
                        k8s_cluster_version: metadata.version,
                    },
                )
                .await?;
            orchestrator.persist_cluster_id(response.vizier_id).await?;
            response.vizier_id
        }
    };
    info!(%vizier_id, "cluster identity resolved");

    let update_state = UpdateState::new();
    // Spawned rather than awaited: a pre-existing job can take arbitrarily
    // long to finish, and the cloud connection/enrollment/heartbeats must
    // not stall behind it.
    tokio::spawn({
        let orchestrator = orchestrator.clone();
        let update_state = update_state.clone();
        async move { recover_existing_job(orchestrator.as_ref(), update_state).await }
    });

    let identity = ClusterIdentity {
        id: Some(vizier_id),
        jwt_signing_key: cfg.jwt_signing_key.clone(),
        session_id: rand_session_id(),
    };

    let health_probe = Arc::new(HttpHealthProbe::new("http://localhost:50300/healthz".to_owned()));
    let channel_factory = Arc::new(WsChannelFactory {
        stream_url: cfg.cloud.stream_url.clone(),
    });
    let job_template = std::fs::read_to_string(&cfg.orchestrator.job_template_path)
        .map_err(|e| BridgeError::UpdateRender(format!("reading job template: {e}")))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });
    let seq = HeartbeatSeq::new();

    let watchdog = tokio::spawn(bridge::supervisor::run_watchdog(
        seq.clone(),
        shutdown_rx.clone(),
    ));

    let supervisor = BridgeSupervisor {
        bus,
        channel_factory,
        orchestrator,
        health_probe,
        identity,
        seq,
        update_state,
        job_template,
        bootstrap_mode: cfg.bootstrap_mode,
        bootstrap_version: cfg.bootstrap_version,
        shutdown_rx,
    };

    let result = supervisor.run(vizier_id).await;
    watchdog.abort();
    result
}

/// Best-effort discovery of this pod's own IP, the address the bridge
/// advertises in `register`/heartbeat frames. Falls back to an unspecified
/// address if unavailable; the cloud side treats that as advisory only.
fn local_pod_ip() -> Option<String> {
    std::env::var("POD_IP").ok()
}

fn rand_session_id() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
