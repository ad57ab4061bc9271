// bridge-test-doubles: in-memory fakes for the cloud connector bridge's
// external collaborators (local bus, cloud stream, enrollment RPC, data
// plane health probe, in-cluster orchestrator), so the bridge's own test
// suites never have to stand up NATS, a real WebSocket server, or a
// Kubernetes API.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use bridge::bus::{LocalBus, RawBusMessage};
use bridge::error::BridgeError;
use bridge::heartbeat::{HealthObservation, HealthProbe};
use bridge::registration::EnrollmentClient;
use bridge::transport::CloudChannel;
use bridge::update::{ClusterMetadata, JobOutcome, Orchestrator};
use bridge_proto::{C2VBridgeMessage, EnrollRequest, EnrollResponse, V2CBridgeMessage, WorkloadStatus};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

const CHANNEL_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// LocalBus
// ---------------------------------------------------------------------------

/// In-memory `LocalBus`: `publish_fire_and_forget` records every message it
/// is given, and `push_outbound` lets a test simulate a local producer
/// publishing onto the outbound-prefix wildcard the bridge subscribes to.
pub struct InMemoryBus {
    outbound_tx: mpsc::Sender<RawBusMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<RawBusMessage>>>,
    published: Arc<StdMutex<Vec<(String, Vec<u8>)>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        Self {
            outbound_tx: tx,
            outbound_rx: Mutex::new(Some(rx)),
            published: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// Simulate a local producer publishing `payload` on `subject` onto the
    /// outbound-prefix wildcard.
    pub async fn push_outbound(&self, subject: impl Into<String>, payload: Vec<u8>) {
        self.outbound_tx
            .send(RawBusMessage {
                subject: subject.into(),
                payload,
            })
            .await
            .expect("outbound channel closed");
    }

    /// Every message handed to `publish_fire_and_forget` so far, in order.
    pub fn published_messages(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().expect("lock poisoned").clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus for InMemoryBus {
    fn subscribe_outbound<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<RawBusMessage>, BridgeError>> {
        Box::pin(async move {
            self.outbound_rx
                .lock()
                .await
                .take()
                .ok_or_else(|| BridgeError::ConnectFailed("bus already subscribed".to_owned()))
        })
    }

    fn publish_fire_and_forget<'a>(
        &'a self,
        subject: String,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            self.published.lock().expect("lock poisoned").push((subject, payload));
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// CloudChannel
// ---------------------------------------------------------------------------

/// One side of an in-memory duplex cloud stream. Implements `CloudChannel`
/// the way `WsCloudChannel` does — a `send_frame`/`recv_frame` pair backed
/// by independently lockable halves, so it can be shared behind an `Arc`
/// between a reader and a writer task.
pub struct DuplexChannel {
    to_peer: mpsc::Sender<V2CBridgeMessage>,
    from_peer: Mutex<mpsc::Receiver<C2VBridgeMessage>>,
}

/// The test-controlled counterpart of a `DuplexChannel`: read what the
/// bridge sent, and feed it frames as if they came from the cloud.
pub struct DuplexChannelPeer {
    outgoing: Mutex<mpsc::Receiver<V2CBridgeMessage>>,
    incoming: mpsc::Sender<C2VBridgeMessage>,
}

impl DuplexChannelPeer {
    pub async fn recv_sent(&self) -> Option<V2CBridgeMessage> {
        self.outgoing.lock().await.recv().await
    }

    pub async fn send_to_bridge(&self, frame: C2VBridgeMessage) {
        self.incoming.send(frame).await.expect("bridge side dropped");
    }
}

/// Build a connected pair: the first element is handed to bridge code as an
/// `Arc<dyn CloudChannel>`, the second is the test's handle on it.
pub fn duplex_channel_pair() -> (DuplexChannel, DuplexChannelPeer) {
    let (to_peer_tx, to_peer_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (from_peer_tx, from_peer_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        DuplexChannel {
            to_peer: to_peer_tx,
            from_peer: Mutex::new(from_peer_rx),
        },
        DuplexChannelPeer {
            outgoing: Mutex::new(to_peer_rx),
            incoming: from_peer_tx,
        },
    )
}

impl CloudChannel for DuplexChannel {
    fn send_frame<'a>(&'a self, frame: V2CBridgeMessage) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            self.to_peer
                .send(frame)
                .await
                .map_err(|e| BridgeError::StreamWrite(e.to_string()))
        })
    }

    fn recv_frame<'a>(&'a self) -> BoxFuture<'a, Result<Option<C2VBridgeMessage>, BridgeError>> {
        Box::pin(async move { Ok(self.from_peer.lock().await.recv().await) })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {})
    }
}

// ---------------------------------------------------------------------------
// EnrollmentClient
// ---------------------------------------------------------------------------

/// Configurable fake `EnrollmentClient`: returns a fixed `vizier_id` on
/// success, or a fixed rejection reason.
pub struct FakeEnrollmentClient {
    result: StdMutex<Option<Result<Uuid, String>>>,
}

impl FakeEnrollmentClient {
    pub fn accepting(vizier_id: Uuid) -> Self {
        Self {
            result: StdMutex::new(Some(Ok(vizier_id))),
        }
    }

    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self {
            result: StdMutex::new(Some(Err(reason.into()))),
        }
    }
}

impl EnrollmentClient for FakeEnrollmentClient {
    fn enroll<'a>(
        &'a self,
        _deploy_key: &'a str,
        _request: EnrollRequest,
    ) -> BoxFuture<'a, Result<EnrollResponse, BridgeError>> {
        Box::pin(async move {
            match self.result.lock().expect("lock poisoned").clone() {
                Some(Ok(vizier_id)) => Ok(EnrollResponse { vizier_id }),
                Some(Err(reason)) => Err(BridgeError::EnrollmentRejected(reason)),
                None => Err(BridgeError::EnrollmentRejected("no response configured".to_owned())),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// HealthProbe
// ---------------------------------------------------------------------------

/// Fake `HealthProbe` whose observation a test can set at will.
pub struct FakeHealthProbe {
    observation: StdMutex<HealthObservation>,
}

impl FakeHealthProbe {
    pub fn healthy() -> Self {
        Self {
            observation: StdMutex::new(HealthObservation {
                at: Instant::now(),
                error: None,
            }),
        }
    }

    pub fn set_error(&self, error: Option<String>) {
        let mut obs = self.observation.lock().expect("lock poisoned");
        obs.at = Instant::now();
        obs.error = error;
    }

    pub fn set_stale(&self, age: std::time::Duration) {
        let mut obs = self.observation.lock().expect("lock poisoned");
        obs.at = Instant::now() - age;
    }
}

impl HealthProbe for FakeHealthProbe {
    fn observe<'a>(&'a self) -> BoxFuture<'a, HealthObservation> {
        Box::pin(async move { self.observation.lock().expect("lock poisoned").clone() })
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeOrchestratorState {
    num_nodes: u32,
    workloads: Vec<WorkloadStatus>,
    jobs: HashMap<String, Option<JobOutcome>>,
    secrets: HashMap<String, HashMap<String, String>>,
    launched_manifests: Vec<String>,
    persisted_cluster_id: Option<Uuid>,
}

/// Fake `Orchestrator` tracking job/secret lifecycle in memory, so update
/// flow tests can assert on what was launched without touching Kubernetes.
pub struct FakeOrchestrator {
    local_address: (String, u16),
    cluster_metadata: ClusterMetadata,
    state: StdMutex<FakeOrchestratorState>,
}

impl FakeOrchestrator {
    pub fn new(local_address: (String, u16), cluster_metadata: ClusterMetadata) -> Self {
        Self {
            local_address,
            cluster_metadata,
            state: StdMutex::new(FakeOrchestratorState::default()),
        }
    }

    pub fn set_workload_state(&self, num_nodes: u32, workloads: Vec<WorkloadStatus>) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.num_nodes = num_nodes;
        state.workloads = workloads;
    }

    /// Pre-seed an existing job so `get_job` reports it present at startup.
    pub fn seed_existing_job(&self, name: &str) {
        self.state
            .lock()
            .expect("lock poisoned")
            .jobs
            .insert(name.to_owned(), None);
    }

    /// Resolve a job's outcome, unblocking any in-flight `wait_job_completion`.
    pub fn resolve_job(&self, name: &str, outcome: JobOutcome) {
        self.state
            .lock()
            .expect("lock poisoned")
            .jobs
            .insert(name.to_owned(), Some(outcome));
    }

    pub fn launched_manifests(&self) -> Vec<String> {
        self.state.lock().expect("lock poisoned").launched_manifests.clone()
    }

    pub fn secret(&self, name: &str) -> Option<HashMap<String, String>> {
        self.state.lock().expect("lock poisoned").secrets.get(name).cloned()
    }

    pub fn persisted_cluster_id(&self) -> Option<Uuid> {
        self.state.lock().expect("lock poisoned").persisted_cluster_id
    }
}

impl Orchestrator for FakeOrchestrator {
    fn local_address<'a>(&'a self) -> BoxFuture<'a, Result<(String, u16), BridgeError>> {
        Box::pin(async move { Ok(self.local_address.clone()) })
    }

    fn cluster_metadata<'a>(&'a self) -> BoxFuture<'a, Result<ClusterMetadata, BridgeError>> {
        Box::pin(async move { Ok(self.cluster_metadata.clone()) })
    }

    fn workload_state<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<(u32, Vec<WorkloadStatus>), BridgeError>> {
        Box::pin(async move {
            let state = self.state.lock().expect("lock poisoned");
            Ok((state.num_nodes, state.workloads.clone()))
        })
    }

    fn render_job_manifest<'a>(
        &'a self,
        template: &'a str,
        substitutions: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, Result<String, BridgeError>> {
        Box::pin(async move { Ok(bridge::update::render_template(template, substitutions)) })
    }

    fn launch_job<'a>(&'a self, manifest: &'a str) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            self.state
                .lock()
                .expect("lock poisoned")
                .launched_manifests
                .push(manifest.to_owned());
            Ok(())
        })
    }

    fn get_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool, BridgeError>> {
        Box::pin(async move {
            Ok(self.state.lock().expect("lock poisoned").jobs.contains_key(name))
        })
    }

    fn wait_job_completion<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<JobOutcome, BridgeError>> {
        let name = name.to_owned();
        Box::pin(async move {
            loop {
                if let Some(Some(outcome)) =
                    self.state.lock().expect("lock poisoned").jobs.get(&name).copied()
                {
                    return Ok(outcome);
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
    }

    fn delete_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            self.state.lock().expect("lock poisoned").jobs.remove(name);
            Ok(())
        })
    }

    fn create_secret<'a>(
        &'a self,
        name: &'a str,
        data: &'a HashMap<String, String>,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            self.state
                .lock()
                .expect("lock poisoned")
                .secrets
                .insert(name.to_owned(), data.clone());
            Ok(())
        })
    }

    fn persist_cluster_id<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            self.state.lock().expect("lock poisoned").persisted_cluster_id = Some(id);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_bus_forwards_pushed_outbound_messages() {
        let bus = InMemoryBus::new();
        let mut rx = bus.subscribe_outbound().await.unwrap();
        bus.push_outbound("v2c.heartbeat", b"{}".to_vec()).await;

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "v2c.heartbeat");
    }

    #[tokio::test]
    async fn in_memory_bus_records_published_messages() {
        let bus = InMemoryBus::new();
        bus.publish_fire_and_forget("c2v.heartbeat".to_owned(), b"hi".to_vec())
            .await
            .unwrap();
        let published = bus.published_messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "c2v.heartbeat");
    }

    #[tokio::test]
    async fn duplex_channel_relays_both_directions() {
        let (channel, peer) = duplex_channel_pair();

        channel
            .send_frame(V2CBridgeMessage {
                topic: "register".to_owned(),
                session_id: 1,
                msg: serde_json::json!({}),
            })
            .await
            .unwrap();
        let sent = peer.recv_sent().await.unwrap();
        assert_eq!(sent.topic, "register");

        peer.send_to_bridge(C2VBridgeMessage {
            topic: "registerAck".to_owned(),
            msg: serde_json::json!({"status": "OK"}),
        })
        .await;
        let received = channel.recv_frame().await.unwrap().unwrap();
        assert_eq!(received.topic, "registerAck");
    }

    #[tokio::test]
    async fn fake_enrollment_client_returns_configured_id() {
        let id = Uuid::new_v4();
        let client = FakeEnrollmentClient::accepting(id);
        let response = client
            .enroll(
                "dk1",
                EnrollRequest {
                    k8s_cluster_uid: "uid".to_owned(),
                    k8s_cluster_name: "name".to_owned(),
                    k8s_cluster_version: "v1".to_owned(),
                },
            )
            .await
            .unwrap();
        assert_eq!(response.vizier_id, id);
    }

    #[tokio::test]
    async fn fake_orchestrator_tracks_job_lifecycle() {
        let orchestrator = FakeOrchestrator::new(
            ("10.0.0.1".to_owned(), 80),
            ClusterMetadata {
                uid: "uid".to_owned(),
                name: "name".to_owned(),
                version: "v1".to_owned(),
            },
        );
        orchestrator.launch_job("{}").await.unwrap();
        assert_eq!(orchestrator.launched_manifests(), vec!["{}".to_owned()]);

        orchestrator.seed_existing_job("pl-update-job");
        assert!(orchestrator.get_job("pl-update-job").await.unwrap());

        orchestrator.resolve_job("pl-update-job", JobOutcome::Success);
        let outcome = orchestrator.wait_job_completion("pl-update-job").await.unwrap();
        assert_eq!(outcome, JobOutcome::Success);
    }

    #[tokio::test]
    async fn fake_health_probe_reports_configured_error() {
        let probe = FakeHealthProbe::healthy();
        assert!(probe.observe().await.error.is_none());
        probe.set_error(Some("down".to_owned()));
        assert_eq!(probe.observe().await.error.as_deref(), Some("down"));
    }
}
