//! Integration tests driving the bridge's components together through the
//! in-memory test doubles, covering the end-to-end scenarios the component
//! contracts are meant to satisfy: registration, heartbeat aggregation,
//! the update flow, and outbound prioritization.

use std::time::Duration;

use bridge::error::BridgeError;
use bridge::heartbeat::{self, HeartbeatContext};
use bridge::identity::{HeartbeatSeq, PendingSend, UpdateState};
use bridge::registration;
use bridge::transport::{self, CloudChannel};
use bridge::update::{self, ClusterMetadata, JobOutcome, Orchestrator};
use bridge_proto::{ClusterStatus, HeartbeatPayload, OutboundFrame, RegisterAck, RegisterAckStatus};
use bridge_test_doubles::{duplex_channel_pair, FakeOrchestrator};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

#[tokio::test]
async fn handshake_completes_when_peer_acks_through_reader() {
    let (channel, peer) = duplex_channel_pair();
    let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let (_done_tx, done_rx) = watch::channel(false);
    let vizier_id = Uuid::new_v4();

    let channel = std::sync::Arc::new(channel);
    let reader = tokio::spawn(transport::run_stream_reader(
        channel.clone(),
        inbound_tx,
        shutdown_rx,
        done_rx,
    ));

    let handshake = tokio::spawn({
        let channel = channel.clone();
        async move {
            registration::run_handshake(
                channel.as_ref(),
                &mut inbound_rx,
                vizier_id,
                "jwt",
                "10.0.0.5",
                50300,
                "cluster-uid",
                "cluster-name",
                "v1",
                1,
            )
            .await
        }
    });

    let sent = peer.recv_sent().await.expect("register frame sent");
    assert_eq!(sent.topic, "register");
    assert_eq!(sent.session_id, 1);

    peer.send_to_bridge(bridge_proto::C2VBridgeMessage {
        topic: "registerAck".to_owned(),
        msg: serde_json::to_value(RegisterAck {
            status: RegisterAckStatus::Ok,
        })
        .unwrap(),
    })
    .await;

    handshake.await.unwrap().expect("handshake should succeed");
    reader.abort();
}

#[tokio::test]
async fn heartbeat_carries_healthy_status_and_sequence_zero() {
    let ctx = HeartbeatContext {
        vizier_id: Uuid::new_v4(),
        address: "10.0.0.5".to_owned(),
        port: 50300,
        bootstrap_mode: false,
        bootstrap_version: String::new(),
    };
    let seq = HeartbeatSeq::new();
    let update_state = UpdateState::new();
    let probe: &'static bridge_test_doubles::FakeHealthProbe =
        Box::leak(Box::new(bridge_test_doubles::FakeHealthProbe::healthy()));
    let orchestrator: &'static FakeOrchestrator = Box::leak(Box::new(FakeOrchestrator::new(
        ("10.0.0.5".to_owned(), 50300),
        ClusterMetadata {
            uid: "uid".to_owned(),
            name: "name".to_owned(),
            version: "v1".to_owned(),
        },
    )));
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(heartbeat::run_heartbeat_generator(
        ctx,
        seq,
        update_state,
        probe,
        orchestrator,
        outbound_tx,
        1,
        shutdown_rx,
        || 1_700_000_000,
    ));

    let frame = tokio::time::timeout(Duration::from_secs(1), outbound_rx.recv())
        .await
        .expect("heartbeat should arrive promptly")
        .expect("channel open");
    let payload: HeartbeatPayload = serde_json::from_value(frame.payload).unwrap();
    assert_eq!(payload.sequence_number, 0);
    assert_eq!(payload.status, ClusterStatus::Healthy);

    handle.abort();
}

#[tokio::test]
async fn update_flow_success_then_failure_is_sticky() {
    let orchestrator = std::sync::Arc::new(FakeOrchestrator::new(
        ("10.0.0.5".to_owned(), 50300),
        ClusterMetadata {
            uid: "uid".to_owned(),
            name: "name".to_owned(),
            version: "v1".to_owned(),
        },
    ));
    let update_state = UpdateState::new();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundFrame>(8);

    let payload = serde_json::json!({
        "version": "0.2.3",
        "token": "t",
        "redeploy_etcd": true,
    });

    // Pre-seed the job so the `watch_job` task spawned by a successful
    // `handle_vizier_update` has something to resolve against.
    orchestrator.seed_existing_job(update::UPDATE_JOB_NAME);

    update::handle_vizier_update(
        orchestrator.clone(),
        &update_state,
        payload,
        "image:{updater}",
        1,
        &outbound_tx,
    )
    .await
    .expect("update should launch");

    assert!(update_state.is_running());
    assert!(!update_state.is_failed());

    let secret = orchestrator.secret("pl-update-job-secrets").expect("secret created");
    assert_eq!(secret.get("cloud-token"), Some(&"t".to_owned()));
    assert_eq!(orchestrator.launched_manifests(), vec!["image:0.2.3".to_owned()]);

    let response_frame = outbound_rx.recv().await.expect("response frame published");
    assert_eq!(response_frame.topic, "VizierUpdateResponse");

    // Resolve the job the spawned watcher is waiting on: status should
    // clear back to not-running once it observes success.
    orchestrator.resolve_job(update::UPDATE_JOB_NAME, JobOutcome::Success);
    wait_until(|| !update_state.is_running()).await;
    assert!(!update_state.is_failed());

    // A second update that fails should mark the flag sticky.
    update_state.set_running(true);
    update_state.clear_failed();
    orchestrator.seed_existing_job(update::UPDATE_JOB_NAME);
    orchestrator.resolve_job(update::UPDATE_JOB_NAME, JobOutcome::Failure);
    update::recover_existing_job(orchestrator.as_ref(), update_state.clone()).await;
    assert!(!update_state.is_running());
    assert!(update_state.is_failed());
}

/// Poll `condition` until it holds, up to a short bound — used to observe
/// state a background-spawned task converges to asynchronously.
async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition did not become true in time");
}

#[tokio::test]
async fn writer_drains_passthrough_frames_before_default_frames() {
    let (channel, peer) = duplex_channel_pair();
    let channel = std::sync::Arc::new(channel);
    let pending = PendingSend::new();
    let (passthrough_tx, passthrough_rx) = mpsc::channel::<OutboundFrame>(8);
    let (default_tx, default_rx) = mpsc::channel::<OutboundFrame>(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    default_tx
        .send(OutboundFrame {
            topic: "heartbeat".to_owned(),
            session_id: 1,
            payload: serde_json::json!({}),
        })
        .await
        .unwrap();
    passthrough_tx
        .send(OutboundFrame {
            topic: "reply-1".to_owned(),
            session_id: 1,
            payload: serde_json::json!({}),
        })
        .await
        .unwrap();

    let writer = tokio::spawn(transport::run_stream_writer(
        channel,
        pending,
        passthrough_rx,
        default_rx,
        shutdown_rx,
    ));

    let first = peer.recv_sent().await.expect("first frame");
    assert_eq!(first.topic, "reply-1", "passthrough frame should be drained first");
    let second = peer.recv_sent().await.expect("second frame");
    assert_eq!(second.topic, "heartbeat");

    shutdown_tx.send(true).unwrap();
    writer.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_send_keeps_frame_pending_for_next_attempt() {
    struct FlakyOnce {
        failed: std::sync::atomic::AtomicBool,
        inner: bridge_test_doubles::DuplexChannel,
    }

    type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

    impl CloudChannel for FlakyOnce {
        fn send_frame<'a>(
            &'a self,
            frame: bridge_proto::V2CBridgeMessage,
        ) -> BoxFuture<'a, Result<(), BridgeError>> {
            Box::pin(async move {
                if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    return Err(BridgeError::StreamWrite("simulated disconnect".to_owned()));
                }
                self.inner.send_frame(frame).await
            })
        }
        fn recv_frame<'a>(
            &'a self,
        ) -> BoxFuture<'a, Result<Option<bridge_proto::C2VBridgeMessage>, BridgeError>> {
            self.inner.recv_frame()
        }
        fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
            self.inner.close()
        }
    }

    let (inner, peer) = duplex_channel_pair();
    let channel: std::sync::Arc<dyn CloudChannel> = std::sync::Arc::new(FlakyOnce {
        failed: std::sync::atomic::AtomicBool::new(false),
        inner,
    });
    let pending = PendingSend::new();
    let (passthrough_tx, passthrough_rx) = mpsc::channel::<OutboundFrame>(8);
    let (default_tx, default_rx) = mpsc::channel::<OutboundFrame>(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    drop(passthrough_tx);

    default_tx
        .send(OutboundFrame {
            topic: "heartbeat".to_owned(),
            session_id: 1,
            payload: serde_json::json!({}),
        })
        .await
        .unwrap();

    let result = transport::run_stream_writer(channel.clone(), pending.clone(), passthrough_rx, default_rx, shutdown_rx).await;
    assert!(result.is_err(), "writer should surface the send failure");
    let retained = pending.take().expect("failed frame must be retained");
    assert_eq!(retained.topic, "heartbeat");

    // Retrying the same frame against the same (now healthy) channel
    // succeeds and reaches the peer.
    channel.send_frame(retained.into()).await.unwrap();
    let relayed = peer.recv_sent().await.expect("retried frame relayed");
    assert_eq!(relayed.topic, "heartbeat");
}
