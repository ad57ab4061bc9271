//! Bridge Supervisor (G): wires the Bus Adapter, Stream Reader/Writer,
//! Registration Machine, Heartbeat Generator, and Update Controller
//! together, and owns the reconnect loop, channel lifetimes, and the
//! process-scoped watchdog.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bridge_proto::{InboundFrame, OutboundFrame};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::bus::{self, LocalBus};
use crate::error::BridgeError;
use crate::heartbeat::{self, HealthProbe, HeartbeatContext};
use crate::identity::{ClusterIdentity, HeartbeatSeq, PendingSend, UpdateState};
use crate::registration;
use crate::transport::{self, CloudChannel};
use crate::update::{self, Orchestrator};

const INITIAL_BACKOFF: Duration = Duration::from_secs(30);
const BACKOFF_MULTIPLIER: u32 = 2;
const TOTAL_BACKOFF_CAP: Duration = Duration::from_secs(30 * 60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
const OUTBOUND_CHANNEL_CAPACITY: usize = 5_000;
const INBOUND_CHANNEL_CAPACITY: usize = 5_000;

/// Outcome of the per-connection routing loop. Distinguishes "the writer
/// task itself already finished" from every other exit reason so the
/// caller knows whether it still needs to await (and possibly abort) the
/// writer handle.
enum RoutingOutcome {
    WriterFinished(Result<(), BridgeError>),
    Other(Result<(), BridgeError>),
}

/// Factory for a fresh `CloudChannel` per connection attempt.
pub trait ChannelFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        jwt: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn CloudChannel>, BridgeError>> + Send + 'a>>;
}

/// The identity, collaborators, and shared state the supervisor wires
/// together on every connection attempt.
pub struct BridgeSupervisor {
    pub bus: Arc<dyn LocalBus>,
    pub channel_factory: Arc<dyn ChannelFactory>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub health_probe: Arc<dyn HealthProbe>,
    pub identity: ClusterIdentity,
    pub seq: HeartbeatSeq,
    pub update_state: UpdateState,
    pub job_template: String,
    pub bootstrap_mode: bool,
    pub bootstrap_version: String,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl BridgeSupervisor {
    /// Run the reconnect loop until `shutdown` fires or the backoff cap is
    /// exhausted, in which case this returns a fatal error for `main` to
    /// act on.
    pub async fn run(mut self, vizier_id: Uuid) -> Result<(), BridgeError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut total_elapsed = Duration::ZERO;
        let mut attempt: u64 = 0;

        loop {
            if *self.shutdown_rx.borrow() {
                info!("shutdown requested before connect");
                return Ok(());
            }

            attempt += 1;
            let span = info_span!("bridge_connection", connection_id = attempt);
            let outcome = self.run_one_connection(vizier_id).instrument(span).await;

            match outcome {
                Ok(()) => {
                    info!("connection closed cleanly");
                    return Ok(());
                }
                Err(BridgeError::EnrollmentRejected(reason)) => {
                    error!(reason, "enrollment rejected, exiting fatally");
                    return Err(BridgeError::EnrollmentRejected(reason));
                }
                Err(e) => {
                    warn!(error = %e, attempt, elapsed_backoff = ?total_elapsed, "connection attempt failed, backing off");
                    if total_elapsed >= TOTAL_BACKOFF_CAP {
                        error!("total backoff cap exceeded, exiting fatally");
                        return Err(BridgeError::ConnectFailed(
                            "exceeded total elapsed backoff cap".to_owned(),
                        ));
                    }
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown_rx.changed() => {
                            if *self.shutdown_rx.borrow() {
                                return Ok(());
                            }
                        }
                    }
                    total_elapsed += backoff;
                    backoff = (backoff * BACKOFF_MULTIPLIER).min(TOTAL_BACKOFF_CAP);
                }
            }
        }
    }

    async fn run_one_connection(&mut self, vizier_id: Uuid) -> Result<(), BridgeError> {
        let channel = self
            .channel_factory
            .connect(&self.identity.jwt_signing_key)
            .await?;
        info!("connected");

        let (address, port) = self.orchestrator.local_address().await?;
        let metadata = self.orchestrator.cluster_metadata().await?;

        let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundFrame>(INBOUND_CHANNEL_CAPACITY);
        let (default_tx, default_rx) = mpsc::channel::<OutboundFrame>(OUTBOUND_CHANNEL_CAPACITY);
        let (passthrough_tx, passthrough_rx) =
            mpsc::channel::<OutboundFrame>(OUTBOUND_CHANNEL_CAPACITY);
        let pending = PendingSend::new();
        let (done_tx, done_rx) = watch::channel(false);

        // The reader and writer must be running before the handshake: the
        // handshake's `registerAck` arrives off the same WebSocket every
        // other inbound frame does, so nothing would ever feed `inbound_rx`
        // if the reader started only after the handshake returned.
        let reader_handle = tokio::spawn(transport::run_stream_reader(
            channel.clone(),
            inbound_tx.clone(),
            self.shutdown_rx.clone(),
            done_rx,
        ));

        let mut writer_handle = tokio::spawn(transport::run_stream_writer(
            channel.clone(),
            pending,
            passthrough_rx,
            default_rx,
            self.shutdown_rx.clone(),
        ));

        if let Err(e) = registration::run_handshake(
            channel.as_ref(),
            &mut inbound_rx,
            vizier_id,
            &self.identity.jwt_signing_key,
            &address,
            port,
            &metadata.uid,
            &metadata.name,
            &metadata.version,
            self.identity.session_id,
        )
        .await
        {
            let _ = done_tx.send(true);
            reader_handle.abort();
            writer_handle.abort();
            let _ = reader_handle.await;
            let _ = writer_handle.await;
            return Err(e);
        }
        info!("registered");

        let bus_handle = self.spawn_bus_forwarder(default_tx.clone(), passthrough_tx.clone());

        let heartbeat_handle = self.spawn_heartbeat(vizier_id, &address, port, default_tx.clone());

        let routing_outcome = self
            .route_inbound(vizier_id, &mut inbound_rx, &mut writer_handle, &default_tx)
            .await;

        // Connection teardown: signal done to the reader, then wait for the
        // per-connection tasks so the next connect attempt never overlaps
        // with this one's subtasks.
        let _ = done_tx.send(true);
        heartbeat_handle.abort();
        bus_handle.abort();
        let _ = reader_handle.await;

        match routing_outcome {
            RoutingOutcome::WriterFinished(result) => result,
            RoutingOutcome::Other(result) => {
                writer_handle.abort();
                let _ = writer_handle.await;
                result
            }
        }
    }

    fn spawn_bus_forwarder(
        &self,
        default_tx: mpsc::Sender<OutboundFrame>,
        passthrough_tx: mpsc::Sender<OutboundFrame>,
    ) -> tokio::task::JoinHandle<()> {
        let bus = self.bus.clone();
        let session_id = self.identity.session_id;
        tokio::spawn(async move {
            let Ok(mut raw_rx) = bus.subscribe_outbound().await else {
                warn!("bus subscription failed, outbound bus forwarding disabled for this connection");
                return;
            };
            while let Some(raw) = raw_rx.recv().await {
                match bus::decode_outbound(&raw, session_id) {
                    Ok((frame, bus::Priority::Passthrough)) => {
                        if passthrough_tx.send(frame).await.is_err() {
                            return;
                        }
                    }
                    Ok((frame, bus::Priority::Default)) => {
                        if let Err(mpsc::error::TrySendError::Full(_)) = default_tx.try_send(frame) {
                            warn!("dropping outbound frame: default channel full");
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping malformed outbound bus message"),
                }
            }
        })
    }

    fn spawn_heartbeat(
        &self,
        vizier_id: Uuid,
        address: &str,
        port: u16,
        outbound_tx: mpsc::Sender<OutboundFrame>,
    ) -> tokio::task::JoinHandle<()> {
        let ctx = HeartbeatContext {
            vizier_id,
            address: address.to_owned(),
            port,
            bootstrap_mode: self.bootstrap_mode,
            bootstrap_version: self.bootstrap_version.clone(),
        };
        let seq = self.seq.clone();
        let update_state = self.update_state.clone();
        let probe = self.health_probe.clone();
        let session_id = self.identity.session_id;
        let shutdown = self.shutdown_rx.clone();
        let orchestrator = self.orchestrator.clone();

        tokio::spawn(async move {
            heartbeat::run_heartbeat_generator(
                ctx,
                seq,
                update_state,
                probe.as_ref(),
                orchestrator.as_ref(),
                outbound_tx,
                session_id,
                shutdown,
                || {
                    i64::try_from(
                        std::time::SystemTime::now()
                            .duration_since(std::time::UNIX_EPOCH)
                            .map(|d| d.as_secs())
                            .unwrap_or(0),
                    )
                    .unwrap_or(0)
                },
            )
            .await;
        })
    }

    /// Routing loop: dispatches inbound frames and watches for shutdown,
    /// writer failure, or the connection's own done signal.
    async fn route_inbound(
        &mut self,
        vizier_id: Uuid,
        inbound_rx: &mut mpsc::Receiver<InboundFrame>,
        writer_handle: &mut tokio::task::JoinHandle<Result<(), BridgeError>>,
        default_tx: &mpsc::Sender<OutboundFrame>,
    ) -> RoutingOutcome {
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        return RoutingOutcome::Other(Ok(()));
                    }
                }
                result = &mut *writer_handle => {
                    let outcome = match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e),
                        Err(e) => Err(BridgeError::StreamWrite(format!("writer task panicked: {e}"))),
                    };
                    return RoutingOutcome::WriterFinished(outcome);
                }
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(frame) => {
                            if let Err(e) = self.dispatch_inbound(vizier_id, frame, default_tx).await {
                                return RoutingOutcome::Other(Err(e));
                            }
                        }
                        None => return RoutingOutcome::Other(Ok(())),
                    }
                }
            }
        }
    }

    async fn dispatch_inbound(
        &mut self,
        vizier_id: Uuid,
        frame: InboundFrame,
        default_tx: &mpsc::Sender<OutboundFrame>,
    ) -> Result<(), BridgeError> {
        if frame.topic == bridge_proto::topics::VIZIER_UPDATE {
            return update::handle_vizier_update(
                self.orchestrator.clone(),
                &self.update_state,
                frame.payload,
                &self.job_template,
                self.identity.session_id,
                default_tx,
            )
            .await;
        }

        bus::publish_inbound(self.bus.as_ref(), vizier_id, frame).await
    }
}

/// Process-scoped watchdog: wakes every 30s, compares the heartbeat
/// sequence number now vs. 30s ago, and exits the process fatally if it has
/// not advanced.
pub async fn run_watchdog(seq: HeartbeatSeq, mut shutdown: watch::Receiver<bool>) {
    let mut last = seq.get();
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            () = tokio::time::sleep(WATCHDOG_INTERVAL) => {
                let now = seq.get();
                if now == last {
                    error!(interval_secs = WATCHDOG_INTERVAL.as_secs(), "heartbeat sequence stalled, exiting fatally");
                    std::process::exit(1);
                }
                last = now;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_total() {
        let mut backoff = INITIAL_BACKOFF;
        let mut total = Duration::ZERO;
        for _ in 0..10 {
            total += backoff;
            backoff = (backoff * BACKOFF_MULTIPLIER).min(TOTAL_BACKOFF_CAP);
        }
        assert!(backoff <= TOTAL_BACKOFF_CAP);
        assert!(total > Duration::from_secs(30));
    }

    #[tokio::test]
    async fn watchdog_does_not_fire_while_sequence_advances() {
        let seq = HeartbeatSeq::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        seq.advance();

        let handle = tokio::spawn(run_watchdog(seq, shutdown_rx));
        shutdown_tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "watchdog should exit promptly on shutdown");
    }
}
