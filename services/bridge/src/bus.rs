//! Bus Adapter (component A): local pub/sub bus access plus the
//! prefix-stripping / wrapping glue between it and the supervisor's
//! outbound/inbound channels.
//!
//! `LocalBus` is a trait rather than a concrete type so tests can swap in
//! an in-memory double for the production NATS-backed adapter, the same
//! way the updater workflow traits let tests swap in a fake checker instead
//! of the real download/verify pipeline.

use std::future::Future;
use std::pin::Pin;

use bridge_proto::{self, C2VMessage, InboundFrame, OutboundFrame, V2CMessage};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::BridgeError;

/// A message received from the local bus's outbound-prefix wildcard
/// subscription, before any decoding.
#[derive(Debug, Clone)]
pub struct RawBusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The local publish/subscribe bus the bridge relays to and from: subjects
/// `v2c.<topic>` carry locally-produced traffic bound for the cloud,
/// `c2v.<topic>` carry cloud-produced traffic for local consumers.
pub trait LocalBus: Send + Sync {
    /// Subscribe to `<outbound-prefix>.*`, returning a receiver fed by a
    /// background task. The bus implementation is responsible for sizing
    /// its own pending-message buffer (at least 10,000,000 messages before
    /// drop) so a cloud disconnect never backpressures unrelated
    /// producers.
    fn subscribe_outbound<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<RawBusMessage>, BridgeError>>;

    /// Publish `payload` on `subject` without waiting for an ack.
    fn publish_fire_and_forget<'a>(
        &'a self,
        subject: String,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BridgeError>>;
}

/// Decode a raw bus message into an `OutboundFrame`, routing passthrough
/// replies to the high-priority channel and everything else to the default
/// channel.
///
/// Fails with `MalformedFrame` if `subject` does not carry the outbound
/// prefix. This is fatal to the current connection, not merely the one
/// message, because it indicates the local bus contract itself has been
/// violated.
pub fn decode_outbound(
    raw: &RawBusMessage,
    session_id: i64,
) -> Result<(OutboundFrame, Priority), BridgeError> {
    let topic = bridge_proto::strip_outbound_prefix(&raw.subject).ok_or_else(|| {
        BridgeError::MalformedFrame {
            topic: raw.subject.clone(),
            reason: "subject does not carry the outbound prefix".to_owned(),
        }
    })?;

    let wrapper: V2CMessage = serde_json::from_slice(&raw.payload).map_err(|e| {
        BridgeError::MalformedFrame {
            topic: topic.to_owned(),
            reason: e.to_string(),
        }
    })?;

    let priority = if bridge_proto::is_passthrough_topic(topic) {
        Priority::Passthrough
    } else {
        Priority::Default
    };

    Ok((
        OutboundFrame {
            topic: topic.to_owned(),
            session_id,
            payload: wrapper.msg,
        },
        priority,
    ))
}

/// Which outbound channel a decoded frame belongs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Passthrough,
    Default,
}

/// Publish an inbound frame to the local bus under the inbound prefix,
/// wrapping it with the cluster identifier per the `C2VMessage` envelope.
pub async fn publish_inbound(
    bus: &dyn LocalBus,
    vizier_id: Uuid,
    frame: InboundFrame,
) -> Result<(), BridgeError> {
    let subject = bridge_proto::inbound_subject(&frame.topic);
    let wrapper = C2VMessage {
        vizier_id,
        msg: frame.payload,
    };
    let payload = serde_json::to_vec(&wrapper).map_err(|e| BridgeError::MalformedFrame {
        topic: frame.topic.clone(),
        reason: e.to_string(),
    })?;
    if let Err(e) = bus.publish_fire_and_forget(subject, payload).await {
        warn!(topic = %frame.topic, error = %e, "inbound publish failed");
        return Err(e);
    }
    Ok(())
}

/// Production `LocalBus` backed by NATS.
///
/// Subjects map literally onto the local-bus naming scheme: `v2c.<topic>`
/// outbound, `c2v.<topic>` inbound. The subscription capacity is set to the
/// 10,000,000-pending-message floor.
pub struct NatsBus {
    client: async_nats::Client,
}

const PENDING_BUS_CAPACITY: usize = 10_000_000;

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, BridgeError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BridgeError::ConnectFailed(format!("nats connect: {e}")))?;
        Ok(Self { client })
    }
}

impl LocalBus for NatsBus {
    fn subscribe_outbound<'a>(
        &'a self,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<RawBusMessage>, BridgeError>> {
        Box::pin(async move {
            let subject = format!("{}.*", bridge_proto::OUTBOUND_PREFIX);
            let mut sub = self
                .client
                .subscribe(subject)
                .await
                .map_err(|e| BridgeError::ConnectFailed(format!("nats subscribe: {e}")))?;

            let (tx, rx) = mpsc::channel(PENDING_BUS_CAPACITY);
            tokio::spawn(async move {
                use futures_util::StreamExt;
                while let Some(msg) = sub.next().await {
                    let raw = RawBusMessage {
                        subject: msg.subject.to_string(),
                        payload: msg.payload.to_vec(),
                    };
                    if tx.send(raw).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        })
    }

    fn publish_fire_and_forget<'a>(
        &'a self,
        subject: String,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            self.client
                .publish(subject, payload.into())
                .await
                .map_err(|e| BridgeError::StreamWrite(format!("nats publish: {e}")))
        })
    }
}
