//! Stream Reader (B) and Stream Writer (C): the bidirectional RPC channel
//! to the cloud, modelled as a transport-agnostic `SendFrame`/`RecvFrame`/
//! `Close` interface per the design notes, so tests can substitute an
//! in-memory duplex for the production WebSocket transport.
//!
//! `send_frame`/`recv_frame` take `&self` rather than `&mut self` so a
//! single `Arc<dyn CloudChannel>` can be shared between the reader and
//! writer tasks that run concurrently against one connection — each task
//! only ever calls the half it owns, so the internal locks are uncontended.
//!
//! The production transport and its request framing follow the forwarder
//! uplink's WebSocket session: connect, build an authenticated request,
//! then loop over `ws.next()` handling text/close/ping frames.

use std::future::Future;
use std::pin::Pin;

use bridge_proto::{C2VBridgeMessage, InboundFrame, OutboundFrame, V2CBridgeMessage};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::BridgeError;
use crate::identity::PendingSend;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// One connection attempt's bidirectional byte-frame carrier.
pub trait CloudChannel: Send + Sync {
    fn send_frame<'a>(&'a self, frame: V2CBridgeMessage) -> BoxFuture<'a, Result<(), BridgeError>>;
    fn recv_frame<'a>(&'a self) -> BoxFuture<'a, Result<Option<C2VBridgeMessage>, BridgeError>>;
    fn close<'a>(&'a self) -> BoxFuture<'a, ()>;
}

/// Production `CloudChannel` over a `tokio-tungstenite` WebSocket.
pub struct WsCloudChannel {
    write: Mutex<SplitSink<WsStream, Message>>,
    read: Mutex<SplitStream<WsStream>>,
}

impl WsCloudChannel {
    pub async fn connect(url: &str, jwt: &str) -> Result<Self, BridgeError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| BridgeError::ConnectFailed(format!("invalid stream url: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {jwt}")
                .parse()
                .map_err(|e| BridgeError::ConnectFailed(format!("invalid auth header: {e}")))?,
        );

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BridgeError::ConnectFailed(e.to_string()))?;

        let (write, read) = ws.split();
        Ok(Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
        })
    }
}

impl CloudChannel for WsCloudChannel {
    fn send_frame<'a>(&'a self, frame: V2CBridgeMessage) -> BoxFuture<'a, Result<(), BridgeError>> {
        Box::pin(async move {
            let text = serde_json::to_string(&frame)
                .map_err(|e| BridgeError::StreamWrite(e.to_string()))?;
            self.write
                .lock()
                .await
                .send(Message::Text(text.into()))
                .await
                .map_err(|e| BridgeError::StreamWrite(e.to_string()))
        })
    }

    fn recv_frame<'a>(&'a self) -> BoxFuture<'a, Result<Option<C2VBridgeMessage>, BridgeError>> {
        Box::pin(async move {
            let mut read = self.read.lock().await;
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let msg: C2VBridgeMessage = serde_json::from_str(&text)
                            .map_err(|e| BridgeError::StreamRead(e.to_string()))?;
                        return Ok(Some(msg));
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "cloud stream closed by peer");
                        return Ok(None);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(BridgeError::StreamRead(e.to_string())),
                    None => return Ok(None),
                }
            }
        })
    }

    fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let _ = self.write.lock().await.close().await;
        })
    }
}

/// Stream Reader (B): drains `channel.recv_frame()` into `inbound_tx` until
/// a termination condition fires. Termination priority, highest first:
/// shutdown, stream context cancellation, supervisor-done, end-of-stream,
/// any read error. In every case the reader exits without closing
/// `inbound_tx` — the supervisor owns the channel's lifetime.
pub async fn run_stream_reader(
    channel: std::sync::Arc<dyn CloudChannel>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    mut done: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("stream reader stopping: shutdown");
                return;
            }
            _ = done.changed() => {
                debug!("stream reader stopping: connection done");
                return;
            }
            frame = channel.recv_frame() => {
                match frame {
                    Ok(Some(msg)) => {
                        let inbound: InboundFrame = msg.into();
                        if inbound_tx.send(inbound).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {
                        debug!("stream reader stopping: end of stream");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "stream reader stopping: read error");
                        return;
                    }
                }
            }
        }
    }
}

/// Stream Writer (C): drains the prioritized outbound channels to
/// `channel`, honoring the pending-send slot invariant — at most one frame
/// in flight, and a failed send's frame is retried before anything else is
/// examined.
pub async fn run_stream_writer(
    channel: std::sync::Arc<dyn CloudChannel>,
    pending: PendingSend,
    mut passthrough_rx: mpsc::Receiver<OutboundFrame>,
    mut default_rx: mpsc::Receiver<OutboundFrame>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), BridgeError> {
    loop {
        let frame = if let Some(pending_frame) = pending.take() {
            pending_frame
        } else {
            // Favor the passthrough channel: a non-blocking attempt first,
            // then a blocking select across both plus shutdown.
            match passthrough_rx.try_recv() {
                Ok(frame) => frame,
                Err(mpsc::error::TryRecvError::Empty) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            channel.close().await;
                            return Ok(());
                        }
                        frame = passthrough_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => continue,
                        },
                        frame = default_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => continue,
                        },
                    }
                }
                // The passthrough channel is gone for good; fall back to a
                // default-only wait instead of looping on `try_recv` with no
                // await point, which would never yield back to the executor.
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => {
                            channel.close().await;
                            return Ok(());
                        }
                        frame = default_rx.recv() => match frame {
                            Some(frame) => frame,
                            None => return Ok(()),
                        },
                    }
                }
            }
        };

        if let Err(e) = channel.send_frame(frame.clone().into()).await {
            warn!(error = %e, topic = %frame.topic, "writer send failed, retaining pending frame");
            pending.put(frame);
            return Err(e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    struct RecordingChannel {
        sent: Arc<StdMutex<Vec<String>>>,
        fail_on: StdMutex<Option<String>>,
    }

    impl CloudChannel for RecordingChannel {
        fn send_frame<'a>(
            &'a self,
            frame: V2CBridgeMessage,
        ) -> BoxFuture<'a, Result<(), BridgeError>> {
            Box::pin(async move {
                let mut fail_on = self.fail_on.lock().unwrap();
                if fail_on.as_deref() == Some(frame.topic.as_str()) {
                    *fail_on = None;
                    return Err(BridgeError::StreamWrite("simulated failure".to_owned()));
                }
                drop(fail_on);
                self.sent.lock().unwrap().push(frame.topic);
                Ok(())
            })
        }

        fn recv_frame<'a>(&'a self) -> BoxFuture<'a, Result<Option<C2VBridgeMessage>, BridgeError>> {
            Box::pin(async move { Ok(None) })
        }

        fn close<'a>(&'a self) -> BoxFuture<'a, ()> {
            Box::pin(async move {})
        }
    }

    fn frame(topic: &str) -> OutboundFrame {
        OutboundFrame {
            topic: topic.to_owned(),
            session_id: 1,
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn failed_send_retains_frame_in_pending_slot() {
        let channel = RecordingChannel {
            sent: Arc::new(StdMutex::new(Vec::new())),
            fail_on: StdMutex::new(Some("flaky".to_owned())),
        };
        let pending = PendingSend::new();

        let result = channel.send_frame(frame("flaky").into()).await;
        assert!(result.is_err());
        pending.put(frame("flaky"));
        assert!(!pending.is_empty());

        let retried = pending.take().unwrap();
        channel.send_frame(retried.into()).await.unwrap();
        assert_eq!(*channel.sent.lock().unwrap(), vec!["flaky".to_owned()]);
    }

    #[tokio::test]
    async fn writer_drains_pending_slot_before_new_frames() {
        let channel = Arc::new(RecordingChannel {
            sent: Arc::new(StdMutex::new(Vec::new())),
            fail_on: StdMutex::new(None),
        });
        let pending = PendingSend::new();
        pending.put(frame("carried-over"));

        let (ptx, prx) = mpsc::channel(8);
        let (dtx, drx) = mpsc::channel(8);
        dtx.send(frame("fresh")).await.unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let sent = channel.sent.clone();
        let channel_for_writer: std::sync::Arc<dyn CloudChannel> = channel.clone();
        let writer = tokio::spawn(run_stream_writer(
            channel_for_writer,
            pending,
            prx,
            drx,
            shutdown_rx,
        ));

        // Give the writer a moment to drain both frames, then shut it down.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        drop(ptx);
        drop(dtx);
        let _ = writer.await;

        assert_eq!(
            *sent.lock().unwrap(),
            vec!["carried-over".to_owned(), "fresh".to_owned()]
        );
    }
}
