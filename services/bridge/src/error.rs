//! Error types shared by every bridge component.
//!
//! One variant per failure mode named in the error-handling design: each
//! carries enough context (topic, status, attempt count) to diagnose from a
//! log line alone.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to connect to cloud stream: {0}")]
    ConnectFailed(String),

    #[error("enrollment rejected by cloud: {0}")]
    EnrollmentRejected(String),

    #[error("registration handshake timed out waiting for registerAck")]
    RegistrationTimeout,

    #[error("registration rejected: status={status:?}")]
    RegistrationRejected { status: bridge_proto::RegisterAckStatus },

    #[error("received frame for unknown cluster")]
    ClusterUnknown,

    #[error("failed to read from cloud stream: {0}")]
    StreamRead(String),

    #[error("failed to write to cloud stream: {0}")]
    StreamWrite(String),

    #[error("malformed frame on topic {topic:?}: {reason}")]
    MalformedFrame { topic: String, reason: String },

    #[error("update payload decode failed: {0}")]
    UpdateDecode(String),

    #[error("update job manifest render failed: {0}")]
    UpdateRender(String),

    #[error("update job launch failed: {0}")]
    UpdateLaunch(String),

    #[error("update secret provisioning failed: {0}")]
    UpdateSecret(String),

    #[error("dropped outbound frame on topic {topic:?}: writer is backpressured")]
    BackpressureDrop { topic: String },

    #[error("heartbeat sequence has not advanced in {elapsed_secs}s")]
    HeartbeatStalled { elapsed_secs: u64 },
}
