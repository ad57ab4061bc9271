// bridge-proto: wire and local-bus message types for the cloud connector bridge.
//
// Two independent surfaces share this crate:
//   - the cloud-facing stream frames (`V2CBridgeMessage` / `C2VBridgeMessage`)
//     exchanged with VZConn over the bidirectional RPC channel
//   - the local-bus envelopes (`V2CMessage` / `C2VMessage`) exchanged with
//     the in-cluster pub/sub bus
//
// Well-known topics are frozen string constants rather than enum variants:
// the bridge relays arbitrary topics it does not otherwise understand, so
// the topic space is open, not closed.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Well-known topics
// ---------------------------------------------------------------------------

pub mod topics {
    pub const REGISTER: &str = "register";
    pub const REGISTER_ACK: &str = "registerAck";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const VIZIER_UPDATE: &str = "VizierUpdate";
    pub const VIZIER_UPDATE_RESPONSE: &str = "VizierUpdateResponse";
}

/// Ack status carried in a `registerAck` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegisterAckStatus {
    Ok,
    NotFound,
    /// Any other status the cloud might send; preserved for forward
    /// compatibility rather than failing deserialization.
    #[serde(other)]
    Unknown,
}

// ---------------------------------------------------------------------------
// Cloud stream frames
// ---------------------------------------------------------------------------

/// Upstream (bridge -> cloud) frame carried on the bidirectional RPC stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2CBridgeMessage {
    pub topic: String,
    pub session_id: i64,
    pub msg: serde_json::Value,
}

/// Downstream (cloud -> bridge) frame carried on the bidirectional RPC stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct C2VBridgeMessage {
    pub topic: String,
    pub msg: serde_json::Value,
}

/// An outbound frame queued for the Stream Writer.
///
/// Produced by the Bus Adapter, the Heartbeat Generator, or the Update
/// Controller; consumed exclusively by the Stream Writer.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundFrame {
    pub topic: String,
    pub session_id: i64,
    pub payload: serde_json::Value,
}

impl From<OutboundFrame> for V2CBridgeMessage {
    fn from(f: OutboundFrame) -> Self {
        V2CBridgeMessage {
            topic: f.topic,
            session_id: f.session_id,
            msg: f.payload,
        }
    }
}

/// An inbound frame produced by the Stream Reader.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl From<C2VBridgeMessage> for InboundFrame {
    fn from(m: C2VBridgeMessage) -> Self {
        InboundFrame {
            topic: m.topic,
            payload: m.msg,
        }
    }
}

// ---------------------------------------------------------------------------
// Registration / enrollment payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub vizier_id: uuid::Uuid,
    pub jwt_signing_key: String,
    pub address: String,
    pub port: u16,
    pub cluster_uid: String,
    pub cluster_name: String,
    pub cluster_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub status: RegisterAckStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub k8s_cluster_uid: String,
    pub k8s_cluster_name: String,
    pub k8s_cluster_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub vizier_id: uuid::Uuid,
}

// ---------------------------------------------------------------------------
// Heartbeat payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Updating,
    UpdateFailed,
    Unknown,
    Unhealthy,
    Healthy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub name: String,
    pub status: String,
    pub last_updated_unix_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub vizier_id: uuid::Uuid,
    pub time_unix_secs: i64,
    pub sequence_number: u64,
    pub address: String,
    pub port: u16,
    pub num_nodes: u32,
    pub workloads: Vec<WorkloadStatus>,
    pub status: ClusterStatus,
    pub bootstrap_mode: bool,
    pub bootstrap_version: String,
}

// ---------------------------------------------------------------------------
// Vizier update payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VizierUpdateRequest {
    pub version: String,
    pub token: String,
    pub redeploy_etcd: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VizierUpdateResponse {
    pub update_started: bool,
}

// ---------------------------------------------------------------------------
// Local bus envelopes
// ---------------------------------------------------------------------------

/// Wrapper published by local producers onto `v2c.<topic>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V2CMessage {
    pub msg: serde_json::Value,
}

/// Wrapper the bridge publishes onto `c2v.<topic>` for local consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct C2VMessage {
    pub vizier_id: uuid::Uuid,
    pub msg: serde_json::Value,
}

pub const OUTBOUND_PREFIX: &str = "v2c";
pub const INBOUND_PREFIX: &str = "c2v";
pub const PASSTHROUGH_REPLY_PREFIX: &str = "reply-";

/// Strip `<outbound-prefix>.` from a bus subject, returning the logical topic.
///
/// Returns `None` if the subject does not carry the outbound prefix.
pub fn strip_outbound_prefix(subject: &str) -> Option<&str> {
    subject
        .strip_prefix(OUTBOUND_PREFIX)
        .and_then(|rest| rest.strip_prefix('.'))
}

/// Build the inbound bus subject for a given logical topic.
pub fn inbound_subject(topic: &str) -> String {
    format!("{INBOUND_PREFIX}.{topic}")
}

/// True if `topic` (already stripped of the outbound prefix) names a
/// passthrough reply subject. Callers run this against the logical topic,
/// not the raw bus subject, so a reply subject never collides with a topic
/// name that happens to start with the same prefix.
pub fn is_passthrough_topic(topic: &str) -> bool {
    topic.starts_with(PASSTHROUGH_REPLY_PREFIX)
}
