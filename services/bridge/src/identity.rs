//! Process-wide shared state: cluster identity, heartbeat sequence counter,
//! update flags, and the pending-send slot.
//!
//! All of it is deliberately small — per design notes, the only global state
//! this bridge needs is the heartbeat counter, the update flags, and the
//! cluster identifier itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bridge_proto::OutboundFrame;
use uuid::Uuid;

/// The cluster's identity as assigned by enrollment. Written at most twice
/// in a process lifetime: once at startup (if loaded from persisted state)
/// and once after a successful enrollment RPC.
#[derive(Debug, Clone)]
pub struct ClusterIdentity {
    pub id: Option<Uuid>,
    pub jwt_signing_key: String,
    pub session_id: i64,
}

impl ClusterIdentity {
    pub fn is_enrolled(&self) -> bool {
        self.id.is_some()
    }
}

/// Process-wide monotonic heartbeat sequence counter.
///
/// Incremented only after a heartbeat frame has been handed off to the
/// outbound pipeline; read by the watchdog to detect a stalled outbound
/// path.
#[derive(Debug, Default, Clone)]
pub struct HeartbeatSeq(Arc<AtomicU64>);

impl HeartbeatSeq {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Returns the sequence number that was assigned to the frame just
    /// handed off, then advances the counter for the next one.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel)
    }
}

/// `{running, failed}` update state shared between the Update Controller and
/// the Heartbeat Generator. `failed` is sticky once set.
#[derive(Debug, Default, Clone)]
pub struct UpdateState {
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
}

impl UpdateState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }

    pub fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Resets `failed` on a new successful update cycle start. The flag is
    /// sticky across a single failed run, not across subsequent attempts.
    pub fn clear_failed(&self) {
        self.failed.store(false, Ordering::Release);
    }
}

/// The single optional outbound frame the Stream Writer retains when a send
/// did not complete. Owned by the supervisor, not the writer task, so that
/// it survives a writer's death across a reconnect.
#[derive(Debug, Default, Clone)]
pub struct PendingSend(Arc<Mutex<Option<OutboundFrame>>>);

impl PendingSend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Option<OutboundFrame> {
        self.0.lock().expect("pending-send lock poisoned").take()
    }

    pub fn put(&self, frame: OutboundFrame) {
        *self.0.lock().expect("pending-send lock poisoned") = Some(frame);
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().expect("pending-send lock poisoned").is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_seq_advances_monotonically() {
        let seq = HeartbeatSeq::new();
        assert_eq!(seq.advance(), 0);
        assert_eq!(seq.advance(), 1);
        assert_eq!(seq.get(), 2);
    }

    #[test]
    fn update_state_failed_is_sticky_until_cleared() {
        let state = UpdateState::new();
        assert!(!state.is_failed());
        state.mark_failed();
        assert!(state.is_failed());
        state.set_running(false);
        assert!(state.is_failed(), "failed must stay set independent of running");
        state.clear_failed();
        assert!(!state.is_failed());
    }

    #[test]
    fn pending_send_holds_at_most_one_frame() {
        let slot = PendingSend::new();
        assert!(slot.is_empty());
        slot.put(OutboundFrame {
            topic: "heartbeat".to_owned(),
            session_id: 1,
            payload: serde_json::json!({}),
        });
        assert!(!slot.is_empty());
        let frame = slot.take().unwrap();
        assert_eq!(frame.topic, "heartbeat");
        assert!(slot.is_empty());
    }
}
