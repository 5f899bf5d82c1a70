//! In-memory fan-out bus for cluster events (spec §2's EventBroker / the
//! `StreamEvents` RPC). Subscribers are optional and disconnecting one never
//! blocks publishers — mirrors `tokio::sync::broadcast`'s lagged-receiver
//! semantics rather than a bounded mpsc that could back up the whole system.

use tokio::sync::broadcast;
use warren_proto::pb::ClusterEvent;
use warren_proto::now_timestamp;

const CHANNEL_CAPACITY: usize = 1024;

pub struct EventBroker {
    sender: broadcast::Sender<ClusterEvent>,
}

impl EventBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, kind: &str, subject_id: &str) {
        let _ = self.sender.send(ClusterEvent {
            kind: kind.to_string(),
            subject_id: subject_id.to_string(),
            at: Some(now_timestamp()),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}
