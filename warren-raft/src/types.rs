//! openraft type configuration.
//!
//! Grounded on the teacher's `pkg/raft` being unavailable to read from
//! directly (see DESIGN.md): this module instead follows
//! `cbaugus-rust_loadtest`'s `raft.rs`, which wires the same `openraft` crate
//! the way the teacher's own `Cargo.toml` pulls it in.
//!
//! The log entry payload (`D`) is the prost-encoded bytes of a
//! `warren_proto::pb::Command`, not the message type itself: prost messages
//! don't derive `serde::Serialize`, but openraft's JSON-over-gRPC transport
//! (see `network.rs`) needs `D` to. Encoding once, here, keeps the wire
//! format a single well-defined protobuf schema end to end.

use std::io::Cursor;

use openraft::{BasicNode, Entry, TokioRuntime};
use serde::{Deserialize, Serialize};

pub type NodeId = u64;

/// Raft log entry payload: a prost-encoded `Command`.
pub type LogPayload = Vec<u8>;

/// State machine response to a single applied entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyAck {
    pub ok: bool,
    pub error: Option<String>,
}

openraft::declare_raft_types!(
    pub TypeConfig:
        D            = LogPayload,
        R            = ApplyAck,
        NodeId       = NodeId,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type RaftInstance = openraft::Raft<TypeConfig>;
pub type Entry = openraft::Entry<TypeConfig>;

/// Derives a stable `u64` node id from a human-readable identifier (a node's
/// advertised address), so the same string always maps to the same Raft
/// member id across restarts.
pub fn node_id_from_str(s: &str) -> NodeId {
    use std::hash::{Hash, Hasher};
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}
