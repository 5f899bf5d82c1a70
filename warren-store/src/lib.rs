//! Durable storage for every cluster entity plus the deterministic state
//! machine that applies committed Raft log entries to it. Grounded on the
//! teacher's `datastore::meta` module (`store.rs`, `state_machine.rs`): one
//! embedded database, named buckets, secondary indexes written alongside the
//! primary record, and an `apply`/`snapshot`/`restore` state machine
//! contract — reimplemented here against `sled` instead of the teacher's
//! bespoke `EmbeddedDB`/`raft` crates, whose sources were not available to
//! ground against (see DESIGN.md).

mod buckets;
mod fsm;
mod store;

pub use fsm::Fsm;
pub use store::Store;
