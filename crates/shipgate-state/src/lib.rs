//! shipgate-state — execution, approval, and audit state for Shipgate.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for execution snapshots, resolved approvals, and the per-execution
//! audit trail.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Audit events use `(execution_id, sequence)` tuple keys so one
//! execution's trail is a single key range.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
