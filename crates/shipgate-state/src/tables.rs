//! redb table definitions for the Shipgate state store.
//!
//! Values are `&[u8]` (JSON-serialized domain types). Snapshots and approvals
//! use `&str` keys; audit events use `(execution_id, sequence)` tuple keys so
//! one execution's trail is a contiguous key range.

use redb::TableDefinition;

/// Latest execution snapshot keyed by `{execution_id}`.
pub const EXECUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("executions");

/// Approval requests keyed by `{execution_id}` (the gate key).
pub const APPROVALS: TableDefinition<&str, &[u8]> = TableDefinition::new("approvals");

/// Audit events keyed by `(execution_id, sequence)`.
pub const AUDIT_EVENTS: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("audit_events");
