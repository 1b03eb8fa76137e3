//! StateStore — redb-backed state persistence for Shipgate.
//!
//! Provides typed operations over execution snapshots, approval requests,
//! and audit events. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        txn.open_table(APPROVALS).map_err(map_err!(Table))?;
        txn.open_table(AUDIT_EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Executions ─────────────────────────────────────────────────

    /// Store the latest snapshot of an execution.
    ///
    /// A terminal snapshot is never replaced by a non-terminal one; such
    /// writes are dropped and `false` is returned.
    pub fn put_execution(&self, snapshot: &ExecutionSnapshot) -> StateResult<bool> {
        let key = snapshot.execution_id.as_str();
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let applied;
        {
            let mut table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
            let existing = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let current_terminal = match existing {
                Some(bytes) => {
                    let current: ExecutionSnapshot =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    current.state.is_terminal()
                }
                None => false,
            };
            applied = !(current_terminal && !snapshot.state.is_terminal());
            if applied {
                table
                    .insert(key, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if !applied {
            warn!(execution_id = %key, state = ?snapshot.state, "ignored snapshot after terminal state");
        }
        Ok(applied)
    }

    /// Get the latest snapshot of an execution.
    pub fn get_execution(&self, execution_id: &str) -> StateResult<Option<ExecutionSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        match table.get(execution_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: ExecutionSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    /// List the latest snapshot of every execution.
    pub fn list_executions(&self) -> StateResult<Vec<ExecutionSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXECUTIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let snapshot: ExecutionSnapshot =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(snapshot);
        }
        Ok(results)
    }

    // ── Approvals ──────────────────────────────────────────────────

    /// Insert or update an approval request.
    ///
    /// A decided request is never reverted to `Pending`. Returns whether
    /// the write was applied.
    pub fn put_approval(&self, request: &ApprovalRequest) -> StateResult<bool> {
        let key = request.execution_id.as_str();
        let value = serde_json::to_vec(request).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let applied;
        {
            let mut table = txn.open_table(APPROVALS).map_err(map_err!(Table))?;
            let existing = table
                .get(key)
                .map_err(map_err!(Read))?
                .map(|guard| guard.value().to_vec());
            let current_decided = match existing {
                Some(bytes) => {
                    let current: ApprovalRequest =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    current.status.is_terminal()
                }
                None => false,
            };
            applied = !(current_decided && !request.status.is_terminal());
            if applied {
                table
                    .insert(key, value.as_slice())
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if applied {
            debug!(execution_id = %key, status = ?request.status, "approval stored");
        } else {
            warn!(execution_id = %key, status = ?request.status, "ignored pending approval after decision");
        }
        Ok(applied)
    }

    /// Get an approval request by its execution key.
    pub fn get_approval(&self, execution_id: &str) -> StateResult<Option<ApprovalRequest>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPROVALS).map_err(map_err!(Table))?;
        match table.get(execution_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let request: ApprovalRequest =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(request))
            }
            None => Ok(None),
        }
    }

    /// List all stored approval requests.
    pub fn list_approvals(&self) -> StateResult<Vec<ApprovalRequest>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPROVALS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let request: ApprovalRequest =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(request);
        }
        Ok(results)
    }

    // ── Audit ──────────────────────────────────────────────────────

    /// Append an event to an execution's audit trail. Returns its sequence number.
    pub fn append_audit_event(&self, event: &AuditEvent) -> StateResult<u64> {
        let execution_id = event.execution_id.as_str();
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let sequence;
        {
            let mut table = txn.open_table(AUDIT_EVENTS).map_err(map_err!(Table))?;
            // Next sequence follows the execution's last key, read inside the write txn.
            let last = table
                .range((execution_id, 0u64)..=(execution_id, u64::MAX))
                .map_err(map_err!(Read))?
                .next_back()
                .transpose()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value().1);
            sequence = last.map_or(0, |seq| seq + 1);
            table
                .insert((execution_id, sequence), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(sequence)
    }

    /// List an execution's audit trail in the order it was recorded.
    pub fn list_audit_events(&self, execution_id: &str) -> StateResult<Vec<AuditEvent>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(AUDIT_EVENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range((execution_id, 0u64)..=(execution_id, u64::MAX))
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let event: AuditEvent =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(event);
        }
        Ok(results)
    }
}
