//! Best-effort observers: audit log, execution tracking, progress.
//!
//! The engine calls these at every transition and logs any failure. An
//! observer can never change the outcome of a pipeline.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use shipgate_core::ExecutionId;
use shipgate_state::{AuditEvent, ExecutionSnapshot, StateStore};

/// Receives the audit trail of every execution.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()>;
}

/// Receives the live state of every execution.
#[async_trait]
pub trait ExecutionTracker: Send + Sync {
    async fn update_state(
        &self,
        execution_id: &str,
        snapshot: &ExecutionSnapshot,
    ) -> anyhow::Result<()>;
}

/// Receives coarse progress updates for UIs.
#[async_trait]
pub trait ProgressNotifier: Send + Sync {
    async fn notify_progress(&self, execution_id: &str, stage: &str, percent: u8)
    -> anyhow::Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl AuditSink for NoopObserver {
    async fn record(&self, _event: &AuditEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ExecutionTracker for NoopObserver {
    async fn update_state(&self, _: &str, _: &ExecutionSnapshot) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ProgressNotifier for NoopObserver {
    async fn notify_progress(&self, _: &str, _: &str, _: u8) -> anyhow::Result<()> {
        Ok(())
    }
}

// ── StateStore adapters ────────────────────────────────────────────

#[async_trait]
impl AuditSink for StateStore {
    async fn record(&self, event: &AuditEvent) -> anyhow::Result<()> {
        self.append_audit_event(event)?;
        Ok(())
    }
}

#[async_trait]
impl ExecutionTracker for StateStore {
    async fn update_state(
        &self,
        _execution_id: &str,
        snapshot: &ExecutionSnapshot,
    ) -> anyhow::Result<()> {
        self.put_execution(snapshot)?;
        Ok(())
    }
}

// ── In-memory cache ────────────────────────────────────────────────

/// Latest snapshot per execution, held in memory.
///
/// Updates are monotonic: once an execution has a terminal snapshot, a
/// late non-terminal update is ignored.
#[derive(Debug, Default)]
pub struct ExecutionCache {
    snapshots: DashMap<ExecutionId, ExecutionSnapshot>,
}

impl ExecutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `snapshot`. Returns false if it was dropped as stale.
    pub fn apply(&self, snapshot: &ExecutionSnapshot) -> bool {
        match self.snapshots.entry(snapshot.execution_id.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(snapshot.clone());
                true
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().state.is_terminal() && !snapshot.state.is_terminal() {
                    debug!(
                        execution_id = %snapshot.execution_id,
                        state = ?snapshot.state,
                        "ignoring stale snapshot"
                    );
                    return false;
                }
                occupied.insert(snapshot.clone());
                true
            }
        }
    }

    pub fn get(&self, execution_id: &str) -> Option<ExecutionSnapshot> {
        self.snapshots.get(execution_id).map(|s| s.clone())
    }

    pub fn contains(&self, execution_id: &str) -> bool {
        self.snapshots.contains_key(execution_id)
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[async_trait]
impl ExecutionTracker for ExecutionCache {
    async fn update_state(
        &self,
        _execution_id: &str,
        snapshot: &ExecutionSnapshot,
    ) -> anyhow::Result<()> {
        self.apply(snapshot);
        Ok(())
    }
}
