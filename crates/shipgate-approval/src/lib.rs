//! shipgate-approval — human approval gates for Shipgate pipelines.
//!
//! A pipeline that reaches a sensitive environment opens an approval
//! request and suspends until someone on the approver list decides, or the
//! request times out.
//!
//! # Architecture
//!
//! ```text
//! ApprovalGate
//!   ├── DashMap<execution_id, slot>     one request per key, ever
//!   │   ├── ApprovalRequest             Pending → Approved | Rejected | Expired
//!   │   └── watch::Sender<status>       wakes wait_for_decision()
//!   ├── ApprovalNotifier                requested / approved / rejected / expired
//!   ├── Optional StateStore mirror      every create and transition
//!   └── run_sweeper()                   periodic sweep_expired()
//! ```
//!
//! # Expiry
//!
//! Requests do not carry their own timers. A periodic sweep moves overdue
//! `Pending` requests to `Expired`, so expiry is observed up to one sweep
//! interval after `timeout_at`.

pub mod error;
pub mod gate;
pub mod notify;

pub use error::{ApprovalError, ApprovalResult};
pub use gate::{ApprovalGate, ApprovalGateConfig, NewApproval};
pub use notify::{ApprovalEvent, ApprovalNotifier, NoopApprovalNotifier};
