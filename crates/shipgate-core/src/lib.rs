//! shipgate-core — shared types and configuration for Shipgate.
//!
//! Everything in here is plain data: the deployment request a caller hands
//! to the pipeline, the ordered environment ladder a module is promoted
//! through, and the `shipgate.toml` configuration shape that the other
//! crates convert into their runtime settings. The cancellation signal used
//! by every suspension point also lives here.

pub mod cancel;
pub mod config;
pub mod types;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use config::{
    ApprovalMode, ApprovalSettings, ConfigError, PipelineSettings, ShipgateConfig,
    StabilizationSettings, parse_duration,
};
pub use types::*;
