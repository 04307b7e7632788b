//! # Rally Core
//!
//! Shared data model, configuration and error types for the Rally campaign
//! engine. No I/O beyond config file loading.

pub mod clock;
pub mod config;
pub mod error;
pub mod plan;
pub mod types;

pub use clock::{ClockFn, ManualClock, system_clock};
pub use config::RallyConfig;
pub use error::{RallyError, Result};
pub use plan::{PhasePlan, PlanStep, Recipients};
pub use types::{
    ActivityMetrics, Channel, MessageStatus, Operation, OperationStatus, OperationStatusView,
    ReadyMessage, ScheduledMessage, TargetOperations,
};
