//! # Rally Scheduler
//!
//! Phased campaign engine with durable, resumable scheduling.
//!
//! ## Design Principles
//! - The store is the only shared state; every write is a copy committed in one transaction
//! - SQLite persistence — survives restarts
//! - One periodic sweep instead of per-message timers
//! - The engine only ever produces `ready` messages; delivery is external
//!
//! ## Architecture
//! ```text
//! CampaignEngine
//!   ├── initiate → Scorer (priority list) → Planner (phase 0 messages)
//!   ├── advance_phase → Phases (guards, debounce) → Planner
//!   ├── mark_complete / cancel → archive + purge
//!   └── get_ready_messages / confirm_delivered
//!
//! Sweeper (tokio interval)
//!   ├── overdue operations → catch up phase by phase
//!   └── due pending messages → ready
//!
//! Relay (optional)
//!   └── ready messages → HTTP webhook → confirm on 2xx
//! ```

pub mod engine;
pub mod persistence;
pub mod phases;
pub mod planner;
pub mod relay;
pub mod resume;
pub mod scorer;
pub mod store;

pub use engine::{CampaignEngine, FireOutcome, OperationLocks};
pub use persistence::SqliteStore;
pub use relay::{RelayStats, WebhookRelay, spawn_relay};
pub use resume::{SweepReport, spawn_sweeper};
pub use store::{Commit, DeleteOutcome, MemoryStore, OperationStore};
