//! Durable notification scheduling for Pushclock.
//!
//! Tasks are persisted in SQLite, registered as jobs keyed by task id, and
//! fired by a poll loop onto a bounded worker pool. Each firing is
//! serialized per task, deduplicated, logged, and followed by hooks,
//! events and alert checks.

pub mod alerts;
pub mod cron;
pub mod engine;
pub mod events;
pub mod jobs;
pub mod locks;
pub mod persistence;

pub use alerts::AlertEvaluator;
pub use engine::{SchedulerEngine, StartupSummary};
pub use events::EventBroadcaster;
pub use jobs::{JobRecord, Trigger};
pub use persistence::SchedulerDb;
