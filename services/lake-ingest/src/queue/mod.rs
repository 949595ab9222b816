//! Task orchestration: three isolated queues with their worker pools.
//!
//! FAST runs downloads in parallel under the rate budget; SLOW is a single
//! worker serializing planning and disk writes; MAINT carries housekeeping.
//! The durable store keeps pending tasks across restarts and holds the
//! dead-letter records.

pub mod orchestrator;
pub mod planner;
pub mod store;
pub mod task;
pub mod worker;

pub use orchestrator::{ExitSummary, Orchestrator};
pub use planner::{PlanOutcome, Planner};
pub use store::{JournalEntry, TaskStore};
pub use task::{DeadLetter, MaintKind, QueueName, Task, TaskError, TaskKind, TaskParams};
pub use worker::{QueueStats, TaskHandler, WorkerPool};
