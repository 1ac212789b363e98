//! # SalesRelay Scheduler
//!
//! Fires the summary pipeline once per day at a fixed local wall-clock time.
//!
//! ```text
//! DailyScheduler (tokio sleep until next fire time)
//!   └── SummaryJob
//!         ├── Aggregator::summarize   (record store, query timeout)
//!         └── Publisher::publish      (broker, confirms, reconnect policy)
//! ```
//!
//! Firings never overlap and are not backfilled after downtime. A failed
//! firing is logged and the next day's firing still happens.

pub mod engine;
pub mod schedule;
pub mod summary;

pub use engine::{DailyScheduler, FiringJob, TriggerOutcome};
pub use schedule::DailySchedule;
pub use summary::SummaryJob;
