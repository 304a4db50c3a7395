//! File-based retry journal for migrations that could not even be queued.
//!
//! The durable queue is the authoritative at-least-once path. The journal
//! covers the case where the queue's backing store was itself unreachable:
//! one JSON file per staged order, swept on an interval with exponential
//! backoff, and left in place once retries are exhausted.

mod store;
mod sweeper;
mod types;

pub use store::{JournalError, RetryJournal};
pub use sweeper::{RetrySweeper, SweepReport};
pub use types::RetryJournalEntry;
