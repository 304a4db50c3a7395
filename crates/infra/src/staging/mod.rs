//! Staging store for orders awaiting payment.

mod disk;
mod store;

pub use disk::StagingError;
pub use store::{StagingStore, StagingTasks};
