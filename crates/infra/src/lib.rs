//! Infrastructure layer: staging store, durable queue, retry journal,
//! migration, payment reconciliation and the background workers that drive them.

pub mod config;
pub mod external;
pub mod journal;
pub mod migration;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod staging;
pub mod workers;

mod json_file;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, PipelineConfig};
pub use pipeline::{OrderPipeline, PipelineError, StagingStatus};
pub use reconciler::{PaymentReconciler, ReconcileOutcome};
