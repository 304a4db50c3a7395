//! `orderflow-core` — foundation building blocks shared by every crate.
//!
//! This crate contains **pure** primitives (no I/O): identifiers, money, the
//! canonical price function and the domain error model.

pub mod error;
pub mod id;
pub mod money;
pub mod pricing;

pub use error::DomainError;
pub use id::{PermanentOrderId, QueueItemId, StagingId};
pub use money::Money;
pub use pricing::{PriceBreakdown, PricePolicy};
