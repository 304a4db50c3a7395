//! Staged-order domain module.
//!
//! This crate contains the shape of an order between placement and permanent
//! storage, implemented purely as deterministic domain logic (no IO, no
//! storage, no gateway calls).

pub mod metadata;
pub mod order;

pub use metadata::{
    MetadataPatch, MigrationRecord, NotificationState, OrderMetadata, PaymentLink, PaymentStatus,
    TransitionCheck,
};
pub use order::{
    subtotal_of, CustomerInfo, LineItem, OrderDraft, RestaurantRef, StagedOrder, StagedOrderPatch,
};
