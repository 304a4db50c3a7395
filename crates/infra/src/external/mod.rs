//! Seams to collaborators outside the pipeline: the payment gateway and the notifier.

mod gateway;
mod notifier;

pub use gateway::{GatewayError, GatewayEvent, GatewayEventKind, PaymentGateway, PaymentLinkRequest};
pub use notifier::{DeliveryReceipt, Notification, Notifier, NotifyError, Template};
