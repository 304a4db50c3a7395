use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Template {
    /// Order ticket for the restaurant's intake address.
    KitchenOrder,
    /// Payment receipt for the customer.
    PaymentReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub destination: String,
    pub template: Template,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<DeliveryReceipt, NotifyError>;
}

