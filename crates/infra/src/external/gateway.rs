use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::Money;
use orderflow_orders::{CustomerInfo, PaymentLink, PaymentStatus};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),
    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),
}

/// Everything the gateway needs to issue a checkout link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentLinkRequest {
    /// Staging id; the gateway echoes it back in event metadata.
    pub order_ref: String,
    pub amount: Money,
    pub customer: CustomerInfo,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_link(&self, request: &PaymentLinkRequest) -> Result<PaymentLink, GatewayError>;
}

/// Normalized gateway event kinds, whatever webhook they arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayEventKind {
    CheckoutCompleted,
    PaymentSucceeded,
    PaymentFailed,
    CheckoutExpired,
}

impl GatewayEventKind {
    /// Payment status this event moves a staged order to.
    pub fn target_status(self) -> PaymentStatus {
        match self {
            GatewayEventKind::CheckoutCompleted | GatewayEventKind::PaymentSucceeded => PaymentStatus::Paid,
            GatewayEventKind::PaymentFailed => PaymentStatus::Failed,
            GatewayEventKind::CheckoutExpired => PaymentStatus::Expired,
        }
    }
}

/// A payment gateway event. Delivery is at-least-once and unordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayEvent {
    pub kind: GatewayEventKind,
    /// Gateway-side identifier (checkout session / payment intent id).
    pub gateway_id: String,
    /// Staging id the caller attached to the link, when the gateway echoes it.
    #[serde(default)]
    pub staging_ref: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

impl GatewayEvent {
    pub fn new(kind: GatewayEventKind, gateway_id: impl Into<String>) -> Self {
        Self {
            kind,
            gateway_id: gateway_id.into(),
            staging_ref: None,
            failure_reason: None,
        }
    }

    pub fn with_staging_ref(mut self, staging_ref: impl Into<String>) -> Self {
        self.staging_ref = Some(staging_ref.into());
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kinds_map_to_statuses() {
        assert_eq!(GatewayEventKind::CheckoutCompleted.target_status(), PaymentStatus::Paid);
        assert_eq!(GatewayEventKind::PaymentSucceeded.target_status(), PaymentStatus::Paid);
        assert_eq!(GatewayEventKind::PaymentFailed.target_status(), PaymentStatus::Failed);
        assert_eq!(GatewayEventKind::CheckoutExpired.target_status(), PaymentStatus::Expired);
    }

    #[test]
    fn events_deserialize_from_normalized_json() {
        let event: GatewayEvent = serde_json::from_str(
            r#"{"kind":"payment_failed","gateway_id":"pi_1","failure_reason":"card_declined"}"#,
        )
        .unwrap();
        assert_eq!(event.kind, GatewayEventKind::PaymentFailed);
        assert_eq!(event.staging_ref, None);
        assert_eq!(event.failure_reason.as_deref(), Some("card_declined"));
    }
}
