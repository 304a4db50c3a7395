//! Typed metadata carried by a staged order.
//!
//! Fields arrive incrementally (payment link at placement, status on each
//! gateway event, migration record once the order is permanent), so every
//! write goes through [`MetadataPatch`], which only touches the keys it sets.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{PermanentOrderId, QueueItemId};

/// Payment status lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Paid,
    Failed,
    Expired,
}

/// Result of asking whether a status change may be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionCheck {
    /// The change moves the order to a new status.
    Apply,
    /// The order is already in the requested status.
    Duplicate,
    /// The change would regress a paid order.
    Stale,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }

    /// `paid` is sticky: once money has moved, no later event may undo it.
    /// Every other status may still become `paid` (events arrive out of order).
    pub fn check_transition(self, next: PaymentStatus) -> TransitionCheck {
        if self == next {
            TransitionCheck::Duplicate
        } else if self == PaymentStatus::Paid {
            TransitionCheck::Stale
        } else {
            TransitionCheck::Apply
        }
    }
}

impl core::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment link issued by the gateway for a staged order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentLink {
    pub gateway_id: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Delivery state of a best-effort notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NotificationState {
    #[default]
    NotSent,
    /// Claimed by a reconciler invocation that is delivering it right now.
    Sending { since: DateTime<Utc> },
    Sent {
        message_id: Option<String>,
        at: DateTime<Utc>,
    },
    Failed { error: String, at: DateTime<Utc> },
}

impl NotificationState {
    pub fn is_sent(&self) -> bool {
        matches!(self, NotificationState::Sent { .. })
    }

    /// A notification may be (re)claimed if nobody delivered it and nobody is delivering it.
    pub fn is_claimable(&self) -> bool {
        matches!(
            self,
            NotificationState::NotSent | NotificationState::Failed { .. }
        )
    }
}

/// Proof that an order reached the permanent store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub permanent_order_id: PermanentOrderId,
    pub migrated_at: DateTime<Utc>,
}

/// Well-known metadata of a staged order.
///
/// `moved_to_permanent` is derived from `migration`, so a migrated order can
/// never lack its permanent id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderMetadata {
    #[serde(default)]
    pub payment_link: Option<PaymentLink>,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payment_failure_reason: Option<String>,
    #[serde(default)]
    pub migration: Option<MigrationRecord>,
    #[serde(default)]
    pub kitchen_notification: NotificationState,
    #[serde(default)]
    pub receipt_notification: NotificationState,
    #[serde(default)]
    pub queue_item_id: Option<QueueItemId>,
    /// Set while a reconciler invocation owns the direct migration attempt.
    #[serde(default)]
    pub migration_claimed_at: Option<DateTime<Utc>>,
}

impl OrderMetadata {
    pub fn moved_to_permanent(&self) -> bool {
        self.migration.is_some()
    }

    pub fn permanent_order_id(&self) -> Option<PermanentOrderId> {
        self.migration.map(|m| m.permanent_order_id)
    }

    /// Nobody has migrated or queued the order, and no live claim is held.
    /// A claim older than `abandon_after` counts as abandoned (its holder crashed).
    pub fn migration_claimable(&self, now: DateTime<Utc>, abandon_after: Duration) -> bool {
        self.migration.is_none()
            && self.queue_item_id.is_none()
            && self
                .migration_claimed_at
                .is_none_or(|at| now - at >= abandon_after)
    }

    /// Merge a patch: keys the patch leaves unset keep their current value.
    pub fn merge(&mut self, patch: MetadataPatch) {
        let MetadataPatch {
            payment_link,
            payment_status,
            paid_at,
            payment_failure_reason,
            migration,
            kitchen_notification,
            receipt_notification,
            queue_item_id,
        } = patch;

        if let Some(v) = payment_link {
            self.payment_link = Some(v);
        }
        if let Some(v) = payment_status {
            self.payment_status = v;
        }
        if let Some(v) = paid_at {
            self.paid_at = Some(v);
        }
        if let Some(v) = payment_failure_reason {
            self.payment_failure_reason = Some(v);
        }
        if let Some(v) = migration {
            self.migration = Some(v);
        }
        if let Some(v) = kitchen_notification {
            self.kitchen_notification = v;
        }
        if let Some(v) = receipt_notification {
            self.receipt_notification = v;
        }
        if let Some(v) = queue_item_id {
            self.queue_item_id = Some(v);
        }
    }
}

/// Partial metadata update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataPatch {
    pub payment_link: Option<PaymentLink>,
    pub payment_status: Option<PaymentStatus>,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_failure_reason: Option<String>,
    pub migration: Option<MigrationRecord>,
    pub kitchen_notification: Option<NotificationState>,
    pub receipt_notification: Option<NotificationState>,
    pub queue_item_id: Option<QueueItemId>,
}

impl MetadataPatch {
    pub fn payment_link(link: PaymentLink) -> Self {
        Self {
            payment_link: Some(link),
            ..Default::default()
        }
    }

    pub fn migrated(record: MigrationRecord) -> Self {
        Self {
            migration: Some(record),
            ..Default::default()
        }
    }

    pub fn queued(id: QueueItemId) -> Self {
        Self {
            queue_item_id: Some(id),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paid_is_sticky() {
        assert_eq!(
            PaymentStatus::Paid.check_transition(PaymentStatus::Failed),
            TransitionCheck::Stale
        );
        assert_eq!(
            PaymentStatus::Paid.check_transition(PaymentStatus::Expired),
            TransitionCheck::Stale
        );
        assert_eq!(
            PaymentStatus::Paid.check_transition(PaymentStatus::Paid),
            TransitionCheck::Duplicate
        );
    }

    #[test]
    fn failed_and_expired_can_still_become_paid() {
        assert_eq!(
            PaymentStatus::Failed.check_transition(PaymentStatus::Paid),
            TransitionCheck::Apply
        );
        assert_eq!(
            PaymentStatus::Expired.check_transition(PaymentStatus::Paid),
            TransitionCheck::Apply
        );
        assert_eq!(
            PaymentStatus::Pending.check_transition(PaymentStatus::Failed),
            TransitionCheck::Apply
        );
    }

    #[test]
    fn merge_only_touches_set_keys() {
        let now = Utc::now();
        let mut meta = OrderMetadata {
            payment_status: PaymentStatus::Paid,
            paid_at: Some(now),
            ..Default::default()
        };

        meta.merge(MetadataPatch {
            kitchen_notification: Some(NotificationState::Sent {
                message_id: Some("m-1".into()),
                at: now,
            }),
            ..Default::default()
        });

        assert_eq!(meta.payment_status, PaymentStatus::Paid);
        assert_eq!(meta.paid_at, Some(now));
        assert!(meta.kitchen_notification.is_sent());
        assert!(!meta.moved_to_permanent());
    }

    #[test]
    fn migration_record_implies_permanent_id() {
        let mut meta = OrderMetadata::default();
        meta.merge(MetadataPatch::migrated(MigrationRecord {
            permanent_order_id: PermanentOrderId(17),
            migrated_at: Utc::now(),
        }));

        assert!(meta.moved_to_permanent());
        assert_eq!(meta.permanent_order_id(), Some(PermanentOrderId(17)));
    }

    #[test]
    fn migration_claim_blocks_until_abandoned() {
        let now = Utc::now();
        let ttl = Duration::minutes(10);
        let mut meta = OrderMetadata::default();
        assert!(meta.migration_claimable(now, ttl));

        meta.migration_claimed_at = Some(now);
        assert!(!meta.migration_claimable(now + Duration::minutes(9), ttl));
        assert!(meta.migration_claimable(now + Duration::minutes(10), ttl));

        meta.migration_claimed_at = None;
        meta.merge(MetadataPatch::queued(QueueItemId::new()));
        assert!(!meta.migration_claimable(now, ttl));
    }

    #[test]
    fn metadata_tolerates_missing_keys_on_disk() {
        let meta: OrderMetadata = serde_json::from_str(r#"{"payment_status":"paid"}"#).unwrap();
        assert_eq!(meta.payment_status, PaymentStatus::Paid);
        assert_eq!(meta.kitchen_notification, NotificationState::NotSent);
    }
}
