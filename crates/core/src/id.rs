//! Strongly-typed identifiers used across the pipeline.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a durable migration-queue item.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueItemId(Uuid);

macro_rules! impl_uuid_newtype {
    ($t:ty, $name:literal) => {
        impl $t {
            /// Create a new identifier.
            ///
            /// Uses UUIDv7 (time-ordered). Prefer passing IDs explicitly in tests
            /// for determinism.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $t {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }

        impl From<Uuid> for $t {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }

        impl From<$t> for Uuid {
            fn from(value: $t) -> Self {
                value.0
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let uuid = Uuid::from_str(s)
                    .map_err(|e| DomainError::invalid_id(format!("{}: {}", $name, e)))?;
                Ok(Self(uuid))
            }
        }
    };
}

impl_uuid_newtype!(QueueItemId, "QueueItemId");

/// Identifier of a transient (not yet paid/migrated) order.
///
/// Always rendered as `TEMP-{millis}-{suffix}` so a staging id can never be
/// confused with a permanent order number. Ordered by creation millis, then suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StagingId {
    raw: String,
    millis: u64,
    suffix: u32,
}

impl StagingId {
    pub const PREFIX: &'static str = "TEMP-";

    /// Build an id from its millisecond timestamp and a 4-digit suffix.
    pub fn from_parts(millis: i64, suffix: u16) -> Self {
        let millis = millis.max(0) as u64;
        let suffix = u32::from(suffix % 10_000);
        Self {
            raw: format!("{}{}-{:04}", Self::PREFIX, millis, suffix),
            millis,
            suffix,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Ord for StagingId {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        (self.millis, self.suffix, &self.raw).cmp(&(other.millis, other.suffix, &other.raw))
    }
}

impl PartialOrd for StagingId {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl core::fmt::Display for StagingId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for StagingId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || DomainError::invalid_id(format!("StagingId: malformed {s:?}"));
        let rest = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| DomainError::invalid_id(format!("StagingId: missing prefix in {s:?}")))?;
        let (millis, suffix) = rest.split_once('-').ok_or_else(malformed)?;
        let digits_only = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !digits_only(millis) || !digits_only(suffix) {
            return Err(malformed());
        }
        Ok(Self {
            raw: s.to_string(),
            millis: millis.parse().map_err(|_| malformed())?,
            suffix: suffix.parse().map_err(|_| malformed())?,
        })
    }
}

impl TryFrom<String> for StagingId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StagingId> for String {
    fn from(value: StagingId) -> Self {
        value.raw
    }
}

/// Identifier assigned by the permanent store once an order has been migrated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermanentOrderId(pub i64);

impl core::fmt::Display for PermanentOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}
