//! Field redaction for viewers without access to sensitive data.
//!
//! Each record type declares its sensitive fields with [`maskable!`], which
//! generates the field list and the redaction together:
//!
//! ```ignore
//! maskable!(Visit { customer_email, customer_phone, notes });
//! ```

use serde::Serialize;

use super::role::RoleInfo;
use super::tier::{resolve_access_tier, AccessTier, OwnedResource, Requester};

/// Replacement for a redacted value.
pub const REDACTED: &str = "***";

/// Label shown next to a masked record.
pub const MASK_INDICATOR: &str = "Restricted: contact details hidden";

pub trait Maskable: Clone {
    /// Names of the fields hidden from limited viewers.
    const SENSITIVE_FIELDS: &'static [&'static str];

    /// Copy of `self` with every present sensitive field replaced by [`REDACTED`].
    fn redacted(&self) -> Self;
}

/// Implements [`Maskable`] for a struct whose sensitive fields are all
/// `Option<String>`.
#[macro_export]
macro_rules! maskable {
    ($ty:ident { $($field:ident),+ $(,)? }) => {
        impl $crate::access::Maskable for $ty {
            const SENSITIVE_FIELDS: &'static [&'static str] = &[$(stringify!($field)),+];

            fn redacted(&self) -> Self {
                let mut record = self.clone();
                $(
                    record.$field = record
                        .$field
                        .take()
                        .map(|_| $crate::access::REDACTED.to_string());
                )+
                record
            }
        }
    };
}

/// A record as a given tier is allowed to see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskedRecord<T> {
    #[serde(flatten)]
    pub record: T,
    pub tier: AccessTier,
    pub is_masked: bool,
}

impl<T: Maskable> MaskedRecord<T> {
    /// Fields hidden in this view.
    pub fn masked_fields(&self) -> &'static [&'static str] {
        if self.is_masked {
            T::SENSITIVE_FIELDS
        } else {
            &[]
        }
    }

    pub fn is_field_masked(&self, field: &str) -> bool {
        self.masked_fields().contains(&field)
    }

    pub fn indicator(&self) -> Option<&'static str> {
        self.is_masked.then_some(MASK_INDICATOR)
    }

    /// Whether to offer a "request access" action.
    pub fn can_request_access(&self) -> bool {
        self.is_masked
    }
}

/// View of `record` for `tier`. The source record is never modified.
pub fn mask<T: Maskable>(record: &T, tier: AccessTier) -> MaskedRecord<T> {
    if tier.sees_sensitive_fields() {
        MaskedRecord {
            record: record.clone(),
            tier,
            is_masked: false,
        }
    } else {
        MaskedRecord {
            record: record.redacted(),
            tier,
            is_masked: true,
        }
    }
}

/// Mask each record with the tier `requester` has on it.
pub fn mask_all<T>(records: &[T], requester: Option<&Requester>, role: &RoleInfo) -> Vec<MaskedRecord<T>>
where
    T: Maskable + OwnedResource,
{
    records
        .iter()
        .map(|record| mask(record, resolve_access_tier(requester, &record.scope(), role)))
        .collect()
}
