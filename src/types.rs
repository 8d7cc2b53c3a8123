//! NewType wrappers for the identifiers that flow through the identity core.
//!
//! Internal ids are opaque UUID strings minted by this crate. Keeping them as
//! distinct types prevents passing a facility id where an organization id is
//! expected, which would otherwise type-check as plain strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Mint a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

newtype_string!(
    /// Internal identifier of a user identity.
    UserId
);

newtype_string!(
    /// Internal identifier of an organization.
    ///
    /// Distinct from the tenant-facing external id, which is a plain string
    /// chosen when the organization is created.
    OrganizationId
);

newtype_string!(
    /// Internal identifier of a facility. Facilities belong to exactly one
    /// organization.
    FacilityId
);

newtype_string!(
    /// Internal identifier of a patient record. A patient record is not a
    /// login identity; the resolver derives a synthetic login from it.
    PatientId
);

/// Normalize a login identifier: trimmed and lower-cased.
pub fn normalize_login(raw: &str) -> String {
    raw.trim().to_lowercase()
}
