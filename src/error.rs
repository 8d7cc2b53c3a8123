//! Error types for identity and access operations.

use std::collections::BTreeSet;
use std::fmt;

use crate::types::FacilityId;

/// Errors surfaced by the identity core.
///
/// Reconciliation mismatches between the provider and the internal store are
/// deliberately absent: they are logged and absorbed, never returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The login identifier is already held by another identity, or an
    /// archived identity cannot be reclaimed for the target organization.
    ConflictingUser,

    /// The identity exists but has no resolvable organization grants.
    MisconfiguredUser(String),

    /// No request context identifies the caller.
    UnidentifiedCaller,

    /// Neither all-facility access nor any explicit facility was requested.
    FacilityAccessRequired,

    /// Some requested facilities do not exist in the target organization.
    FacilitiesNotFound {
        /// Exactly the requested ids that did not resolve.
        facility_ids: BTreeSet<FacilityId>,
        /// External id of the organization the ids were checked against.
        organization_external_id: String,
    },

    /// The external identity provider could not be reached or failed.
    ProviderUnavailable(String),

    /// The provider has no account for this login.
    ProviderAccountMissing(String),

    /// No identity with the given id or login exists.
    NonexistentUser,

    /// No organization with the given external or internal id exists.
    NonexistentOrganization(String),

    /// Site administrators cannot be managed through this operation.
    RestrictedAccessUser,

    /// A caller-supplied argument was rejected.
    InvalidArgument(String),

    /// Persistence failure.
    Database(String),
}

impl fmt::Display for IdentityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingUser => write!(f, "A user with this email address already exists"),
            Self::MisconfiguredUser(user) => {
                write!(f, "User {} has no resolvable organization roles", user)
            }
            Self::UnidentifiedCaller => write!(f, "Unable to identify the current user"),
            Self::FacilityAccessRequired => {
                write!(f, "Facility access must be specified for this user")
            }
            Self::FacilitiesNotFound {
                facility_ids,
                organization_external_id,
            } => {
                let ids: Vec<&str> = facility_ids.iter().map(|id| id.as_str()).collect();
                write!(
                    f,
                    "Facilities not found in organization {}: {}",
                    organization_external_id,
                    ids.join(", ")
                )
            }
            Self::ProviderUnavailable(msg) => write!(f, "Identity provider unavailable: {}", msg),
            Self::ProviderAccountMissing(login) => {
                write!(f, "No identity provider account for {}", login)
            }
            Self::NonexistentUser => write!(f, "Cannot find user"),
            Self::NonexistentOrganization(id) => write!(f, "Organization not found: {}", id),
            Self::RestrictedAccessUser => write!(f, "This user cannot be managed here"),
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::Database(msg) => write!(f, "Database error: {}", msg),
        }
    }
}

impl std::error::Error for IdentityError {}

impl IdentityError {
    /// Whether the caller can fix the request and retry it.
    pub fn is_user_correctable(&self) -> bool {
        matches!(
            self,
            Self::ConflictingUser
                | Self::FacilityAccessRequired
                | Self::FacilitiesNotFound { .. }
                | Self::InvalidArgument(_)
        )
    }

    /// Whether the failure comes from infrastructure and may clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_) | Self::Database(_))
    }
}

/// Result type for identity operations.
pub type IdentityResult<T> = Result<T, IdentityError>;

impl From<anyhow::Error> for IdentityError {
    fn from(err: anyhow::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<surrealdb::Error> for IdentityError {
    fn from(err: surrealdb::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Errors reported by an identity provider client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Transport failure, timeout, or provider-side fault.
    Unavailable(String),
    /// The provider has no account for the given login.
    UserNotFound(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "provider unavailable: {}", msg),
            Self::UserNotFound(login) => write!(f, "provider user not found: {}", login),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for IdentityError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable(msg) => Self::ProviderUnavailable(msg),
            ProviderError::UserNotFound(login) => Self::ProviderAccountMissing(login),
        }
    }
}
