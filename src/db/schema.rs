use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use surrealdb::sql::Datetime;

use crate::access::OrganizationRole;
use crate::types::{FacilityId, OrganizationId, UserId};

/// Structured person name.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PersonName {
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    pub suffix: Option<String>,
}

impl PersonName {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            middle_name: None,
            last_name: last_name.into(),
            suffix: None,
        }
    }

    pub fn with_middle_name(mut self, middle_name: impl Into<String>) -> Self {
        self.middle_name = Some(middle_name.into());
        self
    }

    /// Name used for system identities, which only carry a last name.
    pub fn system(label: impl Into<String>) -> Self {
        Self::new("", label)
    }

    /// First, middle and last name joined by single spaces. A missing middle
    /// name leaves an empty segment, so the result contains two spaces.
    pub fn full_name(&self) -> String {
        format!(
            "{} {} {}",
            self.first_name,
            self.middle_name.as_deref().unwrap_or(""),
            self.last_name
        )
    }
}

/// Persisted organization (tenant).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationRecord {
    pub internal_id: OrganizationId,
    /// Tenant-facing identifier, also used in provider claims.
    pub external_id: String,
    pub name: String,
    /// New provider accounts in unverified organizations start inactive.
    pub identity_verified: bool,
}

/// Payload for creating an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationCreate {
    pub external_id: String,
    pub name: String,
    pub identity_verified: bool,
}

/// Persisted facility, owned by one organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityRecord {
    pub internal_id: FacilityId,
    pub organization_id: OrganizationId,
    pub name: String,
    #[serde(default)]
    pub is_deleted: bool,
}

/// Role grant stored inline on the user record.
///
/// A grant whose roles carry the all-facilities capability stores no
/// explicit facility ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredGrant {
    pub organization_id: OrganizationId,
    pub roles: BTreeSet<OrganizationRole>,
    #[serde(default)]
    pub facility_ids: BTreeSet<FacilityId>,
}

/// Persisted user identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub internal_id: UserId,
    /// Login identifier, normalized to trimmed lower case.
    pub login_email: String,
    pub name: PersonName,
    /// Soft-delete flag. Archived identities are kept so the login can be
    /// reclaimed later.
    #[serde(default)]
    pub is_deleted: bool,
    /// Grant for the user's organization, if any.
    #[serde(default, rename = "access_grant")]
    pub grant: Option<StoredGrant>,
    pub created_at: Option<Datetime>,
    pub updated_at: Option<Datetime>,
    /// Last successful request resolution for a human identity.
    pub last_seen_at: Option<Datetime>,
}

/// Payload for creating a new user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCreate {
    pub login_email: String,
    pub name: PersonName,
    pub grant: Option<StoredGrant>,
    /// Stamp `last_seen_at` at creation (first login).
    pub seen_now: bool,
}

/// Audit log action types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    UserCreated,
    UserReprovisioned,
    UserUpdated,
    UserEmailChanged,
    PrivilegesUpdated,
    UserArchived,
    UserRestored,
    UserReactivated,
    RolesCleared,
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::UserCreated => "user_created",
            Self::UserReprovisioned => "user_reprovisioned",
            Self::UserUpdated => "user_updated",
            Self::UserEmailChanged => "user_email_changed",
            Self::PrivilegesUpdated => "privileges_updated",
            Self::UserArchived => "user_archived",
            Self::UserRestored => "user_restored",
            Self::UserReactivated => "user_reactivated",
            Self::RolesCleared => "roles_cleared",
        }
    }
}

/// Persisted audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogRecord {
    /// Identity that performed the action
    pub actor_id: String,
    /// Identity the action was performed on
    pub subject_id: String,
    pub action: String,
    pub details: Option<Value>,
    pub created_at: Option<Datetime>,
}

/// Payload for creating an audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogCreate {
    pub actor_id: String,
    pub subject_id: String,
    pub action: String,
    pub details: Option<Value>,
}

impl AuditLogCreate {
    pub fn new(actor: &UserId, subject: &UserId, action: AuditAction) -> Self {
        Self {
            actor_id: actor.to_string(),
            subject_id: subject.to_string(),
            action: action.as_str().to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}
