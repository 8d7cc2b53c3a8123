//! Requested roles and the organization-scoped roles they expand to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::IdentityError;

/// Role requested by an administrator when granting access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    EntryOnly,
    User,
    Admin,
}

impl Role {
    pub fn to_organization_role(self) -> OrganizationRole {
        match self {
            Self::EntryOnly => OrganizationRole::EntryOnly,
            Self::User => OrganizationRole::User,
            Self::Admin => OrganizationRole::Admin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EntryOnly => "ENTRY_ONLY",
            Self::User => "USER",
            Self::Admin => "ADMIN",
        }
    }
}

impl FromStr for Role {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENTRY_ONLY" => Ok(Self::EntryOnly),
            "USER" => Ok(Self::User),
            "ADMIN" => Ok(Self::Admin),
            other => Err(IdentityError::InvalidArgument(format!("unknown role: {}", other))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Organization-scoped role as persisted and as carried in provider claims.
///
/// Variant order is the privilege order used by [`effective_role`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrganizationRole {
    /// Present on every grant.
    NoAccess,
    EntryOnly,
    User,
    Admin,
    /// Capability role: access to every facility of the organization.
    AllFacilities,
}

impl OrganizationRole {
    /// The role that is always part of a grant.
    pub fn default_role() -> Self {
        Self::NoAccess
    }

    pub fn grants_all_facility_access(self) -> bool {
        matches!(self, Self::Admin | Self::AllFacilities)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoAccess => "NO_ACCESS",
            Self::EntryOnly => "ENTRY_ONLY",
            Self::User => "USER",
            Self::Admin => "ADMIN",
            Self::AllFacilities => "ALL_FACILITIES",
        }
    }
}

impl fmt::Display for OrganizationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether any role in the set carries the all-facilities capability.
pub fn grants_all_facility_access(roles: &BTreeSet<OrganizationRole>) -> bool {
    roles.iter().any(|r| r.grants_all_facility_access())
}

/// Highest requestable role in the set, if any.
pub fn effective_role(roles: &BTreeSet<OrganizationRole>) -> Option<Role> {
    roles.iter().rev().find_map(|r| match r {
        OrganizationRole::Admin => Some(Role::Admin),
        OrganizationRole::User => Some(Role::User),
        OrganizationRole::EntryOnly => Some(Role::EntryOnly),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert_eq!(" Entry_Only ".parse::<Role>().unwrap(), Role::EntryOnly);
        assert!(matches!(
            "owner".parse::<Role>(),
            Err(IdentityError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_all_facility_capability() {
        let user: BTreeSet<_> = [OrganizationRole::NoAccess, OrganizationRole::User].into();
        assert!(!grants_all_facility_access(&user));

        let admin: BTreeSet<_> = [OrganizationRole::NoAccess, OrganizationRole::Admin].into();
        assert!(grants_all_facility_access(&admin));

        let all: BTreeSet<_> = [OrganizationRole::EntryOnly, OrganizationRole::AllFacilities].into();
        assert!(grants_all_facility_access(&all));
    }

    #[test]
    fn test_effective_role_ignores_capabilities() {
        let roles: BTreeSet<_> = [
            OrganizationRole::NoAccess,
            OrganizationRole::User,
            OrganizationRole::AllFacilities,
        ]
        .into();
        assert_eq!(effective_role(&roles), Some(Role::User));

        let none: BTreeSet<_> = [OrganizationRole::NoAccess].into();
        assert_eq!(effective_role(&none), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&OrganizationRole::AllFacilities).unwrap();
        assert_eq!(json, "\"ALL_FACILITIES\"");
        let role: Role = serde_json::from_str("\"ENTRY_ONLY\"").unwrap();
        assert_eq!(role, Role::EntryOnly);
    }
}
