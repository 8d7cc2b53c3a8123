//! External identity provider seam.
//!
//! The provider owns credentials and account lifecycle (activation mail,
//! password and MFA resets). During the migration it also holds organization
//! role claims, which the reconciler compares against the internal store.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryIdentityProvider`]: local single-process mode and tests
//! - [`HttpIdentityProvider`]: a REST-backed provider
//!
//! Every call may fail with [`ProviderError::Unavailable`]. A login the
//! provider does not know is reported as [`ProviderError::UserNotFound`],
//! which callers can treat as "no claims" rather than an outage.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::access::OrganizationRole;
use crate::db::{OrganizationRecord, PersonName};
use crate::error::ProviderError;
use crate::types::FacilityId;

pub use http::HttpIdentityProvider;
pub use memory::{InMemoryIdentityProvider, ProviderEvent};

/// Account status as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    /// Created, activation not completed.
    Provisioned,
    Active,
    PasswordExpired,
    Suspended,
    Deprovisioned,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioned => "PROVISIONED",
            Self::Active => "ACTIVE",
            Self::PasswordExpired => "PASSWORD_EXPIRED",
            Self::Suspended => "SUSPENDED",
            Self::Deprovisioned => "DEPROVISIONED",
        }
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Organization roles a provider account carries, keyed by the
/// organization's external id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationRoleClaims {
    pub organization_external_id: String,
    pub granted_roles: BTreeSet<OrganizationRole>,
    #[serde(default)]
    pub facility_ids: BTreeSet<FacilityId>,
}

/// What the provider knows about one login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialExternalUser {
    pub login_email: String,
    pub status: Option<UserStatus>,
    #[serde(default)]
    pub is_site_admin: bool,
    pub org_role_claims: Option<OrganizationRoleClaims>,
}

/// Profile pushed to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAttributes {
    pub username: String,
    pub name: PersonName,
}

impl IdentityAttributes {
    pub fn new(username: impl Into<String>, name: PersonName) -> Self {
        Self {
            username: username.into(),
            name,
        }
    }
}

/// Client for the external identity provider.
///
/// Implementations never retry; timeouts and retries belong to the transport.
#[async_trait]
pub trait IdentityProviderClient: Send + Sync {
    async fn find_user(&self, login_email: &str) -> Result<PartialExternalUser, ProviderError>;

    /// Create an account and return the claims the provider recorded.
    async fn create_user(
        &self,
        attributes: &IdentityAttributes,
        organization: &OrganizationRecord,
        facility_ids: &BTreeSet<FacilityId>,
        roles: &BTreeSet<OrganizationRole>,
        active: bool,
    ) -> Result<Option<OrganizationRoleClaims>, ProviderError>;

    /// Push a changed display name.
    async fn update_user(&self, attributes: &IdentityAttributes) -> Result<(), ProviderError>;

    async fn update_user_email(
        &self,
        attributes: &IdentityAttributes,
        new_email: &str,
    ) -> Result<(), ProviderError>;

    /// Replace the account's organization roles and facilities.
    async fn update_user_privileges(
        &self,
        login_email: &str,
        organization: &OrganizationRecord,
        facility_ids: &BTreeSet<FacilityId>,
        roles: &BTreeSet<OrganizationRole>,
    ) -> Result<Option<OrganizationRoleClaims>, ProviderError>;

    /// Re-issue credentials for an account being reclaimed.
    async fn reprovision_user(&self, attributes: &IdentityAttributes) -> Result<(), ProviderError>;

    async fn reset_password(&self, login_email: &str) -> Result<(), ProviderError>;

    async fn reset_mfa(&self, login_email: &str) -> Result<(), ProviderError>;

    async fn set_active(&self, login_email: &str, active: bool) -> Result<(), ProviderError>;

    async fn resend_activation_email(&self, login_email: &str) -> Result<(), ProviderError>;

    async fn list_users_for_organization(
        &self,
        organization_external_id: &str,
    ) -> Result<BTreeSet<String>, ProviderError>;

    async fn list_users_with_status(
        &self,
        organization_external_id: &str,
    ) -> Result<BTreeMap<String, UserStatus>, ProviderError>;
}
