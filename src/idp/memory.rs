//! In-process identity provider.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::{
    IdentityAttributes, IdentityProviderClient, OrganizationRoleClaims, PartialExternalUser,
    UserStatus,
};
use crate::access::OrganizationRole;
use crate::db::{OrganizationRecord, PersonName};
use crate::error::ProviderError;
use crate::types::{normalize_login, FacilityId};

/// Side effects recorded by the in-memory provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    PasswordReset(String),
    MfaReset(String),
    ActivationEmail(String),
    Reprovisioned(String),
}

#[derive(Debug, Clone)]
struct Account {
    name: PersonName,
    status: UserStatus,
    is_site_admin: bool,
    claims: Option<OrganizationRoleClaims>,
}

/// Identity provider holding accounts in memory.
///
/// Used for local runs and as the provider fake in tests. [`set_available`]
/// simulates an outage: every call then fails with
/// [`ProviderError::Unavailable`].
///
/// [`set_available`]: InMemoryIdentityProvider::set_available
#[derive(Debug)]
pub struct InMemoryIdentityProvider {
    accounts: RwLock<HashMap<String, Account>>,
    events: RwLock<Vec<ProviderEvent>>,
    available: AtomicBool,
}

impl Default for InMemoryIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Seed an account directly, bypassing `create_user`.
    pub async fn insert_account(
        &self,
        login_email: &str,
        name: PersonName,
        claims: Option<OrganizationRoleClaims>,
    ) {
        self.accounts.write().await.insert(
            normalize_login(login_email),
            Account {
                name,
                status: UserStatus::Active,
                is_site_admin: false,
                claims,
            },
        );
    }

    pub async fn set_site_admin(&self, login_email: &str, is_site_admin: bool) {
        if let Some(account) = self.accounts.write().await.get_mut(&normalize_login(login_email)) {
            account.is_site_admin = is_site_admin;
        }
    }

    /// Overwrite the claims of an existing account.
    pub async fn set_claims(&self, login_email: &str, claims: Option<OrganizationRoleClaims>) {
        if let Some(account) = self.accounts.write().await.get_mut(&normalize_login(login_email)) {
            account.claims = claims;
        }
    }

    pub async fn events(&self) -> Vec<ProviderEvent> {
        self.events.read().await.clone()
    }

    pub async fn display_name(&self, login_email: &str) -> Option<PersonName> {
        self.accounts
            .read()
            .await
            .get(&normalize_login(login_email))
            .map(|a| a.name.clone())
    }

    fn check_available(&self) -> Result<(), ProviderError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ProviderError::Unavailable("identity provider is offline".to_string()))
        }
    }

    async fn record(&self, event: ProviderEvent) {
        debug!("Identity provider event: {:?}", event);
        self.events.write().await.push(event);
    }

    async fn with_account<T>(
        &self,
        login_email: &str,
        f: impl FnOnce(&mut Account) -> T,
    ) -> Result<T, ProviderError> {
        self.check_available()?;
        let login = normalize_login(login_email);
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(&login)
            .ok_or(ProviderError::UserNotFound(login))?;
        Ok(f(account))
    }
}

fn claims_for(
    organization: &OrganizationRecord,
    facility_ids: &BTreeSet<FacilityId>,
    roles: &BTreeSet<OrganizationRole>,
) -> OrganizationRoleClaims {
    OrganizationRoleClaims {
        organization_external_id: organization.external_id.clone(),
        granted_roles: roles.clone(),
        facility_ids: facility_ids.clone(),
    }
}

#[async_trait]
impl IdentityProviderClient for InMemoryIdentityProvider {
    async fn find_user(&self, login_email: &str) -> Result<PartialExternalUser, ProviderError> {
        let login = normalize_login(login_email);
        self.with_account(&login, |account| PartialExternalUser {
            login_email: login.clone(),
            status: Some(account.status),
            is_site_admin: account.is_site_admin,
            org_role_claims: account.claims.clone(),
        })
        .await
    }

    async fn create_user(
        &self,
        attributes: &IdentityAttributes,
        organization: &OrganizationRecord,
        facility_ids: &BTreeSet<FacilityId>,
        roles: &BTreeSet<OrganizationRole>,
        active: bool,
    ) -> Result<Option<OrganizationRoleClaims>, ProviderError> {
        self.check_available()?;
        let claims = claims_for(organization, facility_ids, roles);
        let status = if active {
            UserStatus::Active
        } else {
            UserStatus::Provisioned
        };

        self.accounts.write().await.insert(
            normalize_login(&attributes.username),
            Account {
                name: attributes.name.clone(),
                status,
                is_site_admin: false,
                claims: Some(claims.clone()),
            },
        );

        Ok(Some(claims))
    }

    async fn update_user(&self, attributes: &IdentityAttributes) -> Result<(), ProviderError> {
        let name = attributes.name.clone();
        self.with_account(&attributes.username, |account| account.name = name)
            .await
    }

    async fn update_user_email(
        &self,
        attributes: &IdentityAttributes,
        new_email: &str,
    ) -> Result<(), ProviderError> {
        self.check_available()?;
        let old = normalize_login(&attributes.username);
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .remove(&old)
            .ok_or(ProviderError::UserNotFound(old))?;
        accounts.insert(normalize_login(new_email), account);
        Ok(())
    }

    async fn update_user_privileges(
        &self,
        login_email: &str,
        organization: &OrganizationRecord,
        facility_ids: &BTreeSet<FacilityId>,
        roles: &BTreeSet<OrganizationRole>,
    ) -> Result<Option<OrganizationRoleClaims>, ProviderError> {
        let claims = claims_for(organization, facility_ids, roles);
        let stored = claims.clone();
        self.with_account(login_email, |account| account.claims = Some(stored))
            .await?;
        Ok(Some(claims))
    }

    async fn reprovision_user(&self, attributes: &IdentityAttributes) -> Result<(), ProviderError> {
        let name = attributes.name.clone();
        self.with_account(&attributes.username, |account| {
            account.name = name;
            account.status = UserStatus::Provisioned;
        })
        .await?;
        self.record(ProviderEvent::Reprovisioned(normalize_login(&attributes.username)))
            .await;
        Ok(())
    }

    async fn reset_password(&self, login_email: &str) -> Result<(), ProviderError> {
        self.with_account(login_email, |_| ()).await?;
        self.record(ProviderEvent::PasswordReset(normalize_login(login_email)))
            .await;
        Ok(())
    }

    async fn reset_mfa(&self, login_email: &str) -> Result<(), ProviderError> {
        self.with_account(login_email, |_| ()).await?;
        self.record(ProviderEvent::MfaReset(normalize_login(login_email)))
            .await;
        Ok(())
    }

    async fn set_active(&self, login_email: &str, active: bool) -> Result<(), ProviderError> {
        self.with_account(login_email, |account| {
            account.status = if active {
                UserStatus::Active
            } else {
                UserStatus::Suspended
            };
        })
        .await
    }

    async fn resend_activation_email(&self, login_email: &str) -> Result<(), ProviderError> {
        self.with_account(login_email, |_| ()).await?;
        self.record(ProviderEvent::ActivationEmail(normalize_login(login_email)))
            .await;
        Ok(())
    }

    async fn list_users_for_organization(
        &self,
        organization_external_id: &str,
    ) -> Result<BTreeSet<String>, ProviderError> {
        Ok(self
            .list_users_with_status(organization_external_id)
            .await?
            .into_keys()
            .collect())
    }

    async fn list_users_with_status(
        &self,
        organization_external_id: &str,
    ) -> Result<BTreeMap<String, UserStatus>, ProviderError> {
        self.check_available()?;
        let accounts = self.accounts.read().await;
        Ok(accounts
            .iter()
            .filter(|(_, account)| {
                account
                    .claims
                    .as_ref()
                    .is_some_and(|c| c.organization_external_id == organization_external_id)
            })
            .map(|(login, account)| (login.clone(), account.status))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrganizationId;

    fn org(external_id: &str) -> OrganizationRecord {
        OrganizationRecord {
            internal_id: OrganizationId::new(format!("id-{}", external_id)),
            external_id: external_id.to_string(),
            name: external_id.to_string(),
            identity_verified: true,
        }
    }

    fn user_roles() -> BTreeSet<OrganizationRole> {
        [OrganizationRole::NoAccess, OrganizationRole::User].into()
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let idp = InMemoryIdentityProvider::new();
        let facilities = BTreeSet::from([FacilityId::new("f1")]);

        let claims = idp
            .create_user(
                &IdentityAttributes::new("New@Example.com", PersonName::new("New", "User")),
                &org("org-a"),
                &facilities,
                &user_roles(),
                false,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claims.organization_external_id, "org-a");

        let found = idp.find_user("new@example.com").await.unwrap();
        assert_eq!(found.status, Some(UserStatus::Provisioned));
        assert_eq!(found.org_role_claims, Some(claims));
        assert!(!found.is_site_admin);
    }

    #[tokio::test]
    async fn test_unknown_user_is_not_an_outage() {
        let idp = InMemoryIdentityProvider::new();
        let err = idp.find_user("nobody@example.com").await.unwrap_err();
        assert_eq!(err, ProviderError::UserNotFound("nobody@example.com".to_string()));
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let idp = InMemoryIdentityProvider::new();
        idp.insert_account("a@example.com", PersonName::new("A", "A"), None)
            .await;
        idp.set_available(false);

        assert!(matches!(
            idp.find_user("a@example.com").await,
            Err(ProviderError::Unavailable(_))
        ));
        assert!(matches!(
            idp.list_users_for_organization("org-a").await,
            Err(ProviderError::Unavailable(_))
        ));

        idp.set_available(true);
        assert!(idp.find_user("a@example.com").await.is_ok());
    }

    #[tokio::test]
    async fn test_roster_and_status() {
        let idp = InMemoryIdentityProvider::new();
        let claims = claims_for(&org("org-a"), &BTreeSet::new(), &user_roles());
        idp.insert_account("a@example.com", PersonName::new("A", "A"), Some(claims.clone()))
            .await;
        idp.insert_account("b@example.com", PersonName::new("B", "B"), Some(claims))
            .await;
        idp.insert_account("c@example.com", PersonName::new("C", "C"), None)
            .await;

        idp.set_active("b@example.com", false).await.unwrap();

        let roster = idp.list_users_for_organization("org-a").await.unwrap();
        assert_eq!(
            roster,
            BTreeSet::from(["a@example.com".to_string(), "b@example.com".to_string()])
        );

        let statuses = idp.list_users_with_status("org-a").await.unwrap();
        assert_eq!(statuses["b@example.com"], UserStatus::Suspended);
        assert_eq!(statuses["a@example.com"], UserStatus::Active);
    }

    #[tokio::test]
    async fn test_side_effects_are_recorded() {
        let idp = InMemoryIdentityProvider::new();
        idp.insert_account("a@example.com", PersonName::new("A", "A"), None)
            .await;

        idp.reset_password("a@example.com").await.unwrap();
        idp.reset_mfa("A@example.com").await.unwrap();

        assert_eq!(
            idp.events().await,
            vec![
                ProviderEvent::PasswordReset("a@example.com".to_string()),
                ProviderEvent::MfaReset("a@example.com".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_email_change_moves_account() {
        let idp = InMemoryIdentityProvider::new();
        idp.insert_account("old@example.com", PersonName::new("A", "A"), None)
            .await;

        idp.update_user_email(
            &IdentityAttributes::new("old@example.com", PersonName::new("A", "A")),
            "new@example.com",
        )
        .await
        .unwrap();

        assert!(idp.find_user("old@example.com").await.is_err());
        assert!(idp.find_user("new@example.com").await.is_ok());
    }
}
