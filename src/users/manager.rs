//! User lifecycle: provisioning, updates, archival and provider side effects.

use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::access::{ComputedGrant, ConsolidatedAccess, GrantCalculator, Reconciler, Role};
use crate::db::{
    AuditAction, AuditLogCreate, Db, OrganizationRecord, PersonName, QueryBuilder, UserCreate,
    UserRecord,
};
use crate::error::{IdentityError, IdentityResult, ProviderError};
use crate::identity::{SystemIdentity, UserStore};
use crate::idp::{IdentityAttributes, IdentityProviderClient, PartialExternalUser, UserStatus};
use crate::migration::{AuthoritySource, MigrationPhase};
use crate::types::{FacilityId, UserId};
use crate::users::directory::{search_users, DirectoryPage, UserWithStatus};

/// Requested account for a new or reclaimed identity.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub login_email: String,
    pub name: PersonName,
    pub role: Role,
    pub access_all_facilities: bool,
    pub facility_ids: BTreeSet<FacilityId>,
}

/// Requested privileges within an organization.
#[derive(Debug, Clone)]
pub struct PrivilegeRequest {
    pub role: Role,
    pub access_all_facilities: bool,
    pub facility_ids: BTreeSet<FacilityId>,
}

/// Orchestrates identity lifecycle operations across the store and the
/// identity provider.
///
/// Every mutation validates first, calls the provider, then persists with a
/// single store write. The migration phase is read once per call.
pub struct UserManager {
    db: Db,
    store: UserStore,
    grants: GrantCalculator,
    reconciler: Reconciler,
    provider: Arc<dyn IdentityProviderClient>,
    migration: Arc<dyn MigrationPhase>,
}

impl UserManager {
    pub fn new(
        db: Db,
        provider: Arc<dyn IdentityProviderClient>,
        migration: Arc<dyn MigrationPhase>,
    ) -> Self {
        Self {
            store: UserStore::new(db.clone()),
            grants: GrantCalculator::new(db.clone()),
            reconciler: Reconciler::new(db.clone()),
            db,
            provider,
            migration,
        }
    }

    pub fn store(&self) -> &UserStore {
        &self.store
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Create a user, or reclaim an archived identity holding the same login.
    pub async fn provision_user(
        &self,
        actor: &UserRecord,
        organization_external_id: &str,
        request: &NewUser,
    ) -> IdentityResult<ConsolidatedAccess> {
        if self
            .store
            .find_by_login_include_archived(&request.login_email)
            .await?
            .is_some()
        {
            self.reprovision_user(actor, organization_external_id, request).await
        } else {
            self.create_user(actor, organization_external_id, request).await
        }
    }

    /// Create a new identity with a provider account and a grant.
    pub async fn create_user(
        &self,
        actor: &UserRecord,
        organization_external_id: &str,
        request: &NewUser,
    ) -> IdentityResult<ConsolidatedAccess> {
        if self.store.find_by_login(&request.login_email).await?.is_some() {
            return Err(IdentityError::ConflictingUser);
        }

        let organization = self.organization(organization_external_id).await?;
        let grant = self
            .grants
            .compute_grants(
                request.role,
                request.access_all_facilities,
                &request.facility_ids,
                &organization,
            )
            .await?;

        let attributes = IdentityAttributes::new(&request.login_email, request.name.clone());
        let active = organization.identity_verified;
        let claims = self
            .provider
            .create_user(
                &attributes,
                &organization,
                &grant.facility_ids(),
                &grant.roles,
                active,
            )
            .await?;

        let user = self
            .store
            .create_user(&UserCreate {
                login_email: request.login_email.clone(),
                name: request.name.clone(),
                grant: Some(grant.to_stored_grant()),
                seen_now: false,
            })
            .await?;

        self.record_audit(
            actor,
            &user.internal_id,
            AuditAction::UserCreated,
            Some(grant_details(&grant)),
        )
        .await;

        let external = PartialExternalUser {
            login_email: user.login_email.clone(),
            status: Some(if active {
                UserStatus::Active
            } else {
                UserStatus::Provisioned
            }),
            is_site_admin: false,
            org_role_claims: claims,
        };

        self.reconciler
            .consolidate(&user, Some(&external), self.migration.authority())
            .await
    }

    /// Reclaim an archived identity for a new registration.
    ///
    /// Legal only when the identity is archived and its last known
    /// organization is the target organization.
    pub async fn reprovision_user(
        &self,
        actor: &UserRecord,
        organization_external_id: &str,
        request: &NewUser,
    ) -> IdentityResult<ConsolidatedAccess> {
        let source = self.migration.authority();
        let existing = self
            .store
            .find_by_login_include_archived(&request.login_email)
            .await?
            .ok_or(IdentityError::NonexistentUser)?;

        if !existing.is_deleted {
            return Err(IdentityError::ConflictingUser);
        }

        let organization = self.organization(organization_external_id).await?;
        let last_organization = self.last_known_organization(&existing, source).await?;
        if last_organization.as_ref().map(|o| &o.internal_id) != Some(&organization.internal_id) {
            return Err(IdentityError::ConflictingUser);
        }

        let grant = self
            .grants
            .compute_grants(
                request.role,
                request.access_all_facilities,
                &request.facility_ids,
                &organization,
            )
            .await?;

        let attributes = IdentityAttributes::new(&existing.login_email, request.name.clone());
        self.provider.reprovision_user(&attributes).await?;
        self.provider
            .update_user_privileges(
                &existing.login_email,
                &organization,
                &grant.facility_ids(),
                &grant.roles,
            )
            .await?;

        let user = self
            .store
            .reprovision(&existing.internal_id, &request.name, &grant.to_stored_grant())
            .await?;

        self.record_audit(
            actor,
            &user.internal_id,
            AuditAction::UserReprovisioned,
            Some(grant_details(&grant)),
        )
        .await;

        self.consolidate_with(&user, source).await
    }

    /// Create a bare identity with no provider account and no grant.
    pub async fn create_user_without_provider(
        &self,
        actor: &UserRecord,
        login_email: &str,
        name: &PersonName,
    ) -> IdentityResult<UserRecord> {
        if self.store.find_by_login_include_archived(login_email).await?.is_some() {
            return Err(IdentityError::InvalidArgument("User already exists".to_string()));
        }

        let user = self
            .store
            .create_user(&UserCreate {
                login_email: login_email.to_string(),
                name: name.clone(),
                grant: None,
                seen_now: false,
            })
            .await?;

        self.record_audit(actor, &user.internal_id, AuditAction::UserCreated, None)
            .await;
        Ok(user)
    }

    pub async fn update_user(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
        name: &PersonName,
    ) -> IdentityResult<ConsolidatedAccess> {
        let user = self.active_user(user_id).await?;

        self.provider
            .update_user(&IdentityAttributes::new(&user.login_email, name.clone()))
            .await?;
        let user = self.store.update_name(&user.internal_id, name).await?;

        self.record_audit(actor, &user.internal_id, AuditAction::UserUpdated, None)
            .await;
        self.consolidate(&user).await
    }

    /// Change the login email. Any identity holding the new email, archived
    /// or not, blocks the change.
    pub async fn update_user_email(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
        new_email: &str,
    ) -> IdentityResult<ConsolidatedAccess> {
        let user = self.active_user(user_id).await?;

        if self.store.find_by_login_include_archived(new_email).await?.is_some() {
            return Err(IdentityError::ConflictingUser);
        }

        self.provider
            .update_user_email(
                &IdentityAttributes::new(&user.login_email, user.name.clone()),
                new_email,
            )
            .await?;
        let updated = self.store.update_login(&user.internal_id, new_email).await?;

        self.record_audit(
            actor,
            &updated.internal_id,
            AuditAction::UserEmailChanged,
            Some(json!({ "from": user.login_email, "to": updated.login_email })),
        )
        .await;
        self.consolidate(&updated).await
    }

    /// Replace the user's grant within their current organization.
    pub async fn update_user_privileges(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
        request: &PrivilegeRequest,
    ) -> IdentityResult<ConsolidatedAccess> {
        let source = self.migration.authority();
        let user = self.active_user(user_id).await?;
        reject_system_identity(&user)?;
        let organization = self
            .last_known_organization(&user, source)
            .await?
            .ok_or_else(|| IdentityError::MisconfiguredUser(user.login_email.clone()))?;

        self.apply_privileges(actor, &user, &organization, request, source)
            .await
    }

    /// Move a user into another organization with new privileges.
    pub async fn update_privileges_and_organization(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
        organization_external_id: &str,
        request: &PrivilegeRequest,
    ) -> IdentityResult<ConsolidatedAccess> {
        let source = self.migration.authority();
        let user = self.active_user(user_id).await?;
        reject_system_identity(&user)?;
        let organization = self.organization(organization_external_id).await?;

        self.apply_privileges(actor, &user, &organization, request, source)
            .await
    }

    async fn apply_privileges(
        &self,
        actor: &UserRecord,
        user: &UserRecord,
        organization: &OrganizationRecord,
        request: &PrivilegeRequest,
        source: AuthoritySource,
    ) -> IdentityResult<ConsolidatedAccess> {
        let grant = self
            .grants
            .compute_grants(
                request.role,
                request.access_all_facilities,
                &request.facility_ids,
                organization,
            )
            .await?;

        self.provider
            .update_user_privileges(
                &user.login_email,
                organization,
                &grant.facility_ids(),
                &grant.roles,
            )
            .await?;
        let user = self
            .store
            .save_grant(&user.internal_id, Some(&grant.to_stored_grant()))
            .await?;

        self.record_audit(
            actor,
            &user.internal_id,
            AuditAction::PrivilegesUpdated,
            Some(grant_details(&grant)),
        )
        .await;

        self.consolidate_with(&user, source).await
    }

    /// Archive or restore an identity. Restoring also resets the password.
    pub async fn set_is_deleted(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
        deleted: bool,
    ) -> IdentityResult<UserRecord> {
        let user = self
            .store
            .find_by_id_include_archived(user_id)
            .await?
            .ok_or(IdentityError::NonexistentUser)?;

        if !deleted {
            if let Some(holder) = self.store.find_by_login(&user.login_email).await? {
                if holder.internal_id != user.internal_id {
                    return Err(IdentityError::ConflictingUser);
                }
            }
        }

        self.provider.set_active(&user.login_email, !deleted).await?;
        if !deleted {
            self.provider.reset_password(&user.login_email).await?;
        }

        let user = self.store.set_deleted(&user.internal_id, deleted).await?;

        let action = if deleted {
            AuditAction::UserArchived
        } else {
            AuditAction::UserRestored
        };
        self.record_audit(actor, &user.internal_id, action, None).await;
        Ok(user)
    }

    pub async fn reset_password(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
    ) -> IdentityResult<ConsolidatedAccess> {
        let user = self.active_user(user_id).await?;
        self.provider.reset_password(&user.login_email).await?;
        info!(
            "Password reset for user with id={} requested by user with id={}",
            user.internal_id, actor.internal_id
        );
        self.consolidate_with_claims(&user).await
    }

    pub async fn reset_mfa(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
    ) -> IdentityResult<ConsolidatedAccess> {
        let user = self.active_user(user_id).await?;
        self.provider.reset_mfa(&user.login_email).await?;
        info!(
            "MFA reset for user with id={} requested by user with id={}",
            user.internal_id, actor.internal_id
        );
        self.consolidate_with_claims(&user).await
    }

    /// Reactivate a suspended provider account and reset its password.
    pub async fn reactivate_user(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
    ) -> IdentityResult<ConsolidatedAccess> {
        let user = self.active_user(user_id).await?;
        self.provider.set_active(&user.login_email, true).await?;
        self.provider.reset_password(&user.login_email).await?;
        self.record_audit(actor, &user.internal_id, AuditAction::UserReactivated, None)
            .await;
        self.consolidate_with_claims(&user).await
    }

    pub async fn resend_activation_email(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
    ) -> IdentityResult<ConsolidatedAccess> {
        let user = self.active_user(user_id).await?;
        self.provider.resend_activation_email(&user.login_email).await?;
        info!(
            "Activation email resent for user with id={} by user with id={}",
            user.internal_id, actor.internal_id
        );
        self.consolidate_with_claims(&user).await
    }

    /// Drop the stored grant, leaving the identity without organization roles.
    pub async fn clear_roles_and_facilities(
        &self,
        actor: &UserRecord,
        user_id: &UserId,
    ) -> IdentityResult<UserRecord> {
        let user = self.active_user(user_id).await?;
        let user = self.store.save_grant(&user.internal_id, None).await?;
        self.record_audit(actor, &user.internal_id, AuditAction::RolesCleared, None)
            .await;
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &UserId) -> IdentityResult<ConsolidatedAccess> {
        let user = self.active_user(user_id).await?;
        self.consolidate(&user).await
    }

    /// Look up a user by login. Site administrators are not exposed here.
    pub async fn get_user_by_login_email(&self, login_email: &str) -> IdentityResult<ConsolidatedAccess> {
        let user = self
            .store
            .find_by_login(login_email)
            .await?
            .ok_or(IdentityError::NonexistentUser)?;

        let external = self.fetch_external(&user.login_email).await?;
        if external.as_ref().is_some_and(|e| e.is_site_admin) {
            return Err(IdentityError::RestrictedAccessUser);
        }

        self.reconciler
            .consolidate(&user, external.as_ref(), self.migration.authority())
            .await
    }

    /// Access summary for the resolved caller.
    pub async fn current_user_info(&self, current: &UserRecord) -> IdentityResult<ConsolidatedAccess> {
        self.consolidate(current).await
    }

    /// Whether any identity, archived or not, holds the login.
    pub async fn user_exists(&self, login_email: &str) -> IdentityResult<bool> {
        Ok(self
            .store
            .find_by_login_include_archived(login_email)
            .await?
            .is_some())
    }

    /// Active members of an organization, ordered by name.
    ///
    /// Membership comes from stored grants once migrated, and from the
    /// provider roster before that.
    pub async fn users_in_organization(&self, organization_external_id: &str) -> IdentityResult<Vec<UserRecord>> {
        let organization = self.organization(organization_external_id).await?;

        let users = match self.migration.authority() {
            AuthoritySource::InternalStore => {
                self.store.find_by_organization(&organization.internal_id).await?
            }
            AuthoritySource::ExternalProvider => {
                let logins = self
                    .provider
                    .list_users_for_organization(&organization.external_id)
                    .await?;
                self.store.find_by_logins(&logins).await?
            }
        };

        Ok(users
            .into_iter()
            .filter(|u| !SystemIdentity::is_system_login(&u.login_email))
            .collect())
    }

    /// Organization members with their provider account status.
    pub async fn users_with_status(&self, organization_external_id: &str) -> IdentityResult<Vec<UserWithStatus>> {
        let users = self.users_in_organization(organization_external_id).await?;
        let statuses = self
            .provider
            .list_users_with_status(organization_external_id)
            .await?;

        Ok(users
            .into_iter()
            .map(|user| {
                let status = statuses.get(&user.login_email).copied();
                UserWithStatus { user, status }
            })
            .collect())
    }

    /// Every identity whose stored grant targets the organization, archived
    /// included.
    pub async fn all_users_by_organization(&self, organization_external_id: &str) -> IdentityResult<Vec<UserRecord>> {
        let organization = self.organization(organization_external_id).await?;
        Ok(self
            .store
            .find_by_organization_include_archived(&organization.internal_id)
            .await?)
    }

    /// Filtered, paged directory of an organization.
    pub async fn search_directory(
        &self,
        organization_external_id: &str,
        page: usize,
        page_size: usize,
        query: Option<&str>,
    ) -> IdentityResult<DirectoryPage> {
        let roster = self.users_with_status(organization_external_id).await?;
        search_users(roster, page, page_size, query)
    }

    /// Actor for operations without an identified caller.
    pub async fn anonymous_user(&self) -> IdentityResult<UserRecord> {
        Ok(self
            .store
            .get_or_create_system_user(SystemIdentity::Anonymous)
            .await?)
    }

    async fn organization(&self, external_id: &str) -> IdentityResult<OrganizationRecord> {
        QueryBuilder::find_organization_by_external_id(&self.db, external_id)
            .await?
            .ok_or_else(|| IdentityError::NonexistentOrganization(external_id.to_string()))
    }

    async fn active_user(&self, user_id: &UserId) -> IdentityResult<UserRecord> {
        self.store
            .find_by_id(user_id)
            .await?
            .ok_or(IdentityError::NonexistentUser)
    }

    /// Organization the user last belonged to, per the authoritative source.
    async fn last_known_organization(
        &self,
        user: &UserRecord,
        source: AuthoritySource,
    ) -> IdentityResult<Option<OrganizationRecord>> {
        match source {
            AuthoritySource::InternalStore => match &user.grant {
                Some(grant) => {
                    Ok(QueryBuilder::find_organization_by_id(&self.db, &grant.organization_id).await?)
                }
                None => Ok(None),
            },
            AuthoritySource::ExternalProvider => {
                let claims = self
                    .fetch_external(&user.login_email)
                    .await?
                    .and_then(|e| e.org_role_claims);
                match claims {
                    Some(claims) => Ok(QueryBuilder::find_organization_by_external_id(
                        &self.db,
                        &claims.organization_external_id,
                    )
                    .await?),
                    None => Ok(None),
                }
            }
        }
    }

    /// Provider view of a login. An unknown login is `None`, not an error.
    async fn fetch_external(&self, login_email: &str) -> IdentityResult<Option<PartialExternalUser>> {
        match self.provider.find_user(login_email).await {
            Ok(user) => Ok(Some(user)),
            Err(ProviderError::UserNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn consolidate(&self, user: &UserRecord) -> IdentityResult<ConsolidatedAccess> {
        self.consolidate_with(user, self.migration.authority()).await
    }

    async fn consolidate_with(
        &self,
        user: &UserRecord,
        source: AuthoritySource,
    ) -> IdentityResult<ConsolidatedAccess> {
        let external = self.fetch_external(&user.login_email).await?;
        self.reconciler
            .consolidate(user, external.as_ref(), source)
            .await
    }

    /// Consolidate after a provider side effect; the provider must hold
    /// claims for the user.
    async fn consolidate_with_claims(&self, user: &UserRecord) -> IdentityResult<ConsolidatedAccess> {
        let external = self
            .fetch_external(&user.login_email)
            .await?
            .filter(|e| e.org_role_claims.is_some())
            .ok_or_else(|| IdentityError::MisconfiguredUser(user.login_email.clone()))?;

        self.reconciler
            .consolidate(user, Some(&external), self.migration.authority())
            .await
    }

    /// Write an audit entry. Failures are logged and swallowed.
    async fn record_audit(
        &self,
        actor: &UserRecord,
        subject: &UserId,
        action: AuditAction,
        details: Option<serde_json::Value>,
    ) {
        info!(
            "User with id={} {} by user with id={}",
            subject,
            action.as_str(),
            actor.internal_id
        );

        let mut entry = AuditLogCreate::new(&actor.internal_id, subject, action);
        if let Some(details) = details {
            entry = entry.with_details(details);
        }

        if let Err(e) = self.store.audit_log(entry).await {
            warn!("Failed to write audit entry for user {}: {}", subject, e);
        }
    }
}

fn grant_details(grant: &ComputedGrant) -> serde_json::Value {
    json!({
        "organization": grant.organization.external_id,
        "roles": grant.roles,
        "facilities": grant.facility_ids(),
    })
}

/// System identities never hold organization grants.
fn reject_system_identity(user: &UserRecord) -> IdentityResult<()> {
    if SystemIdentity::is_system_login(&user.login_email) {
        return Err(IdentityError::RestrictedAccessUser);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::OrganizationRole;
    use crate::db::{create_connection, ensure_schema, DatabaseConfig, FacilityRecord, OrganizationCreate};
    use crate::idp::{InMemoryIdentityProvider, ProviderEvent};
    use crate::migration::MigrationFlag;

    struct Fixture {
        manager: UserManager,
        idp: Arc<InMemoryIdentityProvider>,
        flag: Arc<MigrationFlag>,
        db: Db,
        org: OrganizationRecord,
        f1: FacilityRecord,
        f2: FacilityRecord,
        actor: UserRecord,
    }

    async fn setup() -> Fixture {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();

        let org = create_org(&db, "org-o").await;
        let f1 = QueryBuilder::create_facility(&db, &org.internal_id, "F1").await.unwrap();
        let f2 = QueryBuilder::create_facility(&db, &org.internal_id, "F2").await.unwrap();

        let idp = Arc::new(InMemoryIdentityProvider::new());
        let flag = Arc::new(MigrationFlag::new(false));
        let manager = UserManager::new(db.clone(), idp.clone(), flag.clone());
        let actor = manager.anonymous_user().await.unwrap();

        Fixture {
            manager,
            idp,
            flag,
            db,
            org,
            f1,
            f2,
            actor,
        }
    }

    async fn create_org(db: &Db, external_id: &str) -> OrganizationRecord {
        QueryBuilder::create_organization(
            db,
            &OrganizationCreate {
                external_id: external_id.to_string(),
                name: external_id.to_string(),
                identity_verified: true,
            },
        )
        .await
        .unwrap()
    }

    fn new_user(login: &str, facilities: &[&FacilityRecord]) -> NewUser {
        NewUser {
            login_email: login.to_string(),
            name: PersonName::new("Test", "User"),
            role: Role::User,
            access_all_facilities: false,
            facility_ids: facilities.iter().map(|f| f.internal_id.clone()).collect(),
        }
    }

    #[tokio::test]
    async fn test_create_user_grants_and_audits() {
        let fx = setup().await;

        let access = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("new@example.com", &[&fx.f1, &fx.f2]))
            .await
            .unwrap();

        let roles = access.roles.unwrap();
        assert_eq!(
            roles.granted_roles,
            BTreeSet::from([OrganizationRole::NoAccess, OrganizationRole::User])
        );
        assert_eq!(roles.facilities.len(), 2);
        assert_eq!(access.status, Some(UserStatus::Active));

        let logs = fx
            .manager
            .store()
            .get_audit_log_for_subject(&access.user.internal_id, 10)
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "user_created");
        assert_eq!(logs[0].actor_id, fx.actor.internal_id.as_str());
    }

    #[tokio::test]
    async fn test_create_rejects_active_duplicate() {
        let fx = setup().await;
        let request = new_user("dup@example.com", &[&fx.f1]);
        fx.manager.create_user(&fx.actor, "org-o", &request).await.unwrap();

        let mut again = request.clone();
        again.login_email = " DUP@example.com ".to_string();
        let err = fx.manager.create_user(&fx.actor, "org-o", &again).await.unwrap_err();
        assert_eq!(err, IdentityError::ConflictingUser);
    }

    #[tokio::test]
    async fn test_invalid_grant_aborts_before_persistence() {
        let fx = setup().await;

        let err = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("none@example.com", &[]))
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::FacilityAccessRequired);

        assert!(!fx.manager.user_exists("none@example.com").await.unwrap());
        assert!(fx.idp.find_user("none@example.com").await.is_err());
    }

    #[tokio::test]
    async fn test_reprovision_same_organization() {
        let fx = setup().await;
        let created = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("back@example.com", &[&fx.f1]))
            .await
            .unwrap();
        fx.manager
            .set_is_deleted(&fx.actor, &created.user.internal_id, true)
            .await
            .unwrap();

        let mut request = new_user("back@example.com", &[&fx.f2]);
        request.name = PersonName::new("Returning", "User");
        let access = fx
            .manager
            .provision_user(&fx.actor, "org-o", &request)
            .await
            .unwrap();

        assert_eq!(access.user.internal_id, created.user.internal_id);
        assert!(!access.user.is_deleted);
        assert_eq!(access.user.name.first_name, "Returning");
        assert_eq!(access.roles.unwrap().facilities, vec![fx.f2.clone()]);
        assert!(fx
            .idp
            .events()
            .await
            .contains(&ProviderEvent::Reprovisioned("back@example.com".to_string())));
    }

    #[tokio::test]
    async fn test_reprovision_other_organization_conflicts() {
        let fx = setup().await;
        let other = create_org(&fx.db, "org-other").await;
        let other_facility = QueryBuilder::create_facility(&fx.db, &other.internal_id, "Elsewhere")
            .await
            .unwrap();

        let created = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("mover@example.com", &[&fx.f1]))
            .await
            .unwrap();
        fx.manager
            .set_is_deleted(&fx.actor, &created.user.internal_id, true)
            .await
            .unwrap();

        for migrated in [false, true] {
            fx.flag.set_migrated(migrated);
            let err = fx
                .manager
                .reprovision_user(
                    &fx.actor,
                    "org-other",
                    &new_user("mover@example.com", &[&other_facility]),
                )
                .await
                .unwrap_err();
            assert_eq!(err, IdentityError::ConflictingUser);
        }
    }

    #[tokio::test]
    async fn test_reprovision_active_user_conflicts() {
        let fx = setup().await;
        let request = new_user("active@example.com", &[&fx.f1]);
        fx.manager.create_user(&fx.actor, "org-o", &request).await.unwrap();

        let err = fx
            .manager
            .provision_user(&fx.actor, "org-o", &request)
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::ConflictingUser);
    }

    #[tokio::test]
    async fn test_email_change_conflicts_with_archived_holder() {
        let fx = setup().await;
        let archived = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("taken@example.com", &[&fx.f1]))
            .await
            .unwrap();
        fx.manager
            .set_is_deleted(&fx.actor, &archived.user.internal_id, true)
            .await
            .unwrap();

        let user = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("mine@example.com", &[&fx.f1]))
            .await
            .unwrap();

        let err = fx
            .manager
            .update_user_email(&fx.actor, &user.user.internal_id, "taken@example.com")
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::ConflictingUser);

        let moved = fx
            .manager
            .update_user_email(&fx.actor, &user.user.internal_id, "Fresh@Example.com")
            .await
            .unwrap();
        assert_eq!(moved.user.login_email, "fresh@example.com");
    }

    #[tokio::test]
    async fn test_restore_resets_password() {
        let fx = setup().await;
        let created = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("sleepy@example.com", &[&fx.f1]))
            .await
            .unwrap();
        let id = created.user.internal_id.clone();

        let archived = fx.manager.set_is_deleted(&fx.actor, &id, true).await.unwrap();
        assert!(archived.is_deleted);
        assert_eq!(
            fx.idp.find_user("sleepy@example.com").await.unwrap().status,
            Some(UserStatus::Suspended)
        );

        let restored = fx.manager.set_is_deleted(&fx.actor, &id, false).await.unwrap();
        assert!(!restored.is_deleted);
        assert!(fx
            .idp
            .events()
            .await
            .contains(&ProviderEvent::PasswordReset("sleepy@example.com".to_string())));
    }

    #[tokio::test]
    async fn test_restore_rejected_when_login_was_reclaimed() {
        let fx = setup().await;
        let first = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("dup@example.com", &[&fx.f1]))
            .await
            .unwrap();
        fx.manager
            .set_is_deleted(&fx.actor, &first.user.internal_id, true)
            .await
            .unwrap();

        let second = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("dup@example.com", &[&fx.f2]))
            .await
            .unwrap();

        let err = fx
            .manager
            .set_is_deleted(&fx.actor, &first.user.internal_id, false)
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::ConflictingUser);

        let holder = fx
            .manager
            .store()
            .find_by_login("dup@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(holder.internal_id, second.user.internal_id);
        assert!(!fx
            .idp
            .events()
            .await
            .contains(&ProviderEvent::PasswordReset("dup@example.com".to_string())));
    }

    #[tokio::test]
    async fn test_reactivate_resets_password() {
        let fx = setup().await;
        let created = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("woken@example.com", &[&fx.f1]))
            .await
            .unwrap();
        fx.idp.set_active("woken@example.com", false).await.unwrap();

        let access = fx
            .manager
            .reactivate_user(&fx.actor, &created.user.internal_id)
            .await
            .unwrap();
        assert_eq!(access.status, Some(UserStatus::Active));
        assert!(fx
            .idp
            .events()
            .await
            .contains(&ProviderEvent::PasswordReset("woken@example.com".to_string())));
    }

    #[tokio::test]
    async fn test_system_identity_cannot_receive_grant() {
        let fx = setup().await;
        let request = PrivilegeRequest {
            role: Role::Admin,
            access_all_facilities: false,
            facility_ids: BTreeSet::new(),
        };

        let err = fx
            .manager
            .update_user_privileges(&fx.actor, &fx.actor.internal_id, &request)
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::RestrictedAccessUser);

        let err = fx
            .manager
            .update_privileges_and_organization(&fx.actor, &fx.actor.internal_id, "org-o", &request)
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::RestrictedAccessUser);

        let stored = fx
            .manager
            .store()
            .find_by_id(&fx.actor.internal_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.grant.is_none());
    }

    #[tokio::test]
    async fn test_provider_outage_is_surfaced() {
        let fx = setup().await;
        fx.idp.set_available(false);

        let err = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("down@example.com", &[&fx.f1]))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::ProviderUnavailable(_)));
        assert!(err.is_transient());
        assert!(!fx.manager.user_exists("down@example.com").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_privileges_within_current_organization() {
        let fx = setup().await;
        let created = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("priv@example.com", &[&fx.f1]))
            .await
            .unwrap();

        let access = fx
            .manager
            .update_user_privileges(
                &fx.actor,
                &created.user.internal_id,
                &PrivilegeRequest {
                    role: Role::EntryOnly,
                    access_all_facilities: true,
                    facility_ids: BTreeSet::from([fx.f1.internal_id.clone()]),
                },
            )
            .await
            .unwrap();

        let stored = access.user.grant.clone().unwrap();
        assert!(stored.facility_ids.is_empty());
        assert!(stored.roles.contains(&OrganizationRole::AllFacilities));
        assert_eq!(access.roles.unwrap().facilities.len(), 2);
    }

    #[tokio::test]
    async fn test_reset_requires_provider_claims() {
        let fx = setup().await;
        let bare = fx
            .manager
            .create_user_without_provider(&fx.actor, "bare@example.com", &PersonName::new("Bare", "User"))
            .await
            .unwrap();
        fx.idp
            .insert_account("bare@example.com", PersonName::new("Bare", "User"), None)
            .await;

        let err = fx
            .manager
            .reset_mfa(&fx.actor, &bare.internal_id)
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::MisconfiguredUser("bare@example.com".to_string()));
        assert!(fx
            .idp
            .events()
            .await
            .contains(&ProviderEvent::MfaReset("bare@example.com".to_string())));
    }

    #[tokio::test]
    async fn test_create_without_provider_rejects_existing_login() {
        let fx = setup().await;
        let name = PersonName::new("Bare", "User");
        fx.manager
            .create_user_without_provider(&fx.actor, "bare@example.com", &name)
            .await
            .unwrap();

        let err = fx
            .manager
            .create_user_without_provider(&fx.actor, "BARE@example.com", &name)
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::InvalidArgument("User already exists".to_string()));
    }

    #[tokio::test]
    async fn test_site_admin_lookup_is_restricted() {
        let fx = setup().await;
        fx.manager
            .create_user(&fx.actor, "org-o", &new_user("boss@example.com", &[&fx.f1]))
            .await
            .unwrap();
        fx.idp.set_site_admin("boss@example.com", true).await;

        let err = fx
            .manager
            .get_user_by_login_email("boss@example.com")
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::RestrictedAccessUser);
    }

    #[tokio::test]
    async fn test_roster_follows_migration_phase() {
        let fx = setup().await;
        fx.manager
            .create_user(&fx.actor, "org-o", &new_user("a@example.com", &[&fx.f1]))
            .await
            .unwrap();
        let b = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("b@example.com", &[&fx.f1]))
            .await
            .unwrap();

        // Drop b from the store's view of the org only.
        fx.manager
            .clear_roles_and_facilities(&fx.actor, &b.user.internal_id)
            .await
            .unwrap();

        let legacy = fx.manager.users_in_organization("org-o").await.unwrap();
        assert_eq!(legacy.len(), 2);

        fx.flag.set_migrated(true);
        let migrated = fx.manager.users_in_organization("org-o").await.unwrap();
        let logins: Vec<&str> = migrated.iter().map(|u| u.login_email.as_str()).collect();
        assert_eq!(logins, vec!["a@example.com"]);
    }

    #[tokio::test]
    async fn test_all_users_includes_archived() {
        let fx = setup().await;
        let created = fx
            .manager
            .create_user(&fx.actor, "org-o", &new_user("old@example.com", &[&fx.f1]))
            .await
            .unwrap();
        fx.manager
            .set_is_deleted(&fx.actor, &created.user.internal_id, true)
            .await
            .unwrap();

        let all = fx.manager.all_users_by_organization("org-o").await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_deleted);

        fx.flag.set_migrated(true);
        assert!(fx.manager.users_in_organization("org-o").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_organization() {
        let fx = setup().await;
        let err = fx
            .manager
            .create_user(&fx.actor, "nope", &new_user("x@example.com", &[&fx.f1]))
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::NonexistentOrganization("nope".to_string()));
    }
}
