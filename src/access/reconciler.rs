//! Reconciliation of provider claims with grants held in the internal store.
//!
//! The caller snapshots the migration phase once per call and passes it in as
//! an [`AuthoritySource`]. Whenever both sources hold roles for a user they are
//! compared; a disagreement is logged and never returned to the caller.

use std::collections::BTreeSet;
use tracing::{debug, error, warn};

use crate::access::roles::{effective_role, grants_all_facility_access, OrganizationRole, Role};
use crate::db::{Db, FacilityRecord, OrganizationRecord, QueryBuilder, StoredGrant, UserRecord};
use crate::error::{IdentityError, IdentityResult};
use crate::identity::UserStore;
use crate::idp::{OrganizationRoleClaims, PartialExternalUser, UserStatus};
use crate::migration::AuthoritySource;

/// Roles and facilities a user holds in one organization, resolved against
/// the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationRoles {
    pub organization: OrganizationRecord,
    /// Every non-deleted facility of the organization when the roles carry
    /// the all-facilities capability.
    pub facilities: Vec<FacilityRecord>,
    pub granted_roles: BTreeSet<OrganizationRole>,
}

impl OrganizationRoles {
    pub fn effective_role(&self) -> Option<Role> {
        effective_role(&self.granted_roles)
    }

    pub fn grants_all_facility_access(&self) -> bool {
        grants_all_facility_access(&self.granted_roles)
    }
}

/// Result of consolidating one user's access.
#[derive(Debug, Clone)]
pub struct ConsolidatedAccess {
    pub user: UserRecord,
    /// `None` only for site administrators without an organization.
    pub roles: Option<OrganizationRoles>,
    pub is_site_admin: bool,
    pub status: Option<UserStatus>,
}

/// Chooses the authoritative role source and cross-checks the other one.
#[derive(Clone)]
pub struct Reconciler {
    db: Db,
    store: UserStore,
}

impl Reconciler {
    pub fn new(db: Db) -> Self {
        Self {
            store: UserStore::new(db.clone()),
            db,
        }
    }

    /// Consolidate a user's access from the provider view and the stored grant.
    ///
    /// With [`AuthoritySource::ExternalProvider`] the claims win and the stored
    /// grant is synced to them on a best-effort basis. With
    /// [`AuthoritySource::InternalStore`] the stored grant wins and the provider
    /// view only contributes site-admin and status information.
    pub async fn consolidate(
        &self,
        user: &UserRecord,
        external: Option<&PartialExternalUser>,
        source: AuthoritySource,
    ) -> IdentityResult<ConsolidatedAccess> {
        let is_site_admin = external.is_some_and(|e| e.is_site_admin);
        let status = external.and_then(|e| e.status);
        let claims = external.and_then(|e| e.org_role_claims.as_ref());

        self.cross_check(user, claims).await;

        let user = match (source, claims) {
            (AuthoritySource::ExternalProvider, Some(claims)) => self.sync_grant(user, claims).await,
            _ => user.clone(),
        };

        let roles = self
            .authoritative_roles(&user, claims, source, is_site_admin)
            .await?;

        Ok(ConsolidatedAccess {
            user,
            roles,
            is_site_admin,
            status,
        })
    }

    /// Organization roles from the authoritative source, without syncing.
    ///
    /// An empty authoritative source is a misconfiguration for everyone but
    /// site administrators; the other source is never used as a fallback.
    pub async fn authoritative_roles(
        &self,
        user: &UserRecord,
        claims: Option<&OrganizationRoleClaims>,
        source: AuthoritySource,
        is_site_admin: bool,
    ) -> IdentityResult<Option<OrganizationRoles>> {
        let authoritative = match source {
            AuthoritySource::ExternalProvider => claims.cloned(),
            AuthoritySource::InternalStore => self.claims_from_grant(user).await?,
        };

        match authoritative {
            Some(claims) => Ok(Some(self.resolve_claims(&claims).await?)),
            None if is_site_admin => Ok(None),
            None => {
                error!(
                    "User {} has no organization roles in {}",
                    user.internal_id,
                    source.as_str()
                );
                Err(IdentityError::MisconfiguredUser(user.login_email.clone()))
            }
        }
    }

    /// Resolve claims against the store.
    pub async fn resolve_claims(&self, claims: &OrganizationRoleClaims) -> IdentityResult<OrganizationRoles> {
        let organization =
            QueryBuilder::find_organization_by_external_id(&self.db, &claims.organization_external_id)
                .await?
                .ok_or_else(|| {
                    IdentityError::NonexistentOrganization(claims.organization_external_id.clone())
                })?;

        let facilities = if grants_all_facility_access(&claims.granted_roles) {
            QueryBuilder::list_facilities(&self.db, &organization.internal_id).await?
        } else {
            QueryBuilder::find_facilities_in_organization(
                &self.db,
                &organization.internal_id,
                &claims.facility_ids,
            )
            .await?
        };

        Ok(OrganizationRoles {
            organization,
            facilities,
            granted_roles: claims.granted_roles.clone(),
        })
    }

    /// Express a user's stored grant in claim form.
    pub async fn claims_from_grant(&self, user: &UserRecord) -> IdentityResult<Option<OrganizationRoleClaims>> {
        let Some(grant) = &user.grant else {
            return Ok(None);
        };

        let Some(organization) =
            QueryBuilder::find_organization_by_id(&self.db, &grant.organization_id).await?
        else {
            warn!(
                "Stored grant of user {} points at missing organization {}",
                user.internal_id, grant.organization_id
            );
            return Ok(None);
        };

        Ok(Some(OrganizationRoleClaims {
            organization_external_id: organization.external_id,
            granted_roles: grant.roles.clone(),
            facility_ids: grant.facility_ids.clone(),
        }))
    }

    async fn cross_check(&self, user: &UserRecord, claims: Option<&OrganizationRoleClaims>) {
        let Some(claims) = claims else {
            return;
        };
        if user.grant.is_none() {
            return;
        }

        match self.claims_from_grant(user).await {
            Ok(Some(stored)) if !claims_agree(&stored, claims) => {
                error!(
                    "Role mismatch for user {}: provider has {} {:?} {:?}, store has {} {:?} {:?}",
                    user.internal_id,
                    claims.organization_external_id,
                    claims.granted_roles,
                    claims.facility_ids,
                    stored.organization_external_id,
                    stored.granted_roles,
                    stored.facility_ids
                );
            }
            Ok(_) => {}
            Err(e) => warn!("Could not cross-check roles for user {}: {}", user.internal_id, e),
        }
    }

    /// Mirror provider claims into the stored grant. Failures are logged and
    /// the unsynced record is returned.
    async fn sync_grant(&self, user: &UserRecord, claims: &OrganizationRoleClaims) -> UserRecord {
        let organization = match QueryBuilder::find_organization_by_external_id(
            &self.db,
            &claims.organization_external_id,
        )
        .await
        {
            Ok(Some(org)) => org,
            Ok(None) => {
                warn!(
                    "Skipping grant sync for user {}: unknown organization {}",
                    user.internal_id, claims.organization_external_id
                );
                return user.clone();
            }
            Err(e) => {
                warn!("Skipping grant sync for user {}: {}", user.internal_id, e);
                return user.clone();
            }
        };

        let facility_ids = if grants_all_facility_access(&claims.granted_roles) {
            BTreeSet::new()
        } else {
            claims.facility_ids.clone()
        };

        let grant = StoredGrant {
            organization_id: organization.internal_id,
            roles: claims.granted_roles.clone(),
            facility_ids,
        };

        if user.grant.as_ref() == Some(&grant) {
            return user.clone();
        }

        match self.store.save_grant(&user.internal_id, Some(&grant)).await {
            Ok(updated) => {
                debug!("Synced stored grant for user {} from provider claims", user.internal_id);
                updated
            }
            Err(e) => {
                warn!("Failed to sync grant for user {}: {}", user.internal_id, e);
                user.clone()
            }
        }
    }
}

/// Compare claims the way they are stored: all-facility roles carry no
/// explicit facility ids.
fn claims_agree(stored: &OrganizationRoleClaims, claims: &OrganizationRoleClaims) -> bool {
    let facility_ids = if grants_all_facility_access(&claims.granted_roles) {
        BTreeSet::new()
    } else {
        claims.facility_ids.clone()
    };
    stored.organization_external_id == claims.organization_external_id
        && stored.granted_roles == claims.granted_roles
        && stored.facility_ids == facility_ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_connection, ensure_schema, DatabaseConfig, OrganizationCreate, PersonName};
    use crate::types::FacilityId;

    struct Fixture {
        reconciler: Reconciler,
        store: UserStore,
        org: OrganizationRecord,
        f1: FacilityRecord,
        f2: FacilityRecord,
    }

    async fn setup() -> Fixture {
        let config = DatabaseConfig {
            url: "memory".to_string(),
            ..Default::default()
        };
        let db = create_connection(config).await.unwrap();
        ensure_schema(&db).await.unwrap();

        let org = QueryBuilder::create_organization(
            &db,
            &OrganizationCreate {
                external_id: "org-o".to_string(),
                name: "Org O".to_string(),
                identity_verified: true,
            },
        )
        .await
        .unwrap();
        let f1 = QueryBuilder::create_facility(&db, &org.internal_id, "F1").await.unwrap();
        let f2 = QueryBuilder::create_facility(&db, &org.internal_id, "F2").await.unwrap();

        Fixture {
            reconciler: Reconciler::new(db.clone()),
            store: UserStore::new(db),
            org,
            f1,
            f2,
        }
    }

    fn user_roles() -> BTreeSet<OrganizationRole> {
        [OrganizationRole::NoAccess, OrganizationRole::User].into()
    }

    fn claims(facilities: &[&FacilityRecord]) -> OrganizationRoleClaims {
        OrganizationRoleClaims {
            organization_external_id: "org-o".to_string(),
            granted_roles: user_roles(),
            facility_ids: facilities.iter().map(|f| f.internal_id.clone()).collect(),
        }
    }

    fn external(login: &str, claims: Option<OrganizationRoleClaims>) -> PartialExternalUser {
        PartialExternalUser {
            login_email: login.to_string(),
            status: Some(UserStatus::Active),
            is_site_admin: false,
            org_role_claims: claims,
        }
    }

    async fn new_user(store: &UserStore, login: &str) -> UserRecord {
        store
            .get_or_create_user(login, &PersonName::new("Test", "User"))
            .await
            .unwrap()
            .0
    }

    #[test]
    fn test_all_facility_claims_agree_with_stored_grant() {
        let roles = BTreeSet::from([OrganizationRole::NoAccess, OrganizationRole::AllFacilities]);
        let stored = OrganizationRoleClaims {
            organization_external_id: "org".to_string(),
            granted_roles: roles.clone(),
            facility_ids: BTreeSet::new(),
        };
        let mut claims = OrganizationRoleClaims {
            organization_external_id: "org".to_string(),
            granted_roles: roles,
            facility_ids: BTreeSet::from([FacilityId::from("f1".to_string())]),
        };
        assert!(claims_agree(&stored, &claims));

        claims.granted_roles = BTreeSet::from([OrganizationRole::NoAccess, OrganizationRole::User]);
        assert!(!claims_agree(&stored, &claims));

        claims.facility_ids = BTreeSet::new();
        assert!(claims_agree(
            &OrganizationRoleClaims {
                granted_roles: claims.granted_roles.clone(),
                ..stored
            },
            &claims
        ));
    }

    #[tokio::test]
    async fn test_legacy_mode_uses_claims_and_syncs_store() {
        let fx = setup().await;
        let user = new_user(&fx.store, "a@example.com").await;
        let ext = external("a@example.com", Some(claims(&[&fx.f1])));

        let access = fx
            .reconciler
            .consolidate(&user, Some(&ext), AuthoritySource::ExternalProvider)
            .await
            .unwrap();

        let roles = access.roles.unwrap();
        assert_eq!(roles.organization.internal_id, fx.org.internal_id);
        assert_eq!(roles.facilities, vec![fx.f1.clone()]);
        assert_eq!(roles.effective_role(), Some(Role::User));
        assert_eq!(access.status, Some(UserStatus::Active));

        let stored = fx.store.find_by_id(&user.internal_id).await.unwrap().unwrap();
        let grant = stored.grant.unwrap();
        assert_eq!(grant.organization_id, fx.org.internal_id);
        assert_eq!(grant.facility_ids, BTreeSet::from([fx.f1.internal_id.clone()]));
    }

    #[tokio::test]
    async fn test_migrated_mode_prefers_store_on_mismatch() {
        let fx = setup().await;
        let user = new_user(&fx.store, "b@example.com").await;
        let grant = StoredGrant {
            organization_id: fx.org.internal_id.clone(),
            roles: user_roles(),
            facility_ids: [fx.f2.internal_id.clone()].into(),
        };
        let user = fx.store.save_grant(&user.internal_id, Some(&grant)).await.unwrap();

        // Provider disagrees: F1 instead of F2.
        let ext = external("b@example.com", Some(claims(&[&fx.f1])));

        let access = fx
            .reconciler
            .consolidate(&user, Some(&ext), AuthoritySource::InternalStore)
            .await
            .unwrap();

        assert_eq!(access.roles.unwrap().facilities, vec![fx.f2.clone()]);

        let stored = fx.store.find_by_id(&user.internal_id).await.unwrap().unwrap();
        assert_eq!(stored.grant, Some(grant));
    }

    #[tokio::test]
    async fn test_empty_authoritative_source_is_misconfigured() {
        let fx = setup().await;
        let user = new_user(&fx.store, "c@example.com").await;

        // Migrated mode: claims exist but the store is empty; no fallback.
        let ext = external("c@example.com", Some(claims(&[&fx.f1])));
        let err = fx
            .reconciler
            .consolidate(&user, Some(&ext), AuthoritySource::InternalStore)
            .await
            .unwrap_err();
        assert_eq!(err, IdentityError::MisconfiguredUser("c@example.com".to_string()));

        // Legacy mode: no claims at all.
        let ext = external("c@example.com", None);
        let err = fx
            .reconciler
            .consolidate(&user, Some(&ext), AuthoritySource::ExternalProvider)
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::MisconfiguredUser(_)));
    }

    #[tokio::test]
    async fn test_site_admin_without_roles_is_not_misconfigured() {
        let fx = setup().await;
        let user = new_user(&fx.store, "admin@example.com").await;
        let mut ext = external("admin@example.com", None);
        ext.is_site_admin = true;

        for source in [AuthoritySource::ExternalProvider, AuthoritySource::InternalStore] {
            let access = fx.reconciler.consolidate(&user, Some(&ext), source).await.unwrap();
            assert!(access.is_site_admin);
            assert!(access.roles.is_none());
        }
    }

    #[tokio::test]
    async fn test_all_facilities_expands_to_every_facility() {
        let fx = setup().await;
        let mut all = claims(&[]);
        all.granted_roles.insert(OrganizationRole::AllFacilities);

        let roles = fx.reconciler.resolve_claims(&all).await.unwrap();
        let ids: BTreeSet<FacilityId> = roles.facilities.iter().map(|f| f.internal_id.clone()).collect();
        assert_eq!(ids, BTreeSet::from([fx.f1.internal_id.clone(), fx.f2.internal_id.clone()]));
        assert!(roles.grants_all_facility_access());
    }

    #[tokio::test]
    async fn test_unknown_organization_in_claims() {
        let fx = setup().await;
        let mut bad = claims(&[&fx.f1]);
        bad.organization_external_id = "missing".to_string();

        let err = fx.reconciler.resolve_claims(&bad).await.unwrap_err();
        assert_eq!(err, IdentityError::NonexistentOrganization("missing".to_string()));
    }
}
