//! Grant computation: requested role plus facility scope to a validated grant.

use std::collections::BTreeSet;
use tracing::debug;

use crate::access::roles::{grants_all_facility_access, OrganizationRole, Role};
use crate::db::{Db, FacilityRecord, OrganizationRecord, QueryBuilder, StoredGrant};
use crate::error::{IdentityError, IdentityResult};
use crate::types::FacilityId;

/// Validated roles and facilities for one organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedGrant {
    pub organization: OrganizationRecord,
    pub roles: BTreeSet<OrganizationRole>,
    /// Empty when `roles` carry the all-facilities capability.
    pub facilities: Vec<FacilityRecord>,
}

impl ComputedGrant {
    pub fn facility_ids(&self) -> BTreeSet<FacilityId> {
        self.facilities.iter().map(|f| f.internal_id.clone()).collect()
    }

    pub fn has_all_facility_access(&self) -> bool {
        grants_all_facility_access(&self.roles)
    }

    pub fn to_stored_grant(&self) -> StoredGrant {
        StoredGrant {
            organization_id: self.organization.internal_id.clone(),
            roles: self.roles.clone(),
            facility_ids: self.facility_ids(),
        }
    }
}

/// Computes grants against the organization's facilities.
#[derive(Clone)]
pub struct GrantCalculator {
    db: Db,
}

impl GrantCalculator {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Organization roles for a requested role: always the default role,
    /// plus the capability role when all-facility access is requested.
    pub fn organization_roles(role: Role, access_all_facilities: bool) -> BTreeSet<OrganizationRole> {
        let mut roles = BTreeSet::from([OrganizationRole::default_role(), role.to_organization_role()]);
        if access_all_facilities {
            roles.insert(OrganizationRole::AllFacilities);
        }
        roles
    }

    /// Compute a grant, rejecting it before anything is persisted.
    ///
    /// Explicit ids are discarded when the roles imply all-facility access.
    /// Otherwise at least one id is required and every id must belong to
    /// `organization`; the error names all ids that did not resolve.
    pub async fn compute_grants(
        &self,
        role: Role,
        access_all_facilities: bool,
        facility_ids: &BTreeSet<FacilityId>,
        organization: &OrganizationRecord,
    ) -> IdentityResult<ComputedGrant> {
        let roles = Self::organization_roles(role, access_all_facilities);
        let facilities = self.resolve_facilities(&roles, facility_ids, organization).await?;

        Ok(ComputedGrant {
            organization: organization.clone(),
            roles,
            facilities,
        })
    }

    async fn resolve_facilities(
        &self,
        roles: &BTreeSet<OrganizationRole>,
        facility_ids: &BTreeSet<FacilityId>,
        organization: &OrganizationRecord,
    ) -> IdentityResult<Vec<FacilityRecord>> {
        if grants_all_facility_access(roles) {
            if !facility_ids.is_empty() {
                debug!(
                    "Discarding {} explicit facilities for all-facility grant in {}",
                    facility_ids.len(),
                    organization.external_id
                );
            }
            return Ok(Vec::new());
        }

        if facility_ids.is_empty() {
            return Err(IdentityError::FacilityAccessRequired);
        }

        let found = QueryBuilder::find_facilities_in_organization(
            &self.db,
            &organization.internal_id,
            facility_ids,
        )
        .await?;

        let resolved: BTreeSet<&FacilityId> = found.iter().map(|f| &f.internal_id).collect();
        let missing: BTreeSet<FacilityId> = facility_ids
            .iter()
            .filter(|id| !resolved.contains(id))
            .cloned()
            .collect();

        if !missing.is_empty() {
            return Err(IdentityError::FacilitiesNotFound {
                facility_ids: missing,
                organization_external_id: organization.external_id.clone(),
            });
        }

        Ok(found)
    }
}
