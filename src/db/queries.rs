// Organization and facility queries.
//
// Organizations and facilities are owned by adjacent subsystems; the identity
// core only needs to create them for provisioning and look them up when
// validating grants.

use crate::db::schema::*;
use crate::types::{FacilityId, OrganizationId};
use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use surrealdb::{engine::any::Any, Surreal};

pub struct QueryBuilder;

impl QueryBuilder {
    pub async fn create_organization(
        db: &Surreal<Any>,
        data: &OrganizationCreate,
    ) -> Result<OrganizationRecord> {
        let mut res = db
            .query(
                r#"
                CREATE organization CONTENT {
                    internal_id: $internal_id,
                    external_id: $external_id,
                    name: $name,
                    identity_verified: $identity_verified,
                    created_at: time::now()
                }
                "#,
            )
            .bind(("internal_id", OrganizationId::generate()))
            .bind(("external_id", data.external_id.clone()))
            .bind(("name", data.name.clone()))
            .bind(("identity_verified", data.identity_verified))
            .await?;

        let created: Option<OrganizationRecord> = res.take(0)?;
        created.ok_or_else(|| anyhow!("failed to create organization record"))
    }

    pub async fn create_facility(
        db: &Surreal<Any>,
        organization_id: &OrganizationId,
        name: &str,
    ) -> Result<FacilityRecord> {
        let mut res = db
            .query(
                r#"
                CREATE facility CONTENT {
                    internal_id: $internal_id,
                    organization_id: $organization_id,
                    name: $name,
                    is_deleted: false,
                    created_at: time::now()
                }
                "#,
            )
            .bind(("internal_id", FacilityId::generate()))
            .bind(("organization_id", organization_id.clone()))
            .bind(("name", name.to_string()))
            .await?;

        let created: Option<FacilityRecord> = res.take(0)?;
        created.ok_or_else(|| anyhow!("failed to create facility record"))
    }

    pub async fn find_organization_by_external_id(
        db: &Surreal<Any>,
        external_id: &str,
    ) -> Result<Option<OrganizationRecord>> {
        let mut res = db
            .query("SELECT * FROM organization WHERE external_id = $external_id LIMIT 1")
            .bind(("external_id", external_id.to_string()))
            .await?;

        let orgs: Vec<OrganizationRecord> = res.take(0)?;
        Ok(orgs.into_iter().next())
    }

    pub async fn find_organization_by_id(
        db: &Surreal<Any>,
        organization_id: &OrganizationId,
    ) -> Result<Option<OrganizationRecord>> {
        let mut res = db
            .query("SELECT * FROM organization WHERE internal_id = $id LIMIT 1")
            .bind(("id", organization_id.clone()))
            .await?;

        let orgs: Vec<OrganizationRecord> = res.take(0)?;
        Ok(orgs.into_iter().next())
    }

    /// Non-deleted facilities of an organization, ordered by name.
    pub async fn list_facilities(
        db: &Surreal<Any>,
        organization_id: &OrganizationId,
    ) -> Result<Vec<FacilityRecord>> {
        let mut res = db
            .query(
                r#"
                SELECT * FROM facility
                WHERE organization_id = $organization_id
                  AND is_deleted = false
                ORDER BY name ASC
                "#,
            )
            .bind(("organization_id", organization_id.clone()))
            .await?;

        let facilities: Vec<FacilityRecord> = res.take(0)?;
        Ok(facilities)
    }

    /// Facilities among `facility_ids` that belong to the organization.
    ///
    /// Ids owned by other organizations, deleted facilities, and unknown ids
    /// are simply absent from the result.
    pub async fn find_facilities_in_organization(
        db: &Surreal<Any>,
        organization_id: &OrganizationId,
        facility_ids: &BTreeSet<FacilityId>,
    ) -> Result<Vec<FacilityRecord>> {
        if facility_ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<FacilityId> = facility_ids.iter().cloned().collect();

        let mut res = db
            .query(
                r#"
                SELECT * FROM facility
                WHERE organization_id = $organization_id
                  AND internal_id IN $ids
                  AND is_deleted = false
                ORDER BY name ASC
                "#,
            )
            .bind(("organization_id", organization_id.clone()))
            .bind(("ids", ids))
            .await?;

        let facilities: Vec<FacilityRecord> = res.take(0)?;
        Ok(facilities)
    }
}
