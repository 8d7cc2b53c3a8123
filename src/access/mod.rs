//! Organization roles, facility grants and the reconciliation of the two
//! sources that can hold them.
//!
//! - [`GrantCalculator`] turns a requested role plus facility scope into a
//!   validated grant.
//! - [`Reconciler`] decides, per call, whether the identity provider or the
//!   internal store is authoritative and cross-checks the two.

mod grants;
mod reconciler;
mod roles;

pub use grants::{ComputedGrant, GrantCalculator};
pub use reconciler::{ConsolidatedAccess, OrganizationRoles, Reconciler};
pub use roles::{effective_role, grants_all_facility_access, OrganizationRole, Role};
