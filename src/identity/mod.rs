//! Caller identity: resolution, persistence and system identities.
//!
//! Every request carries at most one identity signal that counts. The
//! transport verifies credentials and fills a [`RequestIdentityContext`];
//! the [`IdentityResolver`] turns it into a stored user, creating one on
//! first sight.
//!
//! ## Signals, in priority order
//!
//! - **Claims**: an authenticated human login
//! - **Patient link**: a patient self-service session, resolved to a
//!   synthetic login derived from the patient id
//! - **Patient self-registration**, **account request**, **webhook**:
//!   fixed [`SystemIdentity`] rows created lazily
//!
//! ## Caching
//!
//! Wrap the context in a [`RequestScope`] to resolve at most once per
//! request. Background jobs call [`IdentityResolver::resolve`] directly and
//! get no cache.
//!
//! ## Usage
//!
//! ```ignore
//! let scope = RequestScope::new(
//!     RequestIdentityContext::new().with_claims(IdentityClaims::new(email, name)),
//! );
//! let user = resolver.resolve_in_scope(&scope).await?;
//! ```

mod context;
mod resolver;
mod system_users;
mod user_store;

pub use context::{ActiveIdentity, IdentityClaims, PatientLink, RequestIdentityContext, RequestScope};
pub use resolver::IdentityResolver;
pub use system_users::{patient_login, SystemIdentity};
pub use user_store::UserStore;
