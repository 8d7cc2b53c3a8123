// Core modules
pub mod access;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod idp;
pub mod migration;
pub mod types;
pub mod users;

// Re-export key types and functions
pub use access::{ConsolidatedAccess, GrantCalculator, OrganizationRole, OrganizationRoles, Reconciler, Role};
pub use config::{load_config, IdentityConfig, IdentityProviderConfig};
pub use db::{create_connection, ensure_schema, DatabaseConfig, Db, PersonName, UserRecord};
pub use error::{IdentityError, IdentityResult, ProviderError};
pub use identity::{
    IdentityClaims, IdentityResolver, PatientLink, RequestIdentityContext, RequestScope,
    SystemIdentity, UserStore,
};
pub use idp::{HttpIdentityProvider, IdentityProviderClient, InMemoryIdentityProvider};
pub use migration::{AuthoritySource, MigrationFlag, MigrationPhase};
pub use users::{DirectoryPage, NewUser, PrivilegeRequest, UserManager};

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

/// Wired-up identity core: one database, one provider, one migration flag.
pub struct IdentityService {
    db: Db,
    resolver: IdentityResolver,
    manager: UserManager,
    migration: Arc<MigrationFlag>,
}

impl IdentityService {
    pub fn new(
        db: Db,
        provider: Arc<dyn IdentityProviderClient>,
        migration: Arc<MigrationFlag>,
    ) -> Self {
        Self {
            resolver: IdentityResolver::new(db.clone()),
            manager: UserManager::new(db.clone(), provider, migration.clone()),
            db,
            migration,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn resolver(&self) -> &IdentityResolver {
        &self.resolver
    }

    pub fn manager(&self) -> &UserManager {
        &self.manager
    }

    /// Flip to change the authoritative source for subsequent calls.
    pub fn migration(&self) -> &MigrationFlag {
        &self.migration
    }
}

/// Build the identity provider client selected by the config.
pub fn create_provider(config: &IdentityProviderConfig) -> Result<Arc<dyn IdentityProviderClient>> {
    match config {
        IdentityProviderConfig::Memory => Ok(Arc::new(InMemoryIdentityProvider::new())),
        IdentityProviderConfig::Http {
            base_url,
            api_token,
            ..
        } => Ok(Arc::new(HttpIdentityProvider::new(
            base_url,
            api_token.clone(),
            config.timeout(),
        )?)),
    }
}

/// Convenience function to create a fully configured identity service.
///
/// Connects to the database, ensures the schema and builds the provider
/// client from the config.
pub async fn create_service(config: IdentityConfig) -> Result<Arc<IdentityService>> {
    let db = create_connection(config.database).await?;
    ensure_schema(&db).await?;

    let provider = create_provider(&config.identity_provider)?;
    let migration = Arc::new(MigrationFlag::new(config.migration_enabled));

    info!(
        "Identity service ready (authority: {})",
        migration.authority().as_str()
    );

    Ok(Arc::new(IdentityService::new(db, provider, migration)))
}
