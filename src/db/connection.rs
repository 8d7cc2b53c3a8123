use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;

pub type Db = Surreal<Any>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub namespace: String,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: env::var("IDENTITY_DB_URL")
                .unwrap_or_else(|_| "memory".to_string()),
            namespace: env::var("IDENTITY_DB_NAMESPACE")
                .unwrap_or_else(|_| "identity".to_string()),
            database: env::var("IDENTITY_DB_DATABASE")
                .unwrap_or_else(|_| "access".to_string()),
            username: env::var("IDENTITY_DB_USERNAME").ok(),
            password: env::var("IDENTITY_DB_PASSWORD").ok(),
        }
    }
}

pub async fn create_connection(config: DatabaseConfig) -> Result<Db> {
    let db = surrealdb::engine::any::connect(config.url).await?;

    // Sign in if credentials are provided
    if let (Some(username), Some(password)) = (config.username, config.password) {
        db.signin(Root {
            username: &username,
            password: &password,
        })
        .await?;
    }

    db.use_ns(config.namespace).use_db(config.database).await?;

    Ok(db)
}

pub async fn ensure_schema(db: &Db) -> Result<()> {
    let schema_queries = vec![
        // Tenants
        "DEFINE TABLE IF NOT EXISTS organization SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS internal_id ON TABLE organization TYPE string;
         DEFINE FIELD IF NOT EXISTS external_id ON TABLE organization TYPE string;
         DEFINE FIELD IF NOT EXISTS name ON TABLE organization TYPE string;
         DEFINE FIELD IF NOT EXISTS identity_verified ON TABLE organization TYPE bool DEFAULT false;",

        // Facilities belong to exactly one organization
        "DEFINE TABLE IF NOT EXISTS facility SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS internal_id ON TABLE facility TYPE string;
         DEFINE FIELD IF NOT EXISTS organization_id ON TABLE facility TYPE string;
         DEFINE FIELD IF NOT EXISTS name ON TABLE facility TYPE string;
         DEFINE FIELD IF NOT EXISTS is_deleted ON TABLE facility TYPE bool DEFAULT false;",

        // User identities; the grant is stored inline
        "DEFINE TABLE IF NOT EXISTS user SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS internal_id ON TABLE user TYPE string;
         DEFINE FIELD IF NOT EXISTS login_email ON TABLE user TYPE string;
         DEFINE FIELD IF NOT EXISTS is_deleted ON TABLE user TYPE bool DEFAULT false;",

        "DEFINE TABLE IF NOT EXISTS audit_log SCHEMALESS;
         DEFINE FIELD IF NOT EXISTS actor_id ON TABLE audit_log TYPE string;
         DEFINE FIELD IF NOT EXISTS subject_id ON TABLE audit_log TYPE string;
         DEFINE FIELD IF NOT EXISTS action ON TABLE audit_log TYPE string;",

        "DEFINE INDEX IF NOT EXISTS organization_internal_id ON TABLE organization COLUMNS internal_id UNIQUE;
         DEFINE INDEX IF NOT EXISTS organization_external_id ON TABLE organization COLUMNS external_id UNIQUE;
         DEFINE INDEX IF NOT EXISTS facility_internal_id ON TABLE facility COLUMNS internal_id UNIQUE;
         DEFINE INDEX IF NOT EXISTS facility_organization ON TABLE facility COLUMNS organization_id;
         DEFINE INDEX IF NOT EXISTS user_internal_id ON TABLE user COLUMNS internal_id UNIQUE;
         DEFINE INDEX IF NOT EXISTS user_login_email ON TABLE user COLUMNS login_email;
         DEFINE INDEX IF NOT EXISTS audit_log_subject ON TABLE audit_log COLUMNS subject_id;",
    ];

    for query in schema_queries {
        db.query(query).await?.check()?;
    }

    Ok(())
}
