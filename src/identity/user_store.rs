//! User identity storage and audit log.

use anyhow::{anyhow, Result};
use std::collections::BTreeSet;
use tracing::info;

use crate::db::Db;
use crate::db::schema::{
    AuditLogCreate, AuditLogRecord, PersonName, StoredGrant, UserCreate, UserRecord,
};
use crate::identity::system_users::SystemIdentity;
use crate::types::{normalize_login, OrganizationId, UserId};

/// User store for database operations.
#[derive(Clone)]
pub struct UserStore {
    db: Db,
}

impl UserStore {
    /// Create a new user store.
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Find an active user by login, or create one on first sight.
    ///
    /// Either way `last_seen_at` is stamped. Returns the user and whether it
    /// was created by this call.
    pub async fn get_or_create_user(
        &self,
        login_email: &str,
        name: &PersonName,
    ) -> Result<(UserRecord, bool)> {
        if let Some(user) = self.find_by_login(login_email).await? {
            let user = self.update_last_seen(&user.internal_id).await?;
            return Ok((user, false));
        }

        let user = self
            .create_user(&UserCreate {
                login_email: login_email.to_string(),
                name: name.clone(),
                grant: None,
                seen_now: true,
            })
            .await?;

        Ok((user, true))
    }

    /// Find a system identity, creating its row if it is missing.
    pub async fn get_or_create_system_user(&self, identity: SystemIdentity) -> Result<UserRecord> {
        if let Some(user) = self.find_by_login(identity.login_email()).await? {
            return Ok(user);
        }

        let user = self
            .create_user(&UserCreate {
                login_email: identity.login_email().to_string(),
                name: PersonName::system(identity.display_name()),
                grant: None,
                seen_now: false,
            })
            .await?;

        info!(
            "Magic {} user not found. Created user with id={}",
            identity.as_str(),
            user.internal_id
        );

        Ok(user)
    }

    /// Get an active user by internal id.
    pub async fn find_by_id(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM user WHERE internal_id = $id AND is_deleted = false LIMIT 1")
            .bind(("id", user_id.clone()))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        Ok(users.into_iter().next())
    }

    /// Get a user by internal id, archived or not.
    pub async fn find_by_id_include_archived(&self, user_id: &UserId) -> Result<Option<UserRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM user WHERE internal_id = $id LIMIT 1")
            .bind(("id", user_id.clone()))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        Ok(users.into_iter().next())
    }

    /// Get the active user holding a login.
    pub async fn find_by_login(&self, login_email: &str) -> Result<Option<UserRecord>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT * FROM user
                WHERE login_email = $login_email
                  AND is_deleted = false
                LIMIT 1
                "#,
            )
            .bind(("login_email", normalize_login(login_email)))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        Ok(users.into_iter().next())
    }

    /// Get the user holding a login, archived or not. An active holder wins
    /// over archived ones.
    pub async fn find_by_login_include_archived(&self, login_email: &str) -> Result<Option<UserRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM user WHERE login_email = $login_email")
            .bind(("login_email", normalize_login(login_email)))
            .await?;

        let mut users: Vec<UserRecord> = res.take(0)?;
        users.sort_by_key(|u| u.is_deleted);
        Ok(users.into_iter().next())
    }

    /// Active users holding any of the given logins, ordered by name.
    pub async fn find_by_logins(&self, logins: &BTreeSet<String>) -> Result<Vec<UserRecord>> {
        if logins.is_empty() {
            return Ok(Vec::new());
        }

        let logins: Vec<String> = logins.iter().map(|l| normalize_login(l)).collect();

        let mut res = self
            .db
            .query(
                r#"
                SELECT * FROM user
                WHERE login_email IN $logins
                  AND is_deleted = false
                "#,
            )
            .bind(("logins", logins))
            .await?;

        let mut users: Vec<UserRecord> = res.take(0)?;
        sort_by_name(&mut users);
        Ok(users)
    }

    /// Active users whose stored grant targets the organization, ordered by name.
    pub async fn find_by_organization(&self, organization_id: &OrganizationId) -> Result<Vec<UserRecord>> {
        let mut users = self.find_by_organization_include_archived(organization_id).await?;
        users.retain(|u| !u.is_deleted);
        Ok(users)
    }

    /// Users whose stored grant targets the organization, archived included.
    pub async fn find_by_organization_include_archived(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<UserRecord>> {
        let mut res = self
            .db
            .query("SELECT * FROM user WHERE access_grant.organization_id = $organization_id")
            .bind(("organization_id", organization_id.clone()))
            .await?;

        let mut users: Vec<UserRecord> = res.take(0)?;
        sort_by_name(&mut users);
        Ok(users)
    }

    /// Create a new user. The login is normalized before it is stored.
    pub async fn create_user(&self, create: &UserCreate) -> Result<UserRecord> {
        let query = if create.seen_now {
            r#"
            CREATE user CONTENT {
                internal_id: $internal_id,
                login_email: $login_email,
                name: $name,
                is_deleted: false,
                access_grant: $grant,
                created_at: time::now(),
                updated_at: time::now(),
                last_seen_at: time::now()
            }
            "#
        } else {
            r#"
            CREATE user CONTENT {
                internal_id: $internal_id,
                login_email: $login_email,
                name: $name,
                is_deleted: false,
                access_grant: $grant,
                created_at: time::now(),
                updated_at: time::now()
            }
            "#
        };

        let mut res = self
            .db
            .query(query)
            .bind(("internal_id", UserId::generate()))
            .bind(("login_email", normalize_login(&create.login_email)))
            .bind(("name", create.name.clone()))
            .bind(("grant", create.grant.clone()))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Failed to create user"))
    }

    /// Stamp `last_seen_at` and return the updated record.
    pub async fn update_last_seen(&self, user_id: &UserId) -> Result<UserRecord> {
        let query = r#"
            UPDATE user SET
                last_seen_at = time::now(),
                updated_at = time::now()
            WHERE internal_id = $id
        "#;

        self.update_one(query, user_id, Vec::new()).await
    }

    pub async fn update_name(&self, user_id: &UserId, name: &PersonName) -> Result<UserRecord> {
        let query = r#"
            UPDATE user SET
                name = $name,
                updated_at = time::now()
            WHERE internal_id = $id
        "#;

        self.update_one(query, user_id, vec![("name", serde_json::to_value(name)?)])
            .await
    }

    pub async fn update_login(&self, user_id: &UserId, login_email: &str) -> Result<UserRecord> {
        let query = r#"
            UPDATE user SET
                login_email = $login_email,
                updated_at = time::now()
            WHERE internal_id = $id
        "#;

        self.update_one(
            query,
            user_id,
            vec![("login_email", serde_json::Value::String(normalize_login(login_email)))],
        )
        .await
    }

    pub async fn set_deleted(&self, user_id: &UserId, deleted: bool) -> Result<UserRecord> {
        let query = r#"
            UPDATE user SET
                is_deleted = $deleted,
                updated_at = time::now()
            WHERE internal_id = $id
        "#;

        self.update_one(query, user_id, vec![("deleted", serde_json::Value::Bool(deleted))])
            .await
    }

    /// Replace (or clear, with `None`) the stored grant.
    pub async fn save_grant(&self, user_id: &UserId, grant: Option<&StoredGrant>) -> Result<UserRecord> {
        let query = r#"
            UPDATE user SET
                access_grant = $grant,
                updated_at = time::now()
            WHERE internal_id = $id
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("id", user_id.clone()))
            .bind(("grant", grant.cloned()))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No user with id {}", user_id))
    }

    /// Restore an archived user with a new name and grant in a single write.
    pub async fn reprovision(
        &self,
        user_id: &UserId,
        name: &PersonName,
        grant: &StoredGrant,
    ) -> Result<UserRecord> {
        let query = r#"
            UPDATE user SET
                is_deleted = false,
                name = $name,
                access_grant = $grant,
                updated_at = time::now()
            WHERE internal_id = $id
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("id", user_id.clone()))
            .bind(("name", name.clone()))
            .bind(("grant", grant.clone()))
            .await?;

        let users: Vec<UserRecord> = res.take(0)?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No user with id {}", user_id))
    }

    async fn update_one(
        &self,
        query: &str,
        user_id: &UserId,
        binds: Vec<(&'static str, serde_json::Value)>,
    ) -> Result<UserRecord> {
        let mut builder = self.db.query(query).bind(("id", user_id.clone()));
        for (key, value) in binds {
            builder = builder.bind((key, value));
        }

        let mut res = builder.await?;
        let users: Vec<UserRecord> = res.take(0)?;
        users
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No user with id {}", user_id))
    }

    /// Write an audit log entry.
    pub async fn audit_log(&self, entry: AuditLogCreate) -> Result<()> {
        let query = r#"
            CREATE audit_log CONTENT {
                actor_id: $actor_id,
                subject_id: $subject_id,
                action: $action,
                details: $details,
                created_at: time::now()
            }
        "#;

        self.db
            .query(query)
            .bind(("actor_id", entry.actor_id))
            .bind(("subject_id", entry.subject_id))
            .bind(("action", entry.action))
            .bind(("details", entry.details))
            .await?
            .check()?;

        Ok(())
    }

    /// Recent audit log entries about a user, newest first.
    pub async fn get_audit_log_for_subject(
        &self,
        subject_id: &UserId,
        limit: u32,
    ) -> Result<Vec<AuditLogRecord>> {
        let query = r#"
            SELECT * FROM audit_log
            WHERE subject_id = $subject_id
            ORDER BY created_at DESC
            LIMIT $limit
        "#;

        let mut res = self
            .db
            .query(query)
            .bind(("subject_id", subject_id.to_string()))
            .bind(("limit", limit))
            .await?;

        let logs: Vec<AuditLogRecord> = res.take(0)?;
        Ok(logs)
    }
}

fn sort_by_name(users: &mut [UserRecord]) {
    users.sort_by(|a, b| {
        (&a.name.last_name, &a.name.first_name, &a.login_email).cmp(&(
            &b.name.last_name,
            &b.name.first_name,
            &b.login_email,
        ))
    });
}
