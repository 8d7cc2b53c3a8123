//! Maps a request context to exactly one user identity.

use tracing::{debug, info};

use crate::db::{Db, UserRecord};
use crate::error::{IdentityError, IdentityResult};
use crate::identity::context::{ActiveIdentity, RequestIdentityContext, RequestScope};
use crate::identity::system_users::{patient_login, SystemIdentity};
use crate::identity::user_store::UserStore;

/// Resolves the current user, provisioning it on first sight.
#[derive(Clone)]
pub struct IdentityResolver {
    user_store: UserStore,
}

impl IdentityResolver {
    pub fn new(db: Db) -> Self {
        Self {
            user_store: UserStore::new(db),
        }
    }

    pub fn user_store(&self) -> &UserStore {
        &self.user_store
    }

    /// Resolve without a cache. Every call hits the store.
    ///
    /// Resolution order, first match wins:
    /// 1. Authenticated claims, looked up by login and created on miss
    /// 2. Patient link, keyed by the synthetic patient login
    /// 3. Patient self-registration system identity
    /// 4. Account request system identity
    /// 5. Webhook system identity
    ///
    /// Human identities get `last_seen_at` stamped. With no signal the call
    /// fails with [`IdentityError::UnidentifiedCaller`].
    pub async fn resolve(&self, context: &RequestIdentityContext) -> IdentityResult<UserRecord> {
        match context.active() {
            ActiveIdentity::Claims(claims) => {
                let (user, created) = self
                    .user_store
                    .get_or_create_user(&claims.login_email, &claims.name)
                    .await?;
                if created {
                    info!("Initial login for user with id={}", user.internal_id);
                } else {
                    debug!("Returning user {}", user.internal_id);
                }
                Ok(user)
            }
            ActiveIdentity::Patient(link) => {
                let login = patient_login(&link.patient_id);
                let (user, created) = self
                    .user_store
                    .get_or_create_user(&login, &link.patient_name)
                    .await?;
                if created {
                    info!(
                        "Created login identity {} for patient link {}",
                        user.internal_id, link.link_id
                    );
                }
                Ok(user)
            }
            ActiveIdentity::PatientSelfRegistration => {
                self.system_user(SystemIdentity::PatientSelfRegistration).await
            }
            ActiveIdentity::AccountRequest => self.system_user(SystemIdentity::AccountRequest).await,
            ActiveIdentity::Webhook => self.system_user(SystemIdentity::Webhook).await,
            ActiveIdentity::Unidentified => Err(IdentityError::UnidentifiedCaller),
        }
    }

    /// Resolve once per request scope; later calls return the cached user.
    pub async fn resolve_in_scope(&self, scope: &RequestScope) -> IdentityResult<UserRecord> {
        if let Some(user) = scope.resolved() {
            debug!("Request-scoped identity cache hit for {}", user.internal_id);
        }

        scope
            .cell()
            .get_or_try_init(|| self.resolve(scope.context()))
            .await
            .cloned()
    }

    /// Get or lazily create a system identity.
    pub async fn system_user(&self, identity: SystemIdentity) -> IdentityResult<UserRecord> {
        Ok(self.user_store.get_or_create_system_user(identity).await?)
    }
}
