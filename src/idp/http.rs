//! REST-backed identity provider client.

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{
    IdentityAttributes, IdentityProviderClient, OrganizationRoleClaims, PartialExternalUser,
    UserStatus,
};
use crate::access::OrganizationRole;
use crate::db::{OrganizationRecord, PersonName};
use crate::error::ProviderError;
use crate::types::{normalize_login, FacilityId};

#[derive(Debug, Serialize)]
struct CreateUserRequest<'a> {
    username: &'a str,
    name: &'a PersonName,
    organization_external_id: &'a str,
    facility_ids: &'a BTreeSet<FacilityId>,
    roles: &'a BTreeSet<OrganizationRole>,
    active: bool,
}

#[derive(Debug, Serialize)]
struct PrivilegesRequest<'a> {
    organization_external_id: &'a str,
    facility_ids: &'a BTreeSet<FacilityId>,
    roles: &'a BTreeSet<OrganizationRole>,
}

#[derive(Debug, Serialize)]
struct EmailRequest<'a> {
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct ActiveRequest {
    active: bool,
}

#[derive(Debug, Deserialize)]
struct ClaimsResponse {
    org_role_claims: Option<OrganizationRoleClaims>,
}

/// Identity provider reached over HTTP with an optional bearer token.
pub struct HttpIdentityProvider {
    base_url: Url,
    api_token: Option<String>,
    client: reqwest::Client,
}

impl HttpIdentityProvider {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("identity provider url cannot be a base: {}", base_url);
        }

        Ok(Self {
            base_url,
            api_token,
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ProviderError::Unavailable(format!("invalid provider url: {}", self.base_url))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn user_endpoint(&self, login_email: &str, action: Option<&str>) -> Result<Url, ProviderError> {
        let login = normalize_login(login_email);
        match action {
            Some(action) => self.endpoint(&["users", &login, action]),
            None => self.endpoint(&["users", &login]),
        }
    }

    /// Send a request. A 404 on a user-scoped call means the account is
    /// unknown; every other failure is an outage.
    async fn send(
        &self,
        request: RequestBuilder,
        login_email: Option<&str>,
    ) -> Result<Response, ProviderError> {
        let request = match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND
            && let Some(login) = login_email
        {
            return Err(ProviderError::UserNotFound(normalize_login(login)));
        }

        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!(
                "HTTP {} from identity provider",
                status
            )));
        }

        Ok(response)
    }

    async fn post_user_action(&self, login_email: &str, action: &str) -> Result<(), ProviderError> {
        let url = self.user_endpoint(login_email, Some(action))?;
        debug!("POST {}", url);
        self.send(self.client.post(url), Some(login_email)).await?;
        Ok(())
    }
}

async fn parse<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    response
        .json()
        .await
        .map_err(|e| ProviderError::Unavailable(format!("invalid provider response: {}", e)))
}

#[async_trait]
impl IdentityProviderClient for HttpIdentityProvider {
    async fn find_user(&self, login_email: &str) -> Result<PartialExternalUser, ProviderError> {
        let url = self.user_endpoint(login_email, None)?;
        let response = self.send(self.client.get(url), Some(login_email)).await?;
        parse(response).await
    }

    async fn create_user(
        &self,
        attributes: &IdentityAttributes,
        organization: &OrganizationRecord,
        facility_ids: &BTreeSet<FacilityId>,
        roles: &BTreeSet<OrganizationRole>,
        active: bool,
    ) -> Result<Option<OrganizationRoleClaims>, ProviderError> {
        let username = normalize_login(&attributes.username);
        let body = CreateUserRequest {
            username: &username,
            name: &attributes.name,
            organization_external_id: &organization.external_id,
            facility_ids,
            roles,
            active,
        };

        let url = self.endpoint(&["users"])?;
        let response = self.send(self.client.post(url).json(&body), None).await?;
        let parsed: ClaimsResponse = parse(response).await?;
        Ok(parsed.org_role_claims)
    }

    async fn update_user(&self, attributes: &IdentityAttributes) -> Result<(), ProviderError> {
        let url = self.user_endpoint(&attributes.username, None)?;
        self.send(
            self.client.put(url).json(&attributes.name),
            Some(&attributes.username),
        )
        .await?;
        Ok(())
    }

    async fn update_user_email(
        &self,
        attributes: &IdentityAttributes,
        new_email: &str,
    ) -> Result<(), ProviderError> {
        let url = self.user_endpoint(&attributes.username, Some("email"))?;
        let email = normalize_login(new_email);
        self.send(
            self.client.put(url).json(&EmailRequest { email: &email }),
            Some(&attributes.username),
        )
        .await?;
        Ok(())
    }

    async fn update_user_privileges(
        &self,
        login_email: &str,
        organization: &OrganizationRecord,
        facility_ids: &BTreeSet<FacilityId>,
        roles: &BTreeSet<OrganizationRole>,
    ) -> Result<Option<OrganizationRoleClaims>, ProviderError> {
        let url = self.user_endpoint(login_email, Some("privileges"))?;
        let body = PrivilegesRequest {
            organization_external_id: &organization.external_id,
            facility_ids,
            roles,
        };
        let response = self
            .send(self.client.put(url).json(&body), Some(login_email))
            .await?;
        let parsed: ClaimsResponse = parse(response).await?;
        Ok(parsed.org_role_claims)
    }

    async fn reprovision_user(&self, attributes: &IdentityAttributes) -> Result<(), ProviderError> {
        let url = self.user_endpoint(&attributes.username, Some("reprovision"))?;
        self.send(
            self.client.post(url).json(&attributes.name),
            Some(&attributes.username),
        )
        .await?;
        Ok(())
    }

    async fn reset_password(&self, login_email: &str) -> Result<(), ProviderError> {
        self.post_user_action(login_email, "reset-password").await
    }

    async fn reset_mfa(&self, login_email: &str) -> Result<(), ProviderError> {
        self.post_user_action(login_email, "reset-mfa").await
    }

    async fn set_active(&self, login_email: &str, active: bool) -> Result<(), ProviderError> {
        let url = self.user_endpoint(login_email, Some("active"))?;
        self.send(
            self.client.put(url).json(&ActiveRequest { active }),
            Some(login_email),
        )
        .await?;
        Ok(())
    }

    async fn resend_activation_email(&self, login_email: &str) -> Result<(), ProviderError> {
        self.post_user_action(login_email, "resend-activation").await
    }

    async fn list_users_for_organization(
        &self,
        organization_external_id: &str,
    ) -> Result<BTreeSet<String>, ProviderError> {
        let url = self.endpoint(&["organizations", organization_external_id, "users"])?;
        let response = self.send(self.client.get(url), None).await?;
        let logins: Vec<String> = parse(response).await?;
        Ok(logins.iter().map(|l| normalize_login(l)).collect())
    }

    async fn list_users_with_status(
        &self,
        organization_external_id: &str,
    ) -> Result<BTreeMap<String, UserStatus>, ProviderError> {
        let url = self.endpoint(&["organizations", organization_external_id, "users", "status"])?;
        let response = self.send(self.client.get(url), None).await?;
        let statuses: BTreeMap<String, UserStatus> = parse(response).await?;
        Ok(statuses
            .into_iter()
            .map(|(login, status)| (normalize_login(&login), status))
            .collect())
    }
}
