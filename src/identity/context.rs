//! Request-scoped identity signals.

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::db::{PersonName, UserRecord};
use crate::types::PatientId;

/// Claims of an authenticated caller, already verified by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub login_email: String,
    pub name: PersonName,
}

impl IdentityClaims {
    pub fn new(login_email: impl Into<String>, name: PersonName) -> Self {
        Self {
            login_email: login_email.into(),
            name,
        }
    }
}

/// A verified patient self-service link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientLink {
    pub link_id: String,
    pub patient_id: PatientId,
    pub patient_name: PersonName,
}

/// The signal that identifies the caller, in resolution priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveIdentity<'a> {
    Claims(&'a IdentityClaims),
    Patient(&'a PatientLink),
    PatientSelfRegistration,
    AccountRequest,
    Webhook,
    Unidentified,
}

/// Identity signals collected by the transport for one request.
///
/// Several signals may be set; only the highest-priority one is used.
#[derive(Debug, Clone, Default)]
pub struct RequestIdentityContext {
    claims: Option<IdentityClaims>,
    patient_link: Option<PatientLink>,
    patient_self_registration: bool,
    account_request: bool,
    webhook: bool,
}

impl RequestIdentityContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claims(mut self, claims: IdentityClaims) -> Self {
        self.claims = Some(claims);
        self
    }

    pub fn with_patient_link(mut self, link: PatientLink) -> Self {
        self.patient_link = Some(link);
        self
    }

    pub fn patient_self_registration(mut self) -> Self {
        self.patient_self_registration = true;
        self
    }

    pub fn account_request(mut self) -> Self {
        self.account_request = true;
        self
    }

    pub fn webhook(mut self) -> Self {
        self.webhook = true;
        self
    }

    pub fn claims(&self) -> Option<&IdentityClaims> {
        self.claims.as_ref()
    }

    /// The signal resolution will act on.
    pub fn active(&self) -> ActiveIdentity<'_> {
        if let Some(claims) = &self.claims {
            ActiveIdentity::Claims(claims)
        } else if let Some(link) = &self.patient_link {
            ActiveIdentity::Patient(link)
        } else if self.patient_self_registration {
            ActiveIdentity::PatientSelfRegistration
        } else if self.account_request {
            ActiveIdentity::AccountRequest
        } else if self.webhook {
            ActiveIdentity::Webhook
        } else {
            ActiveIdentity::Unidentified
        }
    }
}

/// One request's identity context plus its resolved-user cache.
///
/// Create one per request and drop it when the request ends. The cache is
/// filled at most once.
#[derive(Debug, Default)]
pub struct RequestScope {
    context: RequestIdentityContext,
    resolved: OnceCell<UserRecord>,
}

impl RequestScope {
    pub fn new(context: RequestIdentityContext) -> Self {
        Self {
            context,
            resolved: OnceCell::new(),
        }
    }

    pub fn context(&self) -> &RequestIdentityContext {
        &self.context
    }

    /// The user resolved for this request, if resolution already ran.
    pub fn resolved(&self) -> Option<&UserRecord> {
        self.resolved.get()
    }

    pub(crate) fn cell(&self) -> &OnceCell<UserRecord> {
        &self.resolved
    }
}
