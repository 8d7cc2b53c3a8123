//! Well-known system identities for non-human callers.

use crate::types::{normalize_login, PatientId};

const SYSTEM_LOGIN_SUFFIX: &str = "-noreply@simplereport.gov";

/// A fixed system identity. Its row is created lazily on first use and never
/// holds organization grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemIdentity {
    PatientSelfRegistration,
    AccountRequest,
    Webhook,
    /// Actor recorded for audit entries without an identified caller.
    Anonymous,
}

impl SystemIdentity {
    pub const ALL: [SystemIdentity; 4] = [
        Self::PatientSelfRegistration,
        Self::AccountRequest,
        Self::Webhook,
        Self::Anonymous,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PatientSelfRegistration => "patient-self-registration",
            Self::AccountRequest => "account-request",
            Self::Webhook => "webhook",
            Self::Anonymous => "anonymous-user",
        }
    }

    /// Constant login identifier the row is keyed by.
    pub fn login_email(&self) -> &'static str {
        match self {
            Self::PatientSelfRegistration => "patient-self-registration-noreply@simplereport.gov",
            Self::AccountRequest => "account-request-noreply@simplereport.gov",
            Self::Webhook => "webhook-noreply@simplereport.gov",
            Self::Anonymous => "anonymous-user-noreply@simplereport.gov",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PatientSelfRegistration => "Patient Self-Registration User",
            Self::AccountRequest => "Account Request Self-Registration User",
            Self::Webhook => "Webhook User",
            Self::Anonymous => "Anonymous User",
        }
    }

    pub fn from_login(login_email: &str) -> Option<Self> {
        let login = normalize_login(login_email);
        Self::ALL.into_iter().find(|s| s.login_email() == login)
    }

    pub fn is_system_login(login_email: &str) -> bool {
        Self::from_login(login_email).is_some()
    }
}

/// Synthetic login of the identity a patient link resolves to. The patient
/// record itself is not a login identity.
pub fn patient_login(patient_id: &PatientId) -> String {
    normalize_login(&format!("{}{}", patient_id, SYSTEM_LOGIN_SUFFIX))
}
