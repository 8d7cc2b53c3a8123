//! Paged, filtered view over an organization's roster.

use serde::Serialize;

use crate::db::UserRecord;
use crate::error::{IdentityError, IdentityResult};
use crate::identity::SystemIdentity;
use crate::idp::UserStatus;

/// Roster entry with the provider-side account status, when known.
#[derive(Debug, Clone, Serialize)]
pub struct UserWithStatus {
    pub user: UserRecord,
    pub status: Option<UserStatus>,
}

/// One page of a directory search.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryPage {
    pub users: Vec<UserWithStatus>,
    /// Page actually returned; differs from the requested page when the
    /// request was out of range.
    pub page: usize,
    pub page_size: usize,
    /// Matches across all pages.
    pub total_filtered: usize,
    /// Roster size before filtering.
    pub total_unfiltered: usize,
}

/// Split a query into lower-cased tokens. Commas count as whitespace.
pub fn query_tokens(query: &str) -> Vec<String> {
    query
        .replace(',', " ")
        .split_whitespace()
        .map(str::to_lowercase)
        .collect()
}

fn matches(user: &UserRecord, tokens: &[String]) -> bool {
    let full_name = user.name.full_name().to_lowercase();
    tokens.iter().all(|t| full_name.contains(t.as_str()))
}

/// Filter and page a materialized roster.
///
/// A user matches when every query token is a substring of their lower-cased
/// full name. A filtered result that fits in one page, or a page starting
/// past the end, yields page 0. A page starting exactly at the end is empty.
/// System identities are never listed.
pub fn search_users(
    roster: Vec<UserWithStatus>,
    page: usize,
    page_size: usize,
    query: Option<&str>,
) -> IdentityResult<DirectoryPage> {
    if page_size == 0 {
        return Err(IdentityError::InvalidArgument(
            "page size must be positive".to_string(),
        ));
    }

    let roster: Vec<UserWithStatus> = roster
        .into_iter()
        .filter(|u| !SystemIdentity::is_system_login(&u.user.login_email))
        .collect();
    let total_unfiltered = roster.len();

    let tokens = query.map(query_tokens).unwrap_or_default();
    let filtered: Vec<UserWithStatus> = if tokens.is_empty() {
        roster
    } else {
        roster.into_iter().filter(|u| matches(&u.user, &tokens)).collect()
    };
    let total_filtered = filtered.len();

    let mut page = page;
    let mut start = page.saturating_mul(page_size);
    if total_filtered <= page_size || start > total_filtered {
        page = 0;
        start = 0;
    }

    let users = filtered.into_iter().skip(start).take(page_size).collect();

    Ok(DirectoryPage {
        users,
        page,
        page_size,
        total_filtered,
        total_unfiltered,
    })
}
