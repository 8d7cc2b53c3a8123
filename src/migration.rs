//! Migration phase between the external identity provider and the internal
//! authorization store.
//!
//! The phase is polled on every call and turned into an [`AuthoritySource`]
//! that is passed explicitly to the code that needs it. Nothing caches the
//! value, so the phase may flip between any two calls.

use std::sync::atomic::{AtomicBool, Ordering};

/// Source of truth for organization roles and facility grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthoritySource {
    /// Legacy mode: provider claims win and the store is synced to them.
    ExternalProvider,
    /// Migrated mode: the internal store wins; provider claims only supply
    /// site-admin and account status.
    InternalStore,
}

impl AuthoritySource {
    pub fn from_migrated(migrated: bool) -> Self {
        if migrated {
            Self::InternalStore
        } else {
            Self::ExternalProvider
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExternalProvider => "external_provider",
            Self::InternalStore => "internal_store",
        }
    }
}

/// Reports whether the migration to the internal store is active.
pub trait MigrationPhase: Send + Sync {
    fn is_migrated(&self) -> bool;

    /// Snapshot the phase as an authority source for one call.
    fn authority(&self) -> AuthoritySource {
        AuthoritySource::from_migrated(self.is_migrated())
    }
}

/// Process-local migration flag that the embedding system can flip at runtime.
#[derive(Debug, Default)]
pub struct MigrationFlag {
    migrated: AtomicBool,
}

impl MigrationFlag {
    pub fn new(migrated: bool) -> Self {
        Self {
            migrated: AtomicBool::new(migrated),
        }
    }

    pub fn set_migrated(&self, migrated: bool) {
        self.migrated.store(migrated, Ordering::SeqCst);
    }
}

impl MigrationPhase for MigrationFlag {
    fn is_migrated(&self) -> bool {
        self.migrated.load(Ordering::SeqCst)
    }
}
