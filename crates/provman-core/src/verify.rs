//! Pre-execution integrity checks.
//!
//! Before a provider may run, its lock entry must satisfy the configured
//! constraints, its package must be in the cache for the current platform,
//! and the package contents must hash to one of the locked hashes. Each
//! failure is a distinct [`Error`] carrying a remediation command.

use provman_schema::{ConstraintSet, Hash, ProviderAddress};
use tracing::debug;

use crate::cache::{CacheDir, CachedPackage};
use crate::error::{Error, Result};
use crate::io::blocking;
use crate::lockfile::{LockEntry, Locks};
use crate::manifest::Requirements;

/// Checks cached packages against a lock file.
#[derive(Debug, Clone, Copy)]
pub struct IntegrityVerifier<'a> {
    locks: &'a Locks,
    cache: &'a CacheDir,
}

impl<'a> IntegrityVerifier<'a> {
    pub fn new(locks: &'a Locks, cache: &'a CacheDir) -> Self {
        Self { locks, cache }
    }

    /// Verify every requirement, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// See [`IntegrityVerifier::verify_provider`].
    pub async fn verify(&self, reqs: &Requirements) -> Result<Vec<CachedPackage>> {
        let mut verified = Vec::with_capacity(reqs.len());
        for (provider, constraints) in reqs {
            verified.push(self.verify_provider(provider, constraints).await?);
        }
        Ok(verified)
    }

    /// Verify every requirement and report each outcome.
    pub async fn verify_each(
        &self,
        reqs: &Requirements,
    ) -> Vec<(ProviderAddress, Result<CachedPackage>)> {
        let mut outcomes = Vec::with_capacity(reqs.len());
        for (provider, constraints) in reqs {
            let outcome = self.verify_provider(provider, constraints).await;
            outcomes.push((provider.clone(), outcome));
        }
        outcomes
    }

    /// Verify one provider.
    ///
    /// # Errors
    ///
    /// - [`Error::NoVersionSelected`] if the lock has no entry
    /// - [`Error::ConstraintMismatch`] if the locked version is not allowed
    /// - [`Error::NotCached`] naming the expected package directory
    /// - [`Error::TamperedPackage`] if the contents match no locked hash
    pub async fn verify_provider(
        &self,
        provider: &ProviderAddress,
        constraints: &ConstraintSet,
    ) -> Result<CachedPackage> {
        let entry = self.locks.check_against_constraints(provider, constraints)?;
        let Some(pkg) = self.cache.provider_version(provider, entry.version()) else {
            return Err(Error::NotCached {
                provider: provider.clone(),
                version: entry.version().clone(),
                platform: self.cache.platform().clone(),
                path: self.cache.package_dir(provider, entry.version()),
            });
        };

        let target = pkg.clone();
        let computed = blocking(move || target.hash()).await?;
        if let Err(detail) = package_matches(entry, &computed) {
            return Err(Error::TamperedPackage {
                provider: provider.clone(),
                version: entry.version().clone(),
                path: pkg.package_dir,
                detail,
            });
        }

        debug!(%provider, version = %entry.version(), hash = %computed, "package verified");
        Ok(pkg)
    }
}

/// Whether a locally computed hash is accepted by a lock entry.
///
/// Only hashes of the computed scheme count. An entry with none of them
/// cannot confirm the package, so it is rejected too.
pub(crate) fn package_matches(entry: &LockEntry, computed: &Hash) -> std::result::Result<(), String> {
    if entry.hashes().is_empty() {
        return Err("the lock file records no hashes for this version".to_string());
    }
    let scheme = computed.scheme();
    let mut candidates = entry.hashes().iter().filter(|h| h.scheme() == scheme).peekable();
    if candidates.peek().is_none() {
        return Err(format!(
            "the lock file records no {} hash for this version, so the package cannot be checked",
            scheme.prefix()
        ));
    }
    if candidates.any(|h| h == computed) {
        Ok(())
    } else {
        Err(format!(
            "the package contents hash to {computed}, which is not one of the locked hashes"
        ))
    }
}
