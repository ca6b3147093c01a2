//! Predecessor registry lock migration.
//!
//! Lock files written against the predecessor registry name providers as
//! `registry.terraform.io/<namespace>/<type>`. Unless the configuration
//! still names that hostname explicitly, such entries are moved to the
//! default registry at the same version, with hashes fetched fresh from the
//! current source. The artifacts differ between registries, so predecessor
//! hashes are never carried over.

use std::collections::BTreeSet;
use std::fmt;

use provman_schema::{DEFAULT_REGISTRY_HOST, Platform, ProviderAddress, Version};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::lockfile::{LockEntry, Locks};
use crate::sources::Source;

/// What happened to one predecessor entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationNote {
    /// The entry now lives under the default registry.
    Migrated {
        from: ProviderAddress,
        to: ProviderAddress,
        version: Version,
    },
    /// The configuration names the predecessor address, so it was kept.
    RetainedExplicit {
        provider: ProviderAddress,
        would_become: ProviderAddress,
    },
    /// The default registry does not publish this version; the entry was dropped.
    NoEquivalentRelease {
        from: ProviderAddress,
        to: ProviderAddress,
        version: Version,
    },
}

impl fmt::Display for MigrationNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Migrated { from, to, version } => {
                write!(f, "migrated {from} {version} to {to}")
            }
            Self::RetainedExplicit {
                provider,
                would_become,
            } => write!(
                f,
                "kept {provider}: the configuration references it explicitly (it would otherwise become {would_become})"
            ),
            Self::NoEquivalentRelease { from, to, version } => write!(
                f,
                "dropped {from} {version}: {to} has no release {version}; a new version will be selected"
            ),
        }
    }
}

/// Rewrites predecessor-registry lock entries.
#[derive(Debug)]
pub struct PredecessorMigrator<'a, S: ?Sized> {
    source: &'a S,
    platform: &'a Platform,
}

impl<'a, S: Source + ?Sized> PredecessorMigrator<'a, S> {
    pub fn new(source: &'a S, platform: &'a Platform) -> Self {
        Self { source, platform }
    }

    /// Migrate every predecessor entry of `locks` in place.
    ///
    /// Entries whose address appears in `explicit` are left alone.
    ///
    /// # Errors
    ///
    /// Propagates source errors other than [`Error::NotFound`], which means
    /// the default registry has no equivalent release.
    pub async fn migrate(
        &self,
        locks: &mut Locks,
        explicit: &BTreeSet<ProviderAddress>,
    ) -> Result<Vec<MigrationNote>> {
        let predecessors: Vec<LockEntry> = locks
            .all_providers()
            .values()
            .filter(|e| e.provider().is_predecessor_registry())
            .cloned()
            .collect();

        let mut notes = Vec::new();
        for entry in predecessors {
            let from = entry.provider().clone();
            let to = from
                .with_hostname(DEFAULT_REGISTRY_HOST)
                .map_err(|e| Error::Config(e.to_string()))?;

            if explicit.contains(&from) {
                debug!(provider = %from, "keeping explicitly referenced predecessor entry");
                notes.push(MigrationNote::RetainedExplicit {
                    provider: from,
                    would_become: to,
                });
                continue;
            }

            locks.remove_provider(&from);
            if locks.provider(&to).is_some() {
                debug!(provider = %from, current = %to, "current entry already present, dropping predecessor");
                continue;
            }

            let version = entry.version().clone();
            match self.equivalent_release(&to, &version).await? {
                Some(hashes) => {
                    locks.set_provider(LockEntry::new(
                        to.clone(),
                        version.clone(),
                        entry.constraints().cloned(),
                        hashes,
                    ));
                    info!(%from, %to, %version, "migrated lock entry");
                    notes.push(MigrationNote::Migrated { from, to, version });
                }
                None => {
                    info!(%from, %to, %version, "no equivalent release, dropping lock entry");
                    notes.push(MigrationNote::NoEquivalentRelease { from, to, version });
                }
            }
        }
        Ok(notes)
    }

    /// Hashes of `provider` `version` on the current source, if published.
    async fn equivalent_release(
        &self,
        provider: &ProviderAddress,
        version: &Version,
    ) -> Result<Option<BTreeSet<provman_schema::Hash>>> {
        let versions = match self.source.list_versions(provider).await {
            Ok(versions) => versions,
            Err(Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !versions.contains(version) {
            return Ok(None);
        }
        match self.source.package_meta(provider, version, self.platform).await {
            Ok(meta) => Ok(Some(meta.declared_hashes)),
            Err(Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{PackageLocation, PackageMeta};
    use async_trait::async_trait;
    use provman_schema::Hash;
    use std::path::PathBuf;

    /// Publishes `random` 3.6.0 only, with one fixed hash.
    struct CurrentRegistry;

    #[async_trait]
    impl Source for CurrentRegistry {
        async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>> {
            if provider.type_name() == "random" && provider.is_default_registry() {
                Ok(vec!["3.6.0".parse().unwrap()])
            } else {
                Err(Error::not_found(provider, "unknown"))
            }
        }

        async fn package_meta(
            &self,
            provider: &ProviderAddress,
            version: &Version,
            platform: &Platform,
        ) -> Result<PackageMeta> {
            Ok(PackageMeta {
                provider: provider.clone(),
                version: version.clone(),
                platform: platform.clone(),
                filename: String::new(),
                location: PackageLocation::LocalDir(PathBuf::from("/nonexistent")),
                declared_hashes: BTreeSet::from([Hash::parse("zh:current").unwrap()]),
            })
        }

        fn describe(&self) -> String {
            "stub".to_string()
        }
    }

    fn addr(s: &str) -> ProviderAddress {
        s.parse().unwrap()
    }

    fn predecessor_locks(type_name: &str, version: &str) -> Locks {
        let mut locks = Locks::new();
        locks.record_selection(
            &addr(&format!("registry.terraform.io/hashicorp/{type_name}")),
            &version.parse().unwrap(),
            None,
            [Hash::parse("zh:predecessor").unwrap()],
        );
        locks
    }

    #[tokio::test]
    async fn migrates_with_fresh_hashes() {
        let platform: Platform = "linux_amd64".parse().unwrap();
        let mut locks = predecessor_locks("random", "3.6.0");

        let notes = PredecessorMigrator::new(&CurrentRegistry, &platform)
            .migrate(&mut locks, &BTreeSet::new())
            .await
            .unwrap();

        assert_eq!(notes.len(), 1);
        assert!(matches!(notes[0], MigrationNote::Migrated { .. }));
        assert_eq!(locks.len(), 1);
        let entry = locks.provider(&addr("hashicorp/random")).unwrap();
        assert_eq!(entry.version().to_string(), "3.6.0");
        assert_eq!(
            entry.hashes(),
            &BTreeSet::from([Hash::parse("zh:current").unwrap()])
        );
    }

    #[tokio::test]
    async fn explicit_reference_is_retained() {
        let platform: Platform = "linux_amd64".parse().unwrap();
        let mut locks = predecessor_locks("random", "3.6.0");
        let before = locks.clone();

        let explicit = BTreeSet::from([addr("registry.terraform.io/hashicorp/random")]);
        let notes = PredecessorMigrator::new(&CurrentRegistry, &platform)
            .migrate(&mut locks, &explicit)
            .await
            .unwrap();

        assert!(matches!(notes[0], MigrationNote::RetainedExplicit { .. }));
        assert_eq!(locks, before);
    }

    #[tokio::test]
    async fn missing_release_drops_entry() {
        let platform: Platform = "linux_amd64".parse().unwrap();
        for (type_name, version) in [("random", "3.5.0"), ("aws", "5.0.0")] {
            let mut locks = predecessor_locks(type_name, version);
            let notes = PredecessorMigrator::new(&CurrentRegistry, &platform)
                .migrate(&mut locks, &BTreeSet::new())
                .await
                .unwrap();
            assert!(matches!(notes[0], MigrationNote::NoEquivalentRelease { .. }));
            assert!(locks.is_empty());
        }
    }

    #[tokio::test]
    async fn current_entries_are_untouched() {
        let platform: Platform = "linux_amd64".parse().unwrap();
        let mut locks = Locks::new();
        locks.record_selection(&addr("hashicorp/random"), &"3.6.0".parse().unwrap(), None, []);
        let before = locks.clone();

        let notes = PredecessorMigrator::new(&CurrentRegistry, &platform)
            .migrate(&mut locks, &BTreeSet::new())
            .await
            .unwrap();
        assert!(notes.is_empty());
        assert_eq!(locks, before);
    }
}
