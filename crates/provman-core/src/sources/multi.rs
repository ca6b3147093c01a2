//! Ordered composition of sources with include/exclude patterns.

use std::collections::BTreeSet;

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use provman_schema::{DEFAULT_REGISTRY_HOST, Platform, ProviderAddress, Version};
use tracing::debug;

use super::{PackageMeta, ProviderSource, Source};
use crate::error::{Error, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// One source plus the providers it may answer for.
#[derive(Debug)]
pub struct MultiSourceSelector {
    source: ProviderSource,
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl MultiSourceSelector {
    /// Wrap `source` with provider-address patterns.
    ///
    /// Patterns are `hostname/namespace/type` with `*` wildcards per segment.
    /// `namespace/type` implies the default registry host and a lone `*`
    /// matches everything. An empty include list includes everything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for patterns with too many segments or
    /// invalid glob syntax.
    pub fn new(source: ProviderSource, include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            source,
            include: compile_patterns(include)?,
            exclude: compile_patterns(exclude)?,
        })
    }

    /// Whether this selector's source may be asked about `provider`.
    pub fn can_handle(&self, provider: &ProviderAddress) -> bool {
        let addr = provider.to_string();
        let included = self.include.is_empty()
            || self
                .include
                .iter()
                .any(|p| p.matches_with(&addr, MATCH_OPTIONS));
        included
            && !self
                .exclude
                .iter()
                .any(|p| p.matches_with(&addr, MATCH_OPTIONS))
    }

    /// The wrapped source.
    pub fn source(&self) -> &ProviderSource {
        &self.source
    }
}

fn compile_patterns(raw: &[String]) -> Result<Vec<Pattern>> {
    raw.iter()
        .map(|p| {
            let segments: Vec<&str> = p.split('/').collect();
            let full = match segments.as_slice() {
                ["*"] => "*/*/*".to_string(),
                [_, _] => format!("{DEFAULT_REGISTRY_HOST}/{}", p.to_ascii_lowercase()),
                [_, _, _] => p.to_ascii_lowercase(),
                _ => {
                    return Err(Error::Config(format!(
                        "invalid provider pattern {p:?}: expected hostname/namespace/type"
                    )));
                }
            };
            Pattern::new(&full)
                .map_err(|e| Error::Config(format!("invalid provider pattern {p:?}: {e}")))
        })
        .collect()
}

/// Sources tried in order; resolution-layer failures fall through.
#[derive(Debug)]
pub struct MultiSource {
    selectors: Vec<MultiSourceSelector>,
}

impl MultiSource {
    pub fn new(selectors: Vec<MultiSourceSelector>) -> Self {
        Self { selectors }
    }

    /// Number of configured selectors.
    pub fn len(&self) -> usize {
        self.selectors.len()
    }

    /// True when no sources are configured.
    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    fn eligible<'a>(
        &'a self,
        provider: &'a ProviderAddress,
    ) -> impl Iterator<Item = &'a MultiSourceSelector> + 'a {
        self.selectors.iter().filter(move |s| s.can_handle(provider))
    }

    fn no_source(provider: &ProviderAddress) -> Error {
        Error::not_found(
            provider,
            "no configured installation source may provide this provider",
        )
    }
}

#[async_trait]
impl Source for MultiSource {
    async fn list_versions(&self, provider: &ProviderAddress) -> Result<Vec<Version>> {
        let mut versions = BTreeSet::new();
        let mut answered = false;
        let mut last_err = None;

        for selector in self.eligible(provider) {
            match selector.source.list_versions(provider).await {
                Ok(found) => {
                    answered = true;
                    versions.extend(found);
                }
                Err(e) if e.falls_through() => {
                    debug!(source = %selector.source.describe(), %provider, error = %e, "source could not list versions");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if answered {
            Ok(versions.into_iter().collect())
        } else {
            Err(last_err.unwrap_or_else(|| Self::no_source(provider)))
        }
    }

    async fn package_meta(
        &self,
        provider: &ProviderAddress,
        version: &Version,
        platform: &Platform,
    ) -> Result<PackageMeta> {
        let mut last_err = None;

        for selector in self.eligible(provider) {
            match selector
                .source
                .package_meta(provider, version, platform)
                .await
            {
                Ok(meta) => return Ok(meta),
                Err(e) if e.falls_through() => {
                    debug!(source = %selector.source.describe(), %provider, %version, error = %e, "falling through to next source");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Self::no_source(provider)))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self
            .selectors
            .iter()
            .map(|s| s.source.describe())
            .collect();
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::{FilesystemMirrorSource, VendoredSource};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn addr(s: &str) -> ProviderAddress {
        s.parse().unwrap()
    }

    fn vendored(provider: &str, version: &str, path: &Path) -> ProviderSource {
        ProviderSource::Vendored(VendoredSource::new(
            addr(provider),
            version.parse().unwrap(),
            path.to_path_buf(),
        ))
    }

    fn selector(source: ProviderSource, include: &[&str], exclude: &[&str]) -> MultiSourceSelector {
        let include: Vec<String> = include.iter().map(ToString::to_string).collect();
        let exclude: Vec<String> = exclude.iter().map(ToString::to_string).collect();
        MultiSourceSelector::new(source, &include, &exclude).unwrap()
    }

    #[test]
    fn patterns_match_per_segment() {
        let tmp = TempDir::new().unwrap();
        let s = selector(
            ProviderSource::FilesystemMirror(FilesystemMirrorSource::new(tmp.path().into())),
            &["hashicorp/*", "example.com/*/*"],
            &["hashicorp/aws"],
        );
        assert!(s.can_handle(&addr("hashicorp/null")));
        assert!(s.can_handle(&addr("example.com/acme/thing")));
        assert!(!s.can_handle(&addr("hashicorp/aws")));
        assert!(!s.can_handle(&addr("registry.terraform.io/hashicorp/null")));
        assert!(!s.can_handle(&addr("acme/thing")));
    }

    #[test]
    fn empty_include_means_everything() {
        let tmp = TempDir::new().unwrap();
        let s = selector(
            ProviderSource::FilesystemMirror(FilesystemMirrorSource::new(tmp.path().into())),
            &[],
            &["*"],
        );
        assert!(!s.can_handle(&addr("hashicorp/null")));

        let s = selector(
            ProviderSource::FilesystemMirror(FilesystemMirrorSource::new(tmp.path().into())),
            &[],
            &[],
        );
        assert!(s.can_handle(&addr("example.com/a/b")));
    }

    #[tokio::test]
    async fn not_found_falls_through_to_next_source() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("pkg");
        fs::create_dir_all(&pkg).unwrap();

        let multi = MultiSource::new(vec![
            selector(vendored("acme/other", "1.0.0", &pkg), &[], &[]),
            selector(vendored("hashicorp/null", "3.2.0", &pkg), &[], &[]),
        ]);

        let null = addr("hashicorp/null");
        let versions = multi.list_versions(&null).await.unwrap();
        assert_eq!(versions, vec![Version::parse("3.2.0").unwrap()]);

        let meta = multi
            .package_meta(&null, &versions[0], &"linux_amd64".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(meta.provider, null);
    }

    #[tokio::test]
    async fn versions_are_the_union_of_answering_sources() {
        let tmp = TempDir::new().unwrap();
        let pkg = tmp.path().join("pkg");
        fs::create_dir_all(&pkg).unwrap();

        let multi = MultiSource::new(vec![
            selector(vendored("hashicorp/null", "3.2.0", &pkg), &[], &[]),
            selector(vendored("hashicorp/null", "3.1.0", &pkg), &[], &[]),
            selector(vendored("hashicorp/null", "3.2.0", &pkg), &[], &[]),
        ]);
        let versions = multi.list_versions(&addr("hashicorp/null")).await.unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn last_error_is_reported_when_all_sources_fail() {
        let tmp = TempDir::new().unwrap();
        let multi = MultiSource::new(vec![selector(
            vendored("acme/other", "1.0.0", tmp.path()),
            &[],
            &[],
        )]);
        let err = multi.list_versions(&addr("hashicorp/null")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn no_eligible_source_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let multi = MultiSource::new(vec![selector(
            vendored("hashicorp/null", "3.2.0", tmp.path()),
            &["example.com/*/*"],
            &[],
        )]);
        let err = multi.list_versions(&addr("hashicorp/null")).await.unwrap_err();
        assert!(err.to_string().contains("no configured installation source"));
    }
}
