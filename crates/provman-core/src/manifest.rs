//! Project requirements file (`provman.toml`).
//!
//! Declares which providers a working directory needs and the version
//! constraints on each, optionally split across modules:
//!
//! ```toml
//! [required_providers.aws]
//! source = "hashicorp/aws"
//! version = "~> 5.0"
//!
//! [module.network.required_providers.aws]
//! source = "hashicorp/aws"
//! version = ">= 5.10"
//! ```
//!
//! Constraints for the same address are merged across the root and every
//! module. A `source` naming a hostname explicitly (three segments) is an
//! explicit reference; the predecessor migrator keeps such entries.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use provman_schema::{ConstraintSet, ProviderAddress};
use serde::Deserialize;
use tokio::fs;

use crate::error::{Error, Result};

/// Merged constraints per provider.
pub type Requirements = BTreeMap<ProviderAddress, ConstraintSet>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    required_providers: BTreeMap<String, RawRequirement>,
    #[serde(default)]
    module: BTreeMap<String, RawModule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModule {
    #[serde(default)]
    required_providers: BTreeMap<String, RawRequirement>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRequirement {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

/// One declared dependency, as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    /// Module that declared it; `None` for the root.
    pub module: Option<String>,
    pub local_name: String,
    pub provider: ProviderAddress,
    pub constraints: ConstraintSet,
    /// The source named its hostname.
    pub explicit_host: bool,
}

/// Parsed `provman.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectManifest {
    declarations: Vec<Declaration>,
}

impl ProjectManifest {
    /// Load `provman.toml` from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the file is missing or invalid.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::Config(format!(
                    "no requirements file at {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Parse requirements file text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid TOML, addresses or constraints.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawManifest =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;

        let mut declarations = Vec::new();
        for (name, req) in &raw.required_providers {
            declarations.push(declaration(None, name, req)?);
        }
        for (module, body) in &raw.module {
            for (name, req) in &body.required_providers {
                declarations.push(declaration(Some(module), name, req)?);
            }
        }
        Ok(Self { declarations })
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    /// Merge every declaration's constraints per provider address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsatisfiableConstraints`] when the constraints on
    /// one provider provably admit no version.
    pub fn requirements(&self) -> Result<Requirements> {
        let mut grouped: BTreeMap<&ProviderAddress, Vec<ConstraintSet>> = BTreeMap::new();
        for decl in &self.declarations {
            grouped
                .entry(&decl.provider)
                .or_default()
                .push(decl.constraints.clone());
        }
        grouped
            .into_iter()
            .map(|(provider, sets)| {
                ConstraintSet::merge(&sets)
                    .map(|merged| (provider.clone(), merged))
                    .map_err(|e| Error::UnsatisfiableConstraints {
                        provider: provider.clone(),
                        constraints: e.constraints,
                    })
            })
            .collect()
    }

    /// Providers whose source was written with an explicit hostname.
    pub fn explicit_references(&self) -> BTreeSet<ProviderAddress> {
        self.declarations
            .iter()
            .filter(|d| d.explicit_host)
            .map(|d| d.provider.clone())
            .collect()
    }
}

fn declaration(module: Option<&String>, local_name: &str, req: &RawRequirement) -> Result<Declaration> {
    let where_ = module.map_or_else(
        || format!("required_providers.{local_name}"),
        |m| format!("module.{m}.required_providers.{local_name}"),
    );
    let source = req.source.as_deref().unwrap_or(local_name);
    let provider: ProviderAddress = source
        .parse()
        .map_err(|e| Error::Config(format!("{where_}: {e}")))?;
    let constraints = req
        .version
        .as_deref()
        .map(ConstraintSet::parse)
        .transpose()
        .map_err(|e| Error::Config(format!("{where_}: {e}")))?
        .unwrap_or_default();

    Ok(Declaration {
        module: module.cloned(),
        local_name: local_name.to_string(),
        provider,
        constraints,
        explicit_host: source.split('/').count() == 3,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> ProviderAddress {
        s.parse().unwrap()
    }

    #[test]
    fn merges_root_and_module_constraints() {
        let manifest = ProjectManifest::parse(
            r#"
            [required_providers.aws]
            source = "hashicorp/aws"
            version = "~> 5.0"

            [required_providers.null]

            [module.network.required_providers.aws]
            source = "hashicorp/aws"
            version = ">= 5.10"
            "#,
        )
        .unwrap();

        let reqs = manifest.requirements().unwrap();
        assert_eq!(reqs.len(), 2);
        assert_eq!(
            reqs[&addr("hashicorp/aws")],
            ConstraintSet::parse(">= 5.10, ~> 5.0").unwrap()
        );
        assert!(reqs[&addr("hashicorp/null")].is_empty());
        assert!(manifest.explicit_references().is_empty());
    }

    #[test]
    fn explicit_hostnames_are_tracked() {
        let manifest = ProjectManifest::parse(
            r#"
            [required_providers.aws]
            source = "registry.terraform.io/hashicorp/aws"
            "#,
        )
        .unwrap();
        assert_eq!(
            manifest.explicit_references(),
            BTreeSet::from([addr("registry.terraform.io/hashicorp/aws")])
        );
    }

    #[test]
    fn unsatisfiable_merge_is_reported() {
        let manifest = ProjectManifest::parse(
            r#"
            [required_providers.aws]
            version = "1.0.0"

            [module.a.required_providers.aws]
            version = "2.0.0"
            "#,
        )
        .unwrap();
        let err = manifest.requirements().unwrap_err();
        assert!(matches!(err, Error::UnsatisfiableConstraints { .. }));
    }

    #[test]
    fn bad_entries_are_config_errors() {
        for content in [
            "[required_providers.aws]\nsource = \"a/b/c/d\"\n",
            "[required_providers.aws]\nversion = \"~>\"\n",
            "[required_providers.aws]\nunknown = 1\n",
        ] {
            assert!(matches!(
                ProjectManifest::parse(content),
                Err(Error::Config(_))
            ));
        }
    }

    #[tokio::test]
    async fn missing_file_is_config_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = ProjectManifest::load(&tmp.path().join("provman.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
