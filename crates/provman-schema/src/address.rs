//! Provider source addresses.
//!
//! A provider is identified by `hostname/namespace/type`. Configuration may
//! abbreviate this to `namespace/type` (default registry) or just `type`
//! (default registry, legacy `hashicorp` namespace). Addresses are
//! lowercased on parse so that comparisons are case-insensitive.
//!
//! # Example
//!
//! ```
//! use provman_schema::ProviderAddress;
//!
//! let addr: ProviderAddress = "hashicorp/aws".parse().unwrap();
//! assert_eq!(addr.to_string(), "registry.opentofu.org/hashicorp/aws");
//! assert_eq!(addr.for_display(), "hashicorp/aws");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Registry hostname implied when an address omits it.
pub const DEFAULT_REGISTRY_HOST: &str = "registry.opentofu.org";

/// Hostname of the registry this project's packages were forked from.
pub const PREDECESSOR_REGISTRY_HOST: &str = "registry.terraform.io";

/// Namespace implied when an address names only a type.
pub const LEGACY_NAMESPACE: &str = "hashicorp";

/// Fully-qualified provider address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProviderAddress {
    hostname: String,
    namespace: String,
    type_name: String,
}

impl ProviderAddress {
    /// Build an address from its three segments, validating and lowercasing each.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Address`] if any segment is malformed.
    pub fn new(hostname: &str, namespace: &str, type_name: &str) -> Result<Self, ParseError> {
        let input = format!("{hostname}/{namespace}/{type_name}");
        let err = |reason: &str| ParseError::Address {
            input: input.clone(),
            reason: reason.to_string(),
        };

        let hostname = hostname.to_ascii_lowercase();
        let namespace = namespace.to_ascii_lowercase();
        let type_name = type_name.to_ascii_lowercase();

        if !valid_hostname(&hostname) {
            return Err(err("hostname must be a DNS name with an optional port"));
        }
        if !valid_segment(&namespace) {
            return Err(err(
                "namespace must be letters, digits and dashes, not starting or ending with a dash",
            ));
        }
        if !valid_segment(&type_name) {
            return Err(err(
                "type must be letters, digits and dashes, not starting or ending with a dash",
            ));
        }

        Ok(Self {
            hostname,
            namespace,
            type_name,
        })
    }

    /// Registry hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Namespace (organisation) segment.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Provider type, e.g. `aws`.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// True when the address lives on [`DEFAULT_REGISTRY_HOST`].
    pub fn is_default_registry(&self) -> bool {
        self.hostname == DEFAULT_REGISTRY_HOST
    }

    /// True when the address lives on [`PREDECESSOR_REGISTRY_HOST`].
    pub fn is_predecessor_registry(&self) -> bool {
        self.hostname == PREDECESSOR_REGISTRY_HOST
    }

    /// Same namespace and type on another registry host.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Address`] if `hostname` is not a valid hostname.
    pub fn with_hostname(&self, hostname: &str) -> Result<Self, ParseError> {
        Self::new(hostname, &self.namespace, &self.type_name)
    }

    /// Short form for messages: the hostname is omitted for the default registry.
    pub fn for_display(&self) -> String {
        if self.is_default_registry() {
            format!("{}/{}", self.namespace, self.type_name)
        } else {
            self.to_string()
        }
    }

    /// Name prefix of the plugin executable inside a package.
    pub fn executable_prefix(&self) -> String {
        format!("terraform-provider-{}", self.type_name)
    }
}

fn valid_segment(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && !s.ends_with('-')
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn valid_hostname(s: &str) -> bool {
    let (host, port) = match s.split_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (s, None),
    };
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) || port.parse::<u16>().is_err()
        {
            return false;
        }
    }
    !host.is_empty()
        && host.split('.').all(|label| {
            !label.is_empty()
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        })
}

impl fmt::Display for ProviderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.hostname, self.namespace, self.type_name)
    }
}

impl FromStr for ProviderAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('/').collect();
        match parts.as_slice() {
            [type_name] => Self::new(DEFAULT_REGISTRY_HOST, LEGACY_NAMESPACE, type_name),
            [namespace, type_name] => Self::new(DEFAULT_REGISTRY_HOST, namespace, type_name),
            [hostname, namespace, type_name] => Self::new(hostname, namespace, type_name),
            _ => Err(ParseError::Address {
                input: s.to_string(),
                reason: "expected at most three slash-separated segments".to_string(),
            }),
        }
    }
}

impl TryFrom<String> for ProviderAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ProviderAddress> for String {
    fn from(addr: ProviderAddress) -> Self {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbreviations_expand() {
        let full: ProviderAddress = "registry.opentofu.org/hashicorp/aws".parse().unwrap();
        let two: ProviderAddress = "hashicorp/aws".parse().unwrap();
        let one: ProviderAddress = "aws".parse().unwrap();
        assert_eq!(full, two);
        assert_eq!(full, one);
    }

    #[test]
    fn addresses_are_case_normalized() {
        let a: ProviderAddress = "Registry.OpenTofu.org/HashiCorp/AWS".parse().unwrap();
        assert_eq!(a.to_string(), "registry.opentofu.org/hashicorp/aws");
    }

    #[test]
    fn hostname_distinguishes_providers() {
        let current: ProviderAddress = "hashicorp/aws".parse().unwrap();
        let old: ProviderAddress = "registry.terraform.io/hashicorp/aws".parse().unwrap();
        assert_ne!(current, old);
        assert!(old.is_predecessor_registry());
        assert_eq!(old.with_hostname(DEFAULT_REGISTRY_HOST).unwrap(), current);
    }

    #[test]
    fn display_omits_default_host() {
        let a: ProviderAddress = "example.com:8443/acme/widget".parse().unwrap();
        assert_eq!(a.for_display(), "example.com:8443/acme/widget");
        let b: ProviderAddress = "acme/widget".parse().unwrap();
        assert_eq!(b.for_display(), "acme/widget");
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "",
            "a/b/c/d",
            "-bad/aws",
            "hashicorp/aws-",
            "hashicorp/a_ws",
            "bad host/hashicorp/aws",
            "example.com:port/a/b",
            "example..com/a/b",
        ] {
            assert!(bad.parse::<ProviderAddress>().is_err(), "{bad} should fail");
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let a: ProviderAddress = "hashicorp/null".parse().unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"registry.opentofu.org/hashicorp/null\"");
        let back: ProviderAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, a);
    }
}
