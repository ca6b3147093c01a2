//! Semantic versions and version constraint sets.
//!
//! Constraint syntax is a comma-separated conjunction of `op version`
//! terms where `op` is one of `=`, `!=`, `>`, `>=`, `<`, `<=` or `~>`. A bare
//! version means `=`. Partial versions (`1.2`) are zero-filled, except that
//! the pessimistic operator uses the given precision to pick its upper bound.
//!
//! A [`ConstraintSet`] is kept sorted and deduplicated, so two sets holding
//! the same terms compare equal no matter how they were written or merged.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use semver::{BuildMetadata, Prerelease};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ParseError;

/// A provider release version.
///
/// Build metadata is kept for display but ignored by comparisons.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(semver::Version);

impl Version {
    /// A release version with no pre-release or build suffix.
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Parse a version, zero-filling missing minor and patch components.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Version`] for anything that is not
    /// `[v]major[.minor[.patch]][-pre][+build]`.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        parse_parts(s)
            .map(|(v, _)| Self(v))
            .map_err(|reason| ParseError::Version {
                input: s.to_string(),
                reason,
            })
    }

    /// True if this version carries a pre-release tag.
    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// Underlying `semver` value.
    pub fn as_semver(&self) -> &semver::Version {
        &self.0
    }

    fn without_build(&self) -> Self {
        let mut v = self.0.clone();
        v.build = BuildMetadata::EMPTY;
        Self(v)
    }
}

/// Split a version string into a `semver::Version` and the number of
/// numeric components that were actually written (1 to 3).
fn parse_parts(input: &str) -> Result<(semver::Version, u8), String> {
    let s = input.trim();
    let s = s.strip_prefix('v').unwrap_or(s);

    let (rest, build) = match s.split_once('+') {
        Some((rest, build)) => (rest, Some(build)),
        None => (s, None),
    };
    let (core, pre) = match rest.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (rest, None),
    };

    let nums: Vec<&str> = core.split('.').collect();
    if nums.len() > 3 {
        return Err("expected at most major.minor.patch".to_string());
    }
    let mut parsed = [0u64; 3];
    for (slot, n) in parsed.iter_mut().zip(&nums) {
        if n.is_empty() || !n.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("{n:?} is not a version number"));
        }
        *slot = n.parse().map_err(|e| format!("{n:?}: {e}"))?;
    }
    let precision: u8 = match nums.len() {
        1 => 1,
        2 => 2,
        _ => 3,
    };

    let pre = match pre {
        Some("") => return Err("empty pre-release tag".to_string()),
        Some(_) if precision < 3 => {
            return Err("a pre-release tag requires major.minor.patch".to_string());
        }
        Some(p) => Prerelease::new(p).map_err(|e| e.to_string())?,
        None => Prerelease::EMPTY,
    };
    let build = match build {
        Some("") => return Err("empty build metadata".to_string()),
        Some(b) => BuildMetadata::new(b).map_err(|e| e.to_string())?,
        None => BuildMetadata::EMPTY,
    };

    let [major, minor, patch] = parsed;
    Ok((
        semver::Version {
            major,
            minor,
            patch,
            pre,
            build,
        },
        precision,
    ))
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.major, self.0.minor, self.0.patch)
            .cmp(&(other.0.major, other.0.minor, other.0.patch))
            .then_with(|| self.0.pre.cmp(&other.0.pre))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.major.hash(state);
        self.0.minor.hash(state);
        self.0.patch.hash(state);
        self.0.pre.as_str().hash(state);
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.to_string()
    }
}

/// Comparison operator of a single constraint term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    /// `=` or a bare version.
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `~>`: at least the given version, below the next release at the
    /// precision it was written with.
    Pessimistic,
}

impl Operator {
    /// Operator token as written in constraint strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Pessimistic => "~>",
        }
    }
}

/// One `op version` term.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Constraint {
    version: Version,
    op: Operator,
    precision: u8,
}

impl Constraint {
    /// Build a term from an operator and a full version.
    pub fn new(op: Operator, version: Version) -> Self {
        Self {
            version: version.without_build(),
            op,
            precision: 3,
        }
    }

    /// The operator.
    pub fn op(&self) -> Operator {
        self.op
    }

    /// The version operand (zero-filled).
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Whether `v` satisfies this term alone, ignoring pre-release eligibility.
    pub fn matches(&self, v: &Version) -> bool {
        match self.op {
            Operator::Eq => v == &self.version,
            Operator::Ne => v != &self.version,
            Operator::Gt => v > &self.version,
            Operator::Ge => v >= &self.version,
            Operator::Lt => v < &self.version,
            Operator::Le => v <= &self.version,
            Operator::Pessimistic => {
                v >= &self.version && self.pessimistic_ceiling().is_none_or(|ceiling| v < &ceiling)
            }
        }
    }

    /// Exclusive upper bound of `~>`; `None` when the bumped component overflows.
    fn pessimistic_ceiling(&self) -> Option<Version> {
        let v = self.version.as_semver();
        if self.precision >= 3 {
            v.minor.checked_add(1).map(|minor| Version::new(v.major, minor, 0))
        } else {
            v.major.checked_add(1).map(|major| Version::new(major, 0, 0))
        }
    }

    /// Lower bound implied by this term: `(version, inclusive)`.
    fn lower(&self) -> Option<(Version, bool)> {
        match self.op {
            Operator::Gt => Some((self.version.clone(), false)),
            Operator::Ge | Operator::Pessimistic => Some((self.version.clone(), true)),
            _ => None,
        }
    }

    /// Upper bound implied by this term: `(version, inclusive)`.
    fn upper(&self) -> Option<(Version, bool)> {
        match self.op {
            Operator::Lt => Some((self.version.clone(), false)),
            Operator::Le => Some((self.version.clone(), true)),
            Operator::Pessimistic => self.pessimistic_ceiling().map(|ceiling| (ceiling, false)),
            _ => None,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Operator::Eq => write!(f, "{}", self.version),
            Operator::Pessimistic if !self.version.is_prerelease() && self.precision < 3 => {
                let v = self.version.as_semver();
                if self.precision == 1 {
                    write!(f, "~> {}", v.major)
                } else {
                    write!(f, "~> {}.{}", v.major, v.minor)
                }
            }
            op => write!(f, "{} {}", op.as_str(), self.version),
        }
    }
}

impl FromStr for Constraint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let term = s.trim();
        let err = |reason: String| ParseError::Constraint {
            input: s.to_string(),
            reason,
        };

        const OPERATORS: [(&str, Operator); 7] = [
            ("~>", Operator::Pessimistic),
            (">=", Operator::Ge),
            ("<=", Operator::Le),
            ("!=", Operator::Ne),
            (">", Operator::Gt),
            ("<", Operator::Lt),
            ("=", Operator::Eq),
        ];
        let (op, rest) = OPERATORS
            .iter()
            .find_map(|(token, op)| term.strip_prefix(token).map(|rest| (*op, rest)))
            .unwrap_or((Operator::Eq, term));

        let rest = rest.trim();
        if rest.is_empty() {
            return Err(err("missing version".to_string()));
        }
        let (version, precision) = parse_parts(rest).map_err(err)?;
        let version = Version(version).without_build();
        let precision = if op == Operator::Pessimistic { precision } else { 3 };
        Ok(Self {
            version,
            op,
            precision,
        })
    }
}

/// A conjunction of constraint terms, kept in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConstraintSet(Vec<Constraint>);

/// The merged constraints provably admit no version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no version can satisfy all of the constraints \"{constraints}\"")]
pub struct Unsatisfiable {
    /// The merged, canonical constraint set.
    pub constraints: ConstraintSet,
}

impl ConstraintSet {
    /// Canonicalize a list of terms.
    pub fn new(terms: impl IntoIterator<Item = Constraint>) -> Self {
        let unique: BTreeSet<Constraint> = terms.into_iter().collect();
        Self(unique.into_iter().collect())
    }

    /// Parse a comma-separated list. An empty or blank string is the empty set.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::Constraint`] for any malformed term.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let terms = s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(Constraint::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(terms))
    }

    /// The set admitting exactly `version`.
    pub fn exact(version: Version) -> Self {
        Self::new([Constraint::new(Operator::Eq, version)])
    }

    /// True if the set has no terms (every release is allowed).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Terms in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
        self.0.iter()
    }

    /// Whether `v` satisfies every term.
    ///
    /// Pre-release versions are only eligible when some term names that
    /// exact version; they never fall into a range by accident.
    pub fn allows(&self, v: &Version) -> bool {
        if v.is_prerelease() && !self.0.iter().any(|c| &c.version == v) {
            return false;
        }
        self.0.iter().all(|c| c.matches(v))
    }

    /// Intersect any number of sets.
    ///
    /// The result is independent of argument order and grouping.
    ///
    /// # Errors
    ///
    /// Returns [`Unsatisfiable`] when the intersection is provably empty:
    /// two different exact pins, an exact pin excluded by another term, or a
    /// lower bound that lies above the upper bound.
    pub fn merge(sets: &[ConstraintSet]) -> Result<ConstraintSet, Unsatisfiable> {
        let merged = Self::new(sets.iter().flat_map(|s| s.0.iter().cloned()));
        if merged.provably_empty() {
            return Err(Unsatisfiable {
                constraints: merged,
            });
        }
        Ok(merged)
    }

    fn provably_empty(&self) -> bool {
        let exacts: BTreeSet<&Version> = self
            .0
            .iter()
            .filter(|c| c.op == Operator::Eq)
            .map(|c| &c.version)
            .collect();
        match exacts.len() {
            0 => {}
            1 => {
                let pin = exacts.into_iter().next();
                return pin.is_some_and(|v| !self.0.iter().all(|c| c.matches(v)));
            }
            _ => return true,
        }

        let lower = self.0.iter().filter_map(Constraint::lower).reduce(|a, b| {
            match a.0.cmp(&b.0) {
                Ordering::Greater => a,
                Ordering::Less => b,
                Ordering::Equal => (a.0, a.1 && b.1),
            }
        });
        let upper = self.0.iter().filter_map(Constraint::upper).reduce(|a, b| {
            match a.0.cmp(&b.0) {
                Ordering::Less => a,
                Ordering::Greater => b,
                Ordering::Equal => (a.0, a.1 && b.1),
            }
        });

        let (Some((lo, lo_inc)), Some((hi, hi_inc))) = (lower, upper) else {
            return false;
        };
        match lo.cmp(&hi) {
            Ordering::Greater => true,
            Ordering::Equal => {
                !(lo_inc && hi_inc)
                    || self
                        .0
                        .iter()
                        .any(|c| c.op == Operator::Ne && c.version == lo)
            }
            Ordering::Less => false,
        }
    }
}

impl fmt::Display for ConstraintSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl FromStr for ConstraintSet {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConstraintSet {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<ConstraintSet> for String {
    fn from(c: ConstraintSet) -> Self {
        c.to_string()
    }
}

/// Highest version in `available` that `constraints` allow.
pub fn select_best(available: &[Version], constraints: &ConstraintSet) -> Option<Version> {
    available
        .iter()
        .filter(|v| constraints.allows(v))
        .max()
        .cloned()
}
