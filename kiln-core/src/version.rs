//! Semantic template versions and constraint evaluation.
//!
//! Versions are strict three-component `major.minor.patch` values with a
//! total lexicographic order. Constraints pair a version with an operator;
//! operator dispatch goes through a single lookup table of pure comparison
//! functions so adding an operator means adding one row.

use crate::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Operators accepted in dependency version constraints.
pub const VALID_OPERATORS: &str = "=, ==, >, >=, <, <=, ~>";

/// Semantic version of a template.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct VersionInfo {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl VersionInfo {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Next major version. Minor and patch reset to zero.
    #[must_use]
    pub fn increment_major(self) -> Self {
        Self { major: self.major + 1, minor: 0, patch: 0 }
    }

    /// Next minor version. Patch resets to zero.
    #[must_use]
    pub fn increment_minor(self) -> Self {
        Self { minor: self.minor + 1, patch: 0, ..self }
    }

    /// Next patch version.
    #[must_use]
    pub fn increment_patch(self) -> Self {
        Self { patch: self.patch + 1, ..self }
    }

    /// Increment the named component (`major`, `minor` or `patch`).
    pub fn increment(self, component: &str) -> Result<Self> {
        match component {
            "major" => Ok(self.increment_major()),
            "minor" => Ok(self.increment_minor()),
            "patch" => Ok(self.increment_patch()),
            other => Err(BuildError::validation(format!("invalid version component: {other}"))
                .with_context("component", other)
                .with_context("valid_components", "major, minor, patch")),
        }
    }
}

impl fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for VersionInfo {
    type Err = BuildError;

    fn from_str(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split('.').collect();
        if parts.len() != 3 {
            return Err(BuildError::validation(format!(
                "invalid version format: {raw} (expected x.y.z)"
            ))
            .with_context("version", raw));
        }

        let component = |part: &str, name: &str| -> Result<u64> {
            part.parse::<u64>().map_err(|_| {
                BuildError::validation(format!("invalid {name} version: {part}"))
                    .with_context("version", raw)
            })
        };

        Ok(Self {
            major: component(parts[0], "major")?,
            minor: component(parts[1], "minor")?,
            patch: component(parts[2], "patch")?,
        })
    }
}

/// Comparison operator of a version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    /// All three components equal (`=` or `==`).
    Exact,
    /// Greater than or equal (`>=`). The default when none is declared.
    GreaterEq,
    /// Strictly greater (`>`).
    Greater,
    /// Less than or equal (`<=`).
    LessEq,
    /// Strictly less (`<`).
    Less,
    /// Same major line, at or above the required minor.patch (`~>`).
    /// Unbounded upward within the major line.
    Compatible,
}

type Evaluator = fn(VersionInfo, VersionInfo) -> bool;

fn exact(actual: VersionInfo, required: VersionInfo) -> bool {
    actual == required
}

fn greater_eq(actual: VersionInfo, required: VersionInfo) -> bool {
    actual >= required
}

fn greater(actual: VersionInfo, required: VersionInfo) -> bool {
    actual > required
}

fn less_eq(actual: VersionInfo, required: VersionInfo) -> bool {
    actual <= required
}

fn less(actual: VersionInfo, required: VersionInfo) -> bool {
    actual < required
}

fn compatible(actual: VersionInfo, required: VersionInfo) -> bool {
    actual.major == required.major
        && (actual.minor > required.minor
            || (actual.minor == required.minor && actual.patch >= required.patch))
}

/// Operator dispatch table. One row per operator, no dynamic dispatch.
const EVALUATORS: &[(ConstraintOp, Evaluator)] = &[
    (ConstraintOp::Exact, exact),
    (ConstraintOp::GreaterEq, greater_eq),
    (ConstraintOp::Greater, greater),
    (ConstraintOp::LessEq, less_eq),
    (ConstraintOp::Less, less),
    (ConstraintOp::Compatible, compatible),
];

impl ConstraintOp {
    fn evaluator(self) -> Evaluator {
        EVALUATORS
            .iter()
            .find(|(op, _)| *op == self)
            .map(|(_, eval)| *eval)
            .expect("every operator has a table entry")
    }

    /// Whether `actual` satisfies this operator against `required`.
    pub fn satisfied_by(self, actual: VersionInfo, required: VersionInfo) -> bool {
        self.evaluator()(actual, required)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "=",
            Self::GreaterEq => ">=",
            Self::Greater => ">",
            Self::LessEq => "<=",
            Self::Less => "<",
            Self::Compatible => "~>",
        }
    }
}

impl fmt::Display for ConstraintOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConstraintOp {
    type Err = BuildError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "=" | "==" => Ok(Self::Exact),
            ">=" => Ok(Self::GreaterEq),
            ">" => Ok(Self::Greater),
            "<=" => Ok(Self::LessEq),
            "<" => Ok(Self::Less),
            "~>" => Ok(Self::Compatible),
            other => Err(BuildError::validation(format!("invalid version operator: {other}"))
                .with_context("operator", other)
                .with_context("valid_operators", VALID_OPERATORS)),
        }
    }
}

/// Check whether `version` satisfies `constraint` under `operator`.
///
/// A missing or empty operator defaults to `>=`. Either string failing to
/// parse is a validation error.
pub fn check_constraint(version: &str, constraint: &str, operator: Option<&str>) -> Result<bool> {
    let actual: VersionInfo = version.parse()?;
    let required: VersionInfo = constraint.parse()?;
    let op = match operator {
        Some(raw) if !raw.is_empty() => raw.parse()?,
        _ => ConstraintOp::GreaterEq,
    };
    Ok(op.satisfied_by(actual, required))
}

/// Compare two version strings under semantic ordering.
pub fn compare_versions(first: &str, second: &str) -> Result<Ordering> {
    let first: VersionInfo = first.parse()?;
    let second: VersionInfo = second.parse()?;
    Ok(first.cmp(&second))
}
