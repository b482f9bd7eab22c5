//! Multi-constraint conflict resolution.
//!
//! When several templates constrain the same dependency, the constraints are
//! grouped into equality, lower-bound and upper-bound buckets and reduced to
//! the most restrictive representative of each before a version is picked.

use crate::error::{BuildError, Result};
use crate::resolver::resolve::DependencyResolver;
use crate::types::template::TemplateDependency;
use crate::version::{self, ConstraintOp, VersionInfo};
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Most restrictive constraint per bucket for one dependency.
#[derive(Debug, Default)]
struct Bounds {
    equality: Option<VersionInfo>,
    lower: Option<VersionInfo>,
    upper: Option<VersionInfo>,
}

impl DependencyResolver {
    /// Resolve conflicting version constraints contributed by multiple
    /// requesting templates.
    ///
    /// Returns the picked version per dependency name. Dependencies with no
    /// usable constraints produce no entry.
    #[instrument(skip(self, conflicts))]
    pub async fn resolve_conflicts(
        &self,
        conflicts: &HashMap<String, Vec<TemplateDependency>>,
    ) -> Result<HashMap<String, String>> {
        let mut result = HashMap::new();

        for (template, deps) in conflicts {
            let bounds = collect_bounds(template, deps)?;

            if let Some(equality) = bounds.equality {
                if let Some(lower) = bounds.lower {
                    if equality < lower {
                        return Err(BuildError::dependency(format!(
                            "conflicting version requirements for {template}: equal to {equality} but must be >= {lower}"
                        ))
                        .with_context("template", template));
                    }
                }
                if let Some(upper) = bounds.upper {
                    if equality > upper {
                        return Err(BuildError::dependency(format!(
                            "conflicting version requirements for {template}: equal to {equality} but must be <= {upper}"
                        ))
                        .with_context("template", template));
                    }
                }
                result.insert(template.clone(), equality.to_string());
                continue;
            }

            match (bounds.lower, bounds.upper) {
                (Some(lower), Some(upper)) => {
                    if lower > upper {
                        return Err(BuildError::dependency(format!(
                            "conflicting version requirements for {template}: >= {lower} and <= {upper}"
                        ))
                        .with_context("template", template));
                    }
                    let picked = self.pick_within_bounds(template, lower, upper).await;
                    result.insert(template.clone(), picked);
                }
                (Some(lower), None) => {
                    result.insert(template.clone(), lower.to_string());
                }
                (None, Some(upper)) => {
                    result.insert(template.clone(), upper.to_string());
                }
                (None, None) => {}
            }
        }

        Ok(result)
    }

    /// Pick a published version within `[lower, upper]`, preferring the
    /// newest. Falls back to the lower bound when the registry is
    /// unavailable or nothing qualifies.
    async fn pick_within_bounds(
        &self,
        template: &str,
        lower: VersionInfo,
        upper: VersionInfo,
    ) -> String {
        if self.registry().is_none() {
            return lower.to_string();
        }

        let candidates = match self
            .find_compatible_versions(template, &lower.to_string(), Some(">="))
            .await
        {
            Ok(candidates) => candidates,
            Err(err) => {
                debug!(template, error = %err, "registry lookup failed; using lower bound");
                return lower.to_string();
            }
        };

        for candidate in candidates {
            if matches!(
                version::check_constraint(&candidate, &upper.to_string(), Some("<=")),
                Ok(true)
            ) {
                return candidate;
            }
        }

        lower.to_string()
    }
}

/// Reduce a dependency's constraint list to one bound per bucket.
///
/// Strictness is ignored when picking extremes: the highest lower bound and
/// the lowest upper bound win. Divergent equality requirements are a hard
/// conflict. Constraints with unparsable versions or operators outside the
/// three buckets are skipped.
fn collect_bounds(template: &str, deps: &[TemplateDependency]) -> Result<Bounds> {
    let mut bounds = Bounds::default();

    for dep in deps {
        let Some(raw) = dep.version.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };
        let Ok(requested) = raw.parse::<VersionInfo>() else {
            debug!(template, version = raw, "skipping unparsable constraint");
            continue;
        };

        let op = match dep.operator.as_deref().filter(|o| !o.is_empty()) {
            None => ConstraintOp::GreaterEq,
            Some(raw_op) => match raw_op.parse::<ConstraintOp>() {
                Ok(op) => op,
                Err(_) => {
                    debug!(template, operator = raw_op, "skipping unknown operator");
                    continue;
                }
            },
        };

        match op {
            ConstraintOp::Exact => {
                if let Some(existing) = bounds.equality {
                    if existing != requested {
                        return Err(BuildError::dependency(format!(
                            "conflicting exact version requirements for {template}: {existing} vs {requested}"
                        ))
                        .with_context("template", template)
                        .with_context("first_version", existing.to_string())
                        .with_context("second_version", requested.to_string()));
                    }
                } else {
                    bounds.equality = Some(requested);
                }
            }
            ConstraintOp::Greater | ConstraintOp::GreaterEq => {
                bounds.lower = Some(bounds.lower.map_or(requested, |lower| lower.max(requested)));
            }
            ConstraintOp::Less | ConstraintOp::LessEq => {
                bounds.upper = Some(bounds.upper.map_or(requested, |upper| upper.min(requested)));
            }
            ConstraintOp::Compatible => {
                // Pessimistic constraints do not reduce to a single bound.
                debug!(template, "skipping pessimistic constraint in conflict resolution");
            }
        }
    }

    Ok(bounds)
}
