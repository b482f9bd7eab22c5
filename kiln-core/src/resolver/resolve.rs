//! Per-template dependency status resolution.
//!
//! Resolution inspects only a template's direct dependencies; the transitive
//! build order comes from the graph pass, which is a separate traversal with
//! its own semantics. Both are exposed and tested independently.

use crate::adapters::{ImageRegistry, TemplateStore};
use crate::error::{BuildError, Result};
use crate::resolver::graph;
use crate::types::template::{Template, TemplateDependency, TemplateMetadata};
use crate::version::{self, VersionInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Resolution status of a single dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyStatus {
    /// Target exists and meets the declared constraint, if any.
    Satisfied,
    /// Target template is not in the store.
    Missing,
    /// Target exists but carries no version metadata.
    MissingVersion,
    /// A version string failed to parse.
    InvalidVersion,
    /// Target's version does not meet the declared constraint.
    VersionMismatch,
}

impl fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satisfied => f.write_str("satisfied"),
            Self::Missing => f.write_str("missing"),
            Self::MissingVersion => f.write_str("missing-version"),
            Self::InvalidVersion => f.write_str("invalid-version"),
            Self::VersionMismatch => f.write_str("version-mismatch"),
        }
    }
}

/// Outcome of resolving one dependency. Built per call, never persisted.
#[derive(Debug, Clone)]
pub struct ResolvedDependency {
    pub name: String,

    /// Name as declared by the requesting template. Kept separate from
    /// `name` so registry fetches that assign a target name stay traceable.
    pub original_name: String,

    /// Version found in the store, when one was known.
    pub version: Option<String>,

    pub optional: bool,
    pub status: DependencyStatus,
}

/// Outcome of a full resolution call.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Per-dependency status, keyed by dependency name.
    pub dependencies: HashMap<String, ResolvedDependency>,

    /// Transitive build order; dependencies precede dependents.
    pub build_order: Vec<String>,
}

/// Resolves template dependencies against a store, optionally backed by the
/// shared registry for fetching what the store lacks.
pub struct DependencyResolver {
    store: Arc<dyn TemplateStore>,
    registry: Option<Arc<dyn ImageRegistry>>,
}

impl DependencyResolver {
    pub fn new(store: Arc<dyn TemplateStore>, registry: Option<Arc<dyn ImageRegistry>>) -> Self {
        Self { store, registry }
    }

    pub(crate) fn registry(&self) -> Option<&Arc<dyn ImageRegistry>> {
        self.registry.as_ref()
    }

    /// Resolve the direct dependencies of `template_name` and compute its
    /// transitive build order.
    ///
    /// A failure on a required dependency aborts with that error. Failures
    /// on optional dependencies are recorded in the returned map and never
    /// propagate.
    #[instrument(skip(self))]
    pub async fn resolve(&self, template_name: &str) -> Result<Resolution> {
        let template = self.store.get_template(template_name).await?;
        let build_order = graph::build_order(self.store.as_ref(), template_name).await?;

        let mut dependencies = HashMap::new();
        for dep in &template.dependencies {
            let (entry, failure) = self.resolve_dependency(dep).await;
            if let Some(err) = failure {
                if !dep.optional {
                    return Err(err.with_context("template", template_name));
                }
                debug!(dependency = %dep.name, error = %err, "optional dependency unresolved");
            }
            dependencies.insert(dep.name.clone(), entry);
        }

        Ok(Resolution { dependencies, build_order })
    }

    /// Resolve a single dependency. Returns the status entry and, when
    /// resolution failed, the error the caller decides what to do with.
    async fn resolve_dependency(
        &self,
        dep: &TemplateDependency,
    ) -> (ResolvedDependency, Option<BuildError>) {
        let mut entry = ResolvedDependency {
            name: dep.name.clone(),
            original_name: dep.name.clone(),
            version: None,
            optional: dep.optional,
            status: DependencyStatus::Missing,
        };

        if self.store.get_template(&dep.name).await.is_err() {
            let err = BuildError::dependency(format!(
                "dependent template '{}' not found",
                dep.name
            ))
            .with_context("dependency", &dep.name);
            return (entry, Some(err));
        }

        let known_version = self
            .store
            .template_metadata(&dep.name)
            .await
            .and_then(|metadata| metadata.version)
            .filter(|version| !version.is_empty());

        let Some(found) = known_version else {
            entry.status = DependencyStatus::MissingVersion;
            let err = BuildError::dependency(format!(
                "dependent template '{}' has no version information",
                dep.name
            ))
            .with_context("dependency", &dep.name);
            return (entry, Some(err));
        };
        entry.version = Some(found.clone());

        let Some(required) = dep.version.as_deref().filter(|v| !v.is_empty()) else {
            // No constraint declared; whatever version exists satisfies it.
            entry.status = DependencyStatus::Satisfied;
            return (entry, None);
        };

        match version::check_constraint(&found, required, dep.operator.as_deref()) {
            Ok(true) => {
                entry.status = DependencyStatus::Satisfied;
                (entry, None)
            }
            Ok(false) => {
                entry.status = DependencyStatus::VersionMismatch;
                let operator = dep.operator.as_deref().unwrap_or(">=");
                let err = BuildError::dependency(format!(
                    "dependent template '{}' version {found} doesn't satisfy constraint {operator} {required}",
                    dep.name
                ))
                .with_context("dependency", &dep.name)
                .with_context("found_version", &found)
                .with_context("required_version", required)
                .with_context("operator", operator);
                (entry, Some(err))
            }
            Err(err) => {
                entry.status = DependencyStatus::InvalidVersion;
                (entry, Some(err.with_context("dependency", &dep.name)))
            }
        }
    }

    /// Resolve dependencies and, when `fetch_missing` is set, materialize
    /// missing ones from the shared registry.
    ///
    /// Returns the resolution (with fetched entries flipped to satisfied)
    /// and the list of template names that were fetched. A missing registry
    /// is an error only when fetching was requested.
    #[instrument(skip(self))]
    pub async fn resolve_and_fetch(
        &self,
        template_name: &str,
        fetch_missing: bool,
    ) -> Result<(Resolution, Vec<String>)> {
        let mut resolution = self.resolve(template_name).await?;

        if !fetch_missing {
            return Ok((resolution, Vec::new()));
        }

        let Some(registry) = &self.registry else {
            return Err(BuildError::registry(
                "registry not configured, cannot fetch missing dependencies",
            ));
        };

        let missing: Vec<String> = resolution
            .dependencies
            .iter()
            .filter(|(_, dep)| dep.status == DependencyStatus::Missing)
            .map(|(name, _)| name.clone())
            .collect();

        if missing.is_empty() {
            return Ok((resolution, Vec::new()));
        }

        let entries = match registry.list_shared_templates().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(error = %err, "registry listing failed; leaving missing dependencies unfetched");
                return Ok((resolution, Vec::new()));
            }
        };

        let mut fetched = Vec::new();
        for name in missing {
            let Some(shared) = entries.get(&name) else {
                continue;
            };
            if shared.template_data.is_empty() {
                continue;
            }

            let template = Template {
                name: name.clone(),
                description: "Imported from registry".to_string(),
                ..Template::default()
            };
            let metadata = TemplateMetadata {
                version: Some(shared.version.clone()),
                last_modified: shared.published_at,
                source_url: Some(format!("registry://{name}")),
            };

            if let Err(err) = self.store.insert_template(template, metadata).await {
                warn!(template = %name, error = %err, "failed to materialize fetched template");
                continue;
            }

            if let Some(dep) = resolution.dependencies.get_mut(&name) {
                dep.status = DependencyStatus::Satisfied;
                dep.version = Some(shared.version.clone());
            }
            fetched.push(name);
        }

        Ok((resolution, fetched))
    }

    /// Published versions of `template_name` that satisfy the constraint,
    /// newest first. Versions that fail to parse are skipped.
    pub async fn find_compatible_versions(
        &self,
        template_name: &str,
        constraint: &str,
        operator: Option<&str>,
    ) -> Result<Vec<String>> {
        let Some(registry) = &self.registry else {
            return Err(BuildError::registry("registry not configured"));
        };

        let all = registry.list_versions(template_name).await?;
        let mut compatible: Vec<(VersionInfo, String)> = all
            .into_iter()
            .filter_map(|raw| {
                let parsed: VersionInfo = raw.parse().ok()?;
                match version::check_constraint(&raw, constraint, operator) {
                    Ok(true) => Some((parsed, raw)),
                    _ => None,
                }
            })
            .collect();

        compatible.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(compatible.into_iter().map(|(_, raw)| raw).collect())
    }
}
