//! Template dependency resolution.
//!
//! Two separate capabilities live here: first-level status resolution of a
//! template's direct dependencies, and transitive graph expansion producing
//! a topological build order. They traverse the same data independently and
//! deliberately stay unmerged.

mod conflict;
mod graph;
mod resolve;

pub use graph::{build_order, DependencyGraph};
pub use resolve::{DependencyResolver, DependencyStatus, ResolvedDependency, Resolution};
