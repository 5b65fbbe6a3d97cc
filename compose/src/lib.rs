#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Compose turns a user composition callback into a validated, dependency-
//! ordered graph of resources and serializes it as a Kro
//! ResourceGraphDefinition.
//!
//! A composition runs once under a fresh [`CompositionContext`]; factory code
//! registers resources (and deploy-time closures) into the context and
//! returns the status mapping. The result captures everything the executors
//! and the serializer need.

use std::collections::BTreeSet;

use serde_json::Value;

use api::{resource::Resource, schema::SchemaDefinition};

pub mod closure;
pub mod context;
pub mod graph;
pub mod serialize;

pub use closure::{ClosureResource, DeploymentContext, DeploymentStrategy, ResolveReference};
pub use context::CompositionContext;
pub use graph::{DependencyGraph, DeploymentPlan};
pub use serialize::SerializeOptions;

/// Error enumerates composition and serialization failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// CircularDependency reports one concrete cycle.
    #[error("circular dependency: {}", cycle.join(" -> "))]
    CircularDependency {
        /// The ids forming the cycle, in edge order.
        cycle: Vec<String>,
    },
    /// DuplicateResourceId reports a second registration with differing
    /// content.
    #[error("duplicate resource id: {0}")]
    DuplicateResourceId(String),
    /// Analysis wraps an authoring failure.
    #[error(transparent)]
    Analysis(#[from] analysis::Error),
    /// Envelope wraps a manifest envelope failure.
    #[error(transparent)]
    Envelope(#[from] api::resource::Error),
    /// Reference wraps a field-path failure.
    #[error(transparent)]
    Reference(#[from] api::reference::Error),
    /// YAML indicates a YAML serialization failed.
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
}

impl Error {
    /// Kind reports the wire-level error kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CircularDependency { .. } => "CircularDependencyError",
            Self::DuplicateResourceId(_) => "DuplicateResourceId",
            Self::Analysis(err) => err.kind(),
            Self::Envelope(_) => "SerializationError",
            Self::Reference(_) => "InvalidFieldPath",
            Self::YAML(_) => "SerializationError",
        }
    }
}

/// Result typedef for composition.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Composition is the evaluated result of one composition callback.
#[derive(Debug)]
pub struct Composition {
    /// Name of the composition; projected to RFC 1123 on serialization.
    pub name: String,
    /// Schema is the instance API surface.
    pub schema: SchemaDefinition,
    /// Resources in registration order.
    pub resources: Vec<Resource>,
    /// Closures are deploy-time side-effect nodes.
    pub closures: Vec<ClosureResource>,
    /// Status is the tagged status mapping the callback returned.
    pub status: Value,
}

impl Composition {
    /// Ids reports the declared resource ids (closures included; they share
    /// the node namespace).
    pub fn ids(&self) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter(|r| !r.is_external())
            .map(|r| r.id().to_string())
            .chain(self.closures.iter().map(|c| c.name().to_string()))
            .collect()
    }

    /// Externals reports the ids declared as external.
    pub fn externals(&self) -> BTreeSet<String> {
        self.resources
            .iter()
            .filter(|r| r.is_external())
            .map(|r| r.id().to_string())
            .collect()
    }

    /// Resource looks a member up by id.
    pub fn resource(&self, id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.id() == id)
    }

    /// Graph builds the dependency graph over the members.
    pub fn graph(&self) -> DependencyGraph {
        DependencyGraph::build(self)
    }

    /// Plan computes the level-parallel deployment plan, failing fast on
    /// cycles.
    pub fn plan(&self) -> Result<DeploymentPlan> {
        self.graph().plan()
    }

    /// Validate runs the pre-serialization, pre-deploy checks.
    pub fn validate(&self, strictness: analysis::Strictness) -> Result<()> {
        let ids = self.ids();
        let externals = self.externals();
        for r in &self.resources {
            analysis::validate::validate_resource_id(r.id(), strictness)?;
            analysis::validate::validate_references(&ids, &externals, [r.template()])?;
        }
        analysis::validate::validate_status(&self.status, &ids, &externals)?;
        self.plan().map(drop)
    }
}

/// Compose evaluates a composition callback under a fresh context.
///
/// The callback registers resources into the context and returns the status
/// mapping. References are checked as soon as the callback returns, so
/// authoring mistakes never survive to deploy time.
pub fn compose<N, F>(name: N, schema: SchemaDefinition, f: F) -> Result<Composition>
where
    N: Into<String>,
    F: FnOnce(&mut CompositionContext) -> Result<Value>,
{
    let mut ctx = CompositionContext::new(name);
    let status = f(&mut ctx)?;
    let composition = ctx.finish(schema, status);
    let ids = composition.ids();
    let externals = composition.externals();
    for r in &composition.resources {
        analysis::validate::validate_references(&ids, &externals, [r.template()])?;
    }
    analysis::validate::validate_status(&composition.status, &ids, &externals)?;
    Ok(composition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::reference::resource as ref_to;
    use serde_json::json;

    fn schema() -> SchemaDefinition {
        SchemaDefinition::new("example.dev", "WebApp")
    }

    fn manifest(kind: &str, name: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": {"name": name},
        })
    }

    #[test]
    fn empty_composition_composes() {
        let c = compose("empty", schema(), |_| Ok(Value::Null)).unwrap();
        assert!(c.resources.is_empty());
        assert_eq!(c.plan().unwrap().levels.len(), 0);
    }

    #[test]
    fn unknown_ref_aborts_at_compose_time() {
        let err = compose("bad", schema(), |ctx| {
            let mut m = manifest("ConfigMap", "cm");
            m["data"] = json!({"ip": ref_to("ghost").at("status.podIP").build().unwrap().to_tagged()});
            ctx.register(Resource::with_id("cm", m)?)?;
            Ok(Value::Null)
        })
        .unwrap_err();
        assert_eq!(err.kind(), "UnknownResource");
    }

    #[test]
    fn schema_only_refs_need_no_edges() {
        let c = compose("solo", schema(), |ctx| {
            let mut m = manifest("ConfigMap", "cm");
            m["data"] =
                json!({"name": api::reference::schema().at("spec.name").build().unwrap().to_tagged()});
            ctx.register(Resource::with_id("cm", m)?)?;
            Ok(Value::Null)
        })
        .unwrap();
        let plan = c.plan().unwrap();
        assert_eq!(plan.levels, vec![vec!["cm".to_string()]]);
    }
}
