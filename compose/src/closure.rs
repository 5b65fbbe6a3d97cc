//! Closure holds the deploy-time side-effect node type.
//!
//! A closure-resource produces no manifest of its own; its "apply" runs
//! arbitrary code against a [`DeploymentContext`] and returns the records of
//! whatever it created, which then participate in rollback like first-class
//! members.

use std::{collections::BTreeMap, fmt, future::Future, pin::Pin, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use api::{
    client::{AppliedRecord, ClusterClient},
    reference::ResourceRef,
};

/// ClosureError is the boxed error domain closure bodies report.
pub type ClosureError = Box<dyn std::error::Error + Send + Sync>;

/// ClosureFuture is what a closure body returns.
pub type ClosureFuture =
    Pin<Box<dyn Future<Output = Result<Vec<AppliedRecord>, ClosureError>> + Send>>;

/// ClosureFn is a closure body.
pub type ClosureFn = Arc<dyn Fn(DeploymentContext) -> ClosureFuture + Send + Sync>;

/// DeploymentStrategy governs how closure applies treat existing objects.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum DeploymentStrategy {
    /// Replace patches over an existing object.
    #[default]
    Replace,
    /// SkipIfExists logs and leaves the existing object alone.
    SkipIfExists,
    /// Fail propagates the conflict.
    Fail,
}

/// ResolveReference resolves a reference against the deployment's observed
/// state.
pub trait ResolveReference: Send + Sync {
    /// Resolve returns the live value the reference points at.
    fn resolve<'a>(
        &'a self,
        r: &'a ResourceRef,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ClosureError>> + Send + 'a>>;
}

/// DeploymentContext is what a closure body receives when its level runs.
#[derive(Clone)]
pub struct DeploymentContext {
    /// Client is the shared cluster interface.
    pub client: Arc<dyn ClusterClient>,
    /// Resolver resolves captured references against observed state.
    pub resolver: Arc<dyn ResolveReference>,
    /// Namespace the deployment targets.
    pub namespace: String,
    /// Strategy for conflicting applies.
    pub strategy: DeploymentStrategy,
    /// Scope is an opaque passthrough for embedding frameworks.
    pub scope: Option<Value>,
}

impl fmt::Debug for DeploymentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentContext")
            .field("namespace", &self.namespace)
            .field("strategy", &self.strategy)
            .finish()
    }
}

/// ClosureResource is a first-class graph node whose apply is a function.
#[derive(Clone)]
pub struct ClosureResource {
    name: String,
    refs: Vec<ResourceRef>,
    apply: ClosureFn,
}

impl fmt::Debug for ClosureResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClosureResource")
            .field("name", &self.name)
            .field("refs", &self.refs)
            .finish()
    }
}

impl ClosureResource {
    /// New constructs a closure node. `refs` are the references the body
    /// captures; they place the node in the dependency graph.
    pub fn new<N, F, Fut>(name: N, refs: Vec<ResourceRef>, body: F) -> Self
    where
        N: Into<String>,
        F: Fn(DeploymentContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<AppliedRecord>, ClosureError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            refs,
            apply: Arc::new(move |ctx| Box::pin(body(ctx))),
        }
    }

    /// Name reports the node id.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refs reports the captured references.
    pub fn refs(&self) -> &[ResourceRef] {
        &self.refs
    }

    /// Apply runs the closure body.
    pub fn apply(&self, ctx: DeploymentContext) -> ClosureFuture {
        (self.apply)(ctx)
    }

    /// Rename_refs rewrites captured reference targets; used when nested
    /// compositions flatten.
    pub(crate) fn rename_refs(mut self, renames: &BTreeMap<String, String>) -> Self {
        if renames.is_empty() {
            return self;
        }
        self.refs = self
            .refs
            .iter()
            .map(|r| match renames.get(r.resource_id()) {
                Some(new_id) => {
                    ResourceRef::new(new_id.clone(), r.field_path()).unwrap_or_else(|_| r.clone())
                }
                None => r.clone(),
            })
            .collect();
        self
    }
}
