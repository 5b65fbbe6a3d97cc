//! Resolve turns tagged documents into plain manifests against observed
//! cluster state.
//!
//! Only substitution happens here: a `${…}` template whose holes are all
//! plain reference paths hydrates by interpolation, anything needing CEL
//! semantics surfaces as pending. The engine never executes CEL.

use std::collections::{BTreeSet, HashMap};

use serde_json::Value;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;

use api::{
    expr::{CelExpression, Part},
    reference::{PathSegment, ResourceRef},
};

/// ResolveError enumerates resolution failures.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum ResolveError {
    /// Pending indicates the value exists only after more cluster state (or
    /// CEL evaluation) becomes available.
    #[error("expression pending: {expression} (resource {id})")]
    Pending {
        /// Reference root involved.
        id: String,
        /// The path or template that could not hydrate.
        expression: String,
    },
    /// MissingResource indicates a reference to an id with no observed state.
    #[error("no observed state for resource {id} (path {path})")]
    MissingResource {
        /// The unobserved id.
        id: String,
        /// The field path requested.
        path: String,
    },
    /// Cancelled indicates the wait for a producer was cancelled.
    #[error("resolution cancelled")]
    Cancelled,
}

impl ResolveError {
    /// Kind reports the wire-level error kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "ExpressionPending",
            Self::MissingResource { .. } => "UnknownResource",
            Self::Cancelled => "Timeout",
        }
    }
}

/// ObservedState stores the live objects the executor has seen, keyed by
/// graph id, and lets consumers await their producers.
pub struct ObservedState {
    expected: BTreeSet<String>,
    inner: RwLock<HashMap<String, Value>>,
    version: watch::Sender<u64>,
}

impl ObservedState {
    /// New constructs a store. `expected` is the set of ids a producer task
    /// will eventually publish; waiting on anything else fails immediately.
    pub fn new(expected: BTreeSet<String>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            expected,
            inner: RwLock::new(HashMap::new()),
            version,
        }
    }

    /// Insert publishes an observed object and wakes waiters.
    pub async fn insert<S: Into<String>>(&self, id: S, live: Value) {
        self.inner.write().await.insert(id.into(), live);
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Get returns a clone of the observed object, if present.
    pub async fn get(&self, id: &str) -> Option<Value> {
        self.inner.read().await.get(id).cloned()
    }

    /// Wait_for blocks until `id` is observed, its producer can never run, or
    /// the token cancels.
    pub async fn wait_for(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Value, ResolveError> {
        let mut rx = self.version.subscribe();
        loop {
            if let Some(v) = self.get(id).await {
                return Ok(v);
            }
            if !self.expected.contains(id) {
                return Err(ResolveError::MissingResource {
                    id: id.to_string(),
                    path: String::new(),
                });
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ResolveError::Cancelled);
                    }
                }
            }
        }
    }

    /// Resolve_ref walks a reference's field path through the observed
    /// object, awaiting the producer when necessary.
    pub async fn resolve_ref(
        &self,
        r: &ResourceRef,
        cancel: &CancellationToken,
    ) -> Result<Value, ResolveError> {
        let live = self.wait_for(r.resource_id(), cancel).await?;
        walk_path(&live, r)
    }
}

/// Walk_path follows a reference's segments through a live object.
pub fn walk_path(live: &Value, r: &ResourceRef) -> Result<Value, ResolveError> {
    let mut cur = live;
    for seg in r.segments() {
        let next = match &seg {
            PathSegment::Field(f) => cur.get(f),
            PathSegment::Index(i) => cur.get(i),
        };
        match next {
            Some(v) => cur = v,
            None => {
                return Err(ResolveError::Pending {
                    id: r.resource_id().to_string(),
                    expression: r.field_path().to_string(),
                });
            }
        }
    }
    if cur.is_null() {
        return Err(ResolveError::Pending {
            id: r.resource_id().to_string(),
            expression: r.field_path().to_string(),
        });
    }
    Ok(cur.clone())
}

/// Resolve_value hydrates a tagged document: references become observed
/// values, pure-interpolation templates become strings, and anything needing
/// CEL semantics is a pending error.
///
/// Boxed so the recursion over containers can await producer tasks.
pub fn resolve_value<'a>(
    value: &'a Value,
    observed: &'a ObservedState,
    cancel: &'a CancellationToken,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<Value, ResolveError>> + Send + 'a>,
> {
    Box::pin(async move {
        if let Some(r) = ResourceRef::from_tagged(value) {
            return observed.resolve_ref(&r, cancel).await;
        }
        if let Some(Ok(c)) = CelExpression::from_tagged(value) {
            return hydrate_template(&c, observed, cancel).await;
        }
        match value {
            Value::String(s) if s.contains("${") => match CelExpression::from_template(s) {
                // A template with no references is not ours to interpolate.
                Ok(c) if !c.refs().is_empty() => {
                    hydrate_template(&c, observed, cancel).await
                }
                _ => Ok(value.clone()),
            },
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(resolve_value(item, observed, cancel).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, item) in map {
                    out.insert(k.clone(), resolve_value(item, observed, cancel).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    })
}

/// Hydrate_template interpolates a pure template; operator holes are pending.
async fn hydrate_template(
    c: &CelExpression,
    observed: &ObservedState,
    cancel: &CancellationToken,
) -> Result<Value, ResolveError> {
    if !c.is_pure_interpolation() {
        let id = c
            .refs()
            .first()
            .map(|r| r.resource_id().to_string())
            .unwrap_or_default();
        return Err(ResolveError::Pending {
            id,
            expression: c.template().to_string(),
        });
    }
    // A lone-ref template keeps the referenced value's type.
    if let [Part::Ref(r)] = c.parts() {
        return observed.resolve_ref(r, cancel).await;
    }
    let mut s = String::new();
    for part in c.parts() {
        match part {
            Part::Literal(l) => s.push_str(l),
            Part::Ref(r) => {
                let v = observed.resolve_ref(r, cancel).await?;
                match v {
                    Value::String(x) => s.push_str(&x),
                    Value::Number(n) => s.push_str(&n.to_string()),
                    Value::Bool(b) => s.push_str(if b { "true" } else { "false" }),
                    other => {
                        return Err(ResolveError::Pending {
                            id: r.resource_id().to_string(),
                            expression: format!("{} interpolated a {other}", c.template()),
                        });
                    }
                }
            }
            Part::Expr(e) => {
                return Err(ResolveError::Pending {
                    id: String::new(),
                    expression: e.clone(),
                });
            }
        }
    }
    Ok(Value::String(s))
}

/// Hydration is the best-effort result of resolving a status mapping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Hydration {
    /// Status with everything resolvable resolved.
    pub status: Value,
    /// Pending lists the fields that need CEL or missing state, with the
    /// template left in place.
    pub pending: Vec<(String, String)>,
}

/// Hydrate_status resolves a status mapping field by field; unresolvable
/// fields keep their template text and are listed as pending.
pub async fn hydrate_status(
    status: &Value,
    observed: &ObservedState,
    cancel: &CancellationToken,
) -> Hydration {
    let Value::Object(map) = status else {
        return Hydration {
            status: status.clone(),
            pending: Vec::new(),
        };
    };
    let mut out = serde_json::Map::new();
    let mut pending = Vec::new();
    for (k, v) in map {
        match resolve_value(v, observed, cancel).await {
            Ok(resolved) => {
                out.insert(k.clone(), resolved);
            }
            Err(err) => {
                let expression = match &err {
                    ResolveError::Pending { expression, .. } => expression.clone(),
                    other => other.to_string(),
                };
                pending.push((k.clone(), expression));
                out.insert(k.clone(), analysis::analyzer::materialize(v, analysis::Target::Kro));
            }
        }
    }
    Hydration {
        status: Value::Object(out),
        pending,
    }
}
