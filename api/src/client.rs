//! Client defines the narrow Kubernetes surface the executors consume.
//!
//! Implementations live elsewhere; anything satisfying [`ClusterClient`]
//! works, including scripted in-memory fakes. Methods return boxed futures so
//! the trait stays object-safe and closure-resources can hold a `dyn` client.

use std::{fmt, future::Future, pin::Pin};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// GvkRef is an apiVersion/kind pair for dynamic dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GvkRef {
    /// Api_version is the `group/version` (or bare `version` for core).
    pub api_version: String,
    /// Kind is the resource kind.
    pub kind: String,
}

impl GvkRef {
    /// New constructs a pair.
    pub fn new<A: Into<String>, K: Into<String>>(api_version: A, kind: K) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Group reports the API group, empty for the core group.
    pub fn group(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((g, _)) => g,
            None => "",
        }
    }

    /// Version reports the API version.
    pub fn version(&self) -> &str {
        match self.api_version.split_once('/') {
            Some((_, v)) => v,
            None => &self.api_version,
        }
    }

    /// Of_manifest reads the pair out of a manifest.
    pub fn of_manifest(manifest: &Value) -> Option<Self> {
        let api_version = manifest.get("apiVersion")?.as_str()?;
        let kind = manifest.get("kind")?.as_str()?;
        Some(Self::new(api_version, kind))
    }
}

impl fmt::Display for GvkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// AppliedRecord identifies one object an executor created or patched; the
/// rollback manager consumes these in reverse application order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedRecord {
    /// Gvk of the applied object.
    pub gvk: GvkRef,
    /// Name of the applied object.
    pub name: String,
    /// Namespace, absent for cluster-scoped objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Resource_id is the graph id that produced the object, when one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

impl AppliedRecord {
    /// From_manifest builds a record for an applied manifest.
    pub fn from_manifest(resource_id: Option<&str>, manifest: &Value) -> Option<Self> {
        let gvk = GvkRef::of_manifest(manifest)?;
        let name = manifest.get("metadata")?.get("name")?.as_str()?.to_string();
        let namespace = manifest
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(String::from);
        Some(Self {
            gvk,
            name,
            namespace,
            resource_id: resource_id.map(String::from),
        })
    }
}

impl fmt::Display for AppliedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.gvk, ns, self.name),
            None => write!(f, "{} {}", self.gvk, self.name),
        }
    }
}

/// Error is the transport-level error domain of the client interface.
#[derive(thiserror::Error, Clone, Debug)]
pub enum Error {
    /// Api is a status error returned by the apiserver.
    #[error("api error {code}: {message}")]
    Api {
        /// HTTP status code.
        code: u16,
        /// Status message.
        message: String,
    },
    /// Transport is a connection-level failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// Manifest indicates the input document was not applyable.
    #[error("invalid manifest: {0}")]
    Manifest(String),
}

impl Error {
    /// Not_found constructs a 404 error.
    pub fn not_found<S: fmt::Display>(what: S) -> Self {
        Self::Api {
            code: 404,
            message: format!("{what} not found"),
        }
    }

    /// Code reports the HTTP status code, when there is one.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Is_not_found reports a 404.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    /// Is_conflict reports a 409.
    pub fn is_conflict(&self) -> bool {
        self.code() == Some(409)
    }

    /// Is_denied reports a 401 or 403.
    pub fn is_denied(&self) -> bool {
        matches!(self.code(), Some(401) | Some(403))
    }

    /// Is_transient reports an error worth retrying: 5xx, 429, or transport.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { code, .. } => *code >= 500 || *code == 429,
            Self::Manifest(_) => false,
        }
    }
}

/// ApiFuture is the boxed future every [`ClusterClient`] method returns.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// ClusterClient is the narrow Kubernetes interface.
///
/// Callers must supply a thread-safe implementation; the executors share one
/// across level-parallel tasks.
pub trait ClusterClient: Send + Sync {
    /// Create posts a new object from its manifest.
    fn create<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value>;

    /// Read fetches an object.
    fn read<'a>(
        &'a self,
        gvk: &'a GvkRef,
        name: &'a str,
        namespace: Option<&'a str>,
    ) -> ApiFuture<'a, Value>;

    /// Patch applies the manifest over the existing object.
    fn patch<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value>;

    /// Replace swaps the existing object for the manifest.
    fn replace<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value>;

    /// Delete removes an object, optionally with an explicit grace period.
    fn delete<'a>(
        &'a self,
        gvk: &'a GvkRef,
        name: &'a str,
        namespace: Option<&'a str>,
        grace_period: Option<i64>,
    ) -> ApiFuture<'a, ()>;

    /// List enumerates objects, optionally label-selected.
    fn list<'a>(
        &'a self,
        gvk: &'a GvkRef,
        namespace: Option<&'a str>,
        selector: Option<&'a str>,
    ) -> ApiFuture<'a, Vec<Value>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gvk_splits_groups() {
        let g = GvkRef::new("apps/v1", "Deployment");
        assert_eq!(g.group(), "apps");
        assert_eq!(g.version(), "v1");
        let core = GvkRef::new("v1", "Service");
        assert_eq!(core.group(), "");
        assert_eq!(core.version(), "v1");
    }

    #[test]
    fn record_from_manifest() {
        let rec = AppliedRecord::from_manifest(
            Some("webService"),
            &json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "web", "namespace": "prod"},
            }),
        )
        .unwrap();
        assert_eq!(rec.name, "web");
        assert_eq!(rec.namespace.as_deref(), Some("prod"));
        assert_eq!(rec.resource_id.as_deref(), Some("webService"));
    }

    #[test]
    fn error_classification() {
        assert!(Error::not_found("x").is_not_found());
        assert!(
            Error::Api {
                code: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            Error::Api {
                code: 403,
                message: "nope".into()
            }
            .is_denied()
        );
    }
}
