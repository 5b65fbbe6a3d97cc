#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Deployer executes compositions against a live cluster.
//!
//! Two backends share one machinery: [`direct::DirectExecutor`] applies the
//! graph itself, level by level, while [`kro::KroExecutor`] hands the emitted
//! ResourceGraphDefinition to the Kro controller and observes the instance it
//! reconciles. Readiness evaluation, rollback, and structured progress
//! eventing are common to both.

/// Prelude is the common imports for executor modules.
pub(crate) mod prelude {
    pub use std::{collections::BTreeMap, sync::Arc, time::Duration};

    pub use serde_json::{Value, json};
    pub use tokio_util::sync::CancellationToken;
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use api::client::{AppliedRecord, ClusterClient, GvkRef};
    pub use api::resource::{ReadyFn, ReadyStatus};

    pub use super::events::{DeployEvent, EventKind, EventSink, ResourcePhase};
    pub use super::options::FactoryOptions;
    pub use super::{Error, Result};
}

pub mod closures;
pub mod cluster_state;
pub mod direct;
pub mod events;
pub mod kro;
pub mod kube_client;
pub mod metrics;
pub mod options;
pub mod readiness;
pub mod resolve;
pub mod rollback;

#[cfg(test)]
pub(crate) mod testing;

pub use direct::{DeployedInstance, DirectExecutor, PendingExpression};
pub use kro::KroExecutor;
pub use options::{DebugLogging, EventMonitoring, FactoryOptions, Mode};
pub use readiness::ReadinessEngine;
pub use rollback::{RollbackOptions, RollbackOutcome, RollbackStatus};

/// FIELD_MANAGER is the name the executors use for server-side apply.
pub const FIELD_MANAGER: &str = "krograph-deployer";

/// Deploy runs a composition under the backend `options.mode` selects.
pub async fn deploy(
    client: std::sync::Arc<dyn api::client::ClusterClient>,
    composition: &compose::Composition,
    spec: &serde_json::Value,
    options: FactoryOptions,
) -> Result<DeployedInstance> {
    let cancel = tokio_util::sync::CancellationToken::new();
    match options.mode {
        Mode::Direct => {
            DirectExecutor::new(client, options)
                .deploy_with_cancel(composition, spec, cancel)
                .await
        }
        Mode::Kro => {
            KroExecutor::new(client, options)
                .deploy(composition, spec, cancel)
                .await
        }
    }
}

/// Error enumerates deployment failures.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Compose is an authoring failure detected before any apply.
    #[error(transparent)]
    Compose(#[from] compose::Error),
    /// Analysis is an authoring failure detected before any apply.
    #[error(transparent)]
    Analysis(#[from] analysis::Error),
    /// Client is a cluster interface failure.
    #[error(transparent)]
    Client(#[from] api::client::Error),
    /// Resolve indicates a reference or expression could not be resolved.
    #[error("resolution failed for {resource_id}: {source}")]
    Resolve {
        /// The graph member whose document was being resolved.
        resource_id: String,
        /// The underlying resolution failure.
        #[source]
        source: resolve::ResolveError,
    },
    /// Timeout indicates a deadline elapsed while waiting.
    #[error("timeout after {elapsed_ms}ms waiting for {resource_id}")]
    Timeout {
        /// The graph member being waited on.
        resource_id: String,
        /// Elapsed wait in milliseconds.
        elapsed_ms: u64,
        /// The last observed status object, if any poll succeeded.
        last_status: Option<serde_json::Value>,
    },
    /// ReadinessFailed indicates a terminal not-ready condition.
    #[error("readiness failed for {resource_id}: {reason}: {message}")]
    ReadinessFailed {
        /// The graph member that failed.
        resource_id: String,
        /// Machine-oriented cause.
        reason: String,
        /// Human-oriented elaboration.
        message: String,
        /// The last observed status object.
        last_status: Option<serde_json::Value>,
    },
    /// Rollback indicates the cleanup pass itself had failures.
    #[error("rollback finished with {} failed deletions", items.iter().filter(|i| i.error.is_some()).count())]
    Rollback {
        /// Per-record outcomes.
        items: Vec<rollback::RollbackItem>,
    },
    /// Closure indicates a deploy-time closure body failed.
    #[error("closure {name} failed: {message}")]
    Closure {
        /// The closure node's name.
        name: String,
        /// The failure it reported.
        message: String,
    },
    /// Instance indicates the Kro controller reported a failed instance.
    #[error("instance {name} failed: {message}")]
    Instance {
        /// Instance name.
        name: String,
        /// Condition summary from the controller.
        message: String,
    },
    /// Schema indicates the instance document failed the composition's
    /// pluggable validator.
    #[error("schema validation failed: {0}")]
    Schema(String),
    /// Cancelled indicates the deploy's cancel token fired.
    #[error("deployment cancelled")]
    Cancelled,
    /// Kube is a generic error from the `kube` crate.
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),
    /// KubeConfig indicates the process was unable to load a kubeconfig.
    #[error("kubeconfig error: {0}")]
    KubeConfig(#[from] kube::config::KubeconfigError),
    /// JSON indicates a JSON serialization failed.
    #[error("json error: {0}")]
    JSON(#[from] serde_json::Error),
    /// YAML indicates a YAML serialization failed.
    #[error("yaml error: {0}")]
    YAML(#[from] serde_yaml::Error),
    /// Io indicates some OS-level I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Tokio indicates an error joining tasks.
    #[error("tokio error: {0}")]
    Tokio(#[from] tokio::task::JoinError),
}

impl Error {
    /// Kind reports the wire-level error kind string.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Compose(err) => err.kind(),
            Self::Analysis(err) => err.kind(),
            Self::Client(err) => match err.code() {
                Some(401) | Some(403) => "Forbidden",
                Some(404) => "NotFound",
                Some(409) => "Conflict",
                _ => "ApiError",
            },
            Self::Resolve { source, .. } => source.kind(),
            Self::Timeout { .. } => "Timeout",
            Self::ReadinessFailed { .. } => "ReadinessFailed",
            Self::Rollback { .. } => "RollbackError",
            Self::Closure { .. } => "ApiError",
            Self::Instance { .. } => "ReadinessFailed",
            Self::Schema(_) => "SerializationError",
            Self::Cancelled => "Timeout",
            Self::JSON(_) | Self::YAML(_) => "SerializationError",
            Self::Kube(_) | Self::KubeConfig(_) | Self::Io(_) | Self::Tokio(_) => "ApiError",
        }
    }
}

/// Result typedef for deployment.
pub type Result<T, E = Error> = std::result::Result<T, E>;
