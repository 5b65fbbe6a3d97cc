//! Options is the caller-facing configuration surface of the executors.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde_json::Value;

use crate::events::DeployEvent;
pub use compose::DeploymentStrategy;

/// Mode selects the execution backend.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Direct applies the graph itself.
    #[default]
    Direct,
    /// Kro emits an RGD and lets the Kro controller reconcile.
    Kro,
}

/// WatchedEventType filters which Kubernetes Events get attached to failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::EnumString)]
#[allow(missing_docs)]
pub enum WatchedEventType {
    Normal,
    Warning,
    Error,
}

/// EventMonitoring configures Kubernetes Event collection around failures.
#[derive(Clone, Debug)]
pub struct EventMonitoring {
    /// Enabled turns collection on.
    pub enabled: bool,
    /// Event_types to include.
    pub event_types: Vec<WatchedEventType>,
    /// Include_child_resources widens collection beyond the graph members.
    pub include_child_resources: bool,
}

impl Default for EventMonitoring {
    fn default() -> Self {
        Self {
            enabled: false,
            event_types: vec![WatchedEventType::Warning, WatchedEventType::Error],
            include_child_resources: false,
        }
    }
}

/// DebugLogging configures the status-debug event stream.
#[derive(Clone, Debug)]
pub struct DebugLogging {
    /// Enabled turns status-debug events on.
    pub enabled: bool,
    /// Status_polling includes every poll attempt.
    pub status_polling: bool,
    /// Readiness_evaluation includes evaluator results.
    pub readiness_evaluation: bool,
    /// Verbose keeps full objects up to the size cap.
    pub verbose: bool,
    /// Max_status_object_size caps serialized status bytes in debug events;
    /// oversized values are truncated, never dropped.
    pub max_status_object_size: usize,
}

impl Default for DebugLogging {
    fn default() -> Self {
        Self {
            enabled: false,
            status_polling: true,
            readiness_evaluation: true,
            verbose: false,
            max_status_object_size: 16 * 1024,
        }
    }
}

/// ProgressCallback receives every deploy event.
pub type ProgressCallback = Arc<dyn Fn(&DeployEvent) + Send + Sync>;

/// FactoryOptions is the full executor configuration.
#[derive(Clone)]
pub struct FactoryOptions {
    /// Mode selects the backend.
    pub mode: Mode,
    /// Namespace the deployment targets.
    pub namespace: String,
    /// Wait_for_ready blocks on readiness after each apply.
    pub wait_for_ready: bool,
    /// Timeout bounds each resource's wait.
    pub timeout: Duration,
    /// Hydrate_status resolves the status mapping after deploy.
    pub hydrate_status: bool,
    /// Skip_tls_verify disables certificate verification.
    pub skip_tls_verify: bool,
    /// Kube_config points at an explicit kubeconfig file.
    pub kube_config: Option<PathBuf>,
    /// Event_monitoring configures failure-time Event collection.
    pub event_monitoring: EventMonitoring,
    /// Debug_logging configures the status-debug stream.
    pub debug_logging: DebugLogging,
    /// Deployment_strategy governs closure applies on conflicts.
    pub deployment_strategy: DeploymentStrategy,
    /// Rollback_on_failure deletes applied members when the deploy fails or
    /// is cancelled.
    pub rollback_on_failure: bool,
    /// Progress receives every deploy event.
    pub progress: Option<ProgressCallback>,
    /// Alchemy_scope is an opaque passthrough handed to closures.
    pub alchemy_scope: Option<Value>,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Direct,
            namespace: "default".into(),
            wait_for_ready: true,
            timeout: Duration::from_millis(300_000),
            hydrate_status: true,
            skip_tls_verify: false,
            kube_config: None,
            event_monitoring: EventMonitoring::default(),
            debug_logging: DebugLogging::default(),
            deployment_strategy: DeploymentStrategy::default(),
            rollback_on_failure: true,
            progress: None,
            alchemy_scope: None,
        }
    }
}

impl std::fmt::Debug for FactoryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryOptions")
            .field("mode", &self.mode)
            .field("namespace", &self.namespace)
            .field("wait_for_ready", &self.wait_for_ready)
            .field("timeout", &self.timeout)
            .field("hydrate_status", &self.hydrate_status)
            .field("deployment_strategy", &self.deployment_strategy)
            .field("rollback_on_failure", &self.rollback_on_failure)
            .finish()
    }
}
