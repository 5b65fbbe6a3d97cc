//! Readiness holds the pluggable per-resource evaluators and the polling
//! loop that drives them.
//!
//! The default registry selects by `(apiVersion, kind)`. Unknown kinds are
//! ready on existence so arbitrary custom resources never hang a deploy.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::{metrics, prelude::*};

/// DEFAULT_POLL_INTERVAL is the fixed base between readiness polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// CRD_PROPAGATION_GRACE bounds how long a missing custom resource is
/// forgiven while its CRD may still be propagating.
pub const CRD_PROPAGATION_GRACE: Duration = Duration::from_secs(30);

/// ReadinessEngine is the evaluator registry.
#[derive(Clone)]
pub struct ReadinessEngine {
    by_gvk: BTreeMap<(String, String), ReadyFn>,
}

impl Default for ReadinessEngine {
    fn default() -> Self {
        let mut e = Self {
            by_gvk: BTreeMap::new(),
        };
        e.register("apps/v1", "Deployment", Arc::new(deployment_ready));
        e.register("v1", "Service", Arc::new(service_ready));
        e.register("batch/v1", "Job", Arc::new(job_ready));
        e.register("apps/v1", "DaemonSet", Arc::new(daemon_set_ready));
        e.register(
            "v1",
            "ReplicationController",
            Arc::new(replication_controller_ready),
        );
        for v in ["v1", "v1beta2"] {
            e.register(
                format!("source.toolkit.fluxcd.io/{v}"),
                "HelmRepository",
                Arc::new(helm_repository_ready),
            );
        }
        for v in ["v2", "v2beta2", "v2beta1"] {
            e.register(
                format!("helm.toolkit.fluxcd.io/{v}"),
                "HelmRelease",
                Arc::new(helm_release_ready),
            );
        }
        e.register(
            "kustomize.toolkit.fluxcd.io/v1",
            "Kustomization",
            Arc::new(kustomization_ready),
        );
        e.register("cert-manager.io/v1", "Certificate", Arc::new(certificate_ready));
        e.register(
            "cert-manager.io/v1",
            "ClusterIssuer",
            Arc::new(certificate_ready),
        );
        e.register("acme.cert-manager.io/v1", "Challenge", Arc::new(challenge_ready));
        e
    }
}

impl ReadinessEngine {
    /// Register installs an evaluator for an apiVersion/kind pair.
    pub fn register<A: Into<String>, K: Into<String>>(
        &mut self,
        api_version: A,
        kind: K,
        f: ReadyFn,
    ) {
        self.by_gvk.insert((api_version.into(), kind.into()), f);
    }

    /// Evaluator_for selects the evaluator for a manifest; unknown kinds get
    /// the exists-is-ready fallback.
    pub fn evaluator_for(&self, gvk: &GvkRef) -> ReadyFn {
        self.by_gvk
            .get(&(gvk.api_version.clone(), gvk.kind.clone()))
            .cloned()
            .unwrap_or_else(|| Arc::new(exists_ready))
    }
}

/// Exists_ready is the fallback evaluator.
pub fn exists_ready(_live: &Value) -> ReadyStatus {
    ReadyStatus::ready()
}

fn i64_at<'v>(v: &'v Value, path: &[&str]) -> Option<i64> {
    let mut cur = v;
    for p in path {
        cur = cur.get(p)?;
    }
    cur.as_i64()
}

/// Condition_status finds `type_` in a conditions array and reports its
/// status string.
pub fn condition_status(live: &Value, type_: &str) -> Option<String> {
    let conditions = live.get("status")?.get("conditions")?.as_array()?;
    conditions
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
        .and_then(|c| c.get("status"))
        .and_then(Value::as_str)
        .map(String::from)
}

/// Deployment_ready requires every desired replica ready and an
/// `Available=True` condition.
pub fn deployment_ready(live: &Value) -> ReadyStatus {
    let desired = i64_at(live, &["spec", "replicas"]).unwrap_or(1);
    let ready = i64_at(live, &["status", "readyReplicas"]).unwrap_or(0);
    if ready != desired {
        return ReadyStatus::pending("ReplicasNotReady")
            .with_message(format!("{ready}/{desired} replicas ready"));
    }
    match condition_status(live, "Available") {
        Some(s) if s == "True" => ReadyStatus::ready(),
        _ => ReadyStatus::pending("AvailableConditionMissing"),
    }
}

/// Service_ready: ClusterIP services are ready on existence, LoadBalancers
/// need an external endpoint, ExternalName needs its target.
pub fn service_ready(live: &Value) -> ReadyStatus {
    let type_ = live
        .get("spec")
        .and_then(|s| s.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("ClusterIP");
    match type_ {
        "LoadBalancer" => {
            let endpoint = live
                .get("status")
                .and_then(|s| s.get("loadBalancer"))
                .and_then(|lb| lb.get("ingress"))
                .and_then(|i| i.get(0))
                .and_then(|first| {
                    first
                        .get("ip")
                        .or_else(|| first.get("hostname"))
                        .and_then(Value::as_str)
                });
            match endpoint {
                Some(ep) => ReadyStatus::ready().with_message(format!(
                    "LoadBalancer service has external endpoint: {ep}"
                )),
                None => ReadyStatus::pending("LoadBalancerPending"),
            }
        }
        "ExternalName" => {
            match live
                .get("spec")
                .and_then(|s| s.get("externalName"))
                .and_then(Value::as_str)
            {
                Some(_) => ReadyStatus::ready(),
                None => ReadyStatus::pending("ExternalNameMissing"),
            }
        }
        _ => ReadyStatus::ready(),
    }
}

/// Job_ready: at least one success, terminal on a failed condition.
pub fn job_ready(live: &Value) -> ReadyStatus {
    if i64_at(live, &["status", "succeeded"]).unwrap_or(0) >= 1 {
        return ReadyStatus::ready();
    }
    match condition_status(live, "Failed") {
        Some(s) if s == "True" => ReadyStatus::failed("JobFailed"),
        _ => ReadyStatus::pending("JobRunning"),
    }
}

/// Daemon_set_ready: every scheduled pod ready, and at least one desired.
pub fn daemon_set_ready(live: &Value) -> ReadyStatus {
    let desired = i64_at(live, &["status", "desiredNumberScheduled"]).unwrap_or(0);
    let ready = i64_at(live, &["status", "numberReady"]).unwrap_or(0);
    if desired == 0 {
        return ReadyStatus::pending("NoPodsScheduled");
    }
    if ready >= desired && ready > 0 {
        ReadyStatus::ready()
    } else {
        ReadyStatus::pending("PodsNotReady")
            .with_message(format!("{ready}/{desired} pods ready"))
    }
}

/// Replication_controller_ready: replicas, ready and available all agree and
/// are positive.
pub fn replication_controller_ready(live: &Value) -> ReadyStatus {
    let replicas = i64_at(live, &["status", "replicas"]).unwrap_or(0);
    let ready = i64_at(live, &["status", "readyReplicas"]).unwrap_or(0);
    let available = i64_at(live, &["status", "availableReplicas"]).unwrap_or(0);
    if replicas > 0 && replicas == ready && ready == available {
        ReadyStatus::ready()
    } else {
        ReadyStatus::pending("ReplicasNotReady")
    }
}

/// Helm_repository_ready: `Ready=True`, with the OCI exemption: an OCI
/// repository is functional once the object has a generation.
pub fn helm_repository_ready(live: &Value) -> ReadyStatus {
    let oci = live
        .get("spec")
        .and_then(|s| s.get("type"))
        .and_then(Value::as_str)
        == Some("oci");
    if oci {
        return match live
            .get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(Value::as_i64)
        {
            Some(_) => ReadyStatus::ready(),
            None => ReadyStatus::pending("OciRepositoryNotObserved"),
        };
    }
    match condition_status(live, "Ready") {
        Some(s) if s == "True" => ReadyStatus::ready(),
        _ => ReadyStatus::pending("RepositoryNotReady"),
    }
}

/// Helm_release_ready accepts both the conditions shape and the legacy
/// `status.phase` shape.
pub fn helm_release_ready(live: &Value) -> ReadyStatus {
    if let Some(phase) = live
        .get("status")
        .and_then(|s| s.get("phase"))
        .and_then(Value::as_str)
    {
        return match phase {
            "Ready" | "Released" | "Deployed" => ReadyStatus::ready(),
            "Installing" | "Upgrading" => ReadyStatus::pending(phase),
            "Failed" => ReadyStatus::failed("Failed"),
            other => ReadyStatus::pending(other),
        };
    }
    let ready = condition_status(live, "Ready");
    let released = condition_status(live, "Released");
    if ready.as_deref() == Some("True") || released.as_deref() == Some("True") {
        return ReadyStatus::ready();
    }
    if ready.as_deref() == Some("False") {
        // Stalled releases stop retrying; surface that as terminal.
        if condition_status(live, "Stalled").as_deref() == Some("True") {
            return ReadyStatus::failed("Stalled");
        }
    }
    ReadyStatus::pending("ReleaseNotReady")
}

/// Kustomization_ready: `Ready=True`, `Healthy=True` when present, and a
/// non-empty inventory.
pub fn kustomization_ready(live: &Value) -> ReadyStatus {
    if condition_status(live, "Ready").as_deref() != Some("True") {
        return ReadyStatus::pending("KustomizationNotReady");
    }
    if let Some(h) = condition_status(live, "Healthy") {
        if h != "True" {
            return ReadyStatus::pending("KustomizationUnhealthy");
        }
    }
    let empty_inventory = live
        .get("status")
        .and_then(|s| s.get("inventory"))
        .and_then(|i| i.get("entries"))
        .and_then(Value::as_array)
        .is_some_and(Vec::is_empty);
    if empty_inventory {
        return ReadyStatus::pending("EmptyInventory");
    }
    ReadyStatus::ready()
}

/// Certificate_ready covers cert-manager Certificates and ClusterIssuers:
/// `Ready=True`.
pub fn certificate_ready(live: &Value) -> ReadyStatus {
    match condition_status(live, "Ready") {
        Some(s) if s == "True" => ReadyStatus::ready(),
        _ => ReadyStatus::pending("NotReady"),
    }
}

/// Challenge_ready: `state=valid` is ready, `processing` keeps waiting,
/// `state=invalid` is terminal.
pub fn challenge_ready(live: &Value) -> ReadyStatus {
    let state = live
        .get("status")
        .and_then(|s| s.get("state"))
        .and_then(Value::as_str);
    match state {
        Some("valid") => ReadyStatus::ready(),
        Some("invalid") => ReadyStatus::failed("ChallengeInvalid"),
        _ => {
            if live
                .get("status")
                .and_then(|s| s.get("processing"))
                .and_then(Value::as_bool)
                == Some(true)
            {
                ReadyStatus::pending("Processing")
            } else {
                ReadyStatus::pending("ChallengePending")
            }
        }
    }
}

/// WaitParams configures one readiness wait.
pub struct WaitParams<'a> {
    /// Graph member id, for events.
    pub resource_id: &'a str,
    /// Object coordinates.
    pub gvk: &'a GvkRef,
    /// Object name.
    pub name: &'a str,
    /// Object namespace.
    pub namespace: Option<&'a str>,
    /// Overall deadline.
    pub timeout: Duration,
    /// Poll interval; the default is two seconds.
    pub interval: Duration,
    /// Cancellation token; aborts in-flight waits.
    pub cancel: &'a CancellationToken,
    /// Event sink for status-debug events.
    pub sink: &'a EventSink,
}

/// Wait_ready polls the live object until the evaluator reports ready, a
/// terminal condition appears, the deadline passes, or the wait is
/// cancelled. The last observed object is returned on success.
pub async fn wait_ready(
    client: &dyn ClusterClient,
    evaluator: &ReadyFn,
    p: WaitParams<'_>,
) -> Result<Value> {
    let started = Instant::now();
    let mut attempt: u32 = 0;
    let mut last_status: Option<Value> = None;
    loop {
        if p.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let elapsed = started.elapsed();
        let timed_out = elapsed >= p.timeout;
        attempt = attempt.saturating_add(1);
        metrics::readiness_poll();

        match client.read(p.gvk, p.name, p.namespace).await {
            Ok(live) => {
                let status = evaluator(&live);
                let current = live.get("status").cloned().unwrap_or(Value::Null);
                p.sink.status_debug(
                    p.resource_id,
                    &current,
                    Some(&status),
                    attempt,
                    elapsed_ms(elapsed),
                    timed_out,
                    None,
                );
                last_status = Some(current);
                if status.ready {
                    trace!(resource = p.resource_id, attempt, "ready");
                    return Ok(live);
                }
                if status.terminal {
                    return Err(Error::ReadinessFailed {
                        resource_id: p.resource_id.to_string(),
                        reason: status.reason.unwrap_or_else(|| "Failed".into()),
                        message: status.message.unwrap_or_default(),
                        last_status,
                    });
                }
            }
            Err(err) => {
                p.sink.status_debug(
                    p.resource_id,
                    &Value::Null,
                    None,
                    attempt,
                    elapsed_ms(elapsed),
                    timed_out,
                    Some(err.to_string()),
                );
                if err.is_denied() {
                    return Err(err.into());
                }
                if err.is_not_found() {
                    // A custom resource can 404 while its CRD is still
                    // propagating; forgive that inside the grace window.
                    let custom = !matches!(p.gvk.group(), "" | "apps" | "batch");
                    if !(custom && elapsed < CRD_PROPAGATION_GRACE) {
                        return Err(Error::ReadinessFailed {
                            resource_id: p.resource_id.to_string(),
                            reason: "NotFound".into(),
                            message: err.to_string(),
                            last_status,
                        });
                    }
                } else if !err.is_transient() {
                    return Err(err.into());
                }
            }
        }

        if timed_out {
            return Err(Error::Timeout {
                resource_id: p.resource_id.to_string(),
                elapsed_ms: elapsed_ms(started.elapsed()),
                last_status,
            });
        }
        tokio::select! {
            _ = p.cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(p.interval) => {}
        }
    }
}

pub(crate) fn elapsed_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
