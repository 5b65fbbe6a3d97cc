//! Direct is the level-parallel executor: it applies the graph itself,
//! resolving references against observed state, waiting on readiness, and
//! rolling back on failure.

use std::collections::BTreeSet;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::{sync::Mutex, task::JoinSet};

use api::{reference::SCHEMA_ROOT, resource::Resource};
use compose::{
    ClosureResource, Composition, DeploymentContext,
    closure::{ClosureError, ResolveReference},
};

use crate::{
    cluster_state::ClusterStateAccessor,
    metrics,
    prelude::*,
    readiness::{DEFAULT_POLL_INTERVAL, ReadinessEngine, WaitParams, wait_ready},
    resolve::{Hydration, ObservedState, hydrate_status, resolve_value},
    rollback::{RollbackOptions, rollback},
};

/// MAX_APPLY_ATTEMPTS bounds retries of transient apply failures.
const MAX_APPLY_ATTEMPTS: u32 = 4;

/// RETRY_BASE is the first backoff step; it doubles per attempt.
const RETRY_BASE: Duration = Duration::from_millis(500);

/// PendingExpression is a status field that could not hydrate locally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExpression {
    /// Status field name.
    pub path: String,
    /// The template that needs CEL or missing state.
    pub expression: String,
}

/// DeployedInstance is the caller-visible result of a deploy.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedInstance {
    /// Composition name.
    pub name: String,
    /// Namespace deployed into.
    pub namespace: String,
    /// Status mapping with static fields hydrated and observed values
    /// resolved.
    pub status: Value,
    /// Pending lists status fields that need the Kro controller (or more
    /// cluster state) to settle.
    pub pending: Vec<PendingExpression>,
    /// Applied records, in runtime application order.
    pub applied: Vec<AppliedRecord>,
}

/// DirectExecutor deploys compositions level by level.
pub struct DirectExecutor {
    client: Arc<dyn ClusterClient>,
    readiness: ReadinessEngine,
    options: FactoryOptions,
}

impl DirectExecutor {
    /// New constructs an executor over a shared client.
    pub fn new(client: Arc<dyn ClusterClient>, options: FactoryOptions) -> Self {
        Self {
            client,
            readiness: ReadinessEngine::default(),
            options,
        }
    }

    /// With_readiness swaps the evaluator registry.
    pub fn with_readiness(mut self, readiness: ReadinessEngine) -> Self {
        self.readiness = readiness;
        self
    }

    /// Deploy runs the full plan with a fresh cancellation token.
    pub async fn deploy(
        &self,
        composition: &Composition,
        spec: &Value,
    ) -> Result<DeployedInstance> {
        self.deploy_with_cancel(composition, spec, CancellationToken::new())
            .await
    }

    /// Deploy_with_cancel runs the full plan.
    ///
    /// Levels execute in order; members of a level run as parallel tasks
    /// (closures sequentially after them). A failure lets the level's peers
    /// finish, then rolls back everything applied, in reverse runtime order.
    #[instrument(skip_all, fields(composition = %composition.name))]
    pub async fn deploy_with_cancel(
        &self,
        composition: &Composition,
        spec: &Value,
        cancel: CancellationToken,
    ) -> Result<DeployedInstance> {
        composition.validate(analysis::Strictness::Lenient)?;
        let plan = composition.plan()?;
        info!(
            levels = plan.levels.len(),
            width = plan.max_parallelism(),
            "deploying"
        );
        let sink = EventSink::new(
            self.options.progress.clone(),
            self.options.debug_logging.clone(),
        );

        let mut expected: BTreeSet<String> = composition.ids();
        expected.insert(SCHEMA_ROOT.to_string());
        for ext in composition.externals() {
            expected.insert(ext);
        }
        let observed = Arc::new(ObservedState::new(expected));
        observed
            .insert(SCHEMA_ROOT, json!({"spec": spec, "status": {}}))
            .await;
        self.prefetch_externals(composition, &observed).await;

        let applied: Arc<Mutex<Vec<AppliedRecord>>> = Arc::default();
        let failure = self
            .run_levels(composition, &plan, &observed, &applied, &sink, &cancel)
            .await;

        let applied = applied.lock().await.clone();

        if let Some(err) = failure {
            let events = match &err {
                Error::ReadinessFailed { resource_id, .. }
                | Error::Timeout { resource_id, .. } => {
                    let accessor = ClusterStateAccessor::new(
                        self.client.clone(),
                        self.options.namespace.clone(),
                    );
                    accessor
                        .involved_events(resource_id, &self.options.event_monitoring)
                        .await
                }
                _ => Vec::new(),
            };
            sink.emit(EventKind::Failed {
                resource_id: failing_resource(&err),
                error: err.to_string(),
                cluster_events: events,
            });
            if self.options.rollback_on_failure && !applied.is_empty() {
                warn!(records = applied.len(), "deployment failed; rolling back");
                let outcome = rollback(
                    self.client.as_ref(),
                    &applied,
                    &RollbackOptions::default(),
                    &sink,
                    &cancel,
                )
                .await;
                if !outcome.is_success() {
                    error!("rollback incomplete");
                }
            }
            return Err(err);
        }

        let Hydration { status, pending } = if self.options.hydrate_status {
            hydrate_status(&composition.status, &observed, &cancel).await
        } else {
            Hydration {
                status: Value::Null,
                pending: Vec::new(),
            }
        };
        sink.emit(EventKind::Completed {
            applied: applied.len(),
        });
        Ok(DeployedInstance {
            name: composition.name.clone(),
            namespace: self.options.namespace.clone(),
            status,
            pending: pending
                .into_iter()
                .map(|(path, expression)| PendingExpression { path, expression })
                .collect(),
            applied,
        })
    }

    /// Run_levels executes the plan and returns the first failure, if any.
    async fn run_levels(
        &self,
        composition: &Composition,
        plan: &compose::DeploymentPlan,
        observed: &Arc<ObservedState>,
        applied: &Arc<Mutex<Vec<AppliedRecord>>>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Option<Error> {
        let mut failure: Option<Error> = None;
        for (depth, level) in plan.levels.iter().enumerate() {
            if cancel.is_cancelled() {
                failure.get_or_insert(Error::Cancelled);
                break;
            }
            debug!(depth, members = level.len(), "starting level");
            let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();
            let mut closures: Vec<&ClosureResource> = Vec::new();
            for id in level {
                if let Some(resource) = composition.resource(id) {
                    if resource.is_external() {
                        continue;
                    }
                    tasks.spawn(self.spawn_member(
                        resource.clone(),
                        observed.clone(),
                        applied.clone(),
                        sink.clone(),
                        cancel.clone(),
                    ));
                } else if let Some(c) = composition.closures.iter().find(|c| c.name() == id) {
                    closures.push(c);
                }
            }
            // Peers always finish; one failure never cancels its level.
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(()))) => {}
                    Ok((id, Err(err))) => {
                        error!(id = %id, error = %err, "member failed");
                        failure.get_or_insert(err);
                    }
                    Err(join_err) => {
                        failure.get_or_insert(join_err.into());
                    }
                }
            }
            for c in closures {
                if failure.is_some() || cancel.is_cancelled() {
                    sink.progress(c.name(), ResourcePhase::Skipped, None);
                    continue;
                }
                if let Err(err) = self.run_closure(c, observed, applied, sink, cancel).await {
                    failure.get_or_insert(err);
                }
            }
            if failure.is_some() {
                break;
            }
        }
        failure
    }

    /// Spawn_member builds the owned future for one resource task.
    fn spawn_member(
        &self,
        resource: Resource,
        observed: Arc<ObservedState>,
        applied: Arc<Mutex<Vec<AppliedRecord>>>,
        sink: EventSink,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, (String, Result<()>)> {
        let client = self.client.clone();
        let readiness = self.readiness.clone();
        let options = self.options.clone();
        Box::pin(async move {
            let id = resource.id().to_string();
            let out = deploy_member(
                client.as_ref(),
                &readiness,
                &options,
                &resource,
                &observed,
                &applied,
                &sink,
                &cancel,
            )
            .await;
            (id, out)
        })
    }

    async fn run_closure(
        &self,
        c: &ClosureResource,
        observed: &Arc<ObservedState>,
        applied: &Arc<Mutex<Vec<AppliedRecord>>>,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        sink.progress(c.name(), ResourcePhase::Applying, None);
        let ctx = DeploymentContext {
            client: self.client.clone(),
            resolver: Arc::new(ObservedResolver {
                observed: observed.clone(),
                cancel: cancel.clone(),
            }),
            namespace: self.options.namespace.clone(),
            strategy: self.options.deployment_strategy,
            scope: self.options.alchemy_scope.clone(),
        };
        match c.apply(ctx).await {
            Ok(records) => {
                for r in &records {
                    debug!(closure = c.name(), record = %r, "closure applied");
                }
                // References into a closure resolve against what it applied.
                observed
                    .insert(c.name(), json!({"applied": &records}))
                    .await;
                applied.lock().await.extend(records);
                sink.progress(c.name(), ResourcePhase::Ready, None);
                Ok(())
            }
            Err(err) => {
                sink.progress(c.name(), ResourcePhase::Failed, Some(err.to_string()));
                Err(Error::Closure {
                    name: c.name().to_string(),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Prefetch_externals reads externally-owned members so references to
    /// them resolve like any other observed state.
    async fn prefetch_externals(&self, composition: &Composition, observed: &ObservedState) {
        for r in composition.resources.iter().filter(|r| r.is_external()) {
            let Some(name) = r.name() else {
                warn!(id = r.id(), "external resource has no name; skipping prefetch");
                continue;
            };
            let ns = r.namespace().or(Some(self.options.namespace.as_str()));
            match self.client.read(&r.gvk(), name, ns).await {
                Ok(live) => observed.insert(r.id(), live).await,
                Err(err) => {
                    warn!(id = r.id(), error = %err, "external resource not readable");
                }
            }
        }
    }
}

struct ObservedResolver {
    observed: Arc<ObservedState>,
    cancel: CancellationToken,
}

impl ResolveReference for ObservedResolver {
    fn resolve<'a>(
        &'a self,
        r: &'a api::reference::ResourceRef,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Value, ClosureError>> + Send + 'a>,
    > {
        Box::pin(async move {
            self.observed
                .resolve_ref(r, &self.cancel)
                .await
                .map_err(|e| -> ClosureError { Box::new(e) })
        })
    }
}

fn failing_resource(err: &Error) -> Option<String> {
    match err {
        Error::ReadinessFailed { resource_id, .. }
        | Error::Timeout { resource_id, .. }
        | Error::Resolve { resource_id, .. } => Some(resource_id.clone()),
        Error::Closure { name, .. } => Some(name.clone()),
        _ => None,
    }
}

/// Deploy_member runs the per-resource pipeline:
/// Pending → Resolving → Applying → Created → WaitingReady → Ready.
#[allow(clippy::too_many_arguments)]
async fn deploy_member(
    client: &dyn ClusterClient,
    readiness: &ReadinessEngine,
    options: &FactoryOptions,
    resource: &Resource,
    observed: &ObservedState,
    applied: &Mutex<Vec<AppliedRecord>>,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let id = resource.id();
    sink.progress(id, ResourcePhase::Pending, None);

    sink.progress(id, ResourcePhase::Resolving, None);
    let mut manifest = resolve_value(resource.template(), observed, cancel)
        .await
        .map_err(|source| Error::Resolve {
            resource_id: id.to_string(),
            source,
        })?;
    default_namespace(&mut manifest, &options.namespace);

    sink.progress(id, ResourcePhase::Applying, None);
    let applied_obj = apply_with_retry(client, &manifest, cancel).await.map_err(|e| {
        metrics::apply_failure();
        sink.progress(id, ResourcePhase::Failed, Some(e.to_string()));
        e
    })?;
    metrics::apply();
    let record = AppliedRecord::from_manifest(Some(id), &applied_obj)
        .or_else(|| AppliedRecord::from_manifest(Some(id), &manifest));
    if let Some(record) = record {
        applied.lock().await.push(record);
    }
    sink.progress(id, ResourcePhase::Created, None);

    let live = if options.wait_for_ready {
        sink.progress(id, ResourcePhase::WaitingReady, None);
        let gvk = resource.gvk();
        let name = manifest
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ns = manifest
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(String::from);
        let evaluator = resource
            .readiness_fn()
            .cloned()
            .unwrap_or_else(|| readiness.evaluator_for(&gvk));
        wait_ready(
            client,
            &evaluator,
            WaitParams {
                resource_id: id,
                gvk: &gvk,
                name: &name,
                namespace: ns.as_deref(),
                timeout: options.timeout,
                interval: DEFAULT_POLL_INTERVAL,
                cancel,
                sink,
            },
        )
        .await
        .inspect_err(|e| {
            sink.progress(id, ResourcePhase::Failed, Some(e.to_string()));
        })?
    } else {
        applied_obj
    };

    observed.insert(id, live).await;
    sink.progress(id, ResourcePhase::Ready, None);
    Ok(())
}

/// Apply_with_retry does get → create/patch with bounded exponential retry
/// on transient failures and a single patch retry on create conflicts.
async fn apply_with_retry(
    client: &dyn ClusterClient,
    manifest: &Value,
    cancel: &CancellationToken,
) -> Result<Value> {
    let gvk = GvkRef::of_manifest(manifest)
        .ok_or_else(|| api::client::Error::Manifest("missing apiVersion/kind".into()))?;
    let name = manifest
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| api::client::Error::Manifest("missing metadata.name".into()))?;
    let ns = manifest
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str);

    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempt = attempt.saturating_add(1);
        let existing = match client.read(&gvk, name, ns).await {
            Ok(v) => Some(v),
            Err(err) if err.is_not_found() => None,
            Err(err) if err.is_transient() && attempt < MAX_APPLY_ATTEMPTS => {
                backoff(attempt).await;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        let result = match existing {
            None => match client.create(manifest).await {
                // Lost a create race; fall back to patching over the winner.
                Err(err) if err.is_conflict() => client.patch(manifest).await,
                other => other,
            },
            Some(_) => match client.patch(manifest).await {
                Err(err) if err.is_conflict() => client.patch(manifest).await,
                other => other,
            },
        };
        match result {
            Ok(v) => return Ok(v),
            Err(err) if err.is_transient() && attempt < MAX_APPLY_ATTEMPTS => {
                debug!(name, attempt, error = %err, "transient apply failure");
                backoff(attempt).await;
            }
            Err(err) => return Err(err.into()),
        }
    }
}

async fn backoff(attempt: u32) {
    let factor = 1u32 << attempt.min(6);
    tokio::time::sleep(RETRY_BASE.saturating_mul(factor)).await;
}

fn default_namespace(manifest: &mut Value, namespace: &str) {
    let Some(meta) = manifest.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    meta.entry("namespace".to_string())
        .or_insert_with(|| Value::String(namespace.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockClient, key_of};
    use api::schema::SchemaDefinition;
    use std::sync::Mutex as StdMutex;

    fn quick_options() -> FactoryOptions {
        FactoryOptions {
            wait_for_ready: false,
            ..Default::default()
        }
    }

    fn cm(id: &str, name: &str, data: Value) -> Resource {
        Resource::with_id(
            id,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": name},
                "data": data,
            }),
        )
        .unwrap()
    }

    fn comp(resources: Vec<Resource>, status: Value) -> Composition {
        Composition {
            name: "test".into(),
            schema: SchemaDefinition::new("example.dev", "Test"),
            resources,
            closures: Vec::new(),
            status,
        }
    }

    #[test_log::test(tokio::test)]
    async fn empty_composition_deploys_zero_records() {
        let client = Arc::new(MockClient::default());
        let exec = DirectExecutor::new(client, quick_options());
        let out = exec.deploy(&comp(vec![], Value::Null), &json!({})).await.unwrap();
        assert!(out.applied.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn dependent_manifests_see_observed_values() {
        let client = Arc::new(MockClient::default());
        client
            .script_status("v1/ConfigMap/default/first", json!({"answer": "42"}))
            .await;
        let first = cm("first", "first", json!({"k": "v"}));
        let second = cm(
            "second",
            "second",
            json!({"from": "${first.status.answer}"}),
        );
        let exec = DirectExecutor::new(client.clone(), quick_options());
        let out = exec
            .deploy(&comp(vec![first, second], Value::Null), &json!({}))
            .await
            .unwrap();
        assert_eq!(out.applied.len(), 2);
        let stored = client.get_object("v1/ConfigMap/default/second").await.unwrap();
        assert_json_diff::assert_json_include!(
            actual: stored,
            expected: json!({"data": {"from": "42"}}),
        );
    }

    #[test_log::test(tokio::test)]
    async fn schema_refs_resolve_from_the_instance_spec() {
        let client = Arc::new(MockClient::default());
        let r = cm(
            "cm",
            "cm",
            json!({"image": {"$kroRef": {"resourceId": "__schema__", "fieldPath": "spec.image"}}}),
        );
        let exec = DirectExecutor::new(client.clone(), quick_options());
        exec.deploy(&comp(vec![r], Value::Null), &json!({"image": "nginx:1.27"}))
            .await
            .unwrap();
        let stored = client.get_object("v1/ConfigMap/default/cm").await.unwrap();
        assert_eq!(stored["data"]["image"], "nginx:1.27");
    }

    #[test_log::test(tokio::test)]
    async fn failure_rolls_back_in_reverse_runtime_order() {
        let client = Arc::new(MockClient::default());
        client
            .fail_with(
                "create",
                "v1/ConfigMap/default/third",
                api::client::Error::Api {
                    code: 403,
                    message: "denied".into(),
                },
            )
            .await;
        let first = cm("first", "first", json!({}));
        let second = cm("second", "second", json!({"x": "${first.metadata.name}"}));
        let third = cm("third", "third", json!({"y": "${second.metadata.name}"}));
        let exec = DirectExecutor::new(client.clone(), quick_options());
        let err = exec
            .deploy(&comp(vec![first, second, third], Value::Null), &json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Forbidden");
        let log = client.log().await;
        let deletes: Vec<&String> = log.iter().filter(|l| l.starts_with("delete")).collect();
        assert_eq!(
            deletes,
            vec![
                "delete v1/ConfigMap/default/second",
                "delete v1/ConfigMap/default/first",
            ],
        );
    }

    #[test_log::test(tokio::test)]
    async fn status_hydrates_and_surfaces_pending() {
        let client = Arc::new(MockClient::default());
        client
            .script_status(
                "v1/ConfigMap/default/only",
                json!({"readyReplicas": 3}),
            )
            .await;
        let only = cm("only", "only", json!({}));
        let status = json!({
            "replicas": "${only.status.readyReplicas}",
            "ready": "${only.status.readyReplicas >= 3}",
            "url": "https://ex.com",
        });
        let exec = DirectExecutor::new(client, quick_options());
        let out = exec.deploy(&comp(vec![only], status), &json!({})).await.unwrap();
        assert_eq!(out.status["replicas"], json!(3));
        assert_eq!(out.status["url"], json!("https://ex.com"));
        assert_eq!(out.pending.len(), 1);
        assert_eq!(out.pending[0].path, "ready");
    }

    #[test_log::test(tokio::test)]
    async fn events_preserve_per_resource_order() {
        let client = Arc::new(MockClient::default());
        let seen: Arc<StdMutex<Vec<(u64, String, ResourcePhase)>>> = Arc::default();
        let sink_seen = seen.clone();
        let mut options = quick_options();
        options.progress = Some(Arc::new(move |ev: &DeployEvent| {
            if let EventKind::Progress {
                resource_id, phase, ..
            } = &ev.kind
            {
                sink_seen
                    .lock()
                    .unwrap()
                    .push((ev.sequence, resource_id.clone(), *phase));
            }
        }));
        let exec = DirectExecutor::new(client, options);
        exec.deploy(&comp(vec![cm("a", "a", json!({}))], Value::Null), &json!({}))
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        let phases: Vec<ResourcePhase> = seen.iter().map(|(_, _, p)| *p).collect();
        assert_eq!(
            phases,
            vec![
                ResourcePhase::Pending,
                ResourcePhase::Resolving,
                ResourcePhase::Applying,
                ResourcePhase::Created,
                ResourcePhase::Ready,
            ],
        );
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test_log::test(tokio::test)]
    async fn second_deploy_patches_instead_of_creating() {
        let client = Arc::new(MockClient::default());
        let exec = DirectExecutor::new(client.clone(), quick_options());
        let c = comp(vec![cm("a", "a", json!({"k": "v"}))], Value::Null);
        exec.deploy(&c, &json!({})).await.unwrap();
        exec.deploy(&c, &json!({})).await.unwrap();
        let log = client.log().await;
        assert_eq!(log.iter().filter(|l| l.starts_with("create")).count(), 1);
        assert_eq!(log.iter().filter(|l| l.starts_with("patch")).count(), 1);
        assert_eq!(key_of(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "a", "namespace": "default"},
        })), "v1/ConfigMap/default/a");
    }

    #[test_log::test(tokio::test)]
    async fn closures_run_and_their_records_roll_back() {
        let client = Arc::new(MockClient::default());
        client
            .fail_with(
                "create",
                "v1/ConfigMap/default/late",
                api::client::Error::Api {
                    code: 401,
                    message: "no".into(),
                },
            )
            .await;
        let closure = ClosureResource::new("seed", Vec::new(), |ctx: DeploymentContext| {
            async move {
                crate::closures::apply_documents(
                    &ctx,
                    vec![json!({
                        "apiVersion": "v1",
                        "kind": "Secret",
                        "metadata": {"name": "seeded"},
                    })],
                )
                .await
            }
        });
        let late = cm("late", "late", json!({"x": "${seed.applied[0].name}"}));
        let c = Composition {
            name: "t".into(),
            schema: SchemaDefinition::new("example.dev", "T"),
            resources: vec![late],
            closures: vec![closure],
            status: Value::Null,
        };
        let exec = DirectExecutor::new(client.clone(), quick_options());
        let err = exec.deploy(&c, &json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "Forbidden");
        let log = client.log().await;
        assert!(log.contains(&"delete v1/Secret/default/seeded".to_string()));
    }
}
