//! Kro is the controller-backed executor: it applies the emitted
//! ResourceGraphDefinition, creates a custom instance, and observes the
//! state the Kro controller reports. CEL evaluation belongs to the
//! controller; only static status hydrates locally.

use std::time::Instant;

use api::v1alpha1::{InstanceState, ResourceGraphDefinition};
use compose::Composition;
use kube::core::Resource as _;

use crate::{
    direct::{DeployedInstance, PendingExpression},
    prelude::*,
    readiness::elapsed_ms,
};

/// RGD_POLL_INTERVAL is the pause between definition/instance polls.
const RGD_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// KroExecutor deploys through the Kro controller.
pub struct KroExecutor {
    client: Arc<dyn ClusterClient>,
    options: FactoryOptions,
}

impl KroExecutor {
    /// New constructs an executor over a shared client.
    pub fn new(client: Arc<dyn ClusterClient>, options: FactoryOptions) -> Self {
        Self { client, options }
    }

    /// Deploy emits the RGD, waits for the controller to accept it, creates
    /// the instance, and waits for `ACTIVE`.
    #[instrument(skip_all, fields(composition = %composition.name))]
    pub async fn deploy(
        &self,
        composition: &Composition,
        spec: &Value,
        cancel: CancellationToken,
    ) -> Result<DeployedInstance> {
        composition.validate(analysis::Strictness::Lenient)?;
        let sink = EventSink::new(
            self.options.progress.clone(),
            self.options.debug_logging.clone(),
        );
        let rgd = composition.to_rgd()?;
        let rgd_name = rgd.meta().name.clone().unwrap_or_default();
        let rgd_gvk = GvkRef::new(
            ResourceGraphDefinition::api_version(&()).to_string(),
            ResourceGraphDefinition::kind(&()).to_string(),
        );

        composition.schema.spec.validate(spec).map_err(Error::Schema)?;

        sink.progress(&rgd_name, ResourcePhase::Applying, None);
        let rgd_manifest = serde_json::to_value(&rgd)?;
        self.apply(&rgd_gvk, &rgd_name, None, &rgd_manifest).await?;
        self.wait_for_definition(&rgd_gvk, &rgd_name, &sink, &cancel)
            .await?;
        sink.progress(&rgd_name, ResourcePhase::Ready, None);

        // The instance lives under the composition's own API surface.
        let instance_gvk = GvkRef::new(
            composition.schema.instance_api_version(),
            composition.schema.kind.clone(),
        );
        let instance_name = rgd_name.clone();
        let ns = self.options.namespace.clone();
        let instance = json!({
            "apiVersion": &instance_gvk.api_version,
            "kind": &instance_gvk.kind,
            "metadata": {"name": &instance_name, "namespace": &ns},
            "spec": spec,
        });
        sink.progress(&instance_name, ResourcePhase::Applying, None);
        self.apply(&instance_gvk, &instance_name, Some(&ns), &instance)
            .await?;
        let live = self
            .wait_for_instance(&instance_gvk, &instance_name, &ns, &sink, &cancel)
            .await?;
        sink.progress(&instance_name, ResourcePhase::Ready, None);

        let status = self.hydrate(composition, &live)?;
        let applied = vec![
            AppliedRecord {
                gvk: rgd_gvk,
                name: rgd_name,
                namespace: None,
                resource_id: None,
            },
            AppliedRecord {
                gvk: instance_gvk,
                name: instance_name.clone(),
                namespace: Some(ns.clone()),
                resource_id: None,
            },
        ];
        sink.emit(EventKind::Completed {
            applied: applied.len(),
        });
        Ok(DeployedInstance {
            name: instance_name,
            namespace: ns,
            status: status.0,
            pending: status.1,
            applied,
        })
    }

    async fn apply(
        &self,
        gvk: &GvkRef,
        name: &str,
        namespace: Option<&str>,
        manifest: &Value,
    ) -> Result<Value> {
        match self.client.read(gvk, name, namespace).await {
            Ok(_) => Ok(self.client.patch(manifest).await?),
            Err(err) if err.is_not_found() => Ok(self.client.create(manifest).await?),
            Err(err) => Err(err.into()),
        }
    }

    /// Wait_for_definition polls until the controller marks the RGD active.
    async fn wait_for_definition(
        &self,
        gvk: &GvkRef,
        name: &str,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt = attempt.saturating_add(1);
            match self.client.read(gvk, name, None).await {
                Ok(live) => {
                    let state = live
                        .get("status")
                        .and_then(|s| s.get("state"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    sink.status_debug(
                        name,
                        live.get("status").unwrap_or(&Value::Null),
                        None,
                        attempt,
                        elapsed_ms(started.elapsed()),
                        false,
                        None,
                    );
                    if state.eq_ignore_ascii_case("active") {
                        return Ok(());
                    }
                    if state.eq_ignore_ascii_case("inactive") {
                        return Err(Error::Instance {
                            name: name.to_string(),
                            message: condition_summary(&live)
                                .unwrap_or_else(|| "definition is inactive".into()),
                        });
                    }
                }
                Err(err) if err.is_not_found() || err.is_transient() => {
                    trace!(name, error = %err, "definition not observable yet");
                }
                Err(err) => return Err(err.into()),
            }
            if started.elapsed() >= self.options.timeout {
                return Err(Error::Timeout {
                    resource_id: name.to_string(),
                    elapsed_ms: elapsed_ms(started.elapsed()),
                    last_status: None,
                });
            }
            tokio::time::sleep(RGD_POLL_INTERVAL).await;
        }
    }

    /// Wait_for_instance polls the instance's `status.state`.
    async fn wait_for_instance(
        &self,
        gvk: &GvkRef,
        name: &str,
        ns: &str,
        sink: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        let mut last: Option<Value> = None;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            attempt = attempt.saturating_add(1);
            match self.client.read(gvk, name, Some(ns)).await {
                Ok(live) => {
                    let state = InstanceState::of_status(&live);
                    sink.status_debug(
                        name,
                        live.get("status").unwrap_or(&Value::Null),
                        None,
                        attempt,
                        elapsed_ms(started.elapsed()),
                        false,
                        None,
                    );
                    match state {
                        Some(InstanceState::Active) => return Ok(live),
                        Some(InstanceState::Failed) => {
                            return Err(Error::Instance {
                                name: name.to_string(),
                                message: condition_summary(&live)
                                    .unwrap_or_else(|| "instance failed".into()),
                            });
                        }
                        _ => {
                            if !self.options.wait_for_ready {
                                return Ok(live);
                            }
                        }
                    }
                    last = Some(live);
                }
                Err(err) if err.is_not_found() || err.is_transient() => {
                    trace!(name, error = %err, "instance not observable yet");
                }
                Err(err) => return Err(err.into()),
            }
            if started.elapsed() >= self.options.timeout {
                return Err(Error::Timeout {
                    resource_id: name.to_string(),
                    elapsed_ms: elapsed_ms(started.elapsed()),
                    last_status: last.and_then(|l| l.get("status").cloned()),
                });
            }
            tokio::time::sleep(RGD_POLL_INTERVAL).await;
        }
    }

    /// Hydrate merges host-side static status with the controller-resolved
    /// dynamic fields read off the live instance.
    fn hydrate(
        &self,
        composition: &Composition,
        live: &Value,
    ) -> Result<(Value, Vec<PendingExpression>)> {
        if !self.options.hydrate_status {
            return Ok((Value::Null, Vec::new()));
        }
        let partition = analysis::analyzer::partition_status(&composition.status)
            .map_err(compose::Error::from)?;
        let mut out = serde_json::Map::new();
        for (k, v) in &partition.static_fields {
            out.insert(k.clone(), v.clone());
        }
        let mut pending = Vec::new();
        let live_status = live.get("status").cloned().unwrap_or(Value::Null);
        for (k, v) in &partition.dynamic_fields {
            match live_status.get(k) {
                Some(resolved) => {
                    out.insert(k.clone(), resolved.clone());
                }
                None => {
                    let template =
                        analysis::analyzer::materialize(v, analysis::Target::Kro);
                    pending.push(PendingExpression {
                        path: k.clone(),
                        expression: template
                            .as_str()
                            .map(String::from)
                            .unwrap_or_else(|| template.to_string()),
                    });
                }
            }
        }
        Ok((Value::Object(out), pending))
    }
}

/// Condition_summary renders the first falsy condition's message.
fn condition_summary(live: &Value) -> Option<String> {
    let conditions = live.get("status")?.get("conditions")?.as_array()?;
    conditions
        .iter()
        .find(|c| c.get("status").and_then(Value::as_str) != Some("True"))
        .or_else(|| conditions.first())
        .map(|c| {
            let reason = c.get("reason").and_then(Value::as_str).unwrap_or("");
            let message = c.get("message").and_then(Value::as_str).unwrap_or("");
            format!("{reason}: {message}")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockClient;
    use api::{
        resource::Resource,
        schema::{SchemaDefinition, StaticSchema},
    };

    fn comp() -> Composition {
        Composition {
            name: "web".into(),
            schema: SchemaDefinition::new("example.dev", "WebApp")
                .with_spec(StaticSchema(json!({"name": "string"}))),
            resources: vec![
                Resource::with_id(
                    "cm",
                    json!({
                        "apiVersion": "v1",
                        "kind": "ConfigMap",
                        "metadata": {"name": "web"},
                    }),
                )
                .unwrap(),
            ],
            closures: Vec::new(),
            status: json!({
                "url": "https://ex.com",
                "ready": "${cm.metadata.name == \"web\"}",
            }),
        }
    }

    #[test_log::test(tokio::test)]
    async fn kro_deploy_applies_rgd_then_instance() {
        let client = Arc::new(MockClient::default());
        client
            .script_status("kro.run/v1alpha1/ResourceGraphDefinition/_/web", json!({"state": "Active"}))
            .await;
        client
            .script_status(
                "example.dev/v1alpha1/WebApp/default/web",
                json!({"state": "ACTIVE", "ready": true}),
            )
            .await;
        let exec = KroExecutor::new(client.clone(), FactoryOptions::default());
        let out = exec
            .deploy(&comp(), &json!({"name": "x"}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.applied.len(), 2);
        // Static hydrates locally, dynamic comes off the live instance.
        assert_eq!(out.status["url"], json!("https://ex.com"));
        assert_eq!(out.status["ready"], json!(true));
        assert!(out.pending.is_empty());
        let log = client.log().await;
        assert!(
            log.iter()
                .any(|l| l == "create kro.run/v1alpha1/ResourceGraphDefinition/_/web"),
        );
        assert!(log.iter().any(|l| l == "create example.dev/v1alpha1/WebApp/default/web"));
    }

    #[test_log::test(tokio::test)]
    async fn failed_instance_surfaces_conditions() {
        let client = Arc::new(MockClient::default());
        client
            .script_status("kro.run/v1alpha1/ResourceGraphDefinition/_/web", json!({"state": "Active"}))
            .await;
        client
            .script_status(
                "example.dev/v1alpha1/WebApp/default/web",
                json!({
                    "state": "FAILED",
                    "conditions": [{
                        "type": "Ready",
                        "status": "False",
                        "reason": "ResolutionError",
                        "message": "no such field",
                    }],
                }),
            )
            .await;
        let exec = KroExecutor::new(client, FactoryOptions::default());
        let err = exec
            .deploy(&comp(), &json!({"name": "x"}), CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Instance { message, .. } => {
                assert!(message.contains("ResolutionError"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
