//! Cluster_state is the accessor surface custom readiness evaluators and
//! failure diagnostics use.

use std::time::Instant;

use crate::{
    options::{EventMonitoring, WatchedEventType},
    prelude::*,
    readiness::{ReadinessEngine, condition_status, elapsed_ms},
};

/// ClusterStateAccessor wraps the narrow client with condition-oriented
/// helpers.
#[derive(Clone)]
pub struct ClusterStateAccessor {
    client: Arc<dyn ClusterClient>,
    namespace: String,
}

impl ClusterStateAccessor {
    /// New constructs an accessor with a default namespace.
    pub fn new<S: Into<String>>(client: Arc<dyn ClusterClient>, namespace: S) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn ns<'a>(&'a self, namespace: Option<&'a str>) -> Option<&'a str> {
        namespace.or(Some(&self.namespace))
    }

    /// Get_resource fetches one live object.
    pub async fn get_resource(
        &self,
        gvk: &GvkRef,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Value, api::client::Error> {
        self.client.read(gvk, name, self.ns(namespace)).await
    }

    /// List_resources enumerates live objects.
    pub async fn list_resources(
        &self,
        gvk: &GvkRef,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<Value>, api::client::Error> {
        self.client.list(gvk, self.ns(namespace), selector).await
    }

    /// Check_resource_condition reports whether the named condition has the
    /// expected status (`True` when unspecified).
    pub async fn check_resource_condition(
        &self,
        gvk: &GvkRef,
        name: &str,
        namespace: Option<&str>,
        condition: &str,
        expected: Option<&str>,
    ) -> Result<bool, api::client::Error> {
        let live = self.get_resource(gvk, name, namespace).await?;
        let want = expected.unwrap_or("True");
        Ok(condition_status(&live, condition).as_deref() == Some(want))
    }

    /// Check_multiple_resources_ready runs the registry evaluators over a
    /// set of objects and reports whether all are ready.
    pub async fn check_multiple_resources_ready(
        &self,
        engine: &ReadinessEngine,
        objects: &[(GvkRef, String, Option<String>)],
    ) -> Result<bool, api::client::Error> {
        for (gvk, name, namespace) in objects {
            let live = self
                .get_resource(gvk, name, namespace.as_deref())
                .await?;
            let evaluator = engine.evaluator_for(gvk);
            if !evaluator(&live).ready {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Wait_for_condition polls until the named condition has the expected
    /// status or the timeout passes. Returns the last observed object.
    pub async fn wait_for_condition(
        &self,
        gvk: &GvkRef,
        name: &str,
        namespace: Option<&str>,
        condition: &str,
        expected: &str,
        timeout: Duration,
    ) -> Result<Value> {
        let started = Instant::now();
        let mut last: Option<Value> = None;
        loop {
            match self.get_resource(gvk, name, namespace).await {
                Ok(live) => {
                    if condition_status(&live, condition).as_deref() == Some(expected) {
                        return Ok(live);
                    }
                    last = Some(live);
                }
                Err(err) if err.is_transient() || err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
            if started.elapsed() >= timeout {
                return Err(Error::Timeout {
                    resource_id: name.to_string(),
                    elapsed_ms: elapsed_ms(started.elapsed()),
                    last_status: last.and_then(|l| l.get("status").cloned()),
                });
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }

    /// Involved_events lists Kubernetes Events for an object, filtered to the
    /// configured types; used to enrich failure events.
    pub async fn involved_events(&self, name: &str, cfg: &EventMonitoring) -> Vec<Value> {
        if !cfg.enabled {
            return Vec::new();
        }
        let gvk = GvkRef::new("v1", "Event");
        let listed = match self.client.list(&gvk, Some(&self.namespace), None).await {
            Ok(items) => items,
            Err(err) => {
                debug!(error = %err, "could not list events");
                return Vec::new();
            }
        };
        listed
            .into_iter()
            .filter(|ev| {
                ev.get("involvedObject")
                    .and_then(|o| o.get("name"))
                    .and_then(Value::as_str)
                    == Some(name)
            })
            .filter(|ev| {
                let type_ = ev.get("type").and_then(Value::as_str).unwrap_or("Normal");
                cfg.event_types
                    .iter()
                    .any(|t| matches!(
                        (t, type_),
                        (WatchedEventType::Normal, "Normal")
                            | (WatchedEventType::Warning, "Warning")
                            | (WatchedEventType::Error, "Error")
                    ))
            })
            .collect()
    }
}
