//! Rollback deletes applied records in reverse application order.

use std::time::Instant;

use serde::Serialize;

use crate::{metrics, prelude::*, readiness::elapsed_ms};

/// RollbackOptions tunes a rollback pass.
#[derive(Clone, Debug)]
pub struct RollbackOptions {
    /// Force retries failed deletions with a zero grace period.
    pub force: bool,
    /// Timeout, when non-zero, bounds a wait-for-gone poll after each
    /// deletion.
    pub timeout: Duration,
    /// Emit_events controls per-record progress events.
    pub emit_events: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            force: false,
            timeout: Duration::ZERO,
            emit_events: true,
        }
    }
}

/// RollbackStatus is the aggregate outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackStatus {
    /// Every record deleted.
    Success,
    /// Some records deleted.
    Partial,
    /// No record deleted.
    Failed,
}

/// RollbackItem is one record's outcome.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackItem {
    /// The record.
    pub record: AppliedRecord,
    /// The deletion error, absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// RollbackOutcome aggregates a pass.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    /// Aggregate status.
    pub status: RollbackStatus,
    /// Per-record outcomes in deletion order.
    pub items: Vec<RollbackItem>,
}

impl RollbackOutcome {
    /// Is_success reports a clean pass.
    pub fn is_success(&self) -> bool {
        self.status == RollbackStatus::Success
    }

    /// Into_result converts a non-clean pass into a rollback error carrying
    /// the per-record outcomes.
    pub fn into_result(self) -> crate::Result<Vec<RollbackItem>> {
        match self.status {
            RollbackStatus::Success => Ok(self.items),
            _ => Err(crate::Error::Rollback { items: self.items }),
        }
    }
}

/// Rollback deletes `records` in reverse order.
///
/// A 404 counts as success. Per-record errors never stop the pass; the
/// aggregate is `Partial` when some deletions fail and `Failed` when all do.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn rollback(
    client: &dyn ClusterClient,
    records: &[AppliedRecord],
    opts: &RollbackOptions,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> RollbackOutcome {
    let mut items = Vec::with_capacity(records.len());
    for record in records.iter().rev() {
        let error = delete_one(client, record, opts, cancel).await;
        match &error {
            None => {
                metrics::rollback_deletion();
                debug!(%record, "rolled back");
            }
            Some(e) => warn!(%record, error = %e, "rollback deletion failed"),
        }
        if opts.emit_events {
            sink.rolled_back(record, error.as_deref());
        }
        items.push(RollbackItem {
            record: record.clone(),
            error,
        });
    }
    let failed = items.iter().filter(|i| i.error.is_some()).count();
    let status = if failed == 0 {
        RollbackStatus::Success
    } else if failed == items.len() && !items.is_empty() {
        RollbackStatus::Failed
    } else {
        RollbackStatus::Partial
    };
    let outcome = RollbackOutcome { status, items };
    if opts.emit_events {
        sink.emit(EventKind::Rollback {
            status: outcome.status,
            items: outcome.items.clone(),
        });
    }
    outcome
}

async fn delete_one(
    client: &dyn ClusterClient,
    record: &AppliedRecord,
    opts: &RollbackOptions,
    cancel: &CancellationToken,
) -> Option<String> {
    let ns = record.namespace.as_deref();
    match client.delete(&record.gvk, &record.name, ns, None).await {
        Ok(()) => {}
        Err(err) if err.is_not_found() => return None,
        Err(err) => {
            if !opts.force {
                return Some(err.to_string());
            }
            match client.delete(&record.gvk, &record.name, ns, Some(0)).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => return None,
                Err(err) => return Some(format!("forced deletion failed: {err}")),
            }
        }
    }
    if opts.timeout.is_zero() {
        return None;
    }
    // Wait for the object to actually go away.
    let started = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Some("rollback wait cancelled".into());
        }
        match client.read(&record.gvk, &record.name, ns).await {
            Err(err) if err.is_not_found() => return None,
            Ok(_) | Err(_) => {}
        }
        if started.elapsed() >= opts.timeout {
            return Some(format!(
                "still present after {}ms",
                elapsed_ms(started.elapsed()),
            ));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Some("rollback wait cancelled".into()),
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockClient;
    use api::client::{Error as ClientError, GvkRef};

    fn record(kind: &str, name: &str) -> AppliedRecord {
        AppliedRecord {
            gvk: GvkRef::new("v1", kind),
            name: name.into(),
            namespace: Some("default".into()),
            resource_id: Some(name.into()),
        }
    }

    async fn seed(client: &MockClient, kind: &str, name: &str) {
        client
            .create(&json!({
                "apiVersion": "v1",
                "kind": kind,
                "metadata": {"name": name, "namespace": "default"},
            }))
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn deletes_run_in_reverse_and_tolerate_404() {
        let client = MockClient::default();
        for name in ["db", "dbSvc", "app", "appSvc"] {
            seed(&client, "ConfigMap", name).await;
        }
        // "ingress" was applied last but is already gone.
        let records: Vec<AppliedRecord> = ["db", "dbSvc", "app", "appSvc", "ingress"]
            .into_iter()
            .map(|n| record("ConfigMap", n))
            .collect();
        let outcome = rollback(
            &client,
            &records,
            &RollbackOptions::default(),
            &EventSink::disabled(),
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.is_success());
        let deletes: Vec<String> = client
            .log()
            .await
            .into_iter()
            .filter(|l| l.starts_with("delete"))
            .collect();
        assert_eq!(
            deletes,
            vec![
                "delete v1/ConfigMap/default/ingress",
                "delete v1/ConfigMap/default/appSvc",
                "delete v1/ConfigMap/default/app",
                "delete v1/ConfigMap/default/dbSvc",
                "delete v1/ConfigMap/default/db",
            ],
        );
    }

    #[test_log::test(tokio::test)]
    async fn force_retries_with_zero_grace() {
        let client = MockClient::default();
        seed(&client, "ConfigMap", "stuck").await;
        client
            .fail_with(
                "delete",
                "v1/ConfigMap/default/stuck",
                ClientError::Api {
                    code: 500,
                    message: "finalizer".into(),
                },
            )
            .await;
        let outcome = rollback(
            &client,
            &[record("ConfigMap", "stuck")],
            &RollbackOptions {
                force: true,
                ..Default::default()
            },
            &EventSink::disabled(),
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.is_success());
        assert_eq!(
            client
                .log()
                .await
                .iter()
                .filter(|l| l.starts_with("delete"))
                .count(),
            2,
        );
    }

    #[test_log::test(tokio::test)]
    async fn partial_outcome_isolates_failures() {
        let client = MockClient::default();
        seed(&client, "ConfigMap", "good").await;
        seed(&client, "ConfigMap", "bad").await;
        client
            .fail_with(
                "delete",
                "v1/ConfigMap/default/bad",
                ClientError::Api {
                    code: 500,
                    message: "nope".into(),
                },
            )
            .await;
        let records = vec![record("ConfigMap", "good"), record("ConfigMap", "bad")];
        let outcome = rollback(
            &client,
            &records,
            &RollbackOptions::default(),
            &EventSink::disabled(),
            &CancellationToken::new(),
        )
        .await;
        assert_eq!(outcome.status, RollbackStatus::Partial);
        // The failed deletion never stops later ones.
        assert!(client.get_object("v1/ConfigMap/default/good").await.is_none());
        assert!(client.get_object("v1/ConfigMap/default/bad").await.is_some());
    }

    #[test_log::test(tokio::test)]
    async fn wait_for_gone_observes_the_deletion() {
        let client = MockClient::default();
        seed(&client, "ConfigMap", "lingering").await;
        let outcome = rollback(
            &client,
            &[record("ConfigMap", "lingering")],
            &RollbackOptions {
                timeout: Duration::from_millis(50),
                ..Default::default()
            },
            &EventSink::disabled(),
            &CancellationToken::new(),
        )
        .await;
        assert!(outcome.is_success());
        let log = client.log().await;
        assert!(log.iter().any(|l| l == "read v1/ConfigMap/default/lingering"));
    }
}
