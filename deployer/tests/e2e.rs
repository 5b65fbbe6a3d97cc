//! End-to-end deploy against a real cluster; run with `--features test_ci`
//! and a reachable kubeconfig.

use std::sync::Arc;

use serde_json::{Value, json};

use api::{
    reference::schema as schema_ref,
    resource::Resource,
    schema::{SchemaDefinition, StaticSchema},
};
use compose::compose;
use deployer::{
    DirectExecutor, FactoryOptions, RollbackOptions,
    kube_client::KubeClusterClient,
    rollback::rollback,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
#[cfg_attr(not(feature = "test_ci"), ignore)]
async fn deploy_and_roll_back() -> Result<(), deployer::Error> {
    const NAME: &str = "krograph-e2e-test";

    let schema = SchemaDefinition::new("example.dev", "E2e")
        .with_spec(StaticSchema(json!({"payload": "string"})));
    let composition = compose(NAME, schema, |ctx| {
        ctx.register(Resource::with_id(
            "seedConfig",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": format!("{NAME}-seed")},
                "data": {
                    "payload": schema_ref().at("spec.payload").build()?.to_tagged(),
                },
            }),
        )?)?;
        ctx.register(Resource::with_id(
            "echoConfig",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": format!("{NAME}-echo")},
                "data": {
                    "upstream": "${seedConfig.metadata.name}",
                },
            }),
        )?)?;
        Ok(json!({
            "seen": "${echoConfig.data.upstream}",
            "fixed": "constant",
        }))
    })
    .map_err(deployer::Error::Compose)?;

    let client = Arc::new(KubeClusterClient::try_default().await?);
    let executor = DirectExecutor::new(client.clone(), FactoryOptions::default());
    let out = executor
        .deploy(&composition, &json!({"payload": "hello"}))
        .await?;

    assert_eq!(out.applied.len(), 2);
    assert_eq!(out.status["fixed"], Value::String("constant".into()));
    assert_eq!(
        out.status["seen"],
        Value::String(format!("{NAME}-seed")),
    );

    let outcome = rollback(
        client.as_ref(),
        &out.applied,
        &RollbackOptions {
            timeout: std::time::Duration::from_secs(30),
            ..Default::default()
        },
        &deployer::events::EventSink::disabled(),
        &tokio_util::sync::CancellationToken::new(),
    )
    .await;
    outcome.into_result()?;
    Ok(())
}
