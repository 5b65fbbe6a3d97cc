//! Kube_client implements the narrow cluster interface over `kube::Client`
//! and dynamic objects.

use kube::{
    Client, Config,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, GroupVersionKind},
};

use api::client::{ApiFuture, ClusterClient, Error as ClientError, GvkRef};

use crate::{FIELD_MANAGER, prelude::*};

/// KubeClusterClient is the production [`ClusterClient`].
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// New wraps an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Try_default infers configuration the way `kubectl` would.
    pub async fn try_default() -> Result<Self> {
        Ok(Self::new(Client::try_default().await?))
    }

    /// From_options honors an explicit kubeconfig path and TLS settings.
    pub async fn from_options(options: &FactoryOptions) -> Result<Self> {
        let mut config = match &options.kube_config {
            Some(path) => {
                let kc = Kubeconfig::read_from(path)?;
                Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await?
            }
            None => Config::infer().await.map_err(kube::Error::InferConfig)?,
        };
        if options.skip_tls_verify {
            config.accept_invalid_certs = true;
        }
        Ok(Self::new(Client::try_from(config)?))
    }

    fn api(&self, gvk: &GvkRef, namespace: Option<&str>) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(gvk.group(), gvk.version(), &gvk.kind);
        let ar = ApiResource::from_gvk(&gvk);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn manifest_coords(manifest: &Value) -> Result<(GvkRef, String, Option<String>), ClientError> {
        let gvk = GvkRef::of_manifest(manifest)
            .ok_or_else(|| ClientError::Manifest("missing apiVersion/kind".into()))?;
        let name = manifest
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Manifest("missing metadata.name".into()))?
            .to_string();
        let namespace = manifest
            .get("metadata")
            .and_then(|m| m.get("namespace"))
            .and_then(Value::as_str)
            .map(String::from);
        Ok((gvk, name, namespace))
    }
}

fn convert(err: kube::Error) -> ClientError {
    match err {
        kube::Error::Api(ae) => ClientError::Api {
            code: ae.code,
            message: ae.message,
        },
        other => ClientError::Transport(other.to_string()),
    }
}

fn to_value<T: serde::Serialize>(obj: T) -> Result<Value, ClientError> {
    serde_json::to_value(obj).map_err(|e| ClientError::Manifest(e.to_string()))
}

fn to_dynamic(manifest: &Value) -> Result<DynamicObject, ClientError> {
    serde_json::from_value(manifest.clone()).map_err(|e| ClientError::Manifest(e.to_string()))
}

impl ClusterClient for KubeClusterClient {
    fn create<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value> {
        Box::pin(async move {
            let (gvk, _, ns) = Self::manifest_coords(manifest)?;
            let api = self.api(&gvk, ns.as_deref());
            let obj = to_dynamic(manifest)?;
            let pp = PostParams {
                dry_run: false,
                field_manager: Some(FIELD_MANAGER.into()),
            };
            let created = api.create(&pp, &obj).await.map_err(convert)?;
            to_value(created)
        })
    }

    fn read<'a>(
        &'a self,
        gvk: &'a GvkRef,
        name: &'a str,
        namespace: Option<&'a str>,
    ) -> ApiFuture<'a, Value> {
        Box::pin(async move {
            let api = self.api(gvk, namespace);
            let got = api.get(name).await.map_err(convert)?;
            to_value(got)
        })
    }

    fn patch<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value> {
        Box::pin(async move {
            let (gvk, name, ns) = Self::manifest_coords(manifest)?;
            let api = self.api(&gvk, ns.as_deref());
            let pp = PatchParams::apply(FIELD_MANAGER).force();
            let patched = api
                .patch(&name, &pp, &Patch::Apply(manifest))
                .await
                .map_err(convert)?;
            to_value(patched)
        })
    }

    fn replace<'a>(&'a self, manifest: &'a Value) -> ApiFuture<'a, Value> {
        Box::pin(async move {
            let (gvk, name, ns) = Self::manifest_coords(manifest)?;
            let api = self.api(&gvk, ns.as_deref());
            let obj = to_dynamic(manifest)?;
            let replaced = api
                .replace(&name, &PostParams::default(), &obj)
                .await
                .map_err(convert)?;
            to_value(replaced)
        })
    }

    fn delete<'a>(
        &'a self,
        gvk: &'a GvkRef,
        name: &'a str,
        namespace: Option<&'a str>,
        grace_period: Option<i64>,
    ) -> ApiFuture<'a, ()> {
        Box::pin(async move {
            let api = self.api(gvk, namespace);
            let dp = DeleteParams {
                grace_period_seconds: grace_period
                    .and_then(|g| u32::try_from(g).ok()),
                ..Default::default()
            };
            api.delete(name, &dp).await.map_err(convert)?;
            Ok(())
        })
    }

    fn list<'a>(
        &'a self,
        gvk: &'a GvkRef,
        namespace: Option<&'a str>,
        selector: Option<&'a str>,
    ) -> ApiFuture<'a, Vec<Value>> {
        Box::pin(async move {
            let api = self.api(gvk, namespace);
            let mut lp = ListParams::default();
            if let Some(s) = selector {
                lp = lp.labels(s);
            }
            let listed = api.list(&lp).await.map_err(convert)?;
            listed.items.into_iter().map(to_value).collect()
        })
    }
}
