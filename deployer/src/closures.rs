//! Closures are the built-in deploy-time side-effect constructors: applying
//! YAML from files or directories, and emitting Flux HelmRelease objects.
//!
//! Each constructor returns a [`ClosureResource`] that participates in the
//! dependency graph and rollback exactly like a first-class member.

use std::path::PathBuf;

use serde_json::Value;

use analysis::analyzer::collect_refs;
use api::reference::ResourceRef;
use compose::{
    ClosureResource, DeploymentContext, DeploymentStrategy,
    closure::{ClosureError, ResolveReference},
};

use crate::prelude::*;

/// Yaml_file returns a closure that applies every document in one YAML file.
pub fn yaml_file<N: Into<String>, P: Into<PathBuf>>(name: N, path: P) -> ClosureResource {
    let path = path.into();
    ClosureResource::new(name, Vec::new(), move |ctx: DeploymentContext| {
        let path = path.clone();
        async move {
            let text = tokio::fs::read_to_string(&path).await?;
            apply_documents(&ctx, parse_documents(&text)?).await
        }
    })
}

/// Yaml_directory returns a closure that applies every `*.yaml` / `*.yml`
/// document under a directory, in filename order.
pub fn yaml_directory<N: Into<String>, P: Into<PathBuf>>(name: N, dir: P) -> ClosureResource {
    let dir = dir.into();
    ClosureResource::new(name, Vec::new(), move |ctx: DeploymentContext| {
        let dir = dir.clone();
        async move {
            let mut files = Vec::new();
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let p = entry.path();
                if matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                ) {
                    files.push(p);
                }
            }
            files.sort();
            let mut docs = Vec::new();
            for f in &files {
                let text = tokio::fs::read_to_string(f).await?;
                docs.extend(parse_documents(&text)?);
            }
            apply_documents(&ctx, docs).await
        }
    })
}

/// HelmReleaseConfig describes a chart install for [`helm_release`].
#[derive(Clone, Debug)]
pub struct HelmReleaseConfig {
    /// Release name; also the HelmRelease object name.
    pub name: String,
    /// Chart name within the repository.
    pub chart: String,
    /// Chart version constraint, when pinned.
    pub version: Option<String>,
    /// Repository URL; when set, a HelmRepository object is emitted too.
    pub repository: Option<String>,
    /// Values document; may contain references.
    pub values: Value,
    /// Namespace override; the deployment namespace when absent.
    pub namespace: Option<String>,
}

/// Helm_release returns a closure that applies a Flux
/// `helm.toolkit.fluxcd.io/v2` HelmRelease (plus its HelmRepository source
/// when a repository URL is given). References inside `values` resolve
/// against observed state when the closure runs.
pub fn helm_release<N: Into<String>>(name: N, config: HelmReleaseConfig) -> ClosureResource {
    let refs = collect_refs(&config.values);
    ClosureResource::new(name, refs, move |ctx: DeploymentContext| {
        let config = config.clone();
        async move {
            let ns = config
                .namespace
                .clone()
                .unwrap_or_else(|| ctx.namespace.clone());
            let values = resolve_tags(&config.values, ctx.resolver.as_ref()).await?;
            let mut docs = Vec::new();
            if let Some(url) = &config.repository {
                docs.push(json!({
                    "apiVersion": "source.toolkit.fluxcd.io/v1",
                    "kind": "HelmRepository",
                    "metadata": {"name": &config.name, "namespace": &ns},
                    "spec": {"url": url, "interval": "5m"},
                }));
            }
            let mut chart: serde_json::Map<String, Value> =
                [("chart".to_string(), json!(&config.chart))].into_iter().collect();
            if let Some(v) = &config.version {
                chart.insert("version".into(), json!(v));
            }
            if config.repository.is_some() {
                chart.insert(
                    "sourceRef".into(),
                    json!({"kind": "HelmRepository", "name": &config.name}),
                );
            }
            docs.push(json!({
                "apiVersion": "helm.toolkit.fluxcd.io/v2",
                "kind": "HelmRelease",
                "metadata": {"name": &config.name, "namespace": &ns},
                "spec": {
                    "interval": "5m",
                    "chart": {"spec": Value::Object(chart)},
                    "values": values,
                },
            }));
            apply_documents(&ctx, docs).await
        }
    })
}

/// Parse_documents splits multi-document YAML into manifests, dropping
/// empty documents.
pub fn parse_documents(text: &str) -> Result<Vec<Value>, ClosureError> {
    let mut docs = Vec::new();
    for part in text.split("\n---") {
        let part = part.trim();
        if part.is_empty() || part == "---" {
            continue;
        }
        let part = part.strip_prefix("---").unwrap_or(part);
        let doc: Value = serde_yaml::from_str(part)?;
        if doc.is_null() {
            continue;
        }
        docs.push(doc);
    }
    Ok(docs)
}

/// Apply_documents applies manifests sequentially under the context's
/// conflict strategy, returning the records of everything created or
/// updated.
pub async fn apply_documents(
    ctx: &DeploymentContext,
    docs: Vec<Value>,
) -> Result<Vec<AppliedRecord>, ClosureError> {
    let mut records = Vec::with_capacity(docs.len());
    for mut doc in docs {
        default_namespace(&mut doc, &ctx.namespace);
        if let Some(record) = apply_one(ctx, &doc).await? {
            records.push(record);
        }
    }
    Ok(records)
}

async fn apply_one(
    ctx: &DeploymentContext,
    doc: &Value,
) -> Result<Option<AppliedRecord>, ClosureError> {
    let gvk = GvkRef::of_manifest(doc).ok_or("manifest missing apiVersion/kind")?;
    let name = doc
        .get("metadata")
        .and_then(|m| m.get("name"))
        .and_then(Value::as_str)
        .ok_or("manifest missing metadata.name")?
        .to_string();
    let ns = doc
        .get("metadata")
        .and_then(|m| m.get("namespace"))
        .and_then(Value::as_str);

    let existing = match ctx.client.read(&gvk, &name, ns).await {
        Ok(v) => Some(v),
        Err(err) if err.is_not_found() => None,
        Err(err) => return Err(err.into()),
    };
    let applied = match existing {
        None => match ctx.client.create(doc).await {
            Ok(v) => v,
            Err(err) if err.is_conflict() => handle_conflict(ctx, doc, &name, err).await?,
            Err(err) => return Err(err.into()),
        },
        Some(_) => match ctx.strategy {
            DeploymentStrategy::Replace => ctx.client.patch(doc).await?,
            DeploymentStrategy::SkipIfExists => {
                info!(name = %name, %gvk, "exists; skipping");
                return Ok(None);
            }
            DeploymentStrategy::Fail => {
                return Err(format!("{gvk} {name} already exists").into());
            }
        },
    };
    Ok(AppliedRecord::from_manifest(None, &applied))
}

async fn handle_conflict(
    ctx: &DeploymentContext,
    doc: &Value,
    name: &str,
    err: api::client::Error,
) -> Result<Value, ClosureError> {
    match ctx.strategy {
        DeploymentStrategy::Replace => Ok(ctx.client.patch(doc).await?),
        DeploymentStrategy::SkipIfExists => {
            info!(name, "create conflicted; skipping");
            Ok(doc.clone())
        }
        DeploymentStrategy::Fail => Err(err.into()),
    }
}

/// Resolve_tags hydrates tagged references through a closure's resolver.
async fn resolve_tags(
    value: &Value,
    resolver: &dyn ResolveReference,
) -> Result<Value, ClosureError> {
    let refs = collect_refs(value);
    let mut resolved: BTreeMap<ResourceRef, Value> = BTreeMap::new();
    for r in refs {
        let v = resolver.resolve(&r).await?;
        resolved.insert(r, v);
    }
    Ok(substitute(value, &resolved))
}

fn substitute(value: &Value, resolved: &BTreeMap<ResourceRef, Value>) -> Value {
    if let Some(r) = ResourceRef::from_tagged(value) {
        if let Some(v) = resolved.get(&r) {
            return v.clone();
        }
    }
    match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| substitute(v, resolved)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, resolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn default_namespace(doc: &mut Value, namespace: &str) {
    let Some(meta) = doc.get_mut("metadata").and_then(Value::as_object_mut) else {
        return;
    };
    meta.entry("namespace".to_string())
        .or_insert_with(|| Value::String(namespace.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_document_yaml_splits() {
        let text = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: a
---
apiVersion: v1
kind: Secret
metadata:
  name: b
";
        let docs = parse_documents(text).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["kind"], "ConfigMap");
        assert_eq!(docs[1]["kind"], "Secret");
    }

    #[test]
    fn leading_separator_and_empties_are_fine() {
        let text = "---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\n---\n";
        let docs = parse_documents(text).unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn helm_release_captures_value_refs() {
        let r = api::reference::resource("db")
            .at("status.podIP")
            .build()
            .unwrap();
        let c = helm_release(
            "cache",
            HelmReleaseConfig {
                name: "cache".into(),
                chart: "redis".into(),
                version: Some("19.x".into()),
                repository: Some("https://charts.bitnami.com/bitnami".into()),
                values: json!({"hostOverride": r.to_tagged()}),
                namespace: None,
            },
        );
        assert_eq!(c.refs(), &[r]);
    }
}
