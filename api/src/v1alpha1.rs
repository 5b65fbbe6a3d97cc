//! Module `v1alpha1` implements the `kro.run/v1alpha1` ResourceGraphDefinition
//! API.

use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// ResourceGraphDefinitionSpec aggregates a set of Kubernetes manifests with
/// declared status mappings and readiness.
#[derive(
    CustomResource, Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema,
)]
#[kube(
    group = "kro.run",
    version = "v1alpha1",
    kind = "ResourceGraphDefinition",
    status = "ResourceGraphDefinitionStatus",
    shortname = "rgd",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionSpec {
    /// Schema declares the API surface instances of this graph expose.
    pub schema: SchemaBlock,
    /// Resources lists the graph members in dependency order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceEntry>,
}

/// SchemaBlock is the instance API declaration inside an RGD.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchemaBlock {
    /// Api_version is the bare version of the instance API.
    pub api_version: String,
    /// Kind of the instance API.
    pub kind: String,
    /// Spec is the instance spec schema.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub spec: Value,
    /// Status holds only the dynamic status fields; each leaf is a `${…}`
    /// template the Kro controller resolves.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

/// ResourceEntry is one graph member inside an RGD.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    /// Id is the camelCase graph id.
    pub id: String,
    /// Template is the manifest with references materialized as `${…}`
    /// strings.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub template: Value,
    /// External_ref points at an object outside the graph instead of a
    /// template.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub external_ref: Value,
    /// Ready_when is an optional CEL readiness template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_when: Option<String>,
}

/// ResourceGraphDefinitionStatus is the Kro controller's observed state.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGraphDefinitionStatus {
    /// State summarizes the definition's lifecycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    /// Conditions reports k8s-style conditions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<Condition>>,
    /// Topological_order reports the order the controller resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topological_order: Option<Vec<String>>,
}

/// InstanceState is the lifecycle of a custom instance created from an RGD.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    /// The controller is still working towards the desired state.
    #[default]
    Progressing,
    /// Every member reached its ready condition.
    Active,
    /// The controller gave up.
    Failed,
    /// The instance is being deleted.
    Terminating,
}

impl InstanceState {
    /// Of_status reads `status.state` out of a live instance object.
    pub fn of_status(live: &Value) -> Option<Self> {
        let s = live.get("status")?.get("state")?.as_str()?;
        Self::from_str(s).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rgd_serializes_camel_case() {
        let spec = ResourceGraphDefinitionSpec {
            schema: SchemaBlock {
                api_version: "v1alpha1".into(),
                kind: "WebApp".into(),
                spec: json!({"name": "string"}),
                status: Value::Null,
            },
            resources: vec![ResourceEntry {
                id: "deployment".into(),
                template: json!({"apiVersion": "apps/v1", "kind": "Deployment"}),
                external_ref: Value::Null,
                ready_when: None,
            }],
        };
        let v = serde_json::to_value(&spec).unwrap();
        assert_eq!(v["schema"]["apiVersion"], "v1alpha1");
        assert_eq!(v["resources"][0]["id"], "deployment");
        assert!(v["resources"][0].get("readyWhen").is_none());
        assert!(v["schema"].get("status").is_none());
    }

    #[test]
    fn instance_state_parses_upper_case() {
        let live = json!({"status": {"state": "ACTIVE"}});
        assert_eq!(InstanceState::of_status(&live), Some(InstanceState::Active));
        assert_eq!(InstanceState::of_status(&json!({})), None);
        assert_eq!(InstanceState::Failed.to_string(), "FAILED");
    }
}
