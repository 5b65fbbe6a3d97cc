//! Serialize emits a composition as a Kro ResourceGraphDefinition document.
//!
//! The emitted document is deterministic: resources are in topological order
//! with an id-lexicographic tie-break, and maps serialize with sorted keys.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};
use tracing::warn;

use analysis::{
    Strictness,
    analyzer::{Target, materialize, rewrite_resource_ids},
    validate,
};
use api::v1alpha1::{
    ResourceEntry, ResourceGraphDefinition, ResourceGraphDefinitionSpec, SchemaBlock,
};

use crate::{Composition, Error, Result};

/// SerializeOptions tunes RGD emission.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerializeOptions {
    /// Strictness of resource-id normalization.
    pub strictness: Strictness,
}

impl Composition {
    /// To_rgd emits the RGD document with lenient id normalization.
    pub fn to_rgd(&self) -> Result<ResourceGraphDefinition> {
        self.to_rgd_with(SerializeOptions::default())
    }

    /// To_rgd_with emits the RGD document.
    ///
    /// Static status fields never appear in the schema block; they are
    /// hydrated host-side at deploy time. Closures have no manifest and are
    /// not emitted.
    pub fn to_rgd_with(&self, opts: SerializeOptions) -> Result<ResourceGraphDefinition> {
        let name = validate::validate_composition_name(&self.name)?;

        // Normalize ids first; every later step sees repaired names.
        let mut renames: BTreeMap<String, String> = BTreeMap::new();
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for r in &self.resources {
            let id = validate::validate_resource_id(r.id(), opts.strictness)?;
            if !ids.insert(id.clone()) {
                return Err(Error::DuplicateResourceId(id));
            }
            if id != r.id() {
                renames.insert(r.id().to_string(), id);
            }
        }
        for c in &self.closures {
            ids.insert(c.name().to_string());
        }
        let externals = self.externals();

        let mut entries_by_id: BTreeMap<String, ResourceEntry> = BTreeMap::new();
        for r in &self.resources {
            let id = renames
                .get(r.id())
                .cloned()
                .unwrap_or_else(|| r.id().to_string());
            let template = rewrite_resource_ids(r.template(), &renames);
            validate::validate_references(&ids, &externals, [&template])?;
            let entry = if r.is_external() {
                ResourceEntry {
                    id: id.clone(),
                    template: Value::Null,
                    external_ref: json!({
                        "apiVersion": r.api_version(),
                        "kind": r.kind(),
                        "metadata": {
                            "name": r.name(),
                            "namespace": r.namespace(),
                        },
                    }),
                    ready_when: None,
                }
            } else {
                ResourceEntry {
                    id: id.clone(),
                    template: materialize(&template, Target::Kro),
                    external_ref: Value::Null,
                    ready_when: r.ready_when_expr().map(|c| c.template().to_string()),
                }
            };
            entries_by_id.insert(id, entry);
        }
        if !self.closures.is_empty() {
            warn!(
                count = self.closures.len(),
                "closures have no manifest and are not emitted",
            );
        }

        let status = rewrite_resource_ids(&self.status, &renames);
        let partition = validate::validate_status(&status, &ids, &externals)?;
        let dynamic_status = if partition.dynamic_fields.is_empty() {
            Value::Null
        } else {
            materialize(&Value::Object(partition.dynamic_fields), Target::Kro)
        };

        // Topological emission order over the renamed graph.
        let renamed = Composition {
            name: self.name.clone(),
            schema: self.schema.clone(),
            resources: self
                .resources
                .iter()
                .map(|r| {
                    let mut r = r.clone();
                    if let Some(new_id) = renames.get(r.id()) {
                        r.set_id(new_id.clone());
                    }
                    let t = rewrite_resource_ids(r.template(), &renames);
                    *r.template_mut() = t;
                    r
                })
                .collect(),
            closures: self.closures.clone(),
            status,
        };
        let order = renamed.graph().topo_order()?;

        let mut resources: Vec<ResourceEntry> = order
            .iter()
            .filter_map(|id| entries_by_id.remove(id))
            .collect();
        // External members sit outside the graph; they trail in id order.
        resources.extend(entries_by_id.into_values());

        let spec = ResourceGraphDefinitionSpec {
            schema: SchemaBlock {
                api_version: self.schema.api_version().to_string(),
                kind: self.schema.kind.clone(),
                spec: self.schema.spec.render(),
                status: dynamic_status,
            },
            resources,
        };
        Ok(ResourceGraphDefinition::new(&name, spec))
    }

    /// To_yaml emits the RGD document as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.to_rgd()?)?)
    }
}
