//! Context is the call-local registry a composition callback populates.
//!
//! Contexts are explicit handles threaded through the composition API; there
//! is no process-global "current context", so concurrent evaluations never
//! observe each other.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use analysis::analyzer::rewrite_resource_ids;
use api::{resource::Resource, schema::SchemaDefinition};

use crate::{ClosureResource, Composition, Error, Result};

/// CompositionContext captures every resource and closure a composition
/// callback produces.
pub struct CompositionContext {
    name: String,
    resources: Vec<Resource>,
    index: BTreeMap<String, usize>,
    closures: Vec<ClosureResource>,
}

impl CompositionContext {
    /// New constructs an empty context for one evaluation.
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            resources: Vec::new(),
            index: BTreeMap::new(),
            closures: Vec::new(),
        }
    }

    /// Name reports the composition name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register records a resource under its id.
    ///
    /// Registration is idempotent: re-registering equal content is a no-op,
    /// differing content fails with a duplicate-id error.
    pub fn register(&mut self, resource: Resource) -> Result<()> {
        if let Some(&at) = self.index.get(resource.id()) {
            if self.resources[at] == resource {
                debug!(id = resource.id(), "ignoring re-registration");
                return Ok(());
            }
            return Err(Error::DuplicateResourceId(resource.id().to_string()));
        }
        if self.closures.iter().any(|c| c.name() == resource.id()) {
            return Err(Error::DuplicateResourceId(resource.id().to_string()));
        }
        debug!(id = resource.id(), kind = resource.kind(), "registered");
        self.index
            .insert(resource.id().to_string(), self.resources.len());
        self.resources.push(resource);
        Ok(())
    }

    /// Register_closure records a deploy-time side-effect node. Closure names
    /// share the id namespace with resources.
    pub fn register_closure(&mut self, closure: ClosureResource) -> Result<()> {
        if self.index.contains_key(closure.name())
            || self.closures.iter().any(|c| c.name() == closure.name())
        {
            return Err(Error::DuplicateResourceId(closure.name().to_string()));
        }
        debug!(name = closure.name(), "registered closure");
        self.closures.push(closure);
        Ok(())
    }

    /// Nest evaluates a nested composition and flattens its members into this
    /// context, disambiguating colliding ids with the child's name.
    ///
    /// The returned value is whatever the nested callback returned, with any
    /// renamed references rewritten.
    pub fn nest<F>(&mut self, name: &str, f: F) -> Result<Value>
    where
        F: FnOnce(&mut CompositionContext) -> Result<Value>,
    {
        let mut child = CompositionContext::new(name);
        let status = f(&mut child)?;

        let mut renames: BTreeMap<String, String> = BTreeMap::new();
        for r in &child.resources {
            if self.index.contains_key(r.id()) {
                let renamed = prefixed_id(name, r.id());
                if self.index.contains_key(&renamed) || child.index.contains_key(&renamed) {
                    return Err(Error::DuplicateResourceId(r.id().to_string()));
                }
                renames.insert(r.id().to_string(), renamed);
            }
        }

        for mut r in child.resources {
            if let Some(new_id) = renames.get(r.id()) {
                debug!(from = r.id(), to = %new_id, "flattening renamed member");
                r.set_id(new_id.clone());
            }
            let rewritten = rewrite_resource_ids(r.template(), &renames);
            *r.template_mut() = rewritten;
            self.register(r)?;
        }
        for c in child.closures {
            self.register_closure(c.rename_refs(&renames))?;
        }

        Ok(rewrite_resource_ids(&status, &renames))
    }

    /// Finish consumes the context into a composition.
    pub(crate) fn finish(self, schema: SchemaDefinition, status: Value) -> Composition {
        Composition {
            name: self.name,
            schema,
            resources: self.resources,
            closures: self.closures,
            status,
        }
    }
}

/// Prefixed_id joins a nested composition's name onto a colliding id.
fn prefixed_id(prefix: &str, id: &str) -> String {
    let repaired = analysis::validate::repair_id(prefix);
    let mut out = repaired;
    let mut chars = id.chars();
    match chars.next() {
        Some(c) => {
            out.extend(c.to_uppercase());
            out.push_str(chars.as_str());
        }
        None => {}
    }
    out
}
