//! Resource is the manifest-plus-envelope entity compositions register.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{client::GvkRef, expr::CelExpression};

/// Error enumerates envelope construction failures.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// MissingField indicates the manifest lacks a field the envelope needs.
    #[error("manifest missing required field: {0}")]
    MissingField(&'static str),
}

/// ReadyStatus is the readiness contract every evaluator returns.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyStatus {
    /// Ready reports whether the resource reached its ready condition.
    pub ready: bool,
    /// Reason is a short machine-oriented cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Message is a human-oriented elaboration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Details carries evaluator-specific observations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// Terminal reports that waiting longer cannot help.
    #[serde(default, skip_serializing_if = "is_false")]
    pub terminal: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ReadyStatus {
    /// Ready constructs a ready result.
    pub fn ready() -> Self {
        Self {
            ready: true,
            ..Default::default()
        }
    }

    /// Pending constructs a not-yet-ready result with a reason.
    pub fn pending<R: Into<String>>(reason: R) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
            ..Default::default()
        }
    }

    /// Failed constructs a terminal not-ready result.
    pub fn failed<R: Into<String>>(reason: R) -> Self {
        Self {
            ready: false,
            reason: Some(reason.into()),
            terminal: true,
            ..Default::default()
        }
    }

    /// With_message attaches a human-oriented message.
    pub fn with_message<M: Into<String>>(mut self, message: M) -> Self {
        self.message = Some(message.into());
        self
    }

    /// With_details attaches evaluator observations.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// ReadyFn is a per-resource readiness evaluator over the live object.
pub type ReadyFn = Arc<dyn Fn(&Value) -> ReadyStatus + Send + Sync>;

/// Resource is a Kubernetes manifest plus its graph envelope.
///
/// The template is the full manifest (`apiVersion`, `kind`, `metadata`, …)
/// and may contain tagged references and CEL expressions anywhere string or
/// object values appear.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    id: String,
    template: Value,
    #[serde(default, skip_serializing_if = "is_false")]
    external: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ready_when: Option<CelExpression>,
    #[serde(skip)]
    readiness: Option<ReadyFn>,
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.id)
            .field("template", &self.template)
            .field("external", &self.external)
            .field("ready_when", &self.ready_when)
            .field("readiness", &self.readiness.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        let readiness_eq = match (&self.readiness, &other.readiness) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        };
        self.id == other.id
            && self.template == other.template
            && self.external == other.external
            && self.ready_when == other.ready_when
            && readiness_eq
    }
}

impl Resource {
    /// New builds an envelope around `template`, deriving the id from the
    /// manifest's kind and name.
    pub fn new(template: Value) -> Result<Self, Error> {
        let kind = field_str(&template, &["kind"]).ok_or(Error::MissingField("kind"))?;
        let name = field_str(&template, &["metadata", "name"])
            .ok_or(Error::MissingField("metadata.name"))?;
        let id = generate_id(kind, name);
        Self::with_id(id, template)
    }

    /// With_id builds an envelope around `template` under an explicit id.
    pub fn with_id<S: Into<String>>(id: S, template: Value) -> Result<Self, Error> {
        field_str(&template, &["apiVersion"]).ok_or(Error::MissingField("apiVersion"))?;
        field_str(&template, &["kind"]).ok_or(Error::MissingField("kind"))?;
        Ok(Self {
            id: id.into(),
            template,
            external: false,
            ready_when: None,
            readiness: None,
        })
    }

    /// External marks the resource as living outside the composition; it
    /// resolves at runtime and never produces dependency edges.
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    /// Ready_when attaches a CEL readiness template emitted into the RGD.
    pub fn ready_when(mut self, expr: CelExpression) -> Self {
        self.ready_when = Some(expr);
        self
    }

    /// Readiness attaches a host-side readiness evaluator override.
    pub fn readiness(mut self, f: ReadyFn) -> Self {
        self.readiness = Some(f);
        self
    }

    /// Id reports the graph id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Set_id rewrites the graph id; used by lenient id repair.
    pub fn set_id<S: Into<String>>(&mut self, id: S) {
        self.id = id.into();
    }

    /// Template reports the manifest, tags and all.
    pub fn template(&self) -> &Value {
        &self.template
    }

    /// Template_mut exposes the manifest for rewriting.
    pub fn template_mut(&mut self) -> &mut Value {
        &mut self.template
    }

    /// Api_version reports the manifest's apiVersion.
    pub fn api_version(&self) -> &str {
        field_str(&self.template, &["apiVersion"]).unwrap_or_default()
    }

    /// Kind reports the manifest's kind.
    pub fn kind(&self) -> &str {
        field_str(&self.template, &["kind"]).unwrap_or_default()
    }

    /// Name reports the manifest's metadata.name, if present.
    pub fn name(&self) -> Option<&str> {
        field_str(&self.template, &["metadata", "name"])
    }

    /// Namespace reports the manifest's metadata.namespace, if present.
    pub fn namespace(&self) -> Option<&str> {
        field_str(&self.template, &["metadata", "namespace"])
    }

    /// Gvk reports the manifest's group-version-kind pair.
    pub fn gvk(&self) -> GvkRef {
        GvkRef::new(self.api_version(), self.kind())
    }

    /// Is_external reports the external flag.
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// Ready_when_expr reports the attached CEL readiness template.
    pub fn ready_when_expr(&self) -> Option<&CelExpression> {
        self.ready_when.as_ref()
    }

    /// Readiness_fn reports the attached evaluator override.
    pub fn readiness_fn(&self) -> Option<&ReadyFn> {
        self.readiness.as_ref()
    }
}

fn field_str<'v>(v: &'v Value, path: &[&str]) -> Option<&'v str> {
    let mut cur = v;
    for p in path {
        cur = cur.get(p)?;
    }
    cur.as_str()
}

/// Generate_id derives a deterministic camelCase id from kind and name:
/// camelCase(name) + PascalCase(kind).
pub fn generate_id<K: AsRef<str>, N: AsRef<str>>(kind: K, name: N) -> String {
    let mut out = camel_case(name.as_ref());
    let kind = kind.as_ref();
    let mut chars = kind.chars();
    if let Some(c) = chars.next() {
        out.extend(c.to_uppercase());
        out.push_str(chars.as_str());
    }
    out
}

fn camel_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut upper_next = false;
    for c in s.chars() {
        if matches!(c, '-' | '_' | '.' | ' ') {
            upper_next = !out.is_empty();
            continue;
        }
        if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else if out.is_empty() {
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
