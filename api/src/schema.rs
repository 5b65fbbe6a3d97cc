//! Schema is the pluggable validator surface the serializer and executors
//! consume; the engine never interprets schemas itself.

use std::{fmt, sync::Arc};

use serde_json::Value;

/// SchemaSource renders a schema block and optionally validates candidate
/// documents against it.
pub trait SchemaSource: Send + Sync {
    /// Render returns the schema block emitted into the RGD document.
    fn render(&self) -> Value;

    /// Validate checks a candidate document. The default accepts everything.
    fn validate(&self, _candidate: &Value) -> Result<(), String> {
        Ok(())
    }
}

/// StaticSchema is a schema block carried verbatim.
#[derive(Clone, Debug, Default)]
pub struct StaticSchema(pub Value);

impl SchemaSource for StaticSchema {
    fn render(&self) -> Value {
        self.0.clone()
    }
}

impl SchemaSource for schemars::Schema {
    fn render(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// SchemaDefinition describes the API surface instances of a composition
/// expose.
#[derive(Clone)]
pub struct SchemaDefinition {
    /// Group of the instance API.
    pub group: String,
    /// Version of the instance API; `v1alpha1` when the author gave a bare
    /// kind.
    pub version: String,
    /// Kind of the instance API.
    pub kind: String,
    /// Spec schema validator.
    pub spec: Arc<dyn SchemaSource>,
    /// Status schema validator.
    pub status: Arc<dyn SchemaSource>,
}

impl fmt::Debug for SchemaDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaDefinition")
            .field("group", &self.group)
            .field("version", &self.version)
            .field("kind", &self.kind)
            .finish()
    }
}

impl SchemaDefinition {
    /// New constructs a definition with the default `v1alpha1` version and
    /// empty schemas.
    pub fn new<G: Into<String>, K: Into<String>>(group: G, kind: K) -> Self {
        Self {
            group: group.into(),
            version: "v1alpha1".into(),
            kind: kind.into(),
            spec: Arc::new(StaticSchema(Value::Null)),
            status: Arc::new(StaticSchema(Value::Null)),
        }
    }

    /// With_version overrides the instance API version.
    pub fn with_version<V: Into<String>>(mut self, version: V) -> Self {
        self.version = version.into();
        self
    }

    /// With_spec attaches the spec validator.
    pub fn with_spec<S: SchemaSource + 'static>(mut self, spec: S) -> Self {
        self.spec = Arc::new(spec);
        self
    }

    /// With_status attaches the status validator.
    pub fn with_status<S: SchemaSource + 'static>(mut self, status: S) -> Self {
        self.status = Arc::new(status);
        self
    }

    /// Api_version reports the bare version placed in the RGD schema block.
    pub fn api_version(&self) -> &str {
        &self.version
    }

    /// Instance_api_version reports the effective `group/version` instances
    /// are created under.
    pub fn instance_api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_kind_defaults_to_v1alpha1() {
        let s = SchemaDefinition::new("example.dev", "WebApp");
        assert_eq!(s.api_version(), "v1alpha1");
        assert_eq!(s.instance_api_version(), "example.dev/v1alpha1");
    }

    #[test]
    fn static_schema_renders_verbatim() {
        let s = StaticSchema(json!({"name": "string"}));
        assert_eq!(s.render(), json!({"name": "string"}));
        assert!(s.validate(&json!({"anything": true})).is_ok());
    }
}
