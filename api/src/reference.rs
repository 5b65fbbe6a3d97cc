//! Reference holds the symbolic field pointer and its fluent capture builder.
//!
//! A [`ResourceRef`] names a field on another graph member (or on the
//! composition's own schema) without holding a pointer to it. Refs travel
//! through arbitrary JSON documents as single-key "tagged" objects so that
//! detection never depends on the host representation.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// SCHEMA_ROOT is the reserved resource id denoting the composition's own
/// spec/status schema.
pub static SCHEMA_ROOT: &str = "__schema__";

/// REF_TAG is the single key marking a serialized [`ResourceRef`] inside a
/// JSON tree.
pub const REF_TAG: &str = "$kroRef";

/// CEL_TAG is the single key marking a serialized CEL expression template
/// inside a JSON tree.
pub const CEL_TAG: &str = "$kroCel";

static FIELD_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*|\[[0-9]+\])*$")
        .expect("programmer error: static regex")
});

/// Error enumerates the ways constructing a reference can fail.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// InvalidFieldPath indicates a path that violates the field-path grammar.
    #[error("invalid field path: {0:?}")]
    InvalidFieldPath(String),
    /// EmptyResourceId indicates a reference without a target id.
    #[error("reference has an empty resource id")]
    EmptyResourceId,
}

/// Is_valid_field_path reports whether `path` matches the field-path grammar.
pub fn is_valid_field_path<S: AsRef<str>>(path: S) -> bool {
    FIELD_PATH.is_match(path.as_ref())
}

/// ResourceRef is a symbolic pointer to a field on a resource or on the
/// schema.
///
/// Identity is `(resource_id, field_path)`; the optional type hint never
/// participates in equality or hashing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    resource_id: String,
    field_path: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    type_hint: Option<String>,
}

impl PartialEq for ResourceRef {
    fn eq(&self, other: &Self) -> bool {
        self.resource_id == other.resource_id && self.field_path == other.field_path
    }
}

impl Eq for ResourceRef {}

impl Hash for ResourceRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resource_id.hash(state);
        self.field_path.hash(state);
    }
}

impl PartialOrd for ResourceRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (&self.resource_id, &self.field_path).cmp(&(&other.resource_id, &other.field_path))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cel_path())
    }
}

impl ResourceRef {
    /// New constructs a validated reference to `field_path` on `resource_id`.
    pub fn new<I, P>(resource_id: I, field_path: P) -> Result<Self, Error>
    where
        I: Into<String>,
        P: Into<String>,
    {
        let resource_id = resource_id.into();
        if resource_id.is_empty() {
            return Err(Error::EmptyResourceId);
        }
        let field_path = field_path.into();
        if !is_valid_field_path(&field_path) {
            return Err(Error::InvalidFieldPath(field_path));
        }
        Ok(Self {
            resource_id,
            field_path,
            type_hint: None,
        })
    }

    /// To_schema constructs a validated reference into the composition's own
    /// schema.
    pub fn to_schema<P: Into<String>>(field_path: P) -> Result<Self, Error> {
        Self::new(SCHEMA_ROOT, field_path)
    }

    /// Resource_id reports the id of the referenced graph member.
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Field_path reports the dotted path into the referenced resource.
    pub fn field_path(&self) -> &str {
        &self.field_path
    }

    /// Type_hint reports the optional host-type annotation.
    pub fn type_hint(&self) -> Option<&str> {
        self.type_hint.as_deref()
    }

    /// With_type_hint attaches a host-type annotation.
    pub fn with_type_hint<S: Into<String>>(mut self, hint: S) -> Self {
        self.type_hint = Some(hint.into());
        self
    }

    /// Is_schema reports whether this reference targets the schema root.
    pub fn is_schema(&self) -> bool {
        self.resource_id == SCHEMA_ROOT
    }

    /// Cel_path renders the reference the way CEL holes spell it: the schema
    /// root becomes the `schema` identifier.
    pub fn cel_path(&self) -> String {
        if self.is_schema() {
            format!("schema.{}", self.field_path)
        } else {
            format!("{}.{}", self.resource_id, self.field_path)
        }
    }

    /// Segments parses the field path into its walkable segments.
    pub fn segments(&self) -> Vec<PathSegment> {
        parse_segments(&self.field_path)
    }

    /// To_tagged serializes the reference into its branded JSON form.
    pub fn to_tagged(&self) -> Value {
        json!({ REF_TAG: self })
    }

    /// From_tagged recovers a reference from its branded JSON form, if `v` is
    /// one.
    pub fn from_tagged(v: &Value) -> Option<Self> {
        let obj = v.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        serde_json::from_value(obj.get(REF_TAG)?.clone()).ok()
    }
}

/// PathSegment is one walkable step of a field path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSegment {
    /// Field indexes into an object by key.
    Field(String),
    /// Index indexes into an array by position.
    Index(usize),
}

/// Parse_segments splits an already-validated field path into segments.
pub fn parse_segments(path: &str) -> Vec<PathSegment> {
    let mut out = Vec::new();
    for part in path.split('.') {
        let (field, rest) = match part.find('[') {
            Some(i) => part.split_at(i),
            None => (part, ""),
        };
        if !field.is_empty() {
            out.push(PathSegment::Field(field.to_string()));
        }
        for idx in rest.split('[').filter(|s| !s.is_empty()) {
            let digits = idx.trim_end_matches(']');
            out.push(PathSegment::Index(
                digits.parse().unwrap_or(usize::MAX),
            ));
        }
    }
    out
}

/// RefBuilder is the fluent capture API: every `at`/`index` step extends the
/// accumulated field path, and [`RefBuilder::build`] materializes the
/// immutable [`ResourceRef`].
///
/// ```
/// use api::reference::resource;
///
/// let r = resource("db").at("status").at("podIP").build().unwrap();
/// assert_eq!(r.cel_path(), "db.status.podIP");
/// ```
#[derive(Clone, Debug)]
pub struct RefBuilder {
    resource_id: String,
    field_path: String,
    type_hint: Option<String>,
}

/// Resource starts a capture rooted at the graph member named `id`.
pub fn resource<S: Into<String>>(id: S) -> RefBuilder {
    RefBuilder {
        resource_id: id.into(),
        field_path: String::new(),
        type_hint: None,
    }
}

/// Schema starts a capture rooted at the composition's own schema.
pub fn schema() -> RefBuilder {
    resource(SCHEMA_ROOT)
}

impl RefBuilder {
    /// At extends the path by a dotted step. Multi-segment arguments such as
    /// `"status.podIP"` are accepted.
    pub fn at<S: AsRef<str>>(mut self, step: S) -> Self {
        if !self.field_path.is_empty() {
            self.field_path.push('.');
        }
        self.field_path.push_str(step.as_ref());
        self
    }

    /// Index extends the path by an array index step.
    pub fn index(mut self, i: usize) -> Self {
        self.field_path.push('[');
        self.field_path.push_str(&i.to_string());
        self.field_path.push(']');
        self
    }

    /// Typed attaches a host-type annotation to the eventual reference.
    pub fn typed<S: Into<String>>(mut self, hint: S) -> Self {
        self.type_hint = Some(hint.into());
        self
    }

    /// Build validates the accumulated path and materializes the reference.
    pub fn build(self) -> Result<ResourceRef, Error> {
        let mut r = ResourceRef::new(self.resource_id, self.field_path)?;
        r.type_hint = self.type_hint;
        Ok(r)
    }
}

impl TryFrom<RefBuilder> for ResourceRef {
    type Error = Error;

    fn try_from(b: RefBuilder) -> Result<Self, Self::Error> {
        b.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_walks_paths() {
        let r = resource("deployment")
            .at("status")
            .at("conditions")
            .index(0)
            .at("type")
            .build()
            .unwrap();
        assert_eq!(r.resource_id(), "deployment");
        assert_eq!(r.field_path(), "status.conditions[0].type");
        assert_eq!(r.cel_path(), "deployment.status.conditions[0].type");
    }

    #[test]
    fn schema_root_renders_as_schema() {
        let r = schema().at("spec").at("name").build().unwrap();
        assert!(r.is_schema());
        assert_eq!(r.cel_path(), "schema.spec.name");
    }

    #[test]
    fn bad_segment_is_rejected() {
        let err = resource("svc").at("status").at("cluster ip").build();
        assert!(matches!(err, Err(Error::InvalidFieldPath(_))));
        let err = resource("").at("status").build();
        assert!(matches!(err, Err(Error::EmptyResourceId)));
    }

    #[test]
    fn equality_ignores_type_hint() {
        let a = resource("db").at("status.podIP").build().unwrap();
        let b = resource("db")
            .at("status.podIP")
            .typed("string")
            .build()
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tagged_round_trip() {
        let r = resource("db").at("status.podIP").build().unwrap();
        let v = r.to_tagged();
        assert_eq!(ResourceRef::from_tagged(&v), Some(r));
        assert_eq!(ResourceRef::from_tagged(&serde_json::json!({"a": 1})), None);
    }

    #[test]
    fn segments_parse() {
        let r = resource("a").at("b").index(999999).at("c").build().unwrap();
        assert_eq!(
            r.segments(),
            vec![
                PathSegment::Field("b".into()),
                PathSegment::Index(999999),
                PathSegment::Field("c".into()),
            ],
        );
    }
}
