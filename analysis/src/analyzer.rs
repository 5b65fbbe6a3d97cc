//! Analyzer classifies values, extracts references, and materializes tagged
//! documents for a deployment target.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::warn;

use api::{
    expr::{CelExpression, Expr, Part},
    reference::{ResourceRef, is_valid_field_path},
};

use crate::{Error, Result};

/// Target selects how dynamic values are rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Target {
    /// Direct keeps live tags so the executor resolves them at apply time.
    #[default]
    Direct,
    /// Kro renders everything dynamic as `${…}` strings for the controller.
    Kro,
}

/// FactoryContext is what the analyzer knows about the enclosing composition.
#[derive(Clone, Debug, Default)]
pub struct FactoryContext {
    /// Target backend.
    pub target: Target,
    /// Available is the set of declared resource ids.
    pub available: BTreeSet<String>,
    /// Externals is the set of ids declared as living outside the graph.
    pub externals: BTreeSet<String>,
}

impl FactoryContext {
    /// Knows reports whether a reference target is resolvable here.
    pub fn knows(&self, r: &ResourceRef) -> bool {
        r.is_schema()
            || self.available.contains(r.resource_id())
            || self.externals.contains(r.resource_id())
    }
}

/// Analyzed is the classification of one value.
#[derive(Clone, Debug, PartialEq)]
pub enum Analyzed {
    /// Static holds a value with no reference anywhere beneath it.
    Static(Value),
    /// Ref holds a value that is exactly one reference.
    Ref(ResourceRef),
    /// Cel holds a (possibly pre-existing) CEL template.
    Cel(CelExpression),
    /// Composite holds a container with at least one dynamic leaf, kept in
    /// tagged form.
    Composite(Value),
}

impl Analyzed {
    /// Is_dynamic reports whether any reference is involved.
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, Self::Static(_))
    }

    /// Into_value renders the classification back into a tagged document.
    pub fn into_value(self) -> Value {
        match self {
            Self::Static(v) => v,
            Self::Ref(r) => r.to_tagged(),
            Self::Cel(c) => c.to_tagged(),
            Self::Composite(v) => v,
        }
    }
}

/// Common Kubernetes manifest roots, used for typo detection.
const WELL_KNOWN_ROOTS: &[&str] = &["metadata", "spec", "status", "data", "stringData"];

/// Analyze classifies `value` and validates every reference it mentions.
pub fn analyze(value: &Value, ctx: &FactoryContext) -> Result<Analyzed> {
    if let Some(r) = ResourceRef::from_tagged(value) {
        check_ref(&r, ctx)?;
        return Ok(Analyzed::Ref(r));
    }
    if let Some(parsed) = CelExpression::from_tagged(value) {
        let c = parsed?;
        for r in c.refs() {
            check_ref(&r, ctx)?;
        }
        return Ok(Analyzed::Cel(c));
    }
    match value {
        Value::String(s) if s.contains("${") => {
            // Dynamism is structural: a template mentioning no reference is
            // an ordinary string (shell syntax, Kro-only CEL, ...).
            let Ok(c) = CelExpression::from_template(s) else {
                return Ok(Analyzed::Static(value.clone()));
            };
            if c.refs().is_empty() {
                return Ok(Analyzed::Static(value.clone()));
            }
            for r in c.refs() {
                check_ref(&r, ctx)?;
            }
            match c.parts() {
                [Part::Ref(r)] => Ok(Analyzed::Ref(r.clone())),
                _ => Ok(Analyzed::Cel(c)),
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            let mut dynamic = false;
            for item in items {
                let a = analyze(item, ctx)?;
                dynamic = dynamic || a.is_dynamic();
                out.push(a.into_value());
            }
            let v = Value::Array(out);
            if dynamic {
                Ok(Analyzed::Composite(v))
            } else {
                Ok(Analyzed::Static(v))
            }
        }
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            let mut dynamic = false;
            for (k, item) in map {
                let a = analyze(item, ctx)?;
                dynamic = dynamic || a.is_dynamic();
                out.insert(k.clone(), a.into_value());
            }
            let v = Value::Object(out);
            if dynamic {
                Ok(Analyzed::Composite(v))
            } else {
                Ok(Analyzed::Static(v))
            }
        }
        other => Ok(Analyzed::Static(other.clone())),
    }
}

/// Analyze_expr lowers an IR node and classifies the result.
pub fn analyze_expr(expr: &Expr, ctx: &FactoryContext) -> Result<Analyzed> {
    for r in expr.refs() {
        check_ref(&r, ctx)?;
    }
    if let Some(folded) = expr.fold() {
        return Ok(Analyzed::Static(folded));
    }
    match expr {
        Expr::Literal(v) => Ok(Analyzed::Static(v.clone())),
        Expr::Ref(r) => Ok(Analyzed::Ref(r.clone())),
        other => Ok(Analyzed::Cel(other.to_cel_expression())),
    }
}

fn check_ref(r: &ResourceRef, ctx: &FactoryContext) -> Result<()> {
    if !is_valid_field_path(r.field_path()) {
        return Err(api::reference::Error::InvalidFieldPath(r.field_path().to_string()).into());
    }
    if !ctx.knows(r) {
        return Err(Error::UnknownResource {
            id: r.resource_id().to_string(),
            path: r.field_path().to_string(),
        });
    }
    warn_suspect_typo(r);
    Ok(())
}

/// Warn_suspect_typo flags near-misses of well-known manifest roots.
fn warn_suspect_typo(r: &ResourceRef) {
    let root = r
        .field_path()
        .split(['.', '['])
        .next()
        .unwrap_or_default();
    if WELL_KNOWN_ROOTS.contains(&root) {
        return;
    }
    for known in WELL_KNOWN_ROOTS {
        if levenshtein(root, known) <= 1 {
            warn!(
                resource = r.resource_id(),
                path = r.field_path(),
                suspect = root,
                expected = *known,
                "field path segment looks like a typo",
            );
            return;
        }
    }
}

/// Levenshtein computes plain edit distance; inputs here are short field
/// names.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0usize; b.len().saturating_add(1)];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i.saturating_add(1);
        for (j, cb) in b.iter().enumerate() {
            let sub = prev[j].saturating_add(usize::from(ca != cb));
            let del = prev[j.saturating_add(1)].saturating_add(1);
            let ins = cur[j].saturating_add(1);
            cur[j.saturating_add(1)] = sub.min(del).min(ins);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// Collect_refs gathers every reference in a tagged document, including ones
/// inside embedded `${…}` strings.
pub fn collect_refs(value: &Value) -> Vec<ResourceRef> {
    let mut out = Vec::new();
    collect_into(value, &mut out);
    out
}

fn collect_into(value: &Value, out: &mut Vec<ResourceRef>) {
    if let Some(r) = ResourceRef::from_tagged(value) {
        if !out.contains(&r) {
            out.push(r);
        }
        return;
    }
    if let Some(Ok(c)) = CelExpression::from_tagged(value) {
        for r in c.refs() {
            if !out.contains(&r) {
                out.push(r);
            }
        }
        return;
    }
    match value {
        Value::String(s) if s.contains("${") => {
            if let Ok(c) = CelExpression::from_template(s) {
                for r in c.refs() {
                    if !out.contains(&r) {
                        out.push(r);
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_into(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_into(v, out)),
        _ => {}
    }
}

/// Is_dynamic reports whether any reference appears beneath `value`.
pub fn is_dynamic(value: &Value) -> bool {
    !collect_refs(value).is_empty()
}

/// Materialize renders a tagged document for a target: `Kro` turns tags into
/// `${…}` strings, `Direct` leaves them live.
pub fn materialize(value: &Value, target: Target) -> Value {
    match target {
        Target::Direct => value.clone(),
        Target::Kro => materialize_kro(value),
    }
}

fn materialize_kro(value: &Value) -> Value {
    if let Some(r) = ResourceRef::from_tagged(value) {
        return Value::String(format!("${{{}}}", r.cel_path()));
    }
    if let Some(Ok(c)) = CelExpression::from_tagged(value) {
        return Value::String(c.template().to_string());
    }
    match value {
        Value::Array(items) => Value::Array(items.iter().map(materialize_kro).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), materialize_kro(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Rewrite_resource_ids renames reference targets throughout a tagged
/// document, including inside embedded `${…}` strings and opaque CEL holes.
pub fn rewrite_resource_ids(
    value: &Value,
    renames: &std::collections::BTreeMap<String, String>,
) -> Value {
    if renames.is_empty() {
        return value.clone();
    }
    if let Some(r) = ResourceRef::from_tagged(value) {
        if let Some(new_id) = renames.get(r.resource_id()) {
            if let Ok(renamed) = ResourceRef::new(new_id.clone(), r.field_path()) {
                return renamed.to_tagged();
            }
        }
        return value.clone();
    }
    if let Some(Ok(c)) = CelExpression::from_tagged(value) {
        return rewrite_template(&c, renames).to_tagged();
    }
    match value {
        Value::String(s) if s.contains("${") => match CelExpression::from_template(s) {
            Ok(c) => Value::String(rewrite_template(&c, renames).template().to_string()),
            Err(_) => value.clone(),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| rewrite_resource_ids(v, renames))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), rewrite_resource_ids(v, renames)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn rewrite_template(
    c: &CelExpression,
    renames: &std::collections::BTreeMap<String, String>,
) -> CelExpression {
    let parts = c
        .parts()
        .iter()
        .map(|p| match p {
            Part::Ref(r) => match renames.get(r.resource_id()) {
                Some(new_id) => match ResourceRef::new(new_id.clone(), r.field_path()) {
                    Ok(renamed) => Part::Ref(renamed),
                    Err(_) => p.clone(),
                },
                None => p.clone(),
            },
            Part::Expr(e) => Part::Expr(rewrite_expr_roots(e, renames)),
            Part::Literal(_) => p.clone(),
        })
        .collect();
    CelExpression::from_parts(parts)
}

/// Rewrite_expr_roots renames dotted-path roots inside an opaque CEL
/// sub-expression by token scanning.
fn rewrite_expr_roots(
    expr: &str,
    renames: &std::collections::BTreeMap<String, String>,
) -> String {
    let mut out = String::with_capacity(expr.len());
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' || c == '\'' {
            // Copy quoted spans untouched.
            out.push(c);
            i = i.saturating_add(1);
            let mut escaped = false;
            while i < chars.len() {
                let q = chars[i];
                out.push(q);
                i = i.saturating_add(1);
                if escaped {
                    escaped = false;
                } else if q == '\\' {
                    escaped = true;
                } else if q == c {
                    break;
                }
            }
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i = i.saturating_add(1);
            }
            let word: String = chars[start..i].iter().collect();
            let prev_is_dot = start > 0 && chars[start.saturating_sub(1)] == '.';
            let next_is_path = chars.get(i).is_some_and(|&n| n == '.' || n == '[');
            match renames.get(&word) {
                Some(new_id) if !prev_is_dot && next_is_path => out.push_str(new_id),
                _ => out.push_str(&word),
            }
        } else {
            out.push(c);
            i = i.saturating_add(1);
        }
    }
    out
}

/// StatusPartition splits a status mapping by the structural-dynamism rule:
/// a top-level field is dynamic iff at least one reference appears beneath
/// it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusPartition {
    /// Static_fields are hydrated by the host and never reach the RGD.
    pub static_fields: Map<String, Value>,
    /// Dynamic_fields are emitted to the Kro controller as `${…}` templates.
    pub dynamic_fields: Map<String, Value>,
}

/// Partition_status splits a status mapping. `Null` partitions to nothing.
pub fn partition_status(status: &Value) -> Result<StatusPartition> {
    let map = match status {
        Value::Null => return Ok(StatusPartition::default()),
        Value::Object(map) => map,
        other => return Err(Error::StatusShape(type_name(other).to_string())),
    };
    let mut out = StatusPartition::default();
    for (k, v) in map {
        if is_dynamic(v) {
            out.dynamic_fields.insert(k.clone(), v.clone());
        } else {
            out.static_fields.insert(k.clone(), v.clone());
        }
    }
    Ok(out)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::reference::resource;
    use serde_json::json;

    fn ctx(ids: &[&str]) -> FactoryContext {
        FactoryContext {
            target: Target::Direct,
            available: ids.iter().map(|s| s.to_string()).collect(),
            externals: BTreeSet::new(),
        }
    }

    fn db_ref() -> ResourceRef {
        resource("db").at("status").at("podIP").build().unwrap()
    }

    #[test]
    fn scalars_are_static() {
        let c = ctx(&[]);
        assert_eq!(
            analyze(&json!("nginx"), &c).unwrap(),
            Analyzed::Static(json!("nginx")),
        );
        assert_eq!(analyze(&json!(3), &c).unwrap(), Analyzed::Static(json!(3)));
    }

    #[test]
    fn tagged_ref_classifies_as_ref() {
        let c = ctx(&["db"]);
        let a = analyze(&db_ref().to_tagged(), &c).unwrap();
        assert_eq!(a, Analyzed::Ref(db_ref()));
    }

    #[test]
    fn unknown_resource_is_rejected() {
        let c = ctx(&[]);
        let err = analyze(&db_ref().to_tagged(), &c).unwrap_err();
        assert_eq!(err.kind(), "UnknownResource");
    }

    #[test]
    fn external_ids_are_allowed() {
        let mut c = ctx(&[]);
        c.externals.insert("db".into());
        assert!(analyze(&db_ref().to_tagged(), &c).is_ok());
    }

    #[test]
    fn embedded_template_string_parses() {
        let c = ctx(&["svc"]);
        let a = analyze(&json!("http://${svc.status.clusterIP}:80"), &c).unwrap();
        match a {
            Analyzed::Cel(cel) => {
                assert_eq!(cel.template(), "http://${svc.status.clusterIP}:80")
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn refless_templates_stay_static() {
        let c = ctx(&[]);
        let shellish = json!("echo ${HOME}");
        assert_eq!(
            analyze(&shellish, &c).unwrap(),
            Analyzed::Static(shellish.clone()),
        );
        let broken = json!("${never closed");
        assert_eq!(
            analyze(&broken, &c).unwrap(),
            Analyzed::Static(broken.clone()),
        );
    }

    #[test]
    fn lone_hole_is_a_ref() {
        let c = ctx(&["svc"]);
        let a = analyze(&json!("${svc.status.clusterIP}"), &c).unwrap();
        assert!(matches!(a, Analyzed::Ref(_)));
    }

    #[test]
    fn mixed_containers_are_composite() {
        let c = ctx(&["db"]);
        let v = json!({
            "image": "nginx",
            "env": [{"name": "DB", "value": db_ref().to_tagged()}],
        });
        let a = analyze(&v, &c).unwrap();
        assert!(a.is_dynamic());
        let all_static = json!({"image": "nginx", "env": [{"name": "DB", "value": "x"}]});
        assert!(!analyze(&all_static, &c).unwrap().is_dynamic());
    }

    #[test]
    fn analyzer_is_idempotent() {
        let c = ctx(&["db", "svc"]);
        let v = json!({
            "url": "http://${svc.status.clusterIP}",
            "ip": db_ref().to_tagged(),
            "fixed": ["a", 1],
        });
        let once = analyze(&v, &c).unwrap();
        let twice = analyze(&once.clone().into_value(), &c).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn collect_finds_refs_everywhere() {
        let v = json!({
            "a": db_ref().to_tagged(),
            "b": "${svc.status.clusterIP}",
            "c": {"nested": [db_ref().to_tagged()]},
        });
        let refs = collect_refs(&v);
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn kro_materialization_renders_holes() {
        let v = json!({"host": db_ref().to_tagged(), "port": 5432});
        let m = materialize(&v, Target::Kro);
        assert_eq!(m, json!({"host": "${db.status.podIP}", "port": 5432}));
        assert_eq!(materialize(&v, Target::Direct), v);
    }

    #[test]
    fn schema_refs_need_no_declaration() {
        let c = ctx(&[]);
        let r = api::reference::schema().at("spec.name").build().unwrap();
        assert!(analyze(&r.to_tagged(), &c).is_ok());
    }

    #[test]
    fn partition_splits_on_structural_dynamism() {
        let status = json!({
            "ready": {"$kroCel": "${deployment.status.readyReplicas >= 3}"},
            "url": "https://ex.com",
        });
        let p = partition_status(&status).unwrap();
        assert!(p.static_fields.contains_key("url"));
        assert!(p.dynamic_fields.contains_key("ready"));
        assert!(partition_status(&json!("nope")).is_err());
    }

    #[test]
    fn expr_analysis_folds_statics() {
        let c = ctx(&["deployment"]);
        let e = Expr::Template(vec![
            Expr::Literal(json!("https://")),
            Expr::Literal(json!("ex.com")),
        ]);
        assert_eq!(
            analyze_expr(&e, &c).unwrap(),
            Analyzed::Static(json!("https://ex.com")),
        );
        let dynamic = Expr::Binary {
            op: api::expr::BinaryOp::Ge,
            lhs: Box::new(Expr::Ref(
                resource("deployment")
                    .at("status.readyReplicas")
                    .build()
                    .unwrap(),
            )),
            rhs: Box::new(Expr::Literal(json!(3))),
        };
        match analyze_expr(&dynamic, &c).unwrap() {
            Analyzed::Cel(cel) => {
                assert_eq!(cel.template(), "${deployment.status.readyReplicas >= 3}")
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn rewrite_renames_targets_everywhere() {
        let renames: std::collections::BTreeMap<String, String> =
            [("service".to_string(), "dbService".to_string())].into();
        let v = json!({
            "a": {"$kroRef": {"resourceId": "service", "fieldPath": "status.clusterIP"}},
            "b": "http://${service.status.clusterIP}",
            "c": "${service.status.readyReplicas >= 1 && other.spec.x == service.spec.y}",
            "quoted": "${x.spec.note == \"service.status\"}",
        });
        let w = rewrite_resource_ids(&v, &renames);
        assert_eq!(
            ResourceRef::from_tagged(&w["a"]).unwrap().resource_id(),
            "dbService",
        );
        assert_eq!(w["b"], json!("http://${dbService.status.clusterIP}"));
        assert_eq!(
            w["c"],
            json!("${dbService.status.readyReplicas >= 1 && other.spec.x == dbService.spec.y}"),
        );
        assert_eq!(w["quoted"], v["quoted"]);
    }

    #[test]
    fn edit_distance() {
        assert_eq!(levenshtein("statuss", "status"), 1);
        assert_eq!(levenshtein("spec", "spec"), 0);
        assert_eq!(levenshtein("metadta", "metadata"), 1);
    }
}
