//! Expr holds the CEL template type and the expression IR the analyzer lowers
//! host expressions into.
//!
//! A [`CelExpression`] is a string template with `${…}` holes. Each hole is
//! either a plain reference path or an opaque CEL sub-expression; nothing in
//! this crate evaluates CEL, it only carries and renders it.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::LazyLock,
};

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};

use crate::reference::{CEL_TAG, ResourceRef, SCHEMA_ROOT, is_valid_field_path};

/// Error enumerates template and IR failures.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// UnbalancedBraces indicates a `${` hole that never closes.
    #[error("unbalanced braces in template: {0:?}")]
    UnbalancedBraces(String),
    /// EmptyHole indicates a `${}` hole with no expression.
    #[error("empty expression hole in template: {0:?}")]
    EmptyHole(String),
    /// Reference wraps a reference construction failure.
    #[error(transparent)]
    Reference(#[from] crate::reference::Error),
}

/// Part is one normalized piece of a template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    /// Literal text, emitted verbatim.
    Literal(String),
    /// Ref is a hole holding exactly one reference path.
    Ref(ResourceRef),
    /// Expr is a hole holding an opaque CEL sub-expression.
    Expr(String),
}

/// CelExpression is an immutable, normalized `${…}` template.
///
/// Adjacent literals are collapsed on construction; equality and hashing are
/// on the rendered template.
#[derive(Clone, Debug)]
pub struct CelExpression {
    template: String,
    parts: Vec<Part>,
}

impl PartialEq for CelExpression {
    fn eq(&self, other: &Self) -> bool {
        self.template == other.template
    }
}

impl Eq for CelExpression {}

impl Hash for CelExpression {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.template.hash(state);
    }
}

impl fmt::Display for CelExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

impl Serialize for CelExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.template)
    }
}

impl<'de> Deserialize<'de> for CelExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_template(&s).map_err(serde::de::Error::custom)
    }
}

static REF_SHAPED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*|\[[0-9]+\])+$")
        .expect("programmer error: static regex")
});

static EXPR_PATHS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)((?:\.[A-Za-z_][A-Za-z0-9_]*|\[[0-9]+\])+)")
        .expect("programmer error: static regex")
});

/// Identifiers CEL owns; never treated as reference roots.
const CEL_KEYWORDS: &[&str] = &[
    "has", "size", "string", "int", "uint", "double", "bool", "bytes", "true", "false", "null",
    "in", "matches",
];

impl CelExpression {
    /// From_parts normalizes `parts` (collapsing adjacent literals) and
    /// renders the template.
    pub fn from_parts(parts: Vec<Part>) -> Self {
        let mut norm: Vec<Part> = Vec::with_capacity(parts.len());
        for p in parts {
            if let Part::Literal(l) = &p {
                if l.is_empty() {
                    continue;
                }
                if let Some(Part::Literal(prev)) = norm.last_mut() {
                    prev.push_str(l);
                    continue;
                }
            }
            norm.push(p);
        }
        let mut template = String::new();
        for p in &norm {
            match p {
                Part::Literal(l) => template.push_str(l),
                Part::Ref(r) => {
                    template.push_str("${");
                    template.push_str(&r.cel_path());
                    template.push('}');
                }
                Part::Expr(e) => {
                    template.push_str("${");
                    template.push_str(e);
                    template.push('}');
                }
            }
        }
        Self {
            template,
            parts: norm,
        }
    }

    /// From_template parses a `${…}` template, classifying each hole as a
    /// plain reference path or an opaque sub-expression.
    ///
    /// Braces nest inside holes (CEL map literals), so a hole only closes at
    /// depth zero.
    pub fn from_template<S: AsRef<str>>(template: S) -> Result<Self, Error> {
        let template = template.as_ref();
        let mut parts = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next();
                if !literal.is_empty() {
                    parts.push(Part::Literal(std::mem::take(&mut literal)));
                }
                let mut depth = 0usize;
                let mut hole = String::new();
                let mut closed = false;
                for h in chars.by_ref() {
                    match h {
                        '{' => {
                            depth = depth.saturating_add(1);
                            hole.push(h);
                        }
                        '}' if depth == 0 => {
                            closed = true;
                            break;
                        }
                        '}' => {
                            depth = depth.saturating_sub(1);
                            hole.push(h);
                        }
                        _ => hole.push(h),
                    }
                }
                if !closed {
                    return Err(Error::UnbalancedBraces(template.to_string()));
                }
                let hole = hole.trim().to_string();
                if hole.is_empty() {
                    return Err(Error::EmptyHole(template.to_string()));
                }
                parts.push(hole_part(&hole));
            } else {
                literal.push(c);
            }
        }
        if !literal.is_empty() {
            parts.push(Part::Literal(literal));
        }
        Ok(Self::from_parts(parts))
    }

    /// Template reports the rendered `${…}` template.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Parts reports the normalized part sequence.
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Refs collects every reference the template mentions, including ones
    /// buried inside opaque sub-expression holes.
    pub fn refs(&self) -> Vec<ResourceRef> {
        let mut out = Vec::new();
        for p in &self.parts {
            match p {
                Part::Literal(_) => {}
                Part::Ref(r) => out.push(r.clone()),
                Part::Expr(e) => out.extend(expr_refs(e)),
            }
        }
        out
    }

    /// Is_pure_interpolation reports whether every hole is a plain reference,
    /// i.e. the template can be hydrated by substitution alone.
    pub fn is_pure_interpolation(&self) -> bool {
        self.parts
            .iter()
            .all(|p| matches!(p, Part::Literal(_) | Part::Ref(_)))
    }

    /// To_tagged serializes the expression into its branded JSON form.
    pub fn to_tagged(&self) -> Value {
        json!({ CEL_TAG: &self.template })
    }

    /// From_tagged recovers an expression from its branded JSON form, if `v`
    /// is one.
    pub fn from_tagged(v: &Value) -> Option<Result<Self, Error>> {
        let obj = v.as_object()?;
        if obj.len() != 1 {
            return None;
        }
        let t = obj.get(CEL_TAG)?.as_str()?;
        Some(Self::from_template(t))
    }
}

/// Hole_part classifies one hole body.
fn hole_part(hole: &str) -> Part {
    if REF_SHAPED.is_match(hole) {
        if let Some((root, rest)) = hole.split_once('.') {
            let id = if root == "schema" { SCHEMA_ROOT } else { root };
            if !CEL_KEYWORDS.contains(&root) {
                if let Ok(r) = ResourceRef::new(id, rest) {
                    return Part::Ref(r);
                }
            }
        }
    }
    Part::Expr(hole.to_string())
}

/// Expr_refs scans an opaque CEL sub-expression for dotted reference paths.
///
/// String literals are stripped first so quoted dots never look like paths.
pub fn expr_refs(expr: &str) -> Vec<ResourceRef> {
    let stripped = strip_strings(expr);
    let mut out = Vec::new();
    for cap in EXPR_PATHS.captures_iter(&stripped) {
        let root = &cap[1];
        if CEL_KEYWORDS.contains(&root) {
            continue;
        }
        let path = cap[2].trim_start_matches('.');
        if !is_valid_field_path(path) {
            continue;
        }
        let id = if root == "schema" { SCHEMA_ROOT } else { root };
        if let Ok(r) = ResourceRef::new(id, path) {
            if !out.contains(&r) {
                out.push(r);
            }
        }
    }
    out
}

fn strip_strings(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in expr.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    out.push(' ');
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

/// UnaryOp is a CEL unary operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// Logical negation.
    Not,
    /// Arithmetic negation.
    Neg,
}

impl UnaryOp {
    fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Neg => "-",
        }
    }
}

/// BinaryOp is a CEL infix operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Rem => "%",
            Eq => "==",
            Ne => "!=",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            And => "&&",
            Or => "||",
        }
    }
}

/// Expr is the reference-bearing expression IR.
///
/// The analyzer lowers host-side expressions into this sum and renders it
/// into a single CEL hole; containers of mixed static/dynamic children stay
/// containers and are analyzed per child.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Literal is a plain JSON value.
    Literal(Value),
    /// Ref is a live field reference.
    Ref(ResourceRef),
    /// Cel is an already-built template, preserved as-is.
    Cel(CelExpression),
    /// Template is string interpolation over sub-expressions.
    Template(Vec<Expr>),
    /// Unary applies a prefix operator.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Box<Expr>,
    },
    /// Binary applies an infix operator.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Box<Expr>,
        /// Right operand.
        rhs: Box<Expr>,
    },
    /// Conditional is CEL's ternary.
    Conditional {
        /// Condition.
        cond: Box<Expr>,
        /// Value when true.
        when_true: Box<Expr>,
        /// Value when false.
        when_false: Box<Expr>,
    },
    /// Optional is optional chaining (`base?.member`), rendered as
    /// `has(base.member) ? base.member : null`.
    Optional {
        /// Base expression; must render to a path.
        base: Box<Expr>,
        /// Member accessed off the base.
        member: String,
    },
}

impl Expr {
    /// Refs collects every reference beneath this node.
    pub fn refs(&self) -> Vec<ResourceRef> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut Vec<ResourceRef>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(r) => {
                if !out.contains(r) {
                    out.push(r.clone());
                }
            }
            Expr::Cel(c) => {
                for r in c.refs() {
                    if !out.contains(&r) {
                        out.push(r);
                    }
                }
            }
            Expr::Template(parts) => parts.iter().for_each(|p| p.collect_refs(out)),
            Expr::Unary { operand, .. } => operand.collect_refs(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
            Expr::Conditional {
                cond,
                when_true,
                when_false,
            } => {
                cond.collect_refs(out);
                when_true.collect_refs(out);
                when_false.collect_refs(out);
            }
            Expr::Optional { base, .. } => base.collect_refs(out),
        }
    }

    /// Is_static reports whether no reference appears anywhere beneath this
    /// node.
    pub fn is_static(&self) -> bool {
        self.refs().is_empty()
    }

    /// Fold evaluates the node to a plain JSON value when that needs no CEL
    /// semantics: literals, and templates whose parts all fold to scalars.
    pub fn fold(&self) -> Option<Value> {
        match self {
            Expr::Literal(v) => Some(v.clone()),
            Expr::Template(parts) => {
                let mut s = String::new();
                for p in parts {
                    match p.fold()? {
                        Value::String(v) => s.push_str(&v),
                        Value::Number(n) => s.push_str(&n.to_string()),
                        Value::Bool(b) => s.push_str(if b { "true" } else { "false" }),
                        _ => return None,
                    }
                }
                Some(Value::String(s))
            }
            _ => None,
        }
    }

    /// To_cel renders the node as one CEL sub-expression (no `${…}` wrapper).
    pub fn to_cel(&self) -> String {
        match self {
            Expr::Literal(v) => literal_cel(v),
            Expr::Ref(r) => r.cel_path(),
            Expr::Cel(c) => {
                // A bare single-hole template degrades to its hole.
                match c.parts() {
                    [Part::Ref(r)] => r.cel_path(),
                    [Part::Expr(e)] => e.clone(),
                    _ => template_concat(c),
                }
            }
            Expr::Template(parts) => {
                let mut pieces = Vec::with_capacity(parts.len());
                for p in parts {
                    match p {
                        Expr::Literal(Value::String(s)) => {
                            pieces.push(literal_cel(&Value::String(s.clone())))
                        }
                        other if other.is_atom() => pieces.push(other.to_cel()),
                        other => pieces.push(format!("({})", other.to_cel())),
                    }
                }
                pieces.join(" + ")
            }
            Expr::Unary { op, operand } => format!("{}{}", op.symbol(), operand.operand_cel()),
            Expr::Binary { op, lhs, rhs } => format!(
                "{} {} {}",
                lhs.operand_cel(),
                op.symbol(),
                rhs.operand_cel()
            ),
            Expr::Conditional {
                cond,
                when_true,
                when_false,
            } => format!(
                "{} ? {} : {}",
                cond.operand_cel(),
                when_true.operand_cel(),
                when_false.operand_cel()
            ),
            Expr::Optional { base, member } => {
                let path = format!("{}.{}", base.to_cel(), member);
                format!("has({path}) ? {path} : null")
            }
        }
    }

    /// To_cel_expression wraps the rendering into a single-hole template.
    pub fn to_cel_expression(&self) -> CelExpression {
        match self {
            Expr::Cel(c) => c.clone(),
            Expr::Ref(r) => CelExpression::from_parts(vec![Part::Ref(r.clone())]),
            Expr::Template(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for p in parts {
                    match p {
                        Expr::Literal(Value::String(s)) => out.push(Part::Literal(s.clone())),
                        Expr::Literal(v) => out.push(Part::Literal(scalar_text(v))),
                        Expr::Ref(r) => out.push(Part::Ref(r.clone())),
                        other => out.push(Part::Expr(other.to_cel())),
                    }
                }
                CelExpression::from_parts(out)
            }
            other => CelExpression::from_parts(vec![Part::Expr(other.to_cel())]),
        }
    }

    fn is_atom(&self) -> bool {
        matches!(
            self,
            Expr::Literal(_) | Expr::Ref(_) | Expr::Optional { .. }
        )
    }

    fn operand_cel(&self) -> String {
        match self {
            Expr::Binary { .. } | Expr::Conditional { .. } | Expr::Template(_) => {
                format!("({})", self.to_cel())
            }
            _ => self.to_cel(),
        }
    }
}

fn template_concat(c: &CelExpression) -> String {
    let mut pieces = Vec::new();
    for p in c.parts() {
        match p {
            Part::Literal(l) => pieces.push(literal_cel(&Value::String(l.clone()))),
            Part::Ref(r) => pieces.push(r.cel_path()),
            Part::Expr(e) => pieces.push(format!("({e})")),
        }
    }
    pieces.join(" + ")
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Literal_cel renders a JSON value as a CEL literal.
fn literal_cel(v: &Value) -> String {
    match v {
        Value::Null => "null".into(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => {
            let mut out = String::with_capacity(s.len().saturating_add(2));
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\t' => out.push_str("\\t"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(c),
                }
            }
            out.push('"');
            out
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(literal_cel).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", literal_cel(&Value::String(k.clone())), literal_cel(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reference::resource;

    fn r(id: &str, path: &str) -> ResourceRef {
        ResourceRef::new(id, path).unwrap()
    }

    #[test]
    fn template_parse_classifies_holes() {
        let c =
            CelExpression::from_template("http://${svc.status.clusterIP}:${schema.spec.port}")
                .unwrap();
        assert_eq!(
            c.parts(),
            &[
                Part::Literal("http://".into()),
                Part::Ref(r("svc", "status.clusterIP")),
                Part::Literal(":".into()),
                Part::Ref(r(SCHEMA_ROOT, "spec.port")),
            ],
        );
        assert!(c.is_pure_interpolation());
    }

    #[test]
    fn template_parse_keeps_expressions_opaque() {
        let c = CelExpression::from_template("${deployment.status.readyReplicas >= 3}").unwrap();
        assert_eq!(
            c.parts(),
            &[Part::Expr("deployment.status.readyReplicas >= 3".into())],
        );
        assert!(!c.is_pure_interpolation());
        assert_eq!(c.refs(), vec![r("deployment", "status.readyReplicas")]);
    }

    #[test]
    fn template_parse_rejects_unbalanced() {
        assert!(matches!(
            CelExpression::from_template("${a.b"),
            Err(Error::UnbalancedBraces(_)),
        ));
        assert!(matches!(
            CelExpression::from_template("x${}y"),
            Err(Error::EmptyHole(_)),
        ));
    }

    #[test]
    fn nested_braces_stay_in_hole() {
        let c = CelExpression::from_template("${size({\"a\": 1})}").unwrap();
        assert_eq!(c.parts().len(), 1);
    }

    #[test]
    fn adjacent_literals_collapse() {
        let c = CelExpression::from_parts(vec![
            Part::Literal("a".into()),
            Part::Literal("b".into()),
            Part::Ref(r("x", "status.y")),
            Part::Literal(String::new()),
        ]);
        assert_eq!(
            c.parts(),
            &[Part::Literal("ab".into()), Part::Ref(r("x", "status.y"))],
        );
        assert_eq!(c.template(), "ab${x.status.y}");
    }

    #[test]
    fn expr_refs_skip_keywords_and_strings() {
        let refs = expr_refs(r#"has(db.status.podIP) && "a.b.c" == db.spec.name"#);
        assert_eq!(refs, vec![r("db", "status.podIP"), r("db", "spec.name")]);
    }

    #[test]
    fn binary_renders_infix() {
        let e = Expr::Binary {
            op: BinaryOp::Ge,
            lhs: Box::new(Expr::Ref(r("deployment", "status.readyReplicas"))),
            rhs: Box::new(Expr::Literal(json!(3))),
        };
        assert_eq!(e.to_cel(), "deployment.status.readyReplicas >= 3");
        assert_eq!(
            e.to_cel_expression().template(),
            "${deployment.status.readyReplicas >= 3}",
        );
    }

    #[test]
    fn compound_operands_get_parens() {
        let sum = Expr::Binary {
            op: BinaryOp::Add,
            lhs: Box::new(Expr::Ref(r("a", "spec.x"))),
            rhs: Box::new(Expr::Literal(json!(1))),
        };
        let e = Expr::Binary {
            op: BinaryOp::Gt,
            lhs: Box::new(sum),
            rhs: Box::new(Expr::Literal(json!(3))),
        };
        assert_eq!(e.to_cel(), "(a.spec.x + 1) > 3");
    }

    #[test]
    fn optional_chaining_renders_has() {
        let e = Expr::Optional {
            base: Box::new(Expr::Ref(r("svc", "status.loadBalancer"))),
            member: "ingress".into(),
        };
        assert_eq!(
            e.to_cel(),
            "has(svc.status.loadBalancer.ingress) ? svc.status.loadBalancer.ingress : null",
        );
    }

    #[test]
    fn template_expr_renders_parts() {
        let e = Expr::Template(vec![
            Expr::Literal(json!("http://")),
            Expr::Ref(r("svc", "status.clusterIP")),
            Expr::Literal(json!(":")),
            Expr::Literal(json!(8080)),
        ]);
        let c = e.to_cel_expression();
        assert_eq!(c.template(), "http://${svc.status.clusterIP}:8080");
    }

    #[test]
    fn fold_static_template() {
        let e = Expr::Template(vec![
            Expr::Literal(json!("https://")),
            Expr::Literal(json!("ex.com")),
        ]);
        assert_eq!(e.fold(), Some(json!("https://ex.com")));
        assert!(e.is_static());
    }

    #[test]
    fn tagged_round_trip() {
        let c = CelExpression::from_template("x${a.b.c}").unwrap();
        let v = c.to_tagged();
        assert_eq!(CelExpression::from_tagged(&v), Some(Ok(c)));
    }

    #[test]
    fn builder_refs_flow_through() {
        let e = Expr::Ref(
            resource("db")
                .at("status")
                .at("podIP")
                .build()
                .unwrap(),
        );
        assert_eq!(e.refs().len(), 1);
    }
}
