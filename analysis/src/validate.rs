//! Validate enforces the authoring rules: id grammar, reference targets,
//! status partitioning, and CEL template well-formedness.
//!
//! Everything here runs before serialization and before deploy; authoring
//! problems never surface mid-apply.

use std::{collections::BTreeSet, sync::LazyLock};

use regex::Regex;
use serde_json::Value;
use tracing::warn;

use api::expr::CelExpression;

use crate::{Error, Result, analyzer};

static RESOURCE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-zA-Z0-9]*$").expect("programmer error: static regex")
});

/// Strictness selects whether grammar violations are repaired or rejected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strictness {
    /// Lenient repairs violations and warns.
    #[default]
    Lenient,
    /// Strict rejects violations, suggesting a repair.
    Strict,
}

/// Is_valid_resource_id reports whether `id` matches the camelCase grammar.
pub fn is_valid_resource_id<S: AsRef<str>>(id: S) -> bool {
    RESOURCE_ID.is_match(id.as_ref())
}

/// Validate_resource_id checks `id` against the camelCase grammar, repairing
/// kebab/snake names under [`Strictness::Lenient`].
pub fn validate_resource_id(id: &str, mode: Strictness) -> Result<String> {
    if is_valid_resource_id(id) {
        return Ok(id.to_string());
    }
    let suggestion = repair_id(id);
    if !is_valid_resource_id(&suggestion) {
        return Err(Error::InvalidResourceId {
            id: id.to_string(),
            suggestion,
        });
    }
    match mode {
        Strictness::Lenient => {
            warn!(id, repaired = %suggestion, "repaired resource id");
            Ok(suggestion)
        }
        Strictness::Strict => Err(Error::InvalidResourceId {
            id: id.to_string(),
            suggestion,
        }),
    }
}

/// Repair_id converts kebab/snake names to camelCase and strips anything the
/// grammar cannot carry.
pub fn repair_id(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    let mut upper_next = false;
    for c in id.chars() {
        if matches!(c, '-' | '_' | '.' | ' ') {
            upper_next = !out.is_empty();
            continue;
        }
        if !c.is_ascii_alphanumeric() {
            continue;
        }
        if out.is_empty() {
            if c.is_ascii_digit() {
                continue;
            }
            out.extend(c.to_lowercase());
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Validate_composition_name projects `name` onto an RFC 1123 label and
/// rejects projections that are empty or longer than 253 characters.
pub fn validate_composition_name(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len());
    let mut prev_dash = false;
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            prev_dash = false;
        } else if matches!(c, '-' | '_' | '.' | ' ') && !out.is_empty() && !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    let out = out.trim_end_matches('-').to_string();
    if out.is_empty() {
        return Err(Error::InvalidCompositionName {
            name: name.to_string(),
            reason: "no usable characters".into(),
        });
    }
    if out.len() > 253 {
        return Err(Error::InvalidCompositionName {
            name: name.to_string(),
            reason: format!("projection is {} characters, limit is 253", out.len()),
        });
    }
    Ok(out)
}

/// Validate_references walks tagged documents and fails on any reference
/// whose target is neither declared, schema, nor external.
pub fn validate_references<'a, I>(
    ids: &BTreeSet<String>,
    externals: &BTreeSet<String>,
    docs: I,
) -> Result<()>
where
    I: IntoIterator<Item = &'a Value>,
{
    for doc in docs {
        for r in analyzer::collect_refs(doc) {
            if r.is_schema() || ids.contains(r.resource_id()) || externals.contains(r.resource_id())
            {
                continue;
            }
            return Err(Error::UnknownResource {
                id: r.resource_id().to_string(),
                path: r.field_path().to_string(),
            });
        }
    }
    Ok(())
}

/// Validate_cel_template parses a `${…}` template and checks every hole's
/// references against the declared ids.
pub fn validate_cel_template(
    template: &str,
    ids: &BTreeSet<String>,
    externals: &BTreeSet<String>,
) -> Result<CelExpression> {
    let c = CelExpression::from_template(template)?;
    for r in c.refs() {
        if r.is_schema() || ids.contains(r.resource_id()) || externals.contains(r.resource_id()) {
            continue;
        }
        return Err(Error::UnknownResource {
            id: r.resource_id().to_string(),
            path: r.field_path().to_string(),
        });
    }
    Ok(c)
}

/// Validate_status partitions the status mapping and checks its references;
/// the partition itself guarantees no static field transitively holds a
/// reference.
pub fn validate_status(
    status: &Value,
    ids: &BTreeSet<String>,
    externals: &BTreeSet<String>,
) -> Result<analyzer::StatusPartition> {
    let partition = analyzer::partition_status(status)?;
    for v in partition.dynamic_fields.values() {
        validate_references(ids, externals, [v])?;
    }
    Ok(partition)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_ids_pass_unchanged() {
        assert_eq!(
            validate_resource_id("webService", Strictness::Strict).unwrap(),
            "webService",
        );
    }

    #[test]
    fn kebab_ids_repair_leniently() {
        assert_eq!(
            validate_resource_id("web-service", Strictness::Lenient).unwrap(),
            "webService",
        );
        assert_eq!(
            validate_resource_id("My_config_map", Strictness::Lenient).unwrap(),
            "myConfigMap",
        );
    }

    #[test]
    fn strict_mode_rejects_with_suggestion() {
        let err = validate_resource_id("web-service", Strictness::Strict).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidResourceId {
                id: "web-service".into(),
                suggestion: "webService".into(),
            },
        );
    }

    #[test]
    fn unrepairable_ids_fail_either_way() {
        assert!(validate_resource_id("123", Strictness::Lenient).is_err());
        assert!(validate_resource_id("", Strictness::Lenient).is_err());
    }

    #[test]
    fn composition_names_project_to_rfc1123() {
        assert_eq!(validate_composition_name("My WebApp").unwrap(), "my-webapp");
        assert_eq!(validate_composition_name("web_app.v2").unwrap(), "web-app-v2");
        assert!(validate_composition_name("!!!").is_err());
        let long = "a".repeat(300);
        assert!(validate_composition_name(&long).is_err());
    }

    #[test]
    fn unknown_reference_targets_fail() {
        let ids: BTreeSet<String> = ["db".to_string()].into();
        let ext = BTreeSet::new();
        let ok = json!({"ip": {"$kroRef": {"resourceId": "db", "fieldPath": "status.podIP"}}});
        assert!(validate_references(&ids, &ext, [&ok]).is_ok());
        let bad = json!({"ip": {"$kroRef": {"resourceId": "dbx", "fieldPath": "status.podIP"}}});
        let err = validate_references(&ids, &ext, [&bad]).unwrap_err();
        assert_eq!(err.kind(), "UnknownResource");
    }

    #[test]
    fn cel_template_checks_roots() {
        let ids: BTreeSet<String> = ["deployment".to_string()].into();
        let ext = BTreeSet::new();
        assert!(
            validate_cel_template("${deployment.status.readyReplicas >= 3}", &ids, &ext).is_ok()
        );
        assert!(validate_cel_template("${schema.spec.name}", &ids, &ext).is_ok());
        assert!(validate_cel_template("${ghost.status.x}", &ids, &ext).is_err());
        assert!(validate_cel_template("${broken", &ids, &ext).is_err());
    }

    #[test]
    fn status_partition_validates_dynamic_fields() {
        let ids: BTreeSet<String> = ["deployment".to_string()].into();
        let ext = BTreeSet::new();
        let status = json!({
            "ready": "${deployment.status.readyReplicas >= 3}",
            "url": "https://ex.com",
        });
        let p = validate_status(&status, &ids, &ext).unwrap();
        assert_eq!(p.static_fields.len(), 1);
        assert_eq!(p.dynamic_fields.len(), 1);
    }
}
