//! Managed-resource state analysis.
//!
//! Crossplane XRs reference their provider-managed resources through
//! `spec.resourceRefs`. Each referenced object carries a management policy,
//! a declared state (`spec.forProvider`) and an observed state
//! (`status.atProvider`); comparing the two surfaces drift that a pure
//! manifest diff cannot see.

use serde_json::Value;
use xplan_core::{FieldComparison, ManagedResourceState};

/// A `spec.resourceRefs` entry with everything needed to fetch the object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub name: String,
}

/// Extract well-formed resource references; malformed entries are dropped.
pub fn parse_resource_refs(xr: &Value) -> Vec<ResourceRef> {
    let Some(refs) = xr.pointer("/spec/resourceRefs").and_then(Value::as_array) else {
        return Vec::new();
    };
    refs.iter()
        .filter_map(|r| {
            let api_version = r.get("apiVersion")?.as_str()?;
            let kind = r.get("kind")?.as_str()?;
            let name = r.get("name")?.as_str()?;
            if api_version.is_empty() || kind.is_empty() || name.is_empty() {
                return None;
            }
            let (group, version) = match api_version.split_once('/') {
                Some((g, v)) => (g.to_string(), v.to_string()),
                None => (String::new(), api_version.to_string()),
            };
            Some(ResourceRef { group, version, kind: kind.to_string(), name: name.to_string() })
        })
        .collect()
}

/// Summarize one managed resource: policies, readiness and declared-versus-
/// observed drift.
pub fn analyze_managed_resource(mr: &Value) -> ManagedResourceState {
    let management_policies: Vec<String> = mr
        .pointer("/spec/managementPolicies")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).map(String::from).collect())
        .unwrap_or_default();
    let is_read_only = management_policies.len() == 1 && management_policies[0] == "Observe";

    let for_provider = mr.pointer("/spec/forProvider").and_then(Value::as_object);
    let at_provider = mr.pointer("/status/atProvider").and_then(Value::as_object);
    let has_at_provider = at_provider.is_some_and(|m| !m.is_empty());

    let is_ready = mr
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some("Ready")
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
        .unwrap_or(false);

    let declared_vs_actual = match (for_provider, at_provider) {
        (Some(declared), Some(actual)) if has_at_provider => compare_fields(declared, actual),
        _ => Vec::new(),
    };

    ManagedResourceState {
        resource: mr.clone(),
        management_policies,
        is_read_only,
        has_at_provider,
        is_ready,
        declared_vs_actual,
    }
}

/// Top-level declared fields whose observed value differs. Fields the
/// provider never reports back are skipped, not drift.
fn compare_fields(
    declared: &serde_json::Map<String, Value>,
    actual: &serde_json::Map<String, Value>,
) -> Vec<FieldComparison> {
    let mut out: Vec<FieldComparison> = declared
        .iter()
        .filter_map(|(key, declared_value)| {
            let actual_value = actual.get(key)?;
            (declared_value != actual_value).then(|| FieldComparison {
                path: key.clone(),
                declared: declared_value.clone(),
                actual: actual_value.clone(),
            })
        })
        .collect();
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}
