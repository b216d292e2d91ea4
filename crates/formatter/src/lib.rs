//! Render aggregated diff results as a GitHub-flavored markdown comment.

#![forbid(unsafe_code)]

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use xplan_core::{meta, DiffResult, StrippedField, DELETION_KEY_PREFIX};
use xplan_gitops::AppSetDiff;

const HEADER: &str = "## 🔄 Crossplane Preview";
const FOOTER: &str =
    "*Generated by [crossplane-plan](https://github.com/millstonehq/crossplane-plan)*";

#[derive(Debug, Clone, Copy, Default)]
pub struct CommentFormatter;

impl CommentFormatter {
    pub fn new() -> Self {
        Self
    }

    /// Single-XR layout, used when a PR touches exactly one resource.
    pub fn format_single(&self, xr: &Value, result: &DiffResult) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{HEADER}");
        out.push('\n');
        let _ = writeln!(out, "**Resource:** `{}/{}`", meta::kind(xr), meta::name(xr));
        if let Some(ns) = meta::namespace(xr) {
            let _ = writeln!(out, "**Namespace:** `{ns}`");
        }
        out.push('\n');

        if result.has_changes {
            out.push_str("### 📋 Changes Detected\n\n");
            let _ = writeln!(out, "{}", result.summary);
            out.push('\n');
            push_diff_details(&mut out, &result.raw_diff);
        } else {
            out.push_str("### ✅ No Changes\n\n");
            let _ = writeln!(out, "{}", result.summary);
        }

        push_managed_resources(&mut out, &result.managed_resources);
        push_stripped_footer(&mut out, &result.stripped_fields);
        out.push_str("\n---\n");
        out.push_str(FOOTER);
        out.push('\n');
        out
    }

    /// Multi-XR layout: counters, modified/deleted sections, per-resource
    /// detail blocks. Unchanged resources only contribute to the counter.
    pub fn format_many(
        &self,
        results: &BTreeMap<String, DiffResult>,
        scope_diff: Option<&AppSetDiff>,
    ) -> String {
        let total = results.len();
        let changed = results.values().filter(|r| r.has_changes).count();

        let mut out = String::new();
        let _ = writeln!(out, "{HEADER}");
        out.push('\n');
        let _ = writeln!(out, "**Resources:** {total} total, {changed} with changes");
        if let Some(scope) = scope_diff {
            let _ = writeln!(
                out,
                "**GitOps scope:** {} added, {} in both, {} deleted",
                scope.additions.len(),
                scope.modifications.len(),
                scope.deletions.len()
            );
        }
        out.push('\n');

        let modified: Vec<(&String, &DiffResult)> = results
            .iter()
            .filter(|(k, r)| r.has_changes && !is_deletion_key(k))
            .collect();
        let deleted: Vec<(&String, &DiffResult)> = results
            .iter()
            .filter(|(k, _)| is_deletion_key(k))
            .collect();

        if modified.is_empty() && deleted.is_empty() {
            out.push_str("### ✅ No Changes\n\n");
            out.push_str("All preview resources match their production counterparts.\n");
        }

        if !modified.is_empty() {
            out.push_str("### 📋 Modified Resources\n\n");
            for (name, result) in &modified {
                let _ = writeln!(out, "- **{name}**: {}", result.summary);
            }
            out.push('\n');
        }

        if !deleted.is_empty() {
            out.push_str("### 🗑️ Deleted Resources\n\n");
            for (key, result) in &deleted {
                let _ = writeln!(out, "- **{}**: {}", deletion_name(key), result.summary);
            }
            out.push('\n');
        }

        // Detail blocks for everything that has a diff body.
        let detailed: Vec<(&String, &DiffResult)> = results
            .iter()
            .filter(|(_, r)| r.has_changes && !r.raw_diff.trim().is_empty())
            .collect();
        if !detailed.is_empty() {
            out.push_str("### Details\n\n");
            for (key, result) in detailed {
                if is_deletion_key(key) {
                    let _ = writeln!(out, "#### `{}` (DELETION)", deletion_name(key));
                    out.push('\n');
                    out.push_str(
                        "**⚠️ WARNING:** This resource will be **DELETED** when this PR is merged.\n\n",
                    );
                } else {
                    let _ = writeln!(out, "#### `{key}`");
                    out.push('\n');
                }
                push_diff_details(&mut out, &result.raw_diff);
            }
        }

        push_stripped_footer(&mut out, &stripped_union(results));
        out.push_str("\n---\n");
        out.push_str(FOOTER);
        out.push('\n');
        out
    }
}

fn is_deletion_key(key: &str) -> bool {
    key.starts_with(DELETION_KEY_PREFIX)
}

fn deletion_name(key: &str) -> &str {
    key.strip_prefix(DELETION_KEY_PREFIX).unwrap_or(key)
}

fn push_diff_details(out: &mut String, raw_diff: &str) {
    out.push_str("<details>\n<summary>Show full diff</summary>\n\n");
    out.push_str("```diff\n");
    out.push_str(raw_diff.trim_end_matches('\n'));
    out.push_str("\n```\n\n</details>\n\n");
}

fn push_managed_resources(out: &mut String, states: &[xplan_core::ManagedResourceState]) {
    if states.is_empty() {
        return;
    }
    out.push_str("\n### 🔍 Managed Resources\n\n");
    for state in states {
        let ready = if state.is_ready { "ready" } else { "not ready" };
        let mode = if state.is_read_only {
            "read-only".to_string()
        } else if state.management_policies.is_empty() {
            "full management".to_string()
        } else {
            format!("policies [{}]", state.management_policies.join(", "))
        };
        let _ = writeln!(
            out,
            "- **{}/{}**: {mode}, {ready}",
            meta::kind(&state.resource),
            meta::name(&state.resource)
        );
        for drift in &state.declared_vs_actual {
            let _ = writeln!(
                out,
                "  - `{}`: declared `{}`, observed `{}`",
                drift.path, drift.declared, drift.actual
            );
        }
    }
}

fn push_stripped_footer(out: &mut String, stripped: &[StrippedField]) {
    if stripped.is_empty() {
        return;
    }
    out.push_str("\n### 🔇 Hidden Fields\n\n");
    out.push_str("These fields were hidden from the diff:\n\n");
    for field in stripped {
        let _ = writeln!(out, "- `{}`: {}", field.path, field.reason);
    }
}

/// Union of stripped fields across all results, de-duplicated, order-stable.
fn stripped_union(results: &BTreeMap<String, DiffResult>) -> Vec<StrippedField> {
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for result in results.values() {
        for field in &result.stripped_fields {
            if seen.insert((field.path.clone(), field.reason.clone())) {
                out.push(field.clone());
            }
        }
    }
    out
}
