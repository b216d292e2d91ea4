//! Strip-rule application: remove noise fields from an XR before diffing.

use regex::Regex;
use serde_json::Value;
use xplan_config::StripRule;
use xplan_core::{paths, StrippedField};

/// Applies an ordered strip-rule list. Immutable after construction.
#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    rules: Vec<StripRule>,
}

/// A sanitized deep copy plus the record of what was removed.
#[derive(Debug, Clone)]
pub struct SanitizeOutcome {
    pub xr: Value,
    pub stripped: Vec<StrippedField>,
}

impl Sanitizer {
    pub fn new(rules: Vec<StripRule>) -> Self {
        Self { rules }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Apply all rules to a deep copy of `xr`; the original is never touched.
    pub fn sanitize(&self, xr: &Value) -> SanitizeOutcome {
        let mut out = SanitizeOutcome { xr: xr.clone(), stripped: Vec::new() };
        for rule in &self.rules {
            apply_rule(&mut out.xr, rule, &mut out.stripped);
        }
        out
    }
}

fn apply_rule(xr: &mut Value, rule: &StripRule, stripped: &mut Vec<StrippedField>) {
    // Pattern rules only make sense against the two string maps; they match
    // map keys, not values.
    if let Some(pattern) = rule.pattern.as_deref() {
        if rule.path == "metadata.annotations" || rule.path == "metadata.labels" {
            strip_matching_keys(xr, rule, pattern, stripped);
        }
        return;
    }

    let Some(expected) = rule.equals.as_ref() else { return };
    let matches = match paths::get(xr, &rule.path) {
        Some(actual) => values_equal(actual, expected),
        None => return,
    };
    if !matches {
        return;
    }

    paths::remove(xr, &rule.path);
    stripped.push(StrippedField { path: rule.path.clone(), reason: rule.reason.clone() });
}

fn strip_matching_keys(xr: &mut Value, rule: &StripRule, pattern: &str, stripped: &mut Vec<StrippedField>) {
    // An uncompilable user pattern silently no-ops.
    let Ok(re) = Regex::new(pattern) else { return };
    let Some(map) = xr
        .pointer_mut(if rule.path == "metadata.annotations" { "/metadata/annotations" } else { "/metadata/labels" })
        .and_then(Value::as_object_mut)
    else {
        return;
    };

    let matching: Vec<String> = map.keys().filter(|k| re.is_match(k)).cloned().collect();
    if matching.is_empty() {
        return;
    }
    for key in &matching {
        map.remove(key);
    }

    // One entry per fired rule, not per removed key.
    stripped.push(StrippedField {
        path: format!("{} (pattern: {})", rule.path, pattern),
        reason: rule.reason.clone(),
    });
}

/// Structural equality with elementwise array comparison, so a configured
/// `["Observe"]` matches the same list regardless of how it was deserialized.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        _ => a == b,
    }
}
