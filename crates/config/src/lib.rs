//! Configuration for crossplane-plan: detection strategy, field strip rules
//! and Argo CD scope settings, loaded from an optional YAML file.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How PR numbers are extracted from composite resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DetectionStrategy {
    #[default]
    Name,
    Label,
    Annotation,
}

impl std::str::FromStr for DetectionStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "name" => Ok(Self::Name),
            "label" => Ok(Self::Label),
            "annotation" => Ok(Self::Annotation),
            other => anyhow::bail!("unknown detection strategy: {other}"),
        }
    }
}

/// One sanitizer rule. Exactly one of `equals` / `pattern` is meaningful;
/// `pattern` only applies to `metadata.annotations` / `metadata.labels` and
/// matches map keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StripRule {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub equals: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionConfig {
    pub strategy: DetectionStrategy,
    pub name_pattern: String,
    pub label_key: String,
    pub annotation_key: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            strategy: DetectionStrategy::Name,
            name_pattern: "pr-{number}-*".into(),
            label_key: "millstone.tech/pr-number".into(),
            annotation_key: "millstone.tech/preview-pr".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DiffConfig {
    pub strip_defaults: bool,
    pub strip_rules: Vec<StripRule>,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self { strip_defaults: true, strip_rules: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ArgoConfig {
    /// Namespace the Argo CD Application objects live in.
    pub namespace: String,
    /// Prefix of preview application names, e.g. "pr-" in "pr-123-myapp".
    pub pr_prefix: String,
    /// Suffix variant, e.g. "-preview" in "myapp-preview-123".
    pub pr_suffix: String,
}

impl Default for ArgoConfig {
    fn default() -> Self {
        Self { namespace: "argocd".into(), pr_prefix: "pr-".into(), pr_suffix: String::new() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub diff: DiffConfig,
    pub argocd: ArgoConfig,
}

impl Config {
    /// Load from `path`. A missing file is not an error: defaults apply, so
    /// the shipped container works without a mounted config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading config {}", path.display())),
        };
        serde_yaml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Active sanitizer rules: defaults (unless disabled) followed by user rules.
    pub fn all_strip_rules(&self) -> Vec<StripRule> {
        let mut rules = Vec::new();
        if self.diff.strip_defaults {
            rules.extend(default_strip_rules());
        }
        rules.extend(self.diff.strip_rules.iter().cloned());
        rules
    }
}

/// Baked-in rules removing preview-only noise before diffing.
pub fn default_strip_rules() -> Vec<StripRule> {
    vec![
        StripRule {
            path: "spec.managementPolicies".into(),
            equals: Some(serde_json::json!(["Observe"])),
            pattern: None,
            reason: "PR previews forced to read-only mode for safety".into(),
        },
        StripRule {
            path: "metadata.annotations".into(),
            equals: None,
            pattern: Some(r"^argocd\.argoproj\.io/.*".into()),
            reason: "ArgoCD-managed tracking metadata".into(),
        },
        StripRule {
            path: "metadata.labels".into(),
            equals: None,
            pattern: Some(r"^crossplane\.io/composite$".into()),
            reason: "Composition engine bookkeeping".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.detection.strategy, DetectionStrategy::Name);
        assert_eq!(cfg.detection.name_pattern, "pr-{number}-*");
        assert_eq!(cfg.detection.label_key, "millstone.tech/pr-number");
        assert_eq!(cfg.detection.annotation_key, "millstone.tech/preview-pr");
        assert!(cfg.diff.strip_defaults);
        assert!(cfg.diff.strip_rules.is_empty());
        assert_eq!(cfg.argocd.namespace, "argocd");
        assert_eq!(cfg.argocd.pr_prefix, "pr-");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load("/nonexistent/crossplane-plan.yaml").unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn yaml_round_trip() {
        let yaml = r#"
diff:
  stripDefaults: false
  stripRules:
    - path: "metadata.labels"
      pattern: "^custom\\.io/.*"
      reason: "Custom labels"
    - path: "spec.someField"
      equals: "testValue"
      reason: "Test field"
argocd:
  namespace: gitops
  prPrefix: preview-
"#;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();

        let cfg = Config::load(f.path()).unwrap();
        assert!(!cfg.diff.strip_defaults);
        assert_eq!(cfg.diff.strip_rules.len(), 2);
        assert_eq!(cfg.diff.strip_rules[0].path, "metadata.labels");
        assert_eq!(cfg.diff.strip_rules[0].pattern.as_deref(), Some(r"^custom\.io/.*"));
        assert_eq!(cfg.diff.strip_rules[1].equals, Some(serde_json::json!("testValue")));
        assert_eq!(cfg.argocd.namespace, "gitops");
        assert_eq!(cfg.argocd.pr_prefix, "preview-");
        // Unset sections keep their defaults.
        assert_eq!(cfg.detection.strategy, DetectionStrategy::Name);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"diff: [not, a, mapping").unwrap();
        assert!(Config::load(f.path()).is_err());
    }

    #[test]
    fn strip_rules_append_user_rules_after_defaults() {
        let mut cfg = Config::default();
        cfg.diff.strip_rules.push(StripRule {
            path: "spec.custom".into(),
            equals: Some(serde_json::json!(true)),
            pattern: None,
            reason: "custom".into(),
        });

        let rules = cfg.all_strip_rules();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].path, "spec.managementPolicies");
        assert_eq!(rules[3].path, "spec.custom");

        cfg.diff.strip_defaults = false;
        let rules = cfg.all_strip_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].path, "spec.custom");
    }
}
