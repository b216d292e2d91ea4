//! PR detection: decide whether an XR belongs to a pull-request preview and
//! which production name it shadows.
//!
//! Three strategies share one enum; `detect_pr` is total and returns 0 for
//! anything that is not a preview resource.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use xplan_config::{DetectionConfig, DetectionStrategy};
use xplan_core::{meta, PrNumber};

pub const DEFAULT_NAME_PATTERN: &str = "pr-{number}-*";
pub const DEFAULT_LABEL_KEY: &str = "millstone.tech/pr-number";
pub const DEFAULT_ANNOTATION_KEY: &str = "millstone.tech/preview-pr";

#[derive(Debug, Clone)]
pub enum Detector {
    /// Name pattern with `{number}` and `*` tokens, e.g. "pr-{number}-*".
    Name { pattern: Regex },
    Label { key: String },
    Annotation { key: String },
}

impl Detector {
    pub fn from_config(cfg: &DetectionConfig) -> Result<Self> {
        match cfg.strategy {
            DetectionStrategy::Name => Self::name_pattern(&cfg.name_pattern),
            DetectionStrategy::Label => Ok(Self::Label { key: cfg.label_key.clone() }),
            DetectionStrategy::Annotation => Ok(Self::Annotation { key: cfg.annotation_key.clone() }),
        }
    }

    /// Compile a name pattern: `{number}` captures the PR id, `*` captures
    /// the production base name, both anchored.
    pub fn name_pattern(pattern: &str) -> Result<Self> {
        let regex = format!(
            "^{}$",
            pattern.replace("{number}", r"(\d+)").replace('*', "(.*)")
        );
        let pattern = Regex::new(&regex)
            .with_context(|| format!("compiling name pattern {pattern:?} (regex {regex:?})"))?;
        Ok(Self::Name { pattern })
    }

    pub fn label(key: impl Into<String>) -> Self {
        Self::Label { key: key.into() }
    }

    pub fn annotation(key: impl Into<String>) -> Self {
        Self::Annotation { key: key.into() }
    }

    /// PR number carried by this XR, or 0 when it is not a preview.
    pub fn detect_pr(&self, xr: &Value) -> PrNumber {
        match self {
            Self::Name { pattern } => pattern
                .captures(meta::name(xr))
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0),
            Self::Label { key } => meta::label(xr, key).and_then(|v| v.parse().ok()).unwrap_or(0),
            Self::Annotation { key } => {
                meta::annotation(xr, key).and_then(|v| v.parse().ok()).unwrap_or(0)
            }
        }
    }

    /// Production name this preview shadows. Non-preview XRs (and strategies
    /// whose names carry no PR marker) keep their own name.
    pub fn base_name(&self, xr: &Value) -> String {
        let name = meta::name(xr);
        match self {
            Self::Name { pattern } => match pattern.captures(name) {
                Some(caps) => caps
                    .get(2)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_else(|| name.to_string()),
                None => name.to_string(),
            },
            Self::Label { .. } | Self::Annotation { .. } => name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn named(name: &str) -> Value {
        json!({"metadata": {"name": name}})
    }

    #[test]
    fn name_detection_happy_path() {
        let d = Detector::name_pattern("pr-{number}-*").unwrap();
        let xr = named("pr-123-mill");
        assert_eq!(d.detect_pr(&xr), 123);
        assert_eq!(d.base_name(&xr), "mill");
    }

    #[test]
    fn name_detection_cases() {
        let cases = [
            ("pr-{number}-*", "pr-456-books", 456),
            ("pr-{number}-*", "mill", 0),
            ("pr-{number}-*", "pr-abc-mill", 0),
            ("preview-{number}-*", "preview-789-test", 789),
            ("pr-{number}-*", "pr-12345-app", 12345),
        ];
        for (pattern, name, want) in cases {
            let d = Detector::name_pattern(pattern).unwrap();
            assert_eq!(d.detect_pr(&named(name)), want, "{pattern} vs {name}");
        }
    }

    #[test]
    fn non_matching_name_keeps_base_name() {
        let d = Detector::name_pattern("pr-{number}-*").unwrap();
        let xr = named("mill");
        assert_eq!(d.detect_pr(&xr), 0);
        assert_eq!(d.base_name(&xr), "mill");
    }

    #[test]
    fn pattern_without_star_keeps_original_name() {
        let d = Detector::name_pattern("pr-{number}").unwrap();
        let xr = named("pr-42");
        assert_eq!(d.detect_pr(&xr), 42);
        assert_eq!(d.base_name(&xr), "pr-42");
    }

    #[test]
    fn detect_is_pure_and_does_not_mutate() {
        let d = Detector::name_pattern("pr-{number}-*").unwrap();
        let xr = named("pr-7-app");
        let before = xr.clone();
        assert_eq!(d.detect_pr(&xr), d.detect_pr(&xr));
        assert_eq!(xr, before);
    }

    #[test]
    fn label_detection() {
        let d = Detector::label(DEFAULT_LABEL_KEY);
        let xr = json!({"metadata": {
            "name": "mill",
            "labels": {"millstone.tech/pr-number": "321"}
        }});
        assert_eq!(d.detect_pr(&xr), 321);
        assert_eq!(d.base_name(&xr), "mill");

        assert_eq!(d.detect_pr(&named("mill")), 0);
        let bad = json!({"metadata": {"name": "x", "labels": {"millstone.tech/pr-number": "soon"}}});
        assert_eq!(d.detect_pr(&bad), 0);
    }

    #[test]
    fn annotation_detection() {
        let d = Detector::annotation(DEFAULT_ANNOTATION_KEY);
        let xr = json!({"metadata": {
            "name": "books",
            "annotations": {"millstone.tech/preview-pr": "88"}
        }});
        assert_eq!(d.detect_pr(&xr), 88);
        assert_eq!(d.base_name(&xr), "books");
        assert_eq!(d.detect_pr(&named("books")), 0);
    }

    #[test]
    fn from_config_selects_the_variant() {
        let mut cfg = DetectionConfig::default();
        assert!(matches!(Detector::from_config(&cfg).unwrap(), Detector::Name { .. }));
        cfg.strategy = xplan_config::DetectionStrategy::Label;
        assert!(matches!(Detector::from_config(&cfg).unwrap(), Detector::Label { .. }));
        cfg.strategy = xplan_config::DetectionStrategy::Annotation;
        assert!(matches!(Detector::from_config(&cfg).unwrap(), Detector::Annotation { .. }));
    }
}
