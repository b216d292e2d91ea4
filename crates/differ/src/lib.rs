//! Diff orchestration: sanitize a composite resource, drive the render
//! engine, and summarize what changed.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;
use xplan_core::{meta, DiffResult, ManagedResourceState};

mod sanitize;
pub use sanitize::{SanitizeOutcome, Sanitizer};

/// Capability seam to the composition rendering engine. Implementations
/// write a textual diff into `out`, never mutate `xr`, and surface failures
/// as structured errors.
#[async_trait]
pub trait DiffEngine: Send + Sync {
    async fn render(&self, xr: &Value, out: &mut Vec<u8>) -> Result<()>;
}

/// Optional second capability: observe the live state of the managed
/// resources an XR references. Probe failures never fail the diff.
#[async_trait]
pub trait StateProbe: Send + Sync {
    async fn managed_state(&self, xr: &Value) -> Result<Vec<ManagedResourceState>>;
}

/// Drives the engine for one XR at a time.
pub struct DiffCalculator {
    engine: Arc<dyn DiffEngine>,
    sanitizer: Option<Sanitizer>,
    probe: Option<Arc<dyn StateProbe>>,
}

impl DiffCalculator {
    pub fn new(engine: Arc<dyn DiffEngine>) -> Self {
        Self { engine, sanitizer: None, probe: None }
    }

    pub fn with_sanitizer(mut self, sanitizer: Sanitizer) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn with_state_probe(mut self, probe: Arc<dyn StateProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Compute the diff for one XR. Engine failures are fatal to this XR's
    /// result only; the caller continues with the rest of the batch.
    pub async fn calculate(&self, xr: &Value) -> Result<DiffResult> {
        let (xr_for_diff, stripped) = match &self.sanitizer {
            Some(s) => {
                let out = s.sanitize(xr);
                (out.xr, out.stripped)
            }
            None => (xr.clone(), Vec::new()),
        };

        let mut buf = Vec::new();
        self.engine
            .render(&xr_for_diff, &mut buf)
            .await
            .with_context(|| format!("rendering diff for {}/{}", meta::kind(xr), meta::name(xr)))?;

        let raw_diff = String::from_utf8_lossy(&buf).into_owned();
        let has_changes = !raw_diff.trim().is_empty();

        let mut result = DiffResult {
            summary: summarize(xr, &raw_diff, has_changes),
            xr: Some(xr.clone()),
            raw_diff,
            has_changes,
            stripped_fields: stripped,
            managed_resources: Vec::new(),
        };

        if let Some(probe) = &self.probe {
            match probe.managed_state(xr).await {
                Ok(states) => result.managed_resources = states,
                // The cluster diff stands on its own without this.
                Err(e) => info!(error = %e, "failed to fetch managed resources"),
            }
        }

        Ok(result)
    }
}

/// High-level indicator, not an exact patch count: lines starting with `+` /
/// `-` after trimming (the `+++`/`---` headers included, blank lines not).
fn summarize(xr: &Value, diff: &str, has_changes: bool) -> String {
    let kind = meta::kind(xr);
    let name = meta::name(xr);
    if !has_changes {
        return format!("No changes detected for {kind}/{name}");
    }

    let mut additions = 0usize;
    let mut deletions = 0usize;
    for line in diff.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }
    format!("Changes detected for {kind}/{name}: +{additions} -{deletions} lines")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xplan_config::default_strip_rules;

    /// Engine writing a canned diff, or failing on demand.
    struct FakeEngine {
        diff: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl DiffEngine for FakeEngine {
        async fn render(&self, _xr: &Value, out: &mut Vec<u8>) -> Result<()> {
            if self.fail {
                anyhow::bail!("engine exploded");
            }
            out.extend_from_slice(self.diff.as_bytes());
            Ok(())
        }
    }

    fn xr() -> Value {
        json!({
            "apiVersion": "example.org/v1",
            "kind": "XDatabase",
            "metadata": {"name": "mill"},
            "spec": {"managementPolicies": ["Observe"], "size": "small"}
        })
    }

    #[tokio::test]
    async fn empty_diff_means_no_changes() {
        let calc = DiffCalculator::new(Arc::new(FakeEngine { diff: "  \n \n", fail: false }));
        let result = calc.calculate(&xr()).await.unwrap();
        assert!(!result.has_changes);
        assert_eq!(result.summary, "No changes detected for XDatabase/mill");
    }

    #[tokio::test]
    async fn summary_counts_plus_and_minus_lines() {
        let diff = "+++ desired\n--- live\n+ size: large\n- size: small\n  context\n\n";
        let calc = DiffCalculator::new(Arc::new(FakeEngine { diff, fail: false }));
        let result = calc.calculate(&xr()).await.unwrap();
        assert!(result.has_changes);
        assert_eq!(result.summary, "Changes detected for XDatabase/mill: +2 -2 lines");
        assert_eq!(result.raw_diff, diff);
    }

    #[tokio::test]
    async fn sanitizer_runs_before_the_engine() {
        // The engine sees the sanitized document; the result reports the
        // stripped fields and keeps the original XR.
        struct CapturingEngine(std::sync::Mutex<Option<Value>>);

        #[async_trait]
        impl DiffEngine for CapturingEngine {
            async fn render(&self, xr: &Value, _out: &mut Vec<u8>) -> Result<()> {
                *self.0.lock().unwrap() = Some(xr.clone());
                Ok(())
            }
        }

        let engine = Arc::new(CapturingEngine(std::sync::Mutex::new(None)));
        let calc = DiffCalculator::new(engine.clone())
            .with_sanitizer(Sanitizer::new(default_strip_rules()));

        let original = xr();
        let result = calc.calculate(&original).await.unwrap();

        let seen = engine.0.lock().unwrap().clone().unwrap();
        assert!(seen.pointer("/spec/managementPolicies").is_none());
        assert_eq!(result.stripped_fields.len(), 1);
        // Original is reported untouched.
        assert_eq!(result.xr.as_ref().unwrap(), &original);
        assert!(original.pointer("/spec/managementPolicies").is_some());
    }

    #[tokio::test]
    async fn engine_errors_are_fatal_to_this_result() {
        let calc = DiffCalculator::new(Arc::new(FakeEngine { diff: "", fail: true }));
        let err = calc.calculate(&xr()).await.unwrap_err();
        assert!(err.to_string().contains("XDatabase/mill"));
    }

    struct FakeProbe {
        fail: bool,
    }

    #[async_trait]
    impl StateProbe for FakeProbe {
        async fn managed_state(&self, _xr: &Value) -> Result<Vec<ManagedResourceState>> {
            if self.fail {
                anyhow::bail!("no resourceRefs found in XR");
            }
            Ok(vec![ManagedResourceState { is_read_only: true, ..Default::default() }])
        }
    }

    #[tokio::test]
    async fn state_probe_enriches_the_result() {
        let calc = DiffCalculator::new(Arc::new(FakeEngine { diff: "", fail: false }))
            .with_state_probe(Arc::new(FakeProbe { fail: false }));
        let result = calc.calculate(&xr()).await.unwrap();
        assert_eq!(result.managed_resources.len(), 1);
        assert!(result.managed_resources[0].is_read_only);
    }

    #[tokio::test]
    async fn state_probe_failures_are_not_fatal() {
        let calc = DiffCalculator::new(Arc::new(FakeEngine { diff: "+ x", fail: false }))
            .with_state_probe(Arc::new(FakeProbe { fail: true }));
        let result = calc.calculate(&xr()).await.unwrap();
        assert!(result.has_changes);
        assert!(result.managed_resources.is_empty());
    }
}
