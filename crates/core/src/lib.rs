//! Core types for the crossplane-plan pipeline.
//!
//! Composite resources travel through the system as raw `serde_json::Value`
//! documents; their schemas are only known at runtime. The `meta` and `paths`
//! modules are the only sanctioned ways to poke at them.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod meta;
pub mod paths;

/// PR numbers are positive; 0 means "not a preview resource".
pub type PrNumber = u64;

/// A field removed by the sanitizer before diffing, kept for transparency.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StrippedField {
    pub path: String,
    pub reason: String,
}

/// Diff outcome for a single composite resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffResult {
    /// The original (unsanitized) XR this result belongs to, when known.
    pub xr: Option<serde_json::Value>,
    /// Raw textual diff as produced by the render engine.
    pub raw_diff: String,
    pub has_changes: bool,
    pub summary: String,
    pub stripped_fields: Vec<StrippedField>,
    /// Live state of the managed resources referenced by the XR; empty when
    /// the probe is unset or failed (non-fatal).
    #[serde(default)]
    pub managed_resources: Vec<ManagedResourceState>,
}

/// Observed state of one managed resource referenced by an XR.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagedResourceState {
    pub resource: serde_json::Value,
    pub management_policies: Vec<String>,
    /// Exactly `["Observe"]`: the resource may be inspected but not mutated.
    pub is_read_only: bool,
    /// `status.atProvider` exists and is populated.
    pub has_at_provider: bool,
    /// The Ready condition is True.
    pub is_ready: bool,
    /// Top-level `spec.forProvider` fields whose observed value differs.
    pub declared_vs_actual: Vec<FieldComparison>,
}

/// One declared-versus-observed difference on a managed resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldComparison {
    pub path: String,
    pub declared: serde_json::Value,
    pub actual: serde_json::Value,
}

/// Full identity of a cluster object, used for set arithmetic between the
/// PR and production application scopes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn gvk(&self) -> (String, String, String) {
        (self.group.clone(), self.version.clone(), self.kind.clone())
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}",
            self.group,
            self.version,
            self.kind,
            self.namespace.as_deref().unwrap_or(""),
            self.name
        )
    }
}

/// A production resource that would be deleted if the PR merged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionEntry {
    pub key: ResourceKey,
    pub raw_diff: String,
}

/// Aggregation-map key prefix distinguishing deletions from modifications.
pub const DELETION_KEY_PREFIX: &str = "DELETED-";

/// GitOps application scope of a PR preview.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scope {
    pub pr_app: String,
    pub prod_app: String,
}

pub mod prelude {
    pub use super::{
        DeletionEntry, DiffResult, FieldComparison, ManagedResourceState, PrNumber, ResourceKey,
        Scope, StrippedField,
    };
}
