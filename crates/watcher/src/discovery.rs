//! Composite-kind discovery from CompositeResourceDefinitions.

use anyhow::{Context, Result};
use kube::{
    api::{Api, DynamicObject, ListParams},
    core::ApiResource,
    Client,
};
use serde_json::Value;
use tracing::warn;
use xplan_core::{meta, paths};

/// A watchable composite-resource kind, extracted from its XRD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl CompositeKind {
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: format!("{}/{}", self.group, self.version),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

impl std::fmt::Display for CompositeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.kind)
    }
}

fn xrd_api_resource() -> ApiResource {
    ApiResource {
        group: "apiextensions.crossplane.io".into(),
        version: "v1".into(),
        api_version: "apiextensions.crossplane.io/v1".into(),
        kind: "CompositeResourceDefinition".into(),
        plural: "compositeresourcedefinitions".into(),
    }
}

/// List all XRDs and extract the kinds to watch. XRDs with missing fields
/// are skipped with a warning, never fatal to the rest of the listing.
pub async fn discover_composite_kinds(client: &Client) -> Result<Vec<CompositeKind>> {
    let api: Api<DynamicObject> = Api::all_with(client.clone(), &xrd_api_resource());
    let list = api
        .list(&ListParams::default())
        .await
        .context("listing composite resource definitions")?;

    let mut out = Vec::new();
    for xrd in &list.items {
        let raw = serde_json::to_value(xrd).context("serializing XRD")?;
        match parse_xrd(&raw) {
            Some(kind) => out.push(kind),
            None => warn!(xrd = %meta::name(&raw), "skipping XRD with missing fields"),
        }
    }
    out.sort_by(|a, b| {
        a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind))
    });
    Ok(out)
}

/// Pull (group, served version, kind, plural) from an XRD document. The
/// version is the first entry that is both served and referenceable.
pub fn parse_xrd(xrd: &Value) -> Option<CompositeKind> {
    let group = paths::get(xrd, "spec.group")?.as_str()?;
    let plural = paths::get(xrd, "spec.names.plural")?.as_str()?;
    let kind = paths::get(xrd, "spec.names.kind")?.as_str()?;
    let versions = paths::get(xrd, "spec.versions")?.as_array()?;

    let version = versions.iter().find_map(|v| {
        let served = v.get("served").and_then(Value::as_bool).unwrap_or(false);
        let referenceable = v.get("referenceable").and_then(Value::as_bool).unwrap_or(false);
        let name = v.get("name").and_then(Value::as_str)?;
        (served && referenceable && !name.is_empty()).then(|| name.to_string())
    })?;

    Some(CompositeKind {
        group: group.to_string(),
        version,
        kind: kind.to_string(),
        plural: plural.to_string(),
    })
}
