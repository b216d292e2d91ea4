//! Diff engine backed by the live cluster.
//!
//! The desired document (a preview XR already renamed to its production
//! identity) is compared against the live production object of the same
//! kind. Both sides are stripped of server-populated noise first; the
//! result is a line-oriented `+`/`-`/`~` rendering of leaf-path changes.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DynamicObject},
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    Client,
};
use serde_json::Value;
use std::io::Write as _;
use tracing::debug;
use xplan_core::{meta, ManagedResourceState};
use xplan_differ::{DiffEngine, StateProbe};

pub mod managed;
pub use managed::{analyze_managed_resource, parse_resource_refs};

pub struct LiveDiffEngine {
    client: Client,
}

impl LiveDiffEngine {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn find_api_resource(&self, gvk: &GroupVersionKind) -> Result<(kube::core::ApiResource, bool)> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }
}

#[async_trait]
impl DiffEngine for LiveDiffEngine {
    async fn render(&self, xr: &Value, out: &mut Vec<u8>) -> Result<()> {
        let (group, version) = meta::group_version(xr);
        let kind = meta::kind(xr).to_string();
        let name = meta::name(xr).to_string();
        if kind.is_empty() || name.is_empty() {
            return Err(anyhow!("document missing kind or metadata.name"));
        }

        let gvk = GroupVersionKind { group, version, kind };
        let (ar, namespaced) = self
            .find_api_resource(&gvk)
            .await
            .with_context(|| format!("resolving api resource for {}", gvk.kind))?;

        let api: Api<DynamicObject> = if namespaced {
            match meta::namespace(xr) {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };

        let live = api
            .get_opt(&name)
            .await
            .with_context(|| format!("fetching live {}/{}", gvk.kind, name))?
            .map(|o| serde_json::to_value(&o))
            .transpose()
            .context("serializing live object")?;

        let desired = strip_noisy(xr.clone());
        let lines = match live {
            Some(live) => {
                debug!(kind = %gvk.kind, name = %name, "diffing against live production object");
                diff_lines(&desired, &strip_noisy(live))
            }
            None => {
                debug!(kind = %gvk.kind, name = %name, "no production counterpart, whole document is new");
                render_added(&desired)
            }
        };

        for line in lines {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateProbe for LiveDiffEngine {
    async fn managed_state(&self, xr: &Value) -> Result<Vec<ManagedResourceState>> {
        let refs = managed::parse_resource_refs(xr);
        if refs.is_empty() {
            return Err(anyhow!("no resourceRefs found in XR"));
        }

        let mut states = Vec::with_capacity(refs.len());
        for r in refs {
            let gvk = GroupVersionKind {
                group: r.group.clone(),
                version: r.version.clone(),
                kind: r.kind.clone(),
            };
            let (ar, _) = match self.find_api_resource(&gvk).await {
                Ok(found) => found,
                Err(e) => {
                    debug!(kind = %r.kind, name = %r.name, error = %e, "failed to resolve managed resource kind");
                    continue;
                }
            };
            // Managed resources are cluster-scoped.
            let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
            match api.get_opt(&r.name).await {
                Ok(Some(obj)) => {
                    let raw = serde_json::to_value(&obj).context("serializing managed resource")?;
                    states.push(managed::analyze_managed_resource(&raw));
                }
                Ok(None) => debug!(kind = %r.kind, name = %r.name, "managed resource not found"),
                Err(e) => {
                    debug!(kind = %r.kind, name = %r.name, error = %e, "failed to fetch managed resource")
                }
            }
        }
        Ok(states)
    }
}

/// Remove server-populated fields that would otherwise show up as spurious
/// changes on every diff.
pub fn strip_noisy(mut v: Value) -> Value {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Leaf-path diff between the desired and live documents. Objects recurse,
/// arrays compare index-wise, scalars compare directly.
pub fn diff_lines(desired: &Value, live: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    walk("", desired, live, &mut lines);
    lines
}

/// Every leaf of a brand-new document, rendered as additions.
pub fn render_added(desired: &Value) -> Vec<String> {
    let mut lines = Vec::new();
    flatten(desired, "", &mut |path, v| lines.push(format!("+ {path}: {v}")));
    lines
}

fn walk(prefix: &str, desired: &Value, live: &Value, lines: &mut Vec<String>) {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => {
            for (k, dv) in d {
                let path = join(prefix, k);
                match l.get(k) {
                    Some(lv) => walk(&path, dv, lv, lines),
                    None => flatten(dv, &path, &mut |p, v| lines.push(format!("+ {p}: {v}"))),
                }
            }
            for (k, lv) in l {
                if !d.contains_key(k) {
                    let path = join(prefix, k);
                    flatten(lv, &path, &mut |p, v| lines.push(format!("- {p}: {v}")));
                }
            }
        }
        (Value::Array(d), Value::Array(l)) => {
            let common = d.len().min(l.len());
            for i in 0..common {
                walk(&format!("{prefix}[{i}]"), &d[i], &l[i], lines);
            }
            for (i, dv) in d.iter().enumerate().skip(common) {
                flatten(dv, &format!("{prefix}[{i}]"), &mut |p, v| {
                    lines.push(format!("+ {p}: {v}"))
                });
            }
            for (i, lv) in l.iter().enumerate().skip(common) {
                flatten(lv, &format!("{prefix}[{i}]"), &mut |p, v| {
                    lines.push(format!("- {p}: {v}"))
                });
            }
        }
        (d, l) => {
            if d != l {
                lines.push(format!("- {prefix}: {}", scalar(l)));
                lines.push(format!("+ {prefix}: {}", scalar(d)));
            }
        }
    }
}

fn flatten(v: &Value, path: &str, emit: &mut impl FnMut(&str, String)) {
    match v {
        Value::Object(map) => {
            if map.is_empty() {
                emit(path, "{}".to_string());
            }
            for (k, vv) in map {
                flatten(vv, &join(path, k), emit);
            }
        }
        Value::Array(arr) => {
            if arr.is_empty() {
                emit(path, "[]".to_string());
            }
            for (i, vv) in arr.iter().enumerate() {
                flatten(vv, &format!("{path}[{i}]"), emit);
            }
        }
        other => emit(path, scalar(other)),
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let v = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [{"foo": "bar"}],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "u",
                "creationTimestamp": "2020-01-01T00:00:00Z"
            },
            "status": {"obs": true},
            "data": {"k": "v"}
        });
        let pruned = strip_noisy(v);
        let meta = pruned.get("metadata").unwrap().as_object().unwrap();
        for gone in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid"] {
            assert!(!meta.contains_key(gone));
        }
        assert!(pruned.get("status").is_none());
        assert_eq!(pruned.pointer("/data/k"), Some(&json!("v")));
    }

    #[test]
    fn identical_documents_produce_no_lines() {
        let v = json!({"spec": {"size": "small", "tags": ["a", "b"]}});
        assert!(diff_lines(&v, &v).is_empty());
    }

    #[test]
    fn scalar_change_emits_minus_then_plus() {
        let desired = json!({"spec": {"size": "large"}});
        let live = json!({"spec": {"size": "small"}});
        assert_eq!(
            diff_lines(&desired, &live),
            vec!["- spec.size: small", "+ spec.size: large"]
        );
    }

    #[test]
    fn added_and_removed_fields_flatten() {
        let desired = json!({"spec": {"new": {"a": 1}}});
        let live = json!({"spec": {"old": true}});
        let lines = diff_lines(&desired, &live);
        assert!(lines.contains(&"+ spec.new.a: 1".to_string()));
        assert!(lines.contains(&"- spec.old: true".to_string()));
    }

    #[test]
    fn array_growth_and_shrink() {
        let desired = json!({"spec": {"tags": ["a", "b", "c"]}});
        let live = json!({"spec": {"tags": ["a", "x"]}});
        let lines = diff_lines(&desired, &live);
        assert_eq!(
            lines,
            vec![
                "- spec.tags[1]: x",
                "+ spec.tags[1]: b",
                "+ spec.tags[2]: c",
            ]
        );
    }

    #[test]
    fn new_document_renders_as_all_additions() {
        let desired = json!({
            "kind": "XDatabase",
            "spec": {"size": "small", "replicas": 2}
        });
        let lines = render_added(&desired);
        assert!(lines.contains(&"+ kind: XDatabase".to_string()));
        assert!(lines.contains(&"+ spec.size: small".to_string()));
        assert!(lines.contains(&"+ spec.replicas: 2".to_string()));
    }
}
