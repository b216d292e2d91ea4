//! Argo CD integration: resolve the application scope of a PR preview and
//! compute set-level diffs between the PR and production applications.
//!
//! Argo CD stamps every managed object with an instance label; that label is
//! the bridge from a watched XR back to the Application that deployed it.

#![forbid(unsafe_code)]

use anyhow::Context;
use kube::{
    api::{Api, DynamicObject},
    core::ApiResource,
    Client,
};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;
use xplan_config::ArgoConfig;
use xplan_core::{meta, DeletionEntry, ResourceKey, Scope};

/// Label Argo CD adds to all resources it manages.
pub const ARGOCD_INSTANCE_LABEL: &str = "argocd.argoproj.io/instance";

#[derive(Debug, thiserror::Error)]
pub enum ArgoError {
    /// The Application object (or Argo CD itself) is absent; callers degrade
    /// to label-free deletion detection.
    #[error("argocd application not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Api(#[from] anyhow::Error),
}

/// Resource-set difference between the PR and production applications.
/// Additions and modifications are informational (the composition diff
/// already covers them); only deletions feed the aggregation map.
#[derive(Debug, Clone, Default)]
pub struct AppSetDiff {
    pub additions: Vec<ResourceKey>,
    pub modifications: Vec<ResourceKey>,
    pub deletions: Vec<DeletionEntry>,
}

pub struct ArgoClient {
    client: Client,
    namespace: String,
    pr_prefix: String,
    pr_suffix: String,
}

impl ArgoClient {
    pub fn new(client: Client, cfg: &ArgoConfig) -> Self {
        Self {
            client,
            namespace: cfg.namespace.clone(),
            pr_prefix: cfg.pr_prefix.clone(),
            pr_suffix: cfg.pr_suffix.clone(),
        }
    }

    /// Strip the PR marker from an application name: "pr-123-myapp" with
    /// prefix "pr-" becomes "myapp". Suffix-style names are handled
    /// symmetrically.
    pub fn production_app_name(&self, pr_app: &str) -> String {
        production_app_name(pr_app, &self.pr_prefix, &self.pr_suffix)
    }

    /// Resolve the PR/prod application scope from an XR's instance label.
    pub fn scope_from_xr(&self, xr: &Value) -> Result<Scope, ArgoError> {
        let Some(app) = meta::label(xr, ARGOCD_INSTANCE_LABEL) else {
            return Err(ArgoError::NotFound(format!(
                "XR {} carries no {} label",
                meta::name(xr),
                ARGOCD_INSTANCE_LABEL
            )));
        };
        Ok(Scope { pr_app: app.to_string(), prod_app: self.production_app_name(app) })
    }

    /// Compare the two applications' resource sets. A missing production app
    /// means a brand-new deployment: everything in the PR is an addition.
    pub async fn app_diff(&self, pr_app: &str, prod_app: &str) -> Result<AppSetDiff, ArgoError> {
        let pr = self.get_application(pr_app).await?;
        let prod = match self.get_application(prod_app).await {
            Ok(app) => app,
            Err(ArgoError::NotFound(_)) => {
                debug!(app = %prod_app, "production application not found, treating as new deployment");
                let additions = extract_resources(&pr).into_values().collect();
                return Ok(AppSetDiff { additions, ..Default::default() });
            }
            Err(e) => return Err(e),
        };

        Ok(compare_resources(&extract_resources(&pr), &extract_resources(&prod)))
    }

    async fn get_application(&self, name: &str) -> Result<Value, ArgoError> {
        let ar = ApiResource {
            group: "argoproj.io".into(),
            version: "v1alpha1".into(),
            api_version: "argoproj.io/v1alpha1".into(),
            kind: "Application".into(),
            plural: "applications".into(),
        };
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &self.namespace, &ar);
        let obj = api
            .get_opt(name)
            .await
            .map_err(|e| ArgoError::Api(anyhow::Error::new(e).context(format!("getting application {name}"))))?
            .ok_or_else(|| ArgoError::NotFound(name.to_string()))?;
        serde_json::to_value(&obj)
            .context("serializing Application")
            .map_err(ArgoError::Api)
    }
}

pub(crate) fn production_app_name(pr_app: &str, prefix: &str, suffix: &str) -> String {
    let mut result = pr_app.to_string();
    if !prefix.is_empty() {
        if let Ok(re) = Regex::new(&format!(r"^{}\d+[-_]", regex::escape(prefix))) {
            result = re.replace(&result, "").into_owned();
        }
    }
    if !suffix.is_empty() {
        if let Ok(re) = Regex::new(&format!(r"{}[-_]\d+$", regex::escape(suffix))) {
            result = re.replace(&result, "").into_owned();
        }
    }
    result
}

/// Pull the managed-resource set out of `status.resources`, keyed by full
/// (group, version, kind, namespace, name) identity.
pub fn extract_resources(app: &Value) -> HashMap<String, ResourceKey> {
    let mut out = HashMap::new();
    let Some(resources) = app.pointer("/status/resources").and_then(Value::as_array) else {
        debug!(app = %meta::name(app), "no resources in application status");
        return out;
    };
    for res in resources {
        let field = |k: &str| res.get(k).and_then(Value::as_str).unwrap_or("").to_string();
        let namespace = res.get("namespace").and_then(Value::as_str).map(String::from);
        let key = ResourceKey {
            group: field("group"),
            version: field("version"),
            kind: field("kind"),
            namespace,
            name: field("name"),
        };
        out.insert(key.to_string(), key);
    }
    out
}

/// Partition the two sets into the three disjoint buckets.
pub fn compare_resources(
    pr: &HashMap<String, ResourceKey>,
    prod: &HashMap<String, ResourceKey>,
) -> AppSetDiff {
    let mut diff = AppSetDiff::default();

    for (key, res) in pr {
        if prod.contains_key(key) {
            diff.modifications.push(res.clone());
        } else {
            diff.additions.push(res.clone());
        }
    }
    for (key, res) in prod {
        if !pr.contains_key(key) {
            let raw_diff = format!(
                "- {}/{} ({})",
                res.kind,
                res.name,
                res.namespace.as_deref().unwrap_or("cluster-scoped")
            );
            diff.deletions.push(DeletionEntry { key: res.clone(), raw_diff });
        }
    }

    // Deterministic output regardless of map iteration order.
    diff.additions.sort();
    diff.modifications.sort();
    diff.deletions.sort_by(|a, b| a.key.cmp(&b.key));
    diff
}
