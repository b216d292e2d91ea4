//! The reconcile loop: leader election, initial sweep, watch fan-out and
//! per-PR batch processing.
//!
//! Watch events never do work directly; they only mark a PR dirty in the
//! debounce queue. When the queue fires, the whole PR is re-listed and
//! re-processed from scratch, so the handler tolerates any amount of churn
//! between event and fire.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Api, DynamicObject, ListParams},
    Client,
};
use metrics::{counter, histogram};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch as signal;
use tracing::{debug, info, warn};

use xplan_core::{meta, DeletionEntry, DiffResult, PrNumber, ResourceKey, Scope, DELETION_KEY_PREFIX};
use xplan_detector::Detector;
use xplan_differ::DiffCalculator;
use xplan_formatter::CommentFormatter;
use xplan_gitops::{AppSetDiff, ArgoClient, ArgoError};
use xplan_queue::{PrProcessor, PrWorkQueue};
use xplan_vcs::CommentSink;

pub mod discovery;
pub mod lease;
mod watch;

pub use discovery::{discover_composite_kinds, CompositeKind};
pub use lease::{LeaderElector, LeaseConfig};

/// Debounce window for PR watch events.
pub const PR_DEBOUNCE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Periodic resync interval in minutes; 0 disables it.
    pub reconciliation_interval_min: u64,
    pub debounce: Duration,
    pub lease: LeaseConfig,
}

impl WatcherConfig {
    pub fn new(reconciliation_interval_min: u64) -> Self {
        Self {
            reconciliation_interval_min,
            debounce: PR_DEBOUNCE,
            lease: LeaseConfig::from_env(),
        }
    }
}

/// Everything one `process_pr` invocation needs. Shared between the queue
/// (as its processor) and the outer watch loop.
pub struct Reconciler {
    client: Client,
    detector: Detector,
    calculator: DiffCalculator,
    formatter: CommentFormatter,
    /// None in dry-run mode: diffs are computed and logged, never posted.
    sink: Option<Arc<dyn CommentSink>>,
    argocd: ArgoClient,
    /// Sweep-path hint: XR name to last successfully processed
    /// resourceVersion. Never consulted on the debounced path.
    processed: Mutex<HashMap<String, String>>,
}

impl Reconciler {
    pub fn new(
        client: Client,
        detector: Detector,
        calculator: DiffCalculator,
        formatter: CommentFormatter,
        sink: Option<Arc<dyn CommentSink>>,
        argocd: ArgoClient,
    ) -> Self {
        Self {
            client,
            detector,
            calculator,
            formatter,
            sink,
            argocd,
            processed: Mutex::new(HashMap::new()),
        }
    }

    async fn list_kind(&self, kind: &CompositeKind) -> Result<Vec<Value>> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &kind.api_resource());
        let list = api
            .list(&ListParams::default())
            .await
            .with_context(|| format!("listing {kind}"))?;
        list.items
            .iter()
            .map(|o| serde_json::to_value(o).context("serializing object"))
            .collect()
    }

    /// All XRs across all composite kinds carrying this PR number.
    async fn find_all_pr_resources(&self, pr: PrNumber) -> Result<Vec<Value>> {
        let kinds = discover_composite_kinds(&self.client).await?;
        let mut all = Vec::new();
        for kind in &kinds {
            match self.list_kind(kind).await {
                Ok(items) => {
                    all.extend(items.into_iter().filter(|xr| self.detector.detect_pr(xr) == pr))
                }
                Err(e) => warn!(gvk = %kind, error = %e, "failed to list resources"),
            }
        }
        Ok(all)
    }

    /// Process one PR's XR set: diff each against production, detect
    /// deletions, render and upsert the single PR comment.
    async fn handle_pr_batch(&self, pr: PrNumber, xrs: &[Value]) -> Result<()> {
        if xrs.is_empty() {
            return Ok(());
        }
        let started = Instant::now();

        // Scope resolution is best effort: without it deletion detection
        // degrades to label-free mode.
        let scope = match self.argocd.scope_from_xr(&xrs[0]) {
            Ok(scope) => {
                info!(pr_app = %scope.pr_app, prod_app = %scope.prod_app, "discovered scope");
                Some(scope)
            }
            Err(e) => {
                warn!(xr = %meta::name(&xrs[0]), error = %e, "failed to discover scope, falling back to label-free detection");
                None
            }
        };

        let mut results: BTreeMap<String, DiffResult> = BTreeMap::new();
        for xr in xrs {
            let name = meta::name(xr).to_string();
            let base_name = self.detector.base_name(xr);
            info!(name = %name, production_name = %base_name, pr, "comparing PR XR against production");

            let xr_for_diff = transform_for_diff(&self.detector, xr);
            match self.calculator.calculate(&xr_for_diff).await {
                Ok(result) => {
                    results.insert(name, result);
                }
                Err(e) => {
                    // Fatal to this XR only; the batch carries on.
                    warn!(name = %name, error = %e, "failed to calculate diff");
                    counter!("pr_diff_errors_total", 1u64);
                }
            }
        }

        let scope_diff = self.collect_deletions(pr, xrs, scope.as_ref(), &mut results).await;

        if results.is_empty() {
            return Ok(());
        }

        let comment = match results.values().next() {
            Some(result) if results.len() == 1 && scope_diff.is_none() => {
                self.formatter.format_single(&xrs[0], result)
            }
            _ => self.formatter.format_many(&results, scope_diff.as_ref()),
        };

        match &self.sink {
            Some(sink) => {
                sink.upsert(pr, &comment).await.context("posting PR comment")?;
                counter!("comment_upserts_total", 1u64);
                info!(pr, resources = results.len(), "posted PR comment");
            }
            None => info!(pr, resources = results.len(), "dry-run: would post comment"),
        }

        histogram!("pr_reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }

    /// Deletion detection, GitOps-assisted when the scope is known and both
    /// applications resolve, label-free otherwise. Failures degrade, never
    /// abort the batch.
    async fn collect_deletions(
        &self,
        pr: PrNumber,
        xrs: &[Value],
        scope: Option<&Scope>,
        results: &mut BTreeMap<String, DiffResult>,
    ) -> Option<AppSetDiff> {
        if let Some(scope) = scope {
            match self.argocd.app_diff(&scope.pr_app, &scope.prod_app).await {
                Ok(diff) => {
                    info!(
                        additions = diff.additions.len(),
                        modifications = diff.modifications.len(),
                        deletions = diff.deletions.len(),
                        "argocd diff complete"
                    );
                    for deletion in &diff.deletions {
                        results.insert(
                            format!("{DELETION_KEY_PREFIX}{}", deletion.key.name),
                            DiffResult {
                                xr: None,
                                raw_diff: deletion.raw_diff.clone(),
                                has_changes: true,
                                summary: format!(
                                    "⚠️ {} will be **DELETED** (ArgoCD)",
                                    deletion.key.kind
                                ),
                                ..Default::default()
                            },
                        );
                    }
                    return Some(diff);
                }
                Err(ArgoError::NotFound(e)) => {
                    info!(pr, reason = %e, "argocd diff unavailable, using fallback deletion detection");
                }
                Err(e) => {
                    warn!(pr, error = %e, "argocd diff failed, using fallback");
                }
            }
        }

        if let Err(e) = self.detect_deletions_label_free(pr, xrs, results).await {
            warn!(pr, error = %e, "deletion detection failed");
        }
        None
    }

    async fn detect_deletions_label_free(
        &self,
        pr: PrNumber,
        xrs: &[Value],
        results: &mut BTreeMap<String, DiffResult>,
    ) -> Result<()> {
        let pr_base_names: HashSet<String> =
            xrs.iter().map(|xr| self.detector.base_name(xr)).collect();
        let pr_gvks: HashSet<(String, String, String)> = xrs
            .iter()
            .map(|xr| {
                let (group, version) = meta::group_version(xr);
                (group, version, meta::kind(xr).to_string())
            })
            .collect();
        if pr_base_names.is_empty() {
            return Ok(());
        }

        let kinds = discover_composite_kinds(&self.client).await?;
        for kind in &kinds {
            let items = match self.list_kind(kind).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(gvk = %kind, error = %e, "failed to list production resources");
                    continue;
                }
            };
            for entry in label_free_deletions(&self.detector, &items, &pr_gvks, &pr_base_names) {
                info!(resource = %entry.key.name, gvk = %kind, pr, "detected deletion");
                results.insert(
                    format!("{DELETION_KEY_PREFIX}{}", entry.key.name),
                    deletion_result(&entry),
                );
            }
        }
        Ok(())
    }

    fn sweep_already_processed(&self, members: &[(String, String)]) -> bool {
        let processed = self.processed.lock().unwrap();
        !members.is_empty()
            && members
                .iter()
                .all(|(name, rv)| processed.get(name).is_some_and(|seen| seen == rv))
    }

    fn remember_processed(&self, members: &[(String, String)]) {
        let mut processed = self.processed.lock().unwrap();
        for (name, rv) in members {
            processed.insert(name.clone(), rv.clone());
        }
    }
}

#[async_trait]
impl PrProcessor for Reconciler {
    async fn process_pr(&self, pr: PrNumber) -> Result<()> {
        info!(pr, "processing all resources for PR");
        counter!("pr_reconcile_total", 1u64);

        let xrs = self.find_all_pr_resources(pr).await.context("finding PR resources")?;
        if xrs.is_empty() {
            info!(pr, "no resources found for PR");
            return Ok(());
        }
        info!(pr, count = xrs.len(), "found resources for PR");
        self.handle_pr_batch(pr, &xrs).await
    }
}

/// Clone a preview XR into the shape the diff engine expects: production
/// name, no server-assigned identity. The input is never mutated.
pub fn transform_for_diff(detector: &Detector, xr: &Value) -> Value {
    let mut out = xr.clone();
    meta::set_name(&mut out, &detector.base_name(xr));
    meta::clear_server_identity(&mut out);
    out
}

/// Production resources that vanish when the PR merges: not previews
/// themselves, of a GVK the PR actually touches, with no PR counterpart by
/// base name.
pub fn label_free_deletions(
    detector: &Detector,
    candidates: &[Value],
    pr_gvks: &HashSet<(String, String, String)>,
    pr_base_names: &HashSet<String>,
) -> Vec<DeletionEntry> {
    let mut out = Vec::new();
    for xr in candidates {
        if detector.detect_pr(xr) != 0 {
            continue;
        }
        let (group, version) = meta::group_version(xr);
        let kind = meta::kind(xr).to_string();
        if !pr_gvks.contains(&(group.clone(), version.clone(), kind.clone())) {
            continue;
        }
        let name = meta::name(xr);
        if pr_base_names.contains(name) {
            continue;
        }
        out.push(DeletionEntry {
            raw_diff: format!("Resource {kind}/{name} will be deleted"),
            key: ResourceKey {
                group,
                version,
                kind,
                namespace: meta::namespace(xr).map(String::from),
                name: name.to_string(),
            },
        });
    }
    out
}

fn deletion_result(entry: &DeletionEntry) -> DiffResult {
    DiffResult {
        xr: None,
        raw_diff: entry.raw_diff.clone(),
        has_changes: true,
        summary: "⚠️  Resource will be **DELETED**".to_string(),
        ..Default::default()
    }
}

/// PR id a watch event should be filed under, if any.
pub fn classify_event(detector: &Detector, xr: &Value) -> Option<PrNumber> {
    match detector.detect_pr(xr) {
        0 => None,
        pr => Some(pr),
    }
}

/// Group a listing by PR number, dropping non-preview entries.
pub fn group_by_pr(detector: &Detector, xrs: Vec<Value>) -> HashMap<PrNumber, Vec<Value>> {
    let mut out: HashMap<PrNumber, Vec<Value>> = HashMap::new();
    for xr in xrs {
        match detector.detect_pr(&xr) {
            0 => {}
            pr => out.entry(pr).or_default().push(xr),
        }
    }
    out
}

/// Top-level supervisor: owns the queue and runs the leader-elected loop.
pub struct XrWatcher {
    core: Arc<Reconciler>,
    queue: Arc<PrWorkQueue>,
    client: Client,
    cfg: WatcherConfig,
}

impl XrWatcher {
    pub fn new(client: Client, core: Reconciler, cfg: WatcherConfig) -> Self {
        let core = Arc::new(core);
        let queue = Arc::new(PrWorkQueue::new(core.clone(), cfg.debounce));
        Self { core, queue, client, cfg }
    }

    /// Run until the shutdown signal flips. Non-leaders idle inside
    /// `acquire`; on lost leadership the watches stop and the loop goes
    /// back to acquiring.
    pub async fn start(&self, mut shutdown: signal::Receiver<bool>) -> Result<()> {
        info!("starting XR watcher with leader election");
        let elector = LeaderElector::new(self.client.clone(), self.cfg.lease.clone());

        loop {
            if !elector.acquire(&mut shutdown).await? {
                break;
            }
            match self.run_as_leader(&elector, &mut shutdown).await {
                Ok(LeaderExit::LostLease) => {
                    warn!("lost leadership, stopping watchers");
                    continue;
                }
                Ok(LeaderExit::Shutdown) => break,
                Err(e) => {
                    elector.release().await;
                    self.queue.shutdown();
                    return Err(e);
                }
            }
        }

        elector.release().await;
        self.queue.shutdown();
        info!("XR watcher stopped");
        Ok(())
    }

    async fn run_as_leader(
        &self,
        elector: &LeaderElector,
        shutdown: &mut signal::Receiver<bool>,
    ) -> Result<LeaderExit> {
        // The very first discovery failing is a bootstrap error; later
        // resync failures only log.
        let kinds = discover_composite_kinds(&self.client)
            .await
            .context("discovering composite kinds")?;
        info!(count = kinds.len(), "discovered composite resource kinds");

        info!("starting initial reconciliation of existing PR XRs");
        self.sweep(&kinds).await;
        info!("initial reconciliation complete");

        // One watch task per kind; all share the stop signal.
        let (stop_tx, stop_rx) = signal::channel(false);
        let mut tasks = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let detector = self.core.detector.clone();
            let queue = self.queue.clone();
            let handler: watch::EventHandler = Arc::new(move |xr: Value| {
                if let Some(pr) = classify_event(&detector, &xr) {
                    debug!(pr, name = %meta::name(&xr), "XR event enqueued");
                    queue.enqueue(pr);
                }
            });
            tasks.push(tokio::spawn(watch::watch_composite_kind(
                self.client.clone(),
                kind,
                handler,
                stop_rx.clone(),
            )));
        }

        let mut renew_timer = tokio::time::interval(self.cfg.lease.renew_period);
        renew_timer.tick().await; // the first tick is immediate

        let mut resync_timer = (self.cfg.reconciliation_interval_min > 0).then(|| {
            info!(interval_min = self.cfg.reconciliation_interval_min, "periodic reconciliation enabled");
            let mut t = tokio::time::interval(Duration::from_secs(
                self.cfg.reconciliation_interval_min * 60,
            ));
            t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            t
        });

        let exit = loop {
            tokio::select! {
                _ = renew_timer.tick() => {
                    match elector.renew().await {
                        Ok(true) => {}
                        Ok(false) => break LeaderExit::LostLease,
                        Err(e) => {
                            warn!(error = %e, "lease renewal failed, assuming leadership lost");
                            break LeaderExit::LostLease;
                        }
                    }
                }
                _ = tick_opt(&mut resync_timer) => {
                    info!("running periodic reconciliation");
                    match discover_composite_kinds(&self.client).await {
                        Ok(kinds) => self.sweep(&kinds).await,
                        Err(e) => warn!(error = %e, "resync discovery failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break LeaderExit::Shutdown;
                    }
                }
            }
        };

        let _ = stop_tx.send(true);
        for task in tasks {
            task.abort();
        }
        Ok(exit)
    }

    /// List every kind, group by PR number and run the batch handler for
    /// each, the same handler the debounced queue invokes. The
    /// resourceVersion cache skips PRs whose members are all unchanged
    /// since the last successful sweep.
    async fn sweep(&self, kinds: &[CompositeKind]) {
        let mut pr_members: HashMap<PrNumber, Vec<(String, String)>> = HashMap::new();
        for kind in kinds {
            let items = match self.core.list_kind(kind).await {
                Ok(items) => items,
                Err(e) => {
                    warn!(gvk = %kind, error = %e, "sweep failed to list resources");
                    continue;
                }
            };
            debug!(gvk = %kind, total = items.len(), "checking for existing PR XRs");
            for (pr, xrs) in group_by_pr(&self.core.detector, items) {
                let members = pr_members.entry(pr).or_default();
                for xr in &xrs {
                    members.push((
                        meta::name(xr).to_string(),
                        meta::resource_version(xr).unwrap_or("").to_string(),
                    ));
                }
            }
        }

        for (pr, members) in pr_members {
            if self.core.sweep_already_processed(&members) {
                debug!(pr, "sweep: resource versions unchanged, skipping");
                continue;
            }
            info!(pr, count = members.len(), "reconciling PR XRs");
            match self.core.process_pr(pr).await {
                Ok(()) => self.core.remember_processed(&members),
                Err(e) => warn!(pr, error = %e, "failed to process PR batch"),
            }
        }
    }
}

enum LeaderExit {
    LostLease,
    Shutdown,
}

async fn tick_opt(timer: &mut Option<tokio::time::Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detector() -> Detector {
        Detector::name_pattern("pr-{number}-*").unwrap()
    }

    fn xr(kind: &str, name: &str) -> Value {
        json!({
            "apiVersion": "example.org/v1",
            "kind": kind,
            "metadata": {
                "name": name,
                "uid": "u-1",
                "resourceVersion": "10",
                "generation": 2,
                "creationTimestamp": "2025-01-01T00:00:00Z",
                "managedFields": [{"manager": "kubectl"}],
                "labels": {"app": "mill"}
            },
            "spec": {"size": "small"}
        })
    }

    #[test]
    fn transform_renames_and_clears_identity_only() {
        let d = detector();
        let original = xr("XDatabase", "pr-123-mill");
        let transformed = transform_for_diff(&d, &original);

        assert_eq!(meta::name(&transformed), "mill");
        let tm = transformed.pointer("/metadata").unwrap().as_object().unwrap();
        for gone in ["uid", "resourceVersion", "generation", "creationTimestamp", "managedFields"] {
            assert!(!tm.contains_key(gone));
        }
        // Everything else survives.
        assert_eq!(transformed.pointer("/spec"), original.pointer("/spec"));
        assert_eq!(transformed.pointer("/metadata/labels"), original.pointer("/metadata/labels"));
        // And the input is untouched.
        assert_eq!(meta::name(&original), "pr-123-mill");
        assert!(original.pointer("/metadata/uid").is_some());
    }

    #[test]
    fn label_free_deletion_for_missing_base_name() {
        let d = detector();
        let pr_xrs = vec![xr("XDatabase", "pr-42-a")];
        let pr_gvks: HashSet<_> = pr_xrs
            .iter()
            .map(|x| {
                let (g, v) = meta::group_version(x);
                (g, v, meta::kind(x).to_string())
            })
            .collect();
        let pr_base_names: HashSet<_> = pr_xrs.iter().map(|x| d.base_name(x)).collect();

        let prod = vec![xr("XDatabase", "a"), xr("XDatabase", "b"), xr("XDatabase", "pr-42-a")];
        let deletions = label_free_deletions(&d, &prod, &pr_gvks, &pr_base_names);

        assert_eq!(deletions.len(), 1);
        assert_eq!(deletions[0].key.name, "b");
        assert_eq!(deletions[0].key.kind, "XDatabase");
        assert_eq!(deletions[0].raw_diff, "Resource XDatabase/b will be deleted");
    }

    #[test]
    fn no_deletions_for_gvks_absent_from_the_pr() {
        let d = detector();
        let pr_xrs = vec![xr("XDatabase", "pr-42-a")];
        let pr_gvks: HashSet<_> = pr_xrs
            .iter()
            .map(|x| {
                let (g, v) = meta::group_version(x);
                (g, v, meta::kind(x).to_string())
            })
            .collect();
        let pr_base_names: HashSet<_> = pr_xrs.iter().map(|x| d.base_name(x)).collect();

        // XBucket is not touched by the PR, so its orphans are invisible.
        let prod = vec![xr("XBucket", "orphan")];
        assert!(label_free_deletions(&d, &prod, &pr_gvks, &pr_base_names).is_empty());
    }

    #[test]
    fn classify_ignores_non_preview_resources() {
        let d = detector();
        assert_eq!(classify_event(&d, &xr("XDatabase", "mill")), None);
        assert_eq!(classify_event(&d, &xr("XDatabase", "pr-9-mill")), Some(9));
    }

    #[test]
    fn group_by_pr_drops_production_entries() {
        let d = detector();
        let grouped = group_by_pr(
            &d,
            vec![
                xr("XDatabase", "pr-5-a"),
                xr("XDatabase", "pr-5-b"),
                xr("XDatabase", "pr-7-a"),
                xr("XDatabase", "prod-only"),
            ],
        );
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[&5].len(), 2);
        assert_eq!(grouped[&7].len(), 1);
    }

    #[test]
    fn deletion_results_are_marked_as_changes() {
        let entry = DeletionEntry {
            key: ResourceKey {
                group: "example.org".into(),
                version: "v1".into(),
                kind: "XDatabase".into(),
                namespace: None,
                name: "b".into(),
            },
            raw_diff: "Resource XDatabase/b will be deleted".into(),
        };
        let result = deletion_result(&entry);
        assert!(result.has_changes);
        assert!(result.summary.contains("DELETED"));
        assert_eq!(result.raw_diff, entry.raw_diff);
    }
}
