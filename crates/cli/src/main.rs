//! crossplane-plan: watch preview composite resources and publish a
//! consolidated infrastructure-change comment per pull request.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

use xplan_config::{Config, DetectionStrategy};
use xplan_detector::Detector;
use xplan_differ::{DiffCalculator, Sanitizer};
use xplan_engine::LiveDiffEngine;
use xplan_formatter::CommentFormatter;
use xplan_gitops::ArgoClient;
use xplan_vcs::{CommentSink, GitHubClient, GitHubConfig};
use xplan_watcher::{Reconciler, WatcherConfig, XrWatcher};

#[derive(Parser, Debug)]
#[command(name = "crossplane-plan", version, about = "Crossplane plan previews as PR comments")]
struct Cli {
    /// Path to kubeconfig file (in-cluster config when omitted)
    #[arg(long = "kubeconfig")]
    kubeconfig: Option<String>,

    /// PR detection strategy
    #[arg(long = "detection-strategy", value_enum, default_value_t = StrategyArg::Name)]
    detection_strategy: StrategyArg,

    /// Name pattern for PR detection (when strategy=name)
    #[arg(long = "name-pattern", default_value = "pr-{number}-*")]
    name_pattern: String,

    /// GitHub repository (format: owner/repo)
    #[arg(long = "github-repo")]
    github_repo: Option<String>,

    /// GitHub API token
    #[arg(long = "github-token", env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// GitHub credentials in crossplane-provider-github format (base64 JSON)
    #[arg(long = "github-credentials", env = "GITHUB_CREDENTIALS", hide_env_values = true)]
    github_credentials: Option<String>,

    /// GitHub App ID
    #[arg(long = "github-app-id", env = "GITHUB_APP_ID")]
    github_app_id: Option<String>,

    /// GitHub App installation ID
    #[arg(long = "github-installation-id", env = "GITHUB_INSTALLATION_ID")]
    github_installation_id: Option<String>,

    /// Path to the GitHub App private key file
    #[arg(long = "github-app-key-path", env = "GITHUB_APP_PRIVATE_KEY_PATH")]
    github_app_key_path: Option<String>,

    /// Calculate diffs but do not post to GitHub
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Periodic reconciliation interval in minutes (0 disables)
    #[arg(long = "reconciliation-interval", default_value_t = 5)]
    reconciliation_interval: u64,

    /// Path to the config file for field stripping rules
    #[arg(long = "config", default_value = "/etc/crossplane-plan/config.yaml")]
    config: String,

    /// Disable the built-in field stripping rules
    #[arg(long = "no-strip-defaults")]
    no_strip_defaults: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StrategyArg {
    Name,
    Label,
    Annotation,
}

impl From<StrategyArg> for DetectionStrategy {
    fn from(v: StrategyArg) -> Self {
        match v {
            StrategyArg::Name => DetectionStrategy::Name,
            StrategyArg::Label => DetectionStrategy::Label,
            StrategyArg::Annotation => DetectionStrategy::Annotation,
        }
    }
}

fn init_tracing() {
    let env = std::env::var("XPLAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("XPLAN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid XPLAN_METRICS_ADDR; expected host:port");
        }
    }
}

async fn build_kube_client(kubeconfig: Option<&str>) -> Result<kube::Client> {
    match kubeconfig {
        Some(path) => {
            let kc = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("reading kubeconfig {path}"))?;
            let cfg = kube::Config::from_custom_kubeconfig(
                kc,
                &kube::config::KubeConfigOptions::default(),
            )
            .await
            .context("building config from kubeconfig")?;
            kube::Client::try_from(cfg).context("creating kubernetes client")
        }
        None => kube::Client::try_default().await.context("creating kubernetes client"),
    }
}

fn build_github_sink(cli: &Cli, repo: &str) -> Result<Arc<dyn CommentSink>> {
    let private_key_pem = match cli.github_app_key_path.as_deref() {
        Some(path) => Some(
            std::fs::read(path)
                .with_context(|| format!("reading GitHub App private key {path}"))?,
        ),
        None => None,
    };
    let client = GitHubClient::from_config(GitHubConfig {
        repository: repo.to_string(),
        token: cli.github_token.clone(),
        credentials: cli.github_credentials.clone(),
        app_id: cli.github_app_id.clone(),
        installation_id: cli.github_installation_id.clone(),
        private_key_pem,
        base_api: None,
    })
    .context("creating GitHub client")?;
    Ok(Arc::new(client))
}

fn auth_method(cli: &Cli) -> &'static str {
    if cli.github_token.as_deref().is_some_and(|t| !t.is_empty()) {
        "token"
    } else if cli.github_credentials.as_deref().is_some_and(|c| !c.is_empty()) {
        "crossplane-credentials"
    } else if cli.github_app_id.is_some()
        && cli.github_installation_id.is_some()
        && cli.github_app_key_path.is_some()
    {
        "github-app"
    } else {
        "none"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    info!(
        detection_strategy = ?cli.detection_strategy,
        name_pattern = %cli.name_pattern,
        github_repo = cli.github_repo.as_deref().unwrap_or(""),
        dry_run = cli.dry_run,
        "starting crossplane-plan"
    );

    // Fatal startup validation: repo and auth are required unless dry-run.
    if !cli.dry_run {
        if cli.github_repo.as_deref().unwrap_or("").is_empty() {
            bail!("--github-repo is required");
        }
        if auth_method(&cli) == "none" {
            bail!(
                "authentication required: provide GITHUB_TOKEN, GITHUB_CREDENTIALS, or GitHub App \
                 credentials (GITHUB_APP_ID, GITHUB_INSTALLATION_ID, GITHUB_APP_PRIVATE_KEY_PATH)"
            );
        }
    }

    // File config carries strip rules and Argo CD settings; CLI flags own
    // detection and delivery.
    let mut config = Config::load(&cli.config)?;
    config.detection.strategy = cli.detection_strategy.into();
    config.detection.name_pattern = cli.name_pattern.clone();
    if cli.no_strip_defaults {
        config.diff.strip_defaults = false;
    }

    let detector =
        Detector::from_config(&config.detection).context("creating PR detector")?;

    let client = build_kube_client(cli.kubeconfig.as_deref()).await?;

    let engine = Arc::new(LiveDiffEngine::new(client.clone()));
    let mut calculator = DiffCalculator::new(engine.clone()).with_state_probe(engine);
    let strip_rules = config.all_strip_rules();
    if strip_rules.is_empty() {
        info!("field stripping disabled");
    } else {
        info!(rule_count = strip_rules.len(), "field stripping enabled");
        calculator = calculator.with_sanitizer(Sanitizer::new(strip_rules));
    }

    let sink = if cli.dry_run {
        None
    } else {
        let repo = cli.github_repo.clone().unwrap_or_default();
        let sink = build_github_sink(&cli, &repo)?;
        info!(auth_method = auth_method(&cli), repo = %repo, "GitHub client created");
        Some(sink)
    };

    let argocd = ArgoClient::new(client.clone(), &config.argocd);
    let reconciler = Reconciler::new(
        client.clone(),
        detector,
        calculator,
        CommentFormatter::new(),
        sink,
        argocd,
    );
    let watcher = XrWatcher::new(
        client,
        reconciler,
        WatcherConfig::new(cli.reconciliation_interval),
    );

    // Flip the shutdown signal on SIGINT/SIGTERM; the watcher drains and
    // releases the lease before returning.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    watcher.start(shutdown_rx).await?;
    info!("shutting down gracefully");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
