//! Leader election over a coordination.k8s.io Lease.
//!
//! Single active writer: replicas race for the named lease, the holder
//! renews it well inside the lease duration, and a crashed holder is taken
//! over once its renew time is older than the lease duration.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::{
    api::{Api, PostParams},
    Client,
};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "crossplane-plan-leader";

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_period: Duration,
    pub retry_period: Duration,
}

impl LeaseConfig {
    /// Identity comes from the downward API; sensible defaults keep local
    /// runs working.
    pub fn from_env() -> Self {
        let identity = std::env::var("POD_NAME").unwrap_or_else(|_| {
            info!("POD_NAME not set, using default identity");
            "crossplane-plan-unknown".to_string()
        });
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            info!("POD_NAMESPACE not set, using default namespace");
            "crossplane-system".to_string()
        });
        Self {
            name: LEASE_NAME.to_string(),
            namespace,
            identity,
            lease_duration: Duration::from_secs(15),
            renew_period: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

pub struct LeaderElector {
    api: Api<Lease>,
    cfg: LeaseConfig,
}

impl LeaderElector {
    pub fn new(client: Client, cfg: LeaseConfig) -> Self {
        let api = Api::namespaced(client, &cfg.namespace);
        Self { api, cfg }
    }

    /// Block until this replica holds the lease. Returns false when the
    /// shutdown signal fires first.
    pub async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> Result<bool> {
        loop {
            if *shutdown.borrow() {
                return Ok(false);
            }
            match self.try_acquire().await {
                Ok(true) => {
                    info!(lease = %self.cfg.name, identity = %self.cfg.identity, "acquired leadership");
                    return Ok(true);
                }
                Ok(false) => debug!(lease = %self.cfg.name, "lease held elsewhere, retrying"),
                Err(e) => warn!(error = %e, "lease acquisition attempt failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.cfg.retry_period) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn try_acquire(&self) -> Result<bool> {
        match self.api.get_opt(&self.cfg.name).await? {
            None => match self.api.create(&PostParams::default(), &self.fresh_lease(1)).await {
                Ok(_) => Ok(true),
                // Another replica won the create race.
                Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                Err(e) => Err(e).context("creating lease"),
            },
            Some(current) => {
                let spec = current.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.as_deref().unwrap_or("");
                if holder == self.cfg.identity {
                    return self.renew().await;
                }
                let expired = match &spec.renew_time {
                    Some(t) => {
                        Utc::now().signed_duration_since(t.0)
                            > chrono::Duration::from_std(self.cfg.lease_duration)?
                    }
                    None => true,
                };
                if !expired {
                    return Ok(false);
                }

                info!(previous = holder, "taking over expired lease");
                let transitions = spec.lease_transitions.unwrap_or(0) + 1;
                let mut lease = current;
                lease.spec = Some(self.desired_spec(transitions));
                match self.api.replace(&self.cfg.name, &PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e).context("taking over lease"),
                }
            }
        }
    }

    /// One renew cycle: refresh renewTime if we still hold the lease.
    /// Returns false when leadership is gone. Transient API errors retry a
    /// couple of times inside the lease window before giving up.
    pub async fn renew(&self) -> Result<bool> {
        let mut last_err = None;
        for _ in 0..2 {
            match self.renew_once().await {
                Ok(held) => return Ok(held),
                Err(e) => {
                    warn!(error = %e, "lease renew attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(self.cfg.retry_period).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("lease renew failed")))
    }

    async fn renew_once(&self) -> Result<bool> {
        let Some(current) = self.api.get_opt(&self.cfg.name).await? else {
            return Ok(false);
        };
        let spec = current.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() != Some(self.cfg.identity.as_str()) {
            return Ok(false);
        }
        let mut lease = current;
        let mut spec = spec;
        spec.renew_time = Some(MicroTime(Utc::now()));
        lease.spec = Some(spec);
        self.api
            .replace(&self.cfg.name, &PostParams::default(), &lease)
            .await
            .context("renewing lease")?;
        Ok(true)
    }

    /// Clear our holder identity so a successor can take over immediately.
    /// Best effort, called on shutdown.
    pub async fn release(&self) {
        let result = async {
            let Some(current) = self.api.get_opt(&self.cfg.name).await? else {
                return Ok::<_, anyhow::Error>(());
            };
            let spec = current.spec.clone().unwrap_or_default();
            if spec.holder_identity.as_deref() != Some(self.cfg.identity.as_str()) {
                return Ok(());
            }
            let mut lease = current;
            let mut spec = spec;
            spec.holder_identity = None;
            spec.renew_time = None;
            lease.spec = Some(spec);
            self.api.replace(&self.cfg.name, &PostParams::default(), &lease).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => info!(lease = %self.cfg.name, "released leadership"),
            Err(e) => warn!(error = %e, "failed to release lease"),
        }
    }

    fn fresh_lease(&self, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.cfg.name.clone()),
                namespace: Some(self.cfg.namespace.clone()),
                ..Default::default()
            },
            spec: Some(self.desired_spec(transitions)),
        }
    }

    fn desired_spec(&self, transitions: i32) -> LeaseSpec {
        let now = MicroTime(Utc::now());
        LeaseSpec {
            holder_identity: Some(self.cfg.identity.clone()),
            lease_duration_seconds: Some(self.cfg.lease_duration.as_secs() as i32),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }
}
