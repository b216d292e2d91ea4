//! Per-PR debounced work queue.
//!
//! Watch events arrive in bursts (one per touched XR); the queue coalesces
//! everything for one PR into a single reconcile that runs once the debounce
//! window goes quiet. Distinct PRs are independent and may fire in parallel.

#![forbid(unsafe_code)]

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use xplan_core::PrNumber;

/// Callback invoked once per debounce window for a PR. Implementations must
/// tolerate the PR's XR set having changed arbitrarily since enqueue.
#[async_trait]
pub trait PrProcessor: Send + Sync {
    async fn process_pr(&self, pr: PrNumber) -> Result<()>;
}

struct PendingPr {
    last_event_at: Instant,
    timer: JoinHandle<()>,
}

struct Inner {
    pending: Mutex<HashMap<PrNumber, PendingPr>>,
    processor: Arc<dyn PrProcessor>,
    debounce: Duration,
}

pub struct PrWorkQueue {
    inner: Arc<Inner>,
}

impl PrWorkQueue {
    pub fn new(processor: Arc<dyn PrProcessor>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                processor,
                debounce,
            }),
        }
    }

    /// Add or refresh a PR. An existing entry has its debounce timer reset;
    /// a new entry starts one.
    pub fn enqueue(&self, pr: PrNumber) {
        let mut pending = self.inner.pending.lock().unwrap();
        match pending.get_mut(&pr) {
            Some(work) => {
                work.timer.abort();
                work.timer = Inner::start_timer(self.inner.clone(), pr);
                work.last_event_at = Instant::now();
                debug!(pr, "reset debounce timer");
            }
            None => {
                pending.insert(
                    pr,
                    PendingPr {
                        last_event_at: Instant::now(),
                        timer: Inner::start_timer(self.inner.clone(), pr),
                    },
                );
                debug!(pr, debounce_ms = self.inner.debounce.as_millis() as u64, "enqueued PR");
            }
        }
    }

    /// Cancel all pending timers and clear the table. Entries already past
    /// their timer may still finish an in-flight processor call.
    pub fn shutdown(&self) {
        let mut pending = self.inner.pending.lock().unwrap();
        for (pr, work) in pending.drain() {
            work.timer.abort();
            info!(pr, "cancelled pending work");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

impl Inner {
    fn start_timer(inner: Arc<Inner>, pr: PrNumber) -> JoinHandle<()> {
        let debounce = inner.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            // Detach the actual processing so an enqueue that lands right
            // after the sleep cannot abort a running processor.
            tokio::spawn(Inner::fire(inner, pr));
        })
    }

    async fn fire(inner: Arc<Inner>, pr: PrNumber) {
        let work = inner.pending.lock().unwrap().remove(&pr);
        let Some(work) = work else { return };

        info!(
            pr,
            last_event_age_ms = work.last_event_at.elapsed().as_millis() as u64,
            "processing PR after debounce"
        );
        if let Err(e) = inner.processor.process_pr(pr).await {
            // Dropped, not re-queued: the periodic resync picks up stragglers.
            warn!(pr, error = %e, "failed to process PR");
        }
    }
}

impl Drop for PrWorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
