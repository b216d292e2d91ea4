//! Long-running watch loop for one composite kind.

use futures::TryStreamExt;
use kube::{
    api::{Api, DynamicObject},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::discovery::CompositeKind;

/// Backoff before reopening a failed watch stream.
const WATCH_BACKOFF: Duration = Duration::from_secs(5);

pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Watch one kind until shutdown. Stream failures reopen after a fixed
/// backoff; malformed objects are logged and skipped.
pub async fn watch_composite_kind(
    client: Client,
    kind: CompositeKind,
    handler: EventHandler,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(gvk = %kind, "watching composite kind");
    let api: Api<DynamicObject> = Api::all_with(client, &kind.api_resource());

    loop {
        if *shutdown.borrow() {
            return;
        }

        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);

        let failed = loop {
            tokio::select! {
                maybe_ev = stream.try_next() => match maybe_ev {
                    Ok(Some(Event::Applied(obj))) => dispatch(&kind, &obj, &handler, "applied"),
                    Ok(Some(Event::Deleted(obj))) => dispatch(&kind, &obj, &handler, "deleted"),
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(gvk = %kind, count = list.len(), "watch restarted");
                        for obj in &list {
                            dispatch(&kind, obj, &handler, "restarted");
                        }
                    }
                    Ok(None) => {
                        warn!(gvk = %kind, "watch stream ended");
                        break true;
                    }
                    Err(e) => {
                        warn!(gvk = %kind, error = %e, "watch failed, retrying in 5s");
                        counter!("watch_errors_total", 1u64);
                        break true;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        };

        if failed {
            tokio::select! {
                _ = tokio::time::sleep(WATCH_BACKOFF) => {}
                _ = shutdown.changed() => {}
            }
            counter!("watch_restarts_total", 1u64);
        }
    }
}

fn dispatch(kind: &CompositeKind, obj: &DynamicObject, handler: &EventHandler, event: &str) {
    counter!("watch_events_total", 1u64);
    match serde_json::to_value(obj) {
        Ok(raw) => {
            debug!(gvk = %kind, event, name = %xplan_core::meta::name(&raw), "watch event");
            handler(raw);
        }
        Err(e) => warn!(gvk = %kind, error = %e, "unexpected object shape, skipping event"),
    }
}
