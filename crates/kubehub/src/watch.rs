//! Typed list+watch feeding a channel.

use anyhow::Result;
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::KubeObject;

#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
    /// Full relist after (re)connecting. Objects missing from it are gone.
    Restarted(Vec<K>),
}

impl<K> WatchEvent<K> {
    pub fn objects(&self) -> &[K] {
        match self {
            Self::Applied(o) | Self::Deleted(o) => std::slice::from_ref(o),
            Self::Restarted(list) => list,
        }
    }
}

/// Watch `api` (optionally narrowed by a label selector) and forward every
/// change into `tx`. Stream errors are logged and retried with backoff; the
/// function returns once the receiver is gone.
pub async fn watch<K: KubeObject>(api: Api<K>, labels: Option<String>, tx: mpsc::Sender<WatchEvent<K>>) -> Result<()> {
    let kind = K::kind(&()).to_string();
    let mut cfg = watcher::Config::default();
    if let Some(sel) = labels.as_deref() {
        cfg = cfg.labels(sel);
    }
    let stream = watcher::watcher(api, cfg).default_backoff();
    futures::pin_mut!(stream);
    info!(%kind, labels = ?labels, "watcher started");

    while let Some(item) = stream.next().await {
        let ev = match item {
            Ok(Event::Applied(o)) => WatchEvent::Applied(o),
            Ok(Event::Deleted(o)) => WatchEvent::Deleted(o),
            Ok(Event::Restarted(list)) => {
                debug!(%kind, count = list.len(), "watch restart");
                WatchEvent::Restarted(list)
            }
            Err(e) => {
                counter!("watch_errors_total", 1u64, "kind" => kind.clone());
                warn!(%kind, error = %e, "watch error");
                continue;
            }
        };
        if tx.send(ev).await.is_err() {
            info!(%kind, "watch receiver closed");
            return Ok(());
        }
    }
    Ok(())
}
