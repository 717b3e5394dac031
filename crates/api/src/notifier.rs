use capstan_core::TaskCompletion;
use capstan_reconcile::CallbackClient;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
struct Cancellation {
    url: String,
    guid: String,
}

/// Background sender of "task was cancelled" callbacks.
///
/// The queue is bounded; when it is full the notification is dropped and
/// logged. Delivery failures are logged and never reach the canceller.
#[derive(Debug, Clone)]
pub struct CancellationNotifier {
    tx: mpsc::Sender<Cancellation>,
}

impl CancellationNotifier {
    /// Start the sender task. It exits once every notifier handle is dropped.
    pub fn spawn(client: CallbackClient, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Cancellation>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let body = TaskCompletion::cancelled(&job.guid);
                match client.post_json(&job.url, &body).await {
                    Ok(()) => {
                        counter!("task_callbacks_total", 1u64, "result" => "cancelled");
                        debug!(guid = %job.guid, "cancellation delivered");
                    }
                    Err(e) => {
                        counter!("task_callbacks_total", 1u64, "result" => e.kind());
                        warn!(guid = %job.guid, url = %job.url, error = %e, "failed to deliver cancellation");
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn notify(&self, url: impl Into<String>, guid: impl Into<String>) {
        let job = Cancellation { url: url.into(), guid: guid.into() };
        if let Err(e) = self.tx.try_send(job) {
            let job = match e {
                mpsc::error::TrySendError::Full(job) | mpsc::error::TrySendError::Closed(job) => job,
            };
            warn!(guid = %job.guid, "cancellation queue unavailable, dropping notification");
        }
    }
}
