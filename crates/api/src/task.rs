use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use capstan_core::Task;
use capstan_workloads::jobs::{TaskDeleter, TaskDesirer, TaskGetter};
use tracing::info;

use crate::notifier::CancellationNotifier;
use crate::{ApiResult, TaskApi};

/// In-process implementation backed by jobs.
pub struct TaskService {
    desirer: Arc<TaskDesirer>,
    getter: Arc<TaskGetter>,
    deleter: Arc<TaskDeleter>,
    notifier: CancellationNotifier,
}

impl TaskService {
    pub fn new(
        desirer: Arc<TaskDesirer>,
        getter: Arc<TaskGetter>,
        deleter: Arc<TaskDeleter>,
        notifier: CancellationNotifier,
    ) -> Self {
        Self { desirer, getter, deleter, notifier }
    }
}

#[async_trait]
impl TaskApi for TaskService {
    async fn transfer(&self, namespace: &str, task: &Task) -> ApiResult<()> {
        let t0 = Instant::now();
        self.desirer.desire(namespace, task, &[]).await?;
        info!(guid = %task.guid(), %namespace, took_ms = %t0.elapsed().as_millis(), "api: task transfer ok");
        Ok(())
    }

    async fn get(&self, guid: &str) -> ApiResult<Task> { Ok(self.getter.get(guid).await?) }

    async fn list(&self) -> ApiResult<Vec<Task>> { Ok(self.getter.list().await?) }

    async fn cancel(&self, guid: &str) -> ApiResult<()> {
        let callback = self.deleter.delete(guid).await?;
        if !callback.is_empty() {
            self.notifier.notify(callback, guid);
        }
        info!(%guid, "api: task cancel ok");
        Ok(())
    }
}
