//! Task completion: once the task container of a task pod has terminated,
//! report the outcome to the task's callback and clean the job up.
//!
//! A pod whose task container has no terminated state is still pending and
//! is left alone. The job is only deleted after the callback accepted the
//! report, so a failed POST leaves everything in place for the next delivery.

use std::sync::Arc;

use async_trait::async_trait;
use capstan_core::labels::is_source;
use capstan_core::{CapstanResult, SourceType, TaskCompletion, WorkloadDescriptor};
use capstan_kubehub::PodClient;
use capstan_workloads::jobs::{TaskDeleter, TaskGetter};
use capstan_workloads::TASK_CONTAINER_NAME;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, Pod};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::callback::CallbackClient;
use crate::queue::Reconciler;
use crate::ObjectKey;

pub struct TaskCompletionReconciler {
    pods: Arc<dyn PodClient>,
    getter: Arc<TaskGetter>,
    deleter: Arc<TaskDeleter>,
    callbacks: CallbackClient,
}

impl TaskCompletionReconciler {
    pub fn new(
        pods: Arc<dyn PodClient>,
        getter: Arc<TaskGetter>,
        deleter: Arc<TaskDeleter>,
        callbacks: CallbackClient,
    ) -> Self {
        Self { pods, getter, deleter, callbacks }
    }

    async fn report(&self, guid: &str, url: &str, completion: &TaskCompletion) -> CapstanResult<()> {
        if url.is_empty() {
            debug!(%guid, "task has no completion callback");
            return Ok(());
        }
        match self.callbacks.post_json(url, completion).await {
            Ok(()) => {
                counter!("task_callbacks_total", 1u64, "result" => "ok");
                Ok(())
            }
            Err(e) => {
                counter!("task_callbacks_total", 1u64, "result" => e.kind());
                Err(e.context(format!("failed to report completion of task {guid}")))
            }
        }
    }
}

/// Terminated state of the container called `name`, if it has one.
fn terminated<'a>(pod: &'a Pod, name: &str) -> Option<&'a ContainerStateTerminated> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == name)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
}

#[async_trait]
impl Reconciler<ObjectKey> for TaskCompletionReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> CapstanResult<()> {
        let pod = match self.pods.get(&key.namespace, &key.name).await {
            Ok(pod) => pod,
            Err(e) if e.is_not_found() => {
                debug!(%key, "task pod no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.context(format!("failed to get pod {key}"))),
        };
        if !is_source(pod.metadata.labels.as_ref(), SourceType::Task) {
            return Ok(());
        }

        let desc = WorkloadDescriptor::from_metadata(pod.metadata.labels.as_ref(), pod.metadata.annotations.as_ref())?;
        let container = if desc.container_name.is_empty() { TASK_CONTAINER_NAME } else { desc.container_name.as_str() };
        let Some(state) = terminated(&pod, container) else {
            debug!(%key, %container, "task container has not terminated");
            return Ok(());
        };

        let guid = desc.identity.guid.as_str();
        match self.getter.get(guid).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(%guid, "task job already cleaned up");
                return Ok(());
            }
            Err(e) => return Err(e.context(format!("failed to get job for task {guid}"))),
        }

        let completion = TaskCompletion::from_exit(guid, state.exit_code, state.reason.as_deref());
        self.report(guid, &desc.completion_callback, &completion).await?;
        info!(%guid, failed = completion.failed, exit_code = state.exit_code, "task completed");

        match self.deleter.delete(guid).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                warn!(%guid, "task job disappeared before cleanup");
                Ok(())
            }
            Err(e) => Err(e.context(format!("failed to delete task {guid}"))),
        }
    }
}
