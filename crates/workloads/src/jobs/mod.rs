//! Tasks as jobs.

use capstan_core::{CapstanResult, Selector, SourceType, WorkloadIdentity};
use capstan_kubehub::JobClient;
use k8s_openapi::api::batch::v1::Job;

mod delete;
mod desire;
mod get;
mod mapping;

pub use delete::TaskDeleter;
pub use desire::TaskDesirer;
pub use get::TaskGetter;
pub use mapping::{job_to_task, JobMapper, TaskToJob};

/// Every job labelled with task `guid`. Callers decide what zero or many means.
pub(crate) async fn jobs_for(client: &dyn JobClient, namespace: Option<&str>, guid: &str) -> CapstanResult<Vec<Job>> {
    let selector = Selector::for_identity(&WorkloadIdentity::new(guid, ""), SourceType::Task);
    client.list(namespace, &selector).await.map_err(|e| e.context("failed to list jobs"))
}
