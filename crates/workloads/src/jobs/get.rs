use std::sync::Arc;

use capstan_core::{CapstanError, CapstanResult, Selector, SourceType, Task};
use capstan_kubehub::JobClient;
use kube::ResourceExt;
use tracing::warn;

use super::jobs_for;
use super::mapping::job_to_task;

pub struct TaskGetter {
    namespace: Option<String>,
    jobs: Arc<dyn JobClient>,
}

impl TaskGetter {
    pub fn new(namespace: Option<String>, jobs: Arc<dyn JobClient>) -> Self { Self { namespace, jobs } }

    pub async fn get(&self, guid: &str) -> CapstanResult<Task> {
        let mut jobs = jobs_for(self.jobs.as_ref(), self.namespace.as_deref(), guid).await?;
        match jobs.len() {
            0 => Err(CapstanError::not_found(format!("no job for task {guid}"))),
            1 => job_to_task(&jobs.remove(0)),
            n => Err(CapstanError::consistency(format!("multiple jobs ({n}) found for task {guid}"))),
        }
    }

    pub async fn list(&self) -> CapstanResult<Vec<Task>> {
        let jobs = self
            .jobs
            .list(self.namespace.as_deref(), &Selector::source_type(SourceType::Task))
            .await
            .map_err(|e| e.context("failed to list jobs"))?;
        Ok(jobs
            .iter()
            .filter_map(|job| {
                job_to_task(job).map_err(|e| warn!(name = %job.name_any(), error = %e, "skipping unmappable job")).ok()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobMapper, TaskToJob};
    use capstan_core::WorkloadIdentity;
    use capstan_kubehub::testing::FakeCluster;

    fn seed(cluster: &FakeCluster, guid: &str, name: Option<&str>) {
        let task = Task { identity: WorkloadIdentity::new(guid, ""), app_name: "a".into(), ..Default::default() };
        let mut job = JobMapper::default().to_job(&task).unwrap();
        if let Some(name) = name {
            job.metadata.name = Some(name.into());
        }
        cluster.jobs.insert(job);
    }

    #[tokio::test]
    async fn get_requires_exactly_one_job() {
        let cluster = FakeCluster::new();
        let getter = TaskGetter::new(None, cluster.jobs.clone());
        assert!(getter.get("t1").await.unwrap_err().is_not_found());

        seed(&cluster, "t1", None);
        assert_eq!(getter.get("t1").await.unwrap().guid(), "t1");

        seed(&cluster, "t1", Some("dup"));
        assert!(matches!(getter.get("t1").await, Err(CapstanError::Consistency(_))));
    }

    #[tokio::test]
    async fn list_returns_every_task() {
        let cluster = FakeCluster::new();
        seed(&cluster, "t1", None);
        seed(&cluster, "t2", None);
        let mut guids: Vec<_> =
            TaskGetter::new(None, cluster.jobs.clone()).list().await.unwrap().into_iter().map(|t| t.identity.guid).collect();
        guids.sort();
        assert_eq!(guids, vec!["t1", "t2"]);
    }
}
