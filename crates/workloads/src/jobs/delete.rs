use std::sync::Arc;

use capstan_core::naming::task_registry_secret_prefix;
use capstan_core::{CapstanError, CapstanResult, WorkloadDescriptor};
use capstan_kubehub::{is_owned, JobClient, SecretClient};
use k8s_openapi::api::batch::v1::Job;
use kube::ResourceExt;
use tracing::{debug, error, info};

use super::jobs_for;

pub struct TaskDeleter {
    namespace: Option<String>,
    jobs: Arc<dyn JobClient>,
    secrets: Arc<dyn SecretClient>,
}

impl TaskDeleter {
    pub fn new(namespace: Option<String>, jobs: Arc<dyn JobClient>, secrets: Arc<dyn SecretClient>) -> Self {
        Self { namespace, jobs, secrets }
    }

    /// Delete the task's job and pull secrets, returning its completion
    /// callback (possibly empty). Owned jobs are left to garbage collection.
    pub async fn delete(&self, guid: &str) -> CapstanResult<String> {
        let mut jobs = jobs_for(self.jobs.as_ref(), self.namespace.as_deref(), guid).await?;
        let job = match jobs.len() {
            1 => jobs.remove(0),
            0 => return Err(CapstanError::not_found(format!("job with guid {guid} should have 1 instance, but it has: 0"))),
            n => {
                error!(%guid, instances = n, "job does not have exactly one instance");
                return Err(CapstanError::consistency(format!(
                    "job with guid {guid} should have 1 instance, but it has: {n}"
                )));
            }
        };

        let desc = WorkloadDescriptor::from_metadata(job.metadata.labels.as_ref(), job.metadata.annotations.as_ref())?;
        let callback = desc.completion_callback.clone();
        let namespace = job.namespace().unwrap_or_default();

        self.delete_registry_secrets(&job, &desc, &namespace).await?;

        if is_owned(&job.metadata) {
            debug!(%guid, "job is owned, leaving it to garbage collection");
            return Ok(callback);
        }
        match self.jobs.delete(&namespace, &job.name_any()).await {
            Err(e) if !e.is_not_found() => {
                error!(%guid, error = %e, "failed to delete job");
                Err(e.context("failed to delete job"))
            }
            _ => {
                info!(%guid, %namespace, "job deleted");
                Ok(callback)
            }
        }
    }

    async fn delete_registry_secrets(&self, job: &Job, desc: &WorkloadDescriptor, namespace: &str) -> CapstanResult<()> {
        let prefix = task_registry_secret_prefix(&desc.app_name, &desc.space_name, &desc.identity.guid)?;
        let names = job
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.image_pull_secrets.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|r| r.name.as_deref())
            .filter(|name| name.starts_with(&prefix));

        for name in names {
            match self.secrets.delete(namespace, name).await {
                Err(e) if !e.is_not_found() => {
                    error!(%namespace, %name, error = %e, "failed to delete secret");
                    return Err(e.context("failed to delete secret"));
                }
                _ => debug!(%namespace, %name, "registry secret deleted"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobMapper, TaskDesirer};
    use crate::with_owner_reference;
    use capstan_core::{PrivateRegistry, Task, WorkloadIdentity};
    use capstan_kubehub::testing::{FakeCluster, Op};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn task() -> Task {
        Task {
            identity: WorkloadIdentity::new("task-guid", ""),
            app_name: "app".into(),
            space_name: "space".into(),
            completion_callback: "http://cc/completed".into(),
            private_registry: Some(PrivateRegistry { server: "h".into(), username: "u".into(), password: "p".into() }),
            ..Default::default()
        }
    }

    async fn desired(cluster: &FakeCluster, owned: bool) {
        let d = TaskDesirer::new(cluster.jobs.clone(), cluster.secrets.clone(), Arc::new(JobMapper::default()));
        let owner = OwnerReference { kind: "Task".into(), name: "t".into(), uid: "u".into(), ..Default::default() };
        let own = with_owner_reference::<Job>(owner);
        let opts: Vec<&dyn crate::DesireOption<Job>> = if owned { vec![&own] } else { vec![] };
        d.desire("ns", &task(), &opts).await.unwrap();
    }

    fn deleter(cluster: &FakeCluster) -> TaskDeleter {
        TaskDeleter::new(None, cluster.jobs.clone(), cluster.secrets.clone())
    }

    #[tokio::test]
    async fn unowned_job_is_deleted_with_its_secret() {
        let cluster = FakeCluster::new();
        desired(&cluster, false).await;
        assert_eq!(deleter(&cluster).delete("task-guid").await.unwrap(), "http://cc/completed");
        assert!(cluster.jobs.is_empty());
        assert!(cluster.secrets.is_empty());
    }

    #[tokio::test]
    async fn owned_job_is_left_alone_but_callback_returned() {
        let cluster = FakeCluster::new();
        desired(&cluster, true).await;
        assert_eq!(deleter(&cluster).delete("task-guid").await.unwrap(), "http://cc/completed");
        assert_eq!(cluster.jobs.len(), 1);
        assert_eq!(cluster.jobs.count(Op::Delete), 0);
        assert!(cluster.secrets.is_empty());
    }

    #[tokio::test]
    async fn secret_failure_aborts_before_job_deletion() {
        let cluster = FakeCluster::new();
        desired(&cluster, false).await;
        cluster.secrets.fail_next(Op::Delete, CapstanError::transient("boom"));
        assert!(deleter(&cluster).delete("task-guid").await.unwrap_err().is_retryable());
        assert_eq!(cluster.jobs.len(), 1);
    }

    #[tokio::test]
    async fn requires_exactly_one_job() {
        let cluster = FakeCluster::new();
        assert!(deleter(&cluster).delete("task-guid").await.unwrap_err().is_not_found());

        desired(&cluster, false).await;
        let mut dup = cluster.jobs.objects()[0].clone();
        dup.metadata.name = Some("dup".into());
        cluster.jobs.insert(dup);
        assert!(matches!(deleter(&cluster).delete("task-guid").await, Err(CapstanError::Consistency(_))));
    }
}
