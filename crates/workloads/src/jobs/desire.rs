use std::sync::Arc;

use capstan_core::naming::task_registry_secret_name;
use capstan_core::{CapstanResult, Task, WorkloadDescriptor};
use capstan_kubehub::{JobClient, SecretClient};
use k8s_openapi::api::batch::v1::Job;
use metrics::counter;
use tracing::{debug, info};

use super::mapping::TaskToJob;
use crate::options::{apply_options, DesireOption};
use crate::registry::pull_secret;
use crate::TASK_CONTAINER_NAME;

pub struct TaskDesirer {
    jobs: Arc<dyn JobClient>,
    secrets: Arc<dyn SecretClient>,
    mapper: Arc<dyn TaskToJob>,
}

impl TaskDesirer {
    pub fn new(jobs: Arc<dyn JobClient>, secrets: Arc<dyn SecretClient>, mapper: Arc<dyn TaskToJob>) -> Self {
        Self { jobs, secrets, mapper }
    }

    pub async fn desire(&self, namespace: &str, task: &Task, opts: &[&dyn DesireOption<Job>]) -> CapstanResult<()> {
        let result = self.desire_inner(namespace, task, opts).await;
        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.kind(),
        };
        counter!("desire_total", 1u64, "kind" => "task", "result" => outcome);
        result
    }

    async fn desire_inner(&self, namespace: &str, task: &Task, opts: &[&dyn DesireOption<Job>]) -> CapstanResult<()> {
        let mut job = self.mapper.to_job(task)?;
        job.metadata.namespace = Some(namespace.to_string());
        apply_options(&mut job, opts)?;

        if let Some(registry) = &task.private_registry {
            let labels = WorkloadDescriptor::for_task(task, TASK_CONTAINER_NAME).labels();
            let secret = pull_secret(&task_registry_secret_name(task)?, labels, registry)?;
            match self.secrets.create(namespace, &secret).await {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => debug!(guid = %task.guid(), "task registry secret already exists"),
                Err(e) => return Err(e.context("failed to create private registry secret for job")),
            }
        }

        match self.jobs.create(namespace, &job).await {
            Ok(created) => {
                info!(guid = %task.guid(), %namespace, name = ?created.metadata.name, "job created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(guid = %task.guid(), %namespace, "job already exists");
                Ok(())
            }
            Err(e) => Err(e.context("failed to create job")),
        }
    }
}
