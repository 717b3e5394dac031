use capstan_core::naming::{job_name, task_registry_secret_name};
use capstan_core::{CapstanResult, Task, WorkloadDescriptor};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec, SecurityContext};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{env_map, env_vars, resources, resources_back, MappingConfig, TASK_CONTAINER_NAME};

pub trait TaskToJob: Send + Sync {
    fn to_job(&self, task: &Task) -> CapstanResult<Job>;
}

impl<F> TaskToJob for F
where
    F: Fn(&Task) -> CapstanResult<Job> + Send + Sync,
{
    fn to_job(&self, task: &Task) -> CapstanResult<Job> { self(task) }
}

#[derive(Debug, Clone, Default)]
pub struct JobMapper {
    config: MappingConfig,
}

impl JobMapper {
    pub fn new(config: MappingConfig) -> Self { Self { config } }
}

impl TaskToJob for JobMapper {
    fn to_job(&self, task: &Task) -> CapstanResult<Job> {
        let name = job_name(task)?;
        let desc = WorkloadDescriptor::for_task(task, TASK_CONTAINER_NAME);
        let labels = desc.labels();
        let annotations = desc.annotations()?;
        let private_secret = match task.private_registry {
            Some(_) => Some(task_registry_secret_name(task)?),
            None => None,
        };

        let container = Container {
            name: TASK_CONTAINER_NAME.to_string(),
            image: Some(task.image.clone()),
            command: (!task.command.is_empty()).then(|| task.command.clone()),
            env: env_vars(&task.env),
            resources: Some(resources(task.memory_mb, task.disk_mb, task.cpu_weight)),
            security_context: Some(SecurityContext { run_as_non_root: Some(true), ..Default::default() }),
            ..Default::default()
        };

        Ok(Job {
            metadata: ObjectMeta {
                name: Some(name),
                labels: Some(labels.clone()),
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        restart_policy: Some("Never".to_string()),
                        image_pull_secrets: self.config.pull_secrets(private_secret),
                        service_account_name: self.config.service_account(),
                        automount_service_account_token: Some(self.config.allow_automount_service_account_token),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        })
    }
}

/// Task as recorded on its job. Registry credentials are not read back.
pub fn job_to_task(job: &Job) -> CapstanResult<Task> {
    let desc = WorkloadDescriptor::from_metadata(job.metadata.labels.as_ref(), job.metadata.annotations.as_ref())?;
    let container_name = if desc.container_name.is_empty() { TASK_CONTAINER_NAME } else { desc.container_name.as_str() };
    let container = job
        .spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|p| p.containers.iter().find(|c| c.name == container_name));
    let (memory_mb, disk_mb, cpu_weight) = resources_back(container.and_then(|c| c.resources.as_ref()));

    Ok(Task {
        identity: desc.identity,
        name: desc.task_name,
        app_guid: desc.app_guid,
        app_name: desc.app_name,
        space_guid: desc.space_guid,
        space_name: desc.space_name,
        org_guid: desc.org_guid,
        org_name: desc.org_name,
        image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
        command: container.and_then(|c| c.command.clone()).unwrap_or_default(),
        env: container.map(env_map).unwrap_or_default(),
        completion_callback: desc.completion_callback,
        memory_mb,
        disk_mb,
        cpu_weight,
        private_registry: None,
    })
}
