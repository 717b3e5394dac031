//! `LRP` and `Task` custom resources (`workloads.capstan.dev/v1`).

use std::collections::BTreeMap;

use capstan_core::{CapstanError, CapstanResult, Lrp, PrivateRegistry, Route, Task, VolumeMount, WorkloadIdentity};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "workloads.capstan.dev", version = "v1", kind = "LRP", root = "LrpResource", plural = "lrps")]
#[kube(shortname = "lrp", namespaced)]
#[serde(rename_all = "camelCase", default)]
pub struct LrpSpec {
    #[serde(rename = "GUID")]
    pub guid: String,
    pub version: String,
    pub process_type: String,
    #[serde(rename = "appGUID")]
    pub app_guid: String,
    pub app_name: String,
    #[serde(rename = "spaceGUID")]
    pub space_guid: String,
    pub space_name: String,
    #[serde(rename = "orgGUID")]
    pub org_guid: String,
    pub org_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub instances: i32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: i64,
    #[serde(rename = "diskMB")]
    pub disk_mb: i64,
    pub cpu_weight: u8,
    pub ports: Vec<i32>,
    pub app_routes: Vec<Route>,
    pub volume_mounts: Vec<VolumeMount>,
    pub private_registry: Option<PrivateRegistry>,
    pub last_updated: String,
    pub user_defined_annotations: BTreeMap<String, String>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "workloads.capstan.dev", version = "v1", kind = "Task", root = "TaskResource", plural = "tasks")]
#[kube(shortname = "tsk", namespaced)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskSpec {
    #[serde(rename = "GUID")]
    pub guid: String,
    pub name: String,
    #[serde(rename = "appGUID")]
    pub app_guid: String,
    pub app_name: String,
    #[serde(rename = "spaceGUID")]
    pub space_guid: String,
    pub space_name: String,
    #[serde(rename = "orgGUID")]
    pub org_guid: String,
    pub org_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub completion_callback: String,
    #[serde(rename = "memoryMB")]
    pub memory_mb: i64,
    #[serde(rename = "diskMB")]
    pub disk_mb: i64,
    pub cpu_weight: u8,
    pub private_registry: Option<PrivateRegistry>,
}

/// Controller owner reference for a custom resource read back from the API
/// server. Fails for objects that were never persisted.
fn controller_ref<K>(obj: &K) -> CapstanResult<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    obj.controller_owner_ref(&()).ok_or_else(|| {
        CapstanError::validation(format!("{} {:?} has no name or uid", K::kind(&()), obj.meta().name))
    })
}

impl LrpResource {
    pub fn to_lrp(&self) -> Lrp {
        let s = &self.spec;
        Lrp {
            identity: WorkloadIdentity::new(&s.guid, &s.version),
            process_type: s.process_type.clone(),
            app_guid: s.app_guid.clone(),
            app_name: s.app_name.clone(),
            space_guid: s.space_guid.clone(),
            space_name: s.space_name.clone(),
            org_guid: s.org_guid.clone(),
            org_name: s.org_name.clone(),
            image: s.image.clone(),
            command: s.command.clone(),
            env: s.env.clone(),
            target_instances: s.instances,
            running_instances: 0,
            memory_mb: s.memory_mb,
            disk_mb: s.disk_mb,
            cpu_weight: s.cpu_weight,
            ports: s.ports.clone(),
            routes: s.app_routes.clone(),
            volume_mounts: s.volume_mounts.clone(),
            private_registry: s.private_registry.clone(),
            last_updated: s.last_updated.clone(),
            original_request: String::new(),
            user_annotations: s.user_defined_annotations.clone(),
        }
    }

    pub fn owner_reference(&self) -> CapstanResult<OwnerReference> { controller_ref(self) }
}

impl TaskResource {
    pub fn to_task(&self) -> Task {
        let s = &self.spec;
        Task {
            identity: WorkloadIdentity::new(&s.guid, ""),
            name: s.name.clone(),
            app_guid: s.app_guid.clone(),
            app_name: s.app_name.clone(),
            space_guid: s.space_guid.clone(),
            space_name: s.space_name.clone(),
            org_guid: s.org_guid.clone(),
            org_name: s.org_name.clone(),
            image: s.image.clone(),
            command: s.command.clone(),
            env: s.env.clone(),
            completion_callback: s.completion_callback.clone(),
            memory_mb: s.memory_mb,
            disk_mb: s.disk_mb,
            cpu_weight: s.cpu_weight,
            private_registry: s.private_registry.clone(),
        }
    }

    pub fn owner_reference(&self) -> CapstanResult<OwnerReference> { controller_ref(self) }
}
