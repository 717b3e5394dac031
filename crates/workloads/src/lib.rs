//! Capstan workloads: LRPs become stateful sets, tasks become jobs.
//!
//! Every component here is built from the narrow capability traits in
//! `capstan_kubehub` and holds no state of its own.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, LocalObjectReference, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

pub mod jobs;
pub mod options;
pub mod registry;
pub mod stset;

pub use options::{apply_options, with_label, with_owner_reference, DesireOption};

/// Name of the application container in LRP pods.
pub const APP_CONTAINER_NAME: &str = "opi";
/// Name of the task container in task pods.
pub const TASK_CONTAINER_NAME: &str = "opi-task";

/// Pod-level settings shared by the stateful set and job mappers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingConfig {
    pub application_service_account: String,
    /// Extra pull secret added to every workload pod, if non-empty.
    pub registry_secret_name: String,
    pub allow_automount_service_account_token: bool,
}

impl MappingConfig {
    pub(crate) fn service_account(&self) -> Option<String> {
        (!self.application_service_account.is_empty()).then(|| self.application_service_account.clone())
    }

    pub(crate) fn pull_secrets(&self, private: Option<String>) -> Option<Vec<LocalObjectReference>> {
        let refs: Vec<_> = [(!self.registry_secret_name.is_empty()).then(|| self.registry_secret_name.clone()), private]
            .into_iter()
            .flatten()
            .map(|name| LocalObjectReference { name: Some(name) })
            .collect();
        (!refs.is_empty()).then_some(refs)
    }
}

pub(crate) fn env_vars(env: &BTreeMap<String, String>) -> Option<Vec<EnvVar>> {
    if env.is_empty() {
        return None;
    }
    Some(env.iter().map(|(k, v)| EnvVar { name: k.clone(), value: Some(v.clone()), ..Default::default() }).collect())
}

/// Plain `name=value` variables; `valueFrom` entries are not ours and are skipped.
pub(crate) fn env_map(container: &Container) -> BTreeMap<String, String> {
    container
        .env
        .iter()
        .flatten()
        .filter(|e| e.value_from.is_none())
        .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
        .collect()
}

pub(crate) fn resources(memory_mb: i64, disk_mb: i64, cpu_weight: u8) -> ResourceRequirements {
    let memory = Quantity(format!("{memory_mb}M"));
    let mut limits = BTreeMap::from([("memory".to_string(), memory.clone())]);
    if disk_mb > 0 {
        limits.insert("ephemeral-storage".to_string(), Quantity(format!("{disk_mb}M")));
    }
    let requests = BTreeMap::from([
        ("memory".to_string(), memory),
        ("cpu".to_string(), Quantity(format!("{}m", u32::from(cpu_weight) * 10))),
    ]);
    ResourceRequirements { limits: Some(limits), requests: Some(requests), ..Default::default() }
}

type QuantityMap = BTreeMap<String, Quantity>;

fn quantity_value(
    resources: Option<&ResourceRequirements>,
    which: fn(&ResourceRequirements) -> Option<&QuantityMap>,
    key: &str,
    suffix: char,
) -> i64 {
    resources
        .and_then(which)
        .and_then(|m| m.get(key))
        .and_then(|q| q.0.strip_suffix(suffix))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// `(memory_mb, disk_mb, cpu_weight)` read back from what [`resources`] wrote.
pub(crate) fn resources_back(r: Option<&ResourceRequirements>) -> (i64, i64, u8) {
    let memory = quantity_value(r, |r| r.limits.as_ref(), "memory", 'M');
    let disk = quantity_value(r, |r| r.limits.as_ref(), "ephemeral-storage", 'M');
    let millis = quantity_value(r, |r| r.requests.as_ref(), "cpu", 'm');
    (memory, disk, u8::try_from(millis / 10).unwrap_or(u8::MAX))
}
