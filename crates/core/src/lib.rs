//! Capstan core types: workload model, naming, label codec and errors.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod labels;
pub mod naming;

pub use error::{CapstanError, CapstanResult, ResultExt};
pub use labels::{Selector, SourceType, WorkloadDescriptor};

/// Stable `{guid, version}` pair naming one desired workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadIdentity {
    pub guid: String,
    pub version: String,
}

impl WorkloadIdentity {
    pub fn new(guid: impl Into<String>, version: impl Into<String>) -> Self {
        Self { guid: guid.into(), version: version.into() }
    }

    /// `<guid>-<version>`, the process guid used by the platform.
    pub fn process_guid(&self) -> String { format!("{}-{}", self.guid, self.version) }
}

impl std::fmt::Display for WorkloadIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.guid, self.version)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Route {
    pub hostname: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub claim_name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PrivateRegistry {
    pub server: String,
    pub username: String,
    pub password: String,
}

/// Long-running process: a service that should keep `target_instances` copies running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lrp {
    pub identity: WorkloadIdentity,
    pub process_type: String,
    pub app_guid: String,
    pub app_name: String,
    pub space_guid: String,
    pub space_name: String,
    pub org_guid: String,
    pub org_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub target_instances: i32,
    /// Observed, filled by the getter from stateful set status.
    pub running_instances: i32,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub cpu_weight: u8,
    pub ports: Vec<i32>,
    pub routes: Vec<Route>,
    pub volume_mounts: Vec<VolumeMount>,
    pub private_registry: Option<PrivateRegistry>,
    pub last_updated: String,
    /// Opaque serialized original request, round-tripped verbatim.
    pub original_request: String,
    pub user_annotations: BTreeMap<String, String>,
}

/// One-shot workload. Never updated in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub identity: WorkloadIdentity,
    pub name: String,
    pub app_guid: String,
    pub app_name: String,
    pub space_guid: String,
    pub space_name: String,
    pub org_guid: String,
    pub org_name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub completion_callback: String,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub cpu_weight: u8,
    pub private_registry: Option<PrivateRegistry>,
}

impl Task {
    pub fn guid(&self) -> &str { &self.identity.guid }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    Running,
    Stopped,
    Error,
    Crashed,
    Unknown,
}

/// Placement error code reported for instances that cannot be scheduled for lack of memory.
pub const INSUFFICIENT_MEMORY_ERROR: &str = "Insufficient resources: memory";

/// Per-pod view computed at read time; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub index: u32,
    pub state: InstanceState,
    pub placement_error: Option<String>,
    /// Pod start time, unix nanoseconds (0 when not started).
    pub since: i64,
}

/// Body POSTed to a task's completion callback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_guid: String,
    pub failed: bool,
    pub failure_reason: String,
}

impl TaskCompletion {
    pub fn from_exit(task_guid: impl Into<String>, exit_code: i32, reason: Option<&str>) -> Self {
        let failed = exit_code != 0;
        Self {
            task_guid: task_guid.into(),
            failed,
            failure_reason: if failed { reason.unwrap_or_default().to_string() } else { String::new() },
        }
    }

    pub fn cancelled(task_guid: impl Into<String>) -> Self {
        Self { task_guid: task_guid.into(), failed: true, failure_reason: "task was cancelled".to_string() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_report_only_carries_reason_on_failure() {
        let ok = TaskCompletion::from_exit("g", 0, Some("Completed"));
        assert!(!ok.failed);
        assert_eq!(ok.failure_reason, "");

        let bad = TaskCompletion::from_exit("g", 42, Some("because"));
        assert!(bad.failed);
        assert_eq!(bad.failure_reason, "because");
    }

    #[test]
    fn completion_report_wire_shape() {
        let v = serde_json::to_value(TaskCompletion::from_exit("the-task-guid", 1, Some("Error"))).unwrap();
        assert_eq!(v, serde_json::json!({"task_guid": "the-task-guid", "failed": true, "failure_reason": "Error"}));
    }

    #[test]
    fn process_guid_joins_guid_and_version() {
        assert_eq!(WorkloadIdentity::new("g", "v").process_guid(), "g-v");
    }
}
