use capstan_core::InstanceState;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

const IMAGE_PULL_ERRORS: &[&str] = &["ErrImagePull", "ImagePullBackOff", "InvalidImageName"];
const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

fn waiting_reason(status: &ContainerStatus) -> Option<&str> {
    status.state.as_ref()?.waiting.as_ref()?.reason.as_deref()
}

fn is_terminated(status: &ContainerStatus) -> bool {
    status.state.as_ref().is_some_and(|s| s.terminated.is_some())
}

/// Instance state derived from pod phase and container statuses.
pub fn pod_state(pod: &Pod) -> InstanceState {
    let Some(status) = pod.status.as_ref() else {
        return InstanceState::Unknown;
    };
    let containers = status.container_statuses.as_deref().unwrap_or_default();
    if containers.is_empty() {
        return InstanceState::Unknown;
    }

    match status.phase.as_deref().unwrap_or("Unknown") {
        "Pending" => {
            if containers.iter().filter_map(waiting_reason).any(|r| IMAGE_PULL_ERRORS.contains(&r)) {
                InstanceState::Error
            } else {
                InstanceState::Unknown
            }
        }
        "Failed" => InstanceState::Error,
        "Succeeded" => InstanceState::Stopped,
        "Running" => {
            if containers.iter().all(|c| c.ready) {
                InstanceState::Running
            } else if containers.iter().any(|c| is_terminated(c) || waiting_reason(c) == Some(CRASH_LOOP_BACK_OFF)) {
                InstanceState::Crashed
            } else {
                InstanceState::Unknown
            }
        }
        _ => InstanceState::Unknown,
    }
}
