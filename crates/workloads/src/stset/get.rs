use std::sync::Arc;

use capstan_core::naming::parse_pod_index;
use capstan_core::{
    CapstanResult, Instance, InstanceState, Lrp, Selector, SourceType, WorkloadIdentity, INSUFFICIENT_MEMORY_ERROR,
};
use capstan_kubehub::{EventClient, EventFilter, PodClient, StatefulSetClient};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::ResourceExt;
use tracing::{error, warn};

use super::mapping::statefulset_to_lrp;
use super::pod_state::pod_state;
use super::find_statefulset;

const EVENT_KILLING: &str = "Killing";
const EVENT_FAILED_SCHEDULING: &str = "FailedScheduling";
const EVENT_FAILED_SCALE_UP: &str = "NotTriggerScaleUp";

pub struct LrpGetter {
    namespace: Option<String>,
    statefulsets: Arc<dyn StatefulSetClient>,
    pods: Arc<dyn PodClient>,
    events: Arc<dyn EventClient>,
}

impl LrpGetter {
    /// `namespace = None` searches every namespace.
    pub fn new(
        namespace: Option<String>,
        statefulsets: Arc<dyn StatefulSetClient>,
        pods: Arc<dyn PodClient>,
        events: Arc<dyn EventClient>,
    ) -> Self {
        Self { namespace, statefulsets, pods, events }
    }

    pub async fn get(&self, id: &WorkloadIdentity) -> CapstanResult<Lrp> {
        let sts = find_statefulset(self.statefulsets.as_ref(), self.namespace.as_deref(), id).await?;
        statefulset_to_lrp(&sts).map_err(|e| {
            error!(guid = %id.guid, version = %id.version, error = %e, "failed to map statefulset to lrp");
            e
        })
    }

    pub async fn list(&self) -> CapstanResult<Vec<Lrp>> {
        let all = self
            .statefulsets
            .list(self.namespace.as_deref(), &Selector::source_type(SourceType::App))
            .await
            .map_err(|e| e.context("failed to list statefulsets"))?;
        let mut out = Vec::with_capacity(all.len());
        for sts in &all {
            match statefulset_to_lrp(sts) {
                Ok(lrp) => out.push(lrp),
                Err(e) => warn!(name = %sts.name_any(), error = %e, "skipping unmappable statefulset"),
            }
        }
        Ok(out)
    }

    /// Current instances of `id`. Pods being killed are left out; pods that
    /// cannot be scheduled for lack of memory are reported as errors.
    pub async fn get_instances(&self, id: &WorkloadIdentity) -> CapstanResult<Vec<Instance>> {
        let sts = find_statefulset(self.statefulsets.as_ref(), self.namespace.as_deref(), id).await?;
        let namespace = sts.namespace().unwrap_or_default();

        let pods = self
            .pods
            .list(Some(&namespace), &Selector::for_identity(id, SourceType::App))
            .await
            .map_err(|e| e.context("failed to list pods"))?;

        let mut instances = Vec::with_capacity(pods.len());
        for pod in &pods {
            let pod_name = pod.name_any();
            let events = self
                .events
                .list(&namespace, &EventFilter::involving("Pod", &pod_name))
                .await
                .map_err(|e| e.context(format!("failed to get events for pod {pod_name}")))?;
            let latest = latest_event(&events);

            if latest.is_some_and(is_killing) {
                continue;
            }

            let index = parse_pod_index(&pod_name).map_err(|e| e.context("failed to parse pod index"))?;
            let (state, placement_error) = if latest.is_some_and(is_insufficient_memory) {
                (InstanceState::Error, Some(INSUFFICIENT_MEMORY_ERROR.to_string()))
            } else {
                (pod_state(pod), None)
            };
            instances.push(Instance { index, state, placement_error, since: started_at(pod) });
        }
        Ok(instances)
    }
}

/// Most recent event by last timestamp (event time when absent); list order breaks ties.
fn latest_event(events: &[Event]) -> Option<&Event> {
    events.iter().max_by_key(|e| e.last_timestamp.as_ref().map(|t| t.0).or_else(|| e.event_time.as_ref().map(|t| t.0)))
}

fn is_killing(event: &Event) -> bool { event.reason.as_deref() == Some(EVENT_KILLING) }

fn is_insufficient_memory(event: &Event) -> bool {
    matches!(event.reason.as_deref(), Some(EVENT_FAILED_SCHEDULING | EVENT_FAILED_SCALE_UP))
        && event.message.as_deref().is_some_and(|m| m.contains("Insufficient memory"))
}

fn started_at(pod: &Pod) -> i64 {
    pod.status
        .as_ref()
        .and_then(|s| s.start_time.as_ref())
        .and_then(|t| t.0.timestamp_nanos_opt())
        .unwrap_or(0)
}
