//! Crash events for LRP instances.
//!
//! Crashes are recorded as one `Warning` event per LRP instance, attached to
//! the LRP custom resource so the history survives pod replacement. The first
//! crash creates the event; later crashes bump `count`, move `lastTimestamp`
//! and take the newest reason. Each event remembers the fingerprint of the
//! crash it last counted so a redelivered pod update does not count twice.

use std::collections::BTreeMap;
use std::sync::Arc;

use capstan_core::labels::{instance_index_label, ANNOTATION_CRASH_FINGERPRINT, ANNOTATION_PROCESS_GUID};
use capstan_core::naming::{parse_pod_index, sanitize_name};
use capstan_core::{CapstanResult, Selector, WorkloadDescriptor};
use capstan_kubehub::{EventClient, EventFilter, StatefulSetClient};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, Time};
use kube::ResourceExt;
use metrics::counter;
use tracing::{debug, info};
use uuid::Uuid;

pub const EVENT_SOURCE_COMPONENT: &str = "capstan-controller";
pub const CRASH_LOOP_BACK_OFF: &str = "CrashLoopBackOff";

const LRP_KIND: &str = "LRP";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> { Utc::now() }
}

/// What the app container of one LRP instance died of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashReport {
    pub index: u32,
    pub reason: String,
    pub exit_code: i32,
    pub exit_description: String,
    pub restart_count: i32,
    /// Unix seconds of the termination.
    pub crash_timestamp: i64,
}

impl CrashReport {
    pub fn fingerprint(&self) -> String { format!("{}:{}", self.reason, self.restart_count) }
}

/// Crash of `container` in an LRP pod, from either a terminated state or a
/// back-off wait after an earlier termination.
pub fn detect_crash(pod: &Pod, container: &str) -> Option<CrashReport> {
    let status = pod.status.as_ref()?.container_statuses.as_ref()?.iter().find(|s| s.name == container)?;
    let index = parse_pod_index(&pod.name_any()).ok()?;
    let state = status.state.as_ref()?;

    let backing_off = state.waiting.as_ref().and_then(|w| w.reason.as_deref()) == Some(CRASH_LOOP_BACK_OFF);
    let (reason, terminated) = if backing_off {
        let last = status.last_state.as_ref()?.terminated.as_ref()?;
        (CRASH_LOOP_BACK_OFF.to_string(), last)
    } else {
        let terminated = state.terminated.as_ref()?;
        (terminated.reason.clone().unwrap_or_else(|| "Unknown".to_string()), terminated)
    };

    Some(CrashReport {
        index,
        reason,
        exit_code: terminated.exit_code,
        exit_description: terminated.message.clone().unwrap_or_default(),
        restart_count: status.restart_count,
        crash_timestamp: terminated
            .finished_at
            .as_ref()
            .or(terminated.started_at.as_ref())
            .map(|t| t.0.timestamp())
            .unwrap_or_default(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashOutcome {
    Created,
    Updated,
    /// Already counted, or the pod does not belong to an LRP resource.
    Unchanged,
}

impl CrashOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

pub struct CrashEvents {
    events: Arc<dyn EventClient>,
    statefulsets: Arc<dyn StatefulSetClient>,
    clock: Arc<dyn Clock>,
}

impl CrashEvents {
    pub fn new(events: Arc<dyn EventClient>, statefulsets: Arc<dyn StatefulSetClient>, clock: Arc<dyn Clock>) -> Self {
        Self { events, statefulsets, clock }
    }

    pub async fn record(&self, pod: &Pod, report: &CrashReport) -> CapstanResult<CrashOutcome> {
        let namespace = pod.namespace().unwrap_or_default();
        let Some(owner) = self.owning_lrp(pod, &namespace).await? else {
            debug!(pod = %pod.name_any(), "pod has no owning lrp, not recording crash");
            return Ok(CrashOutcome::Unchanged);
        };
        let owner_name = owner.name.clone().unwrap_or_default();
        let (index_key, index_value) = instance_index_label(report.index);
        let filter = EventFilter::involving(LRP_KIND, &owner_name)
            .with_labels(Selector::new().with(index_key, index_value));
        let existing = self
            .events
            .list(&namespace, &filter)
            .await
            .map_err(|e| e.context(format!("failed to list crash events for {namespace}/{owner_name}")))?;

        let outcome = match existing.into_iter().next() {
            Some(event) => self.update(&namespace, event, report).await?,
            None => self.create(&namespace, pod, owner, report).await?,
        };
        counter!("crash_events_total", 1u64, "action" => outcome.as_str());
        Ok(outcome)
    }

    /// Pod → owning stateful set → owning LRP resource.
    async fn owning_lrp(&self, pod: &Pod, namespace: &str) -> CapstanResult<Option<ObjectReference>> {
        let Some(sts_ref) = pod.owner_references().iter().find(|o| o.kind == "StatefulSet") else {
            return Ok(None);
        };
        let sts = match self.statefulsets.get(namespace, &sts_ref.name).await {
            Ok(sts) => sts,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.context(format!("failed to get statefulset {namespace}/{}", sts_ref.name))),
        };
        Ok(sts.owner_references().iter().find(|o| o.kind == LRP_KIND).map(|o| ObjectReference {
            api_version: Some(o.api_version.clone()),
            kind: Some(o.kind.clone()),
            name: Some(o.name.clone()),
            namespace: Some(namespace.to_string()),
            uid: Some(o.uid.clone()),
            ..Default::default()
        }))
    }

    async fn create(
        &self,
        namespace: &str,
        pod: &Pod,
        owner: ObjectReference,
        report: &CrashReport,
    ) -> CapstanResult<CrashOutcome> {
        let desc = WorkloadDescriptor::from_metadata(pod.metadata.labels.as_ref(), pod.metadata.annotations.as_ref())?;
        let base = sanitize_name(&desc.app_name, &desc.identity.guid).unwrap_or_else(|| "crash".to_string());
        let now = self.clock.now();
        let (last, event_time) = timestamps(now);

        let event = Event {
            metadata: ObjectMeta {
                name: Some(format!("{base}-{}.{}", report.index, Uuid::new_v4().simple())),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([instance_index_label(report.index)])),
                annotations: Some(BTreeMap::from([
                    (ANNOTATION_PROCESS_GUID.to_string(), desc.identity.process_guid()),
                    (ANNOTATION_CRASH_FINGERPRINT.to_string(), report.fingerprint()),
                ])),
                ..Default::default()
            },
            involved_object: owner,
            reason: Some(reason(report)),
            message: Some(message(report)),
            type_: Some("Warning".to_string()),
            count: Some(1),
            first_timestamp: Some(Time(last)),
            last_timestamp: Some(Time(last)),
            event_time: Some(MicroTime(event_time)),
            source: Some(EventSource { component: Some(EVENT_SOURCE_COMPONENT.to_string()), host: None }),
            reporting_component: Some(EVENT_SOURCE_COMPONENT.to_string()),
            ..Default::default()
        };
        self.events
            .create(namespace, &event)
            .await
            .map_err(|e| e.context(format!("failed to create crash event for {}", desc.identity)))?;
        info!(guid = %desc.identity.guid, index = report.index, reason = %report.reason, "crash event created");
        Ok(CrashOutcome::Created)
    }

    async fn update(&self, namespace: &str, mut event: Event, report: &CrashReport) -> CapstanResult<CrashOutcome> {
        let fingerprint = report.fingerprint();
        let annotations = event.metadata.annotations.get_or_insert_with(BTreeMap::new);
        if annotations.get(ANNOTATION_CRASH_FINGERPRINT) == Some(&fingerprint) {
            debug!(event = %event.name_any(), %fingerprint, "crash already counted");
            return Ok(CrashOutcome::Unchanged);
        }
        annotations.insert(ANNOTATION_CRASH_FINGERPRINT.to_string(), fingerprint);

        let (last, event_time) = timestamps(self.clock.now());
        event.count = Some(event.count.unwrap_or(0) + 1);
        event.reason = Some(reason(report));
        event.message = Some(message(report));
        event.last_timestamp = Some(Time(last));
        event.event_time = Some(MicroTime(event_time));

        self.events
            .update(namespace, &event)
            .await
            .map_err(|e| e.context(format!("failed to update crash event {}", event.name_any())))?;
        info!(event = %event.name_any(), count = ?event.count, reason = %report.reason, "crash event updated");
        Ok(CrashOutcome::Updated)
    }
}

fn reason(report: &CrashReport) -> String { format!("Container: {}", report.reason) }

fn message(report: &CrashReport) -> String { format!("Container terminated with exit code: {}", report.exit_code) }

/// `lastTimestamp` has second precision; `eventTime` must sort strictly after it.
fn timestamps(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let last = now.trunc_subsecs(0);
    let event_time = if now > last { now } else { last + Duration::microseconds(1) };
    (last, event_time)
}
