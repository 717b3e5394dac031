//! LRP pod updates: route (un)registration on readiness changes, crash
//! events on container termination.

use std::sync::Arc;

use async_trait::async_trait;
use capstan_core::labels::is_source;
use capstan_core::{CapstanResult, SourceType, WorkloadDescriptor};
use capstan_kubehub::StatefulSetClient;
use capstan_workloads::APP_CONTAINER_NAME;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, warn};

use crate::crash::{detect_crash, CrashEvents, CrashOutcome};
use crate::queue::{QueueItem, Reconciler};
use crate::report::CcCrashReporter;
use crate::routes::{is_ready, route_messages, RouteEmitter};
use crate::ObjectKey;

/// A pod update. `old` is the state before the first of any coalesced
/// updates, `None` when the pod was first seen.
#[derive(Debug, Clone)]
pub struct PodTransition {
    pub old: Option<Pod>,
    pub new: Pod,
}

impl QueueItem for PodTransition {
    type Key = ObjectKey;

    fn key(&self) -> Self::Key { ObjectKey::of(&self.new) }

    fn merge(&mut self, newer: Self) {
        if self.old.is_none() {
            self.old = newer.old;
        }
        self.new = newer.new;
    }
}

pub struct PodCrashReconciler {
    statefulsets: Arc<dyn StatefulSetClient>,
    routes: Arc<dyn RouteEmitter>,
    crashes: CrashEvents,
    reporter: Option<CcCrashReporter>,
}

impl PodCrashReconciler {
    pub fn new(
        statefulsets: Arc<dyn StatefulSetClient>,
        routes: Arc<dyn RouteEmitter>,
        crashes: CrashEvents,
        reporter: Option<CcCrashReporter>,
    ) -> Self {
        Self { statefulsets, routes, crashes, reporter }
    }

    async fn emit_routes(&self, transition: &PodTransition) -> CapstanResult<()> {
        let new = &transition.new;
        let was_ready = transition.old.as_ref().is_some_and(is_ready);
        let (pod, unregister) = if new.metadata.deletion_timestamp.is_some() || (was_ready && !is_ready(new)) {
            (transition.old.as_ref().unwrap_or(new), true)
        } else if is_ready(new) {
            (new, false)
        } else {
            return Ok(());
        };

        let namespace = pod.namespace().unwrap_or_default();
        let Some(owner) = pod.owner_references().iter().find(|o| o.kind == "StatefulSet") else {
            debug!(pod = %pod.name_any(), "pod is not owned by a statefulset");
            return Ok(());
        };
        let sts = match self.statefulsets.get(&namespace, &owner.name).await {
            Ok(sts) => sts,
            Err(e) if e.is_not_found() => {
                debug!(pod = %pod.name_any(), statefulset = %owner.name, "statefulset gone, no routes to emit");
                return Ok(());
            }
            Err(e) => return Err(e.context(format!("failed to get statefulset {namespace}/{}", owner.name))),
        };
        let desc = WorkloadDescriptor::from_metadata(sts.metadata.labels.as_ref(), sts.metadata.annotations.as_ref())?;

        for message in route_messages(pod, &desc.identity.process_guid(), &desc.registered_routes, unregister) {
            self.routes.emit(message).await?;
        }
        Ok(())
    }

    async fn report_crash(&self, pod: &Pod) -> CapstanResult<()> {
        let desc = WorkloadDescriptor::from_metadata(pod.metadata.labels.as_ref(), pod.metadata.annotations.as_ref())?;
        let container = if desc.container_name.is_empty() { APP_CONTAINER_NAME } else { desc.container_name.as_str() };
        let Some(crash) = detect_crash(pod, container) else {
            return Ok(());
        };

        if self.crashes.record(pod, &crash).await? == CrashOutcome::Unchanged {
            return Ok(());
        }
        if let Some(reporter) = &self.reporter {
            let process_guid = desc.identity.process_guid();
            if let Err(e) = reporter.report(&process_guid, &pod.name_any(), &crash).await {
                warn!(%process_guid, index = crash.index, error = %e, "failed to report crash");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler<PodTransition> for PodCrashReconciler {
    async fn reconcile(&self, transition: &PodTransition) -> CapstanResult<()> {
        if !is_source(transition.new.metadata.labels.as_ref(), SourceType::App) {
            return Ok(());
        }
        self.emit_routes(transition).await?;
        if transition.new.metadata.deletion_timestamp.is_none() {
            self.report_crash(&transition.new).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::SystemClock;
    use crate::routes::{ChannelRouteEmitter, RouteMessage};
    use capstan_core::{Lrp, Route, WorkloadIdentity};
    use capstan_kubehub::testing::FakeCluster;
    use capstan_workloads::stset::{LrpToStatefulSet, StatefulSetMapper};
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
    use tokio::sync::mpsc;

    const STS: &str = "app-space-1234";

    fn lrp() -> Lrp {
        Lrp {
            identity: WorkloadIdentity::new("guid", "v1"),
            app_name: "app".into(),
            space_name: "space".into(),
            image: "busybox".into(),
            target_instances: 1,
            routes: vec![Route { hostname: "app.example.com".into(), port: 8080 }],
            ..Default::default()
        }
    }

    fn setup() -> (FakeCluster, PodCrashReconciler, mpsc::Receiver<RouteMessage>) {
        let cluster = FakeCluster::new();
        let mut sts = StatefulSetMapper::default().to_statefulset(STS, &lrp()).unwrap();
        sts.metadata.namespace = Some("ns".into());
        sts.metadata.owner_references = Some(vec![OwnerReference {
            kind: "LRP".into(),
            name: "my-lrp".into(),
            uid: "u".into(),
            ..Default::default()
        }]);
        cluster.statefulsets.insert(sts);

        let (emitter, rx) = ChannelRouteEmitter::new(16);
        let crashes = CrashEvents::new(cluster.events.clone(), cluster.statefulsets.clone(), Arc::new(SystemClock));
        let reconciler = PodCrashReconciler::new(cluster.statefulsets.clone(), Arc::new(emitter), crashes, None);
        (cluster, reconciler, rx)
    }

    fn pod(ready: bool, state: Option<ContainerState>) -> Pod {
        let meta = StatefulSetMapper::default().to_statefulset(STS, &lrp()).unwrap().spec.unwrap().template.metadata.unwrap();
        Pod {
            metadata: ObjectMeta {
                name: Some(format!("{STS}-0")),
                namespace: Some("ns".into()),
                labels: meta.labels,
                annotations: meta.annotations,
                owner_references: Some(vec![OwnerReference {
                    kind: "StatefulSet".into(),
                    name: STS.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: Some("10.1.2.3".into()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    name: APP_CONTAINER_NAME.into(),
                    state,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn crashed() -> Option<ContainerState> {
        Some(ContainerState {
            terminated: Some(ContainerStateTerminated { exit_code: 1, reason: Some("Error".into()), ..Default::default() }),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn ready_pod_registers_its_routes() {
        let (_cluster, reconciler, mut rx) = setup();
        reconciler.reconcile(&PodTransition { old: None, new: pod(true, None) }).await.unwrap();
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.name, "guid-v1");
        assert_eq!(msg.registered_routes, vec!["app.example.com".to_string()]);
        assert_eq!(msg.port, 8080);
        assert_eq!(msg.address, "10.1.2.3");
        assert_eq!(msg.instance_id, format!("{STS}-0"));
    }

    #[tokio::test]
    async fn losing_readiness_unregisters_and_records_the_crash() {
        let (cluster, reconciler, mut rx) = setup();
        let transition = PodTransition { old: Some(pod(true, None)), new: pod(false, crashed()) };
        reconciler.reconcile(&transition).await.unwrap();

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.unregistered_routes, vec!["app.example.com".to_string()]);
        assert!(msg.registered_routes.is_empty());

        let events = cluster.events.objects();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].involved_object.name.as_deref(), Some("my-lrp"));
    }

    #[tokio::test]
    async fn deleted_pod_only_unregisters() {
        let (cluster, reconciler, mut rx) = setup();
        let mut new = pod(true, crashed());
        new.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        reconciler.reconcile(&PodTransition { old: Some(pod(true, None)), new }).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().unregistered_routes.len(), 1);
        assert!(cluster.events.is_empty());
    }

    #[tokio::test]
    async fn not_ready_pod_without_history_emits_nothing() {
        let (_cluster, reconciler, mut rx) = setup();
        reconciler.reconcile(&PodTransition { old: None, new: pod(false, None) }).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn foreign_pods_are_ignored() {
        let (cluster, reconciler, mut rx) = setup();
        let mut p = pod(true, crashed());
        p.metadata.labels = None;
        reconciler.reconcile(&PodTransition { old: None, new: p }).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(cluster.events.is_empty());
    }

    #[test]
    fn merge_keeps_the_oldest_before_and_newest_after() {
        let mut first = PodTransition { old: Some(pod(true, None)), new: pod(false, None) };
        first.merge(PodTransition { old: Some(pod(false, None)), new: pod(false, crashed()) });
        assert!(is_ready(first.old.as_ref().unwrap()));
        assert!(first.new.status.as_ref().unwrap().container_statuses.as_ref().unwrap()[0].state.is_some());
    }
}
