//! Process wiring: one watcher per resource kind feeding a keyed work queue,
//! drained by a small worker pool per controller.

use std::sync::Arc;

use anyhow::{Context, Result};
use capstan_core::{Selector, SourceType};
use capstan_kubehub::{get_kube_client, watch, KubeClient, KubeObject, LrpResource, TaskResource, WatchEvent};
use capstan_reconcile::{
    spawn_workers, CallbackClient, CcCrashReporter, ChannelRouteEmitter, CrashEvents, LrpReconciler, ObjectKey,
    PodCrashReconciler, PodTransition, QueueItem, RouteMessage, SystemClock, TaskCompletionReconciler,
    TaskReconciler, WorkQueue,
};
use capstan_workloads::jobs::{JobMapper, TaskDeleter, TaskDesirer, TaskGetter};
use capstan_workloads::stset::{LrpDesirer, LrpUpdater, StatefulSetMapper};
use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::Api;
use kube::Resource;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;

const WATCH_BUFFER: usize = 256;

pub async fn run(cfg: Config) -> Result<()> {
    let client = get_kube_client().await.context("connecting to kubernetes")?;
    let kube = Arc::new(KubeClient::new(client));
    let ns = cfg.workloads_namespace.clone();
    let backoff = cfg.backoff();
    let workers = cfg.workers_per_controller;
    let callbacks = CallbackClient::new(cfg.callback_timeout()).context("building callback http client")?;

    let lrp_desirer = Arc::new(LrpDesirer::new(
        kube.clone(),
        kube.clone(),
        kube.clone(),
        Arc::new(StatefulSetMapper::new(cfg.mapping())),
    ));
    let lrp_updater = Arc::new(LrpUpdater::new(ns.clone(), kube.clone(), kube.clone()));
    let task_desirer = Arc::new(TaskDesirer::new(kube.clone(), kube.clone(), Arc::new(JobMapper::new(cfg.mapping()))));
    let task_getter = Arc::new(TaskGetter::new(ns.clone(), kube.clone()));
    let task_deleter = Arc::new(TaskDeleter::new(ns.clone(), kube.clone(), kube.clone()));

    let (routes, route_rx) = ChannelRouteEmitter::new(cfg.route_queue_capacity);
    let route_sink = tokio::spawn(log_routes(route_rx));
    let reporter = cfg.cc_internal_api.as_ref().map(|base| CcCrashReporter::new(base.clone(), callbacks.clone()));
    if reporter.is_none() {
        info!("no cc_internal_api configured, crash reports stay in kubernetes events");
    }

    let lrp_queue = WorkQueue::<ObjectKey>::new("lrp", backoff);
    let task_queue = WorkQueue::<ObjectKey>::new("task", backoff);
    let completion_queue = WorkQueue::<ObjectKey>::new("task-completion", backoff);
    let pod_queue = WorkQueue::<PodTransition>::new("pod-crash", backoff);

    let mut handles = Vec::new();
    handles.extend(spawn_workers(
        lrp_queue.clone(),
        Arc::new(LrpReconciler::new(kube.clone(), lrp_desirer, lrp_updater)),
        workers,
    ));
    handles.extend(spawn_workers(task_queue.clone(), Arc::new(TaskReconciler::new(kube.clone(), task_desirer)), workers));
    handles.extend(spawn_workers(
        completion_queue.clone(),
        Arc::new(TaskCompletionReconciler::new(kube.clone(), task_getter, task_deleter, callbacks)),
        workers,
    ));
    handles.extend(spawn_workers(
        pod_queue.clone(),
        Arc::new(PodCrashReconciler::new(
            kube.clone(),
            Arc::new(routes),
            CrashEvents::new(kube.clone(), kube.clone(), Arc::new(SystemClock)),
            reporter,
        )),
        workers,
    ));

    let app_pods = Selector::source_type(SourceType::App).to_query();
    let task_pods = Selector::source_type(SourceType::Task).to_query();
    let ns = ns.as_deref();
    let watchers = vec![
        pump(kube.api::<LrpResource>(ns), None, lrp_queue.clone(), |ev| {
            ev.objects().iter().map(ObjectKey::of).collect()
        }),
        pump(kube.api::<StatefulSet>(ns), Some(app_pods.clone()), lrp_queue.clone(), |ev| {
            ev.objects().iter().filter_map(|sts| owner_key::<LrpResource>(&sts.metadata)).collect()
        }),
        pump(kube.api::<TaskResource>(ns), None, task_queue.clone(), |ev| {
            ev.objects().iter().map(ObjectKey::of).collect()
        }),
        pump(kube.api::<Job>(ns), Some(task_pods.clone()), task_queue.clone(), |ev| {
            ev.objects().iter().filter_map(|job| owner_key::<TaskResource>(&job.metadata)).collect()
        }),
        pump(kube.api::<Pod>(ns), Some(task_pods), completion_queue.clone(), |ev| match ev {
            WatchEvent::Deleted(_) => Vec::new(),
            ev => ev.objects().iter().map(ObjectKey::of).collect(),
        }),
        {
            let mut tracker = PodTracker::default();
            pump(kube.api::<Pod>(ns), Some(app_pods), pod_queue.clone(), move |ev| tracker.transitions(ev))
        },
    ];
    info!(namespace = ?ns, workers, "capstan controller started");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown requested");
    for w in &watchers {
        w.abort();
    }
    lrp_queue.shutdown();
    task_queue.shutdown();
    completion_queue.shutdown();
    pod_queue.shutdown();
    for h in handles {
        let _ = h.await;
    }
    route_sink.abort();
    info!("capstan controller stopped");
    Ok(())
}

/// Watch `api` and push whatever `translate` makes of each change onto `queue`.
fn pump<K, T, F>(api: Api<K>, labels: Option<String>, queue: Arc<WorkQueue<T>>, mut translate: F) -> JoinHandle<()>
where
    K: KubeObject,
    T: QueueItem,
    F: FnMut(WatchEvent<K>) -> Vec<T> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<WatchEvent<K>>(WATCH_BUFFER);
    let kind = K::kind(&()).to_string();
    tokio::spawn(async move {
        let forward = async {
            while let Some(ev) = rx.recv().await {
                for item in translate(ev) {
                    queue.add(item);
                }
            }
        };
        let (watched, ()) = tokio::join!(watch(api, labels, tx), forward);
        if let Err(e) = watched {
            error!(%kind, queue = queue.name(), error = %e, "watch ended");
        }
    })
}

/// Key of the `O` that controls the object described by `meta`.
fn owner_key<O: Resource<DynamicType = ()>>(meta: &ObjectMeta) -> Option<ObjectKey> {
    let kind = O::kind(&());
    let owner = meta
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true) && r.kind == kind && r.api_version == O::api_version(&()))?;
    Some(ObjectKey::new(meta.namespace.clone().unwrap_or_default(), owner.name.clone()))
}

/// Remembers the last seen state of every pod so updates carry their
/// predecessor. A deleted pod is reported with a deletion timestamp even if
/// the final notification arrived without one. Pods missing from a relist
/// were deleted while the watch was down and are reported as deleted too.
#[derive(Default)]
struct PodTracker {
    last_seen: FxHashMap<ObjectKey, Pod>,
}

impl PodTracker {
    fn transitions(&mut self, ev: WatchEvent<Pod>) -> Vec<PodTransition> {
        match ev {
            WatchEvent::Applied(pod) => vec![self.applied(pod)],
            WatchEvent::Deleted(pod) => vec![self.deleted(pod)],
            WatchEvent::Restarted(pods) => {
                let live: FxHashSet<ObjectKey> = pods.iter().map(ObjectKey::of).collect();
                let vanished: Vec<Pod> =
                    self.last_seen.iter().filter(|(key, _)| !live.contains(*key)).map(|(_, pod)| pod.clone()).collect();
                let mut out: Vec<PodTransition> = vanished.into_iter().map(|pod| self.deleted(pod)).collect();
                out.extend(pods.into_iter().map(|pod| self.applied(pod)));
                out
            }
        }
    }

    fn applied(&mut self, pod: Pod) -> PodTransition {
        let old = self.last_seen.insert(ObjectKey::of(&pod), pod.clone());
        PodTransition { old, new: pod }
    }

    fn deleted(&mut self, mut pod: Pod) -> PodTransition {
        let old = self.last_seen.remove(&ObjectKey::of(&pod));
        if pod.metadata.deletion_timestamp.is_none() {
            pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        PodTransition { old, new: pod }
    }
}

async fn log_routes(mut rx: mpsc::Receiver<RouteMessage>) {
    while let Some(msg) = rx.recv().await {
        let action = if msg.unregistered_routes.is_empty() { "register" } else { "unregister" };
        counter!("route_messages_total", 1u64, "action" => action);
        info!(
            name = %msg.name,
            instance = %msg.instance_id,
            address = %msg.address,
            port = msg.port,
            registered = ?msg.registered_routes,
            unregistered = ?msg.unregistered_routes,
            "route {action}"
        );
    }
    debug!("route channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owned_by(kind: &str, api_version: &str, controller: bool) -> ObjectMeta {
        ObjectMeta {
            name: Some("app-space-abc".into()),
            namespace: Some("apps".into()),
            owner_references: Some(vec![OwnerReference {
                api_version: api_version.into(),
                kind: kind.into(),
                name: "my-lrp".into(),
                uid: "uid-1".into(),
                controller: Some(controller),
                ..Default::default()
            }]),
            ..Default::default()
        }
    }

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some("apps".into()), ..Default::default() },
            ..Default::default()
        }
    }

    #[test]
    fn owner_key_follows_the_controlling_custom_resource() {
        let meta = owned_by("LRP", "workloads.capstan.dev/v1", true);
        assert_eq!(owner_key::<LrpResource>(&meta), Some(ObjectKey::new("apps", "my-lrp")));
        assert_eq!(owner_key::<TaskResource>(&meta), None);
    }

    #[test]
    fn owner_key_ignores_foreign_and_non_controller_owners() {
        assert_eq!(owner_key::<LrpResource>(&owned_by("LRP", "workloads.capstan.dev/v1", false)), None);
        assert_eq!(owner_key::<LrpResource>(&owned_by("LRP", "other.example/v1", true)), None);
        assert_eq!(owner_key::<LrpResource>(&ObjectMeta::default()), None);
    }

    fn one(mut transitions: Vec<PodTransition>) -> PodTransition {
        assert_eq!(transitions.len(), 1);
        transitions.remove(0)
    }

    #[test]
    fn tracker_pairs_updates_with_the_previous_state() {
        let mut tracker = PodTracker::default();
        let first = one(tracker.transitions(WatchEvent::Applied(pod("app-0"))));
        assert!(first.old.is_none());

        let mut ready = pod("app-0");
        ready.metadata.resource_version = Some("2".into());
        let second = one(tracker.transitions(WatchEvent::Applied(ready)));
        assert!(second.old.is_some_and(|p| p.metadata.resource_version.is_none()));
        assert_eq!(second.new.metadata.resource_version.as_deref(), Some("2"));
    }

    #[test]
    fn tracker_marks_deleted_pods_and_forgets_them() {
        let mut tracker = PodTracker::default();
        tracker.transitions(WatchEvent::Applied(pod("app-0")));
        let gone = one(tracker.transitions(WatchEvent::Deleted(pod("app-0"))));
        assert!(gone.old.is_some());
        assert!(gone.new.metadata.deletion_timestamp.is_some());
        assert!(tracker.last_seen.is_empty());
    }

    #[test]
    fn relist_evicts_pods_deleted_while_the_watch_was_down() {
        let mut tracker = PodTracker::default();
        tracker.transitions(WatchEvent::Applied(pod("app-0")));
        tracker.transitions(WatchEvent::Applied(pod("app-1")));

        let out = tracker.transitions(WatchEvent::Restarted(vec![pod("app-1"), pod("app-2")]));
        assert_eq!(out.len(), 3);
        let gone = &out[0];
        assert_eq!(gone.new.metadata.name.as_deref(), Some("app-0"));
        assert!(gone.new.metadata.deletion_timestamp.is_some());
        assert!(out[1].old.is_some());
        assert!(out[2].old.is_none());

        let mut tracked: Vec<_> = tracker.last_seen.keys().map(|k| k.name.clone()).collect();
        tracked.sort();
        assert_eq!(tracked, ["app-1", "app-2"]);
    }
}
