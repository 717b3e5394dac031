use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use capstan_core::{CapstanError, Task, WorkloadIdentity};
use capstan_kubehub::testing::{FakeCluster, Op};
use capstan_reconcile::{CallbackClient, ObjectKey, Reconciler, TaskCompletionReconciler};
use capstan_workloads::jobs::{JobMapper, TaskDeleter, TaskDesirer, TaskGetter};
use capstan_workloads::TASK_CONTAINER_NAME;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};

#[derive(Clone)]
struct Callback {
    status: StatusCode,
    received: Arc<Mutex<Vec<Value>>>,
}

async fn completed(State(cb): State<Callback>, Json(body): Json<Value>) -> (StatusCode, &'static str) {
    cb.received.lock().expect("callback lock").push(body);
    (cb.status, "callback says no")
}

/// Serve the completion callback on an ephemeral port; returns its URL.
async fn serve(cb: Callback) -> String {
    let app = Router::new().route("/completed", post(completed)).with_state(cb);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/completed")
}

struct Harness {
    cluster: FakeCluster,
    reconciler: TaskCompletionReconciler,
    received: Arc<Mutex<Vec<Value>>>,
}

async fn harness(status: StatusCode) -> Harness {
    let received = Arc::new(Mutex::new(Vec::new()));
    let url = serve(Callback { status, received: received.clone() }).await;

    let cluster = FakeCluster::new();
    let task = Task {
        identity: WorkloadIdentity::new("task-guid", ""),
        app_name: "app".into(),
        space_name: "space".into(),
        image: "busybox".into(),
        completion_callback: url,
        ..Default::default()
    };
    TaskDesirer::new(cluster.jobs.clone(), cluster.secrets.clone(), Arc::new(JobMapper::default()))
        .desire("ns", &task, &[])
        .await
        .expect("desire task");

    let reconciler = TaskCompletionReconciler::new(
        cluster.pods.clone(),
        Arc::new(TaskGetter::new(None, cluster.jobs.clone())),
        Arc::new(TaskDeleter::new(None, cluster.jobs.clone(), cluster.secrets.clone())),
        CallbackClient::new(Duration::from_secs(5)).expect("http client"),
    );
    Harness { cluster, reconciler, received }
}

impl Harness {
    fn add_pod(&self, statuses: Option<Vec<ContainerStatus>>) -> ObjectKey {
        let job = self.cluster.jobs.objects().remove(0);
        let meta = job.spec.expect("job spec").template.metadata.expect("template metadata");
        self.cluster.pods.insert(Pod {
            metadata: ObjectMeta {
                name: Some("task-pod".into()),
                namespace: Some("ns".into()),
                labels: meta.labels,
                annotations: meta.annotations,
                ..Default::default()
            },
            status: Some(PodStatus { container_statuses: statuses, ..Default::default() }),
            ..Default::default()
        });
        ObjectKey::new("ns", "task-pod")
    }

    fn received(&self) -> Vec<Value> { self.received.lock().expect("callback lock").clone() }
}

fn status(name: &str, state: ContainerState) -> ContainerStatus {
    ContainerStatus { name: name.into(), state: Some(state), ..Default::default() }
}

fn exited(code: i32, reason: &str) -> ContainerState {
    ContainerState {
        terminated: Some(ContainerStateTerminated { exit_code: code, reason: Some(reason.into()), ..Default::default() }),
        ..Default::default()
    }
}

#[tokio::test]
async fn successful_task_is_reported_and_cleaned_up() {
    let h = harness(StatusCode::OK).await;
    let key = h.add_pod(Some(vec![status(TASK_CONTAINER_NAME, exited(0, "Completed"))]));
    h.reconciler.reconcile(&key).await.unwrap();

    assert_eq!(h.received(), vec![json!({"task_guid": "task-guid", "failed": false, "failure_reason": ""})]);
    assert!(h.cluster.jobs.is_empty());
}

#[tokio::test]
async fn failed_task_reports_its_reason() {
    let h = harness(StatusCode::OK).await;
    let key = h.add_pod(Some(vec![
        status("sidecar", exited(0, "Completed")),
        status(TASK_CONTAINER_NAME, exited(42, "because")),
    ]));
    h.reconciler.reconcile(&key).await.unwrap();

    assert_eq!(h.received(), vec![json!({"task_guid": "task-guid", "failed": true, "failure_reason": "because"})]);
    assert!(h.cluster.jobs.is_empty());
}

#[tokio::test]
async fn running_task_is_left_alone() {
    let h = harness(StatusCode::OK).await;
    let running = ContainerState { running: Some(ContainerStateRunning::default()), ..Default::default() };
    let key = h.add_pod(Some(vec![status(TASK_CONTAINER_NAME, running)]));
    h.reconciler.reconcile(&key).await.unwrap();

    assert!(h.received().is_empty());
    assert_eq!(h.cluster.jobs.len(), 1);
}

#[tokio::test]
async fn missing_task_container_status_is_left_alone() {
    let h = harness(StatusCode::OK).await;
    let key = h.add_pod(None);
    h.reconciler.reconcile(&key).await.unwrap();

    let key = h.add_pod(Some(vec![status("sidecar", exited(1, "Error"))]));
    h.reconciler.reconcile(&key).await.unwrap();

    assert!(h.received().is_empty());
    assert_eq!(h.cluster.jobs.count(Op::Delete), 0);
}

#[tokio::test]
async fn rejected_callback_keeps_the_job_for_a_retry() {
    let h = harness(StatusCode::BAD_GATEWAY).await;
    let key = h.add_pod(Some(vec![status(TASK_CONTAINER_NAME, exited(0, "Completed"))]));
    let err = h.reconciler.reconcile(&key).await.unwrap_err();

    assert!(matches!(err, CapstanError::Protocol(_)));
    assert!(err.is_retryable());
    let msg = err.to_string();
    assert!(msg.contains("status=502"), "{msg}");
    assert!(msg.contains("callback says no"), "{msg}");
    assert_eq!(h.cluster.jobs.len(), 1);
}

#[tokio::test]
async fn redelivery_after_cleanup_is_harmless() {
    let h = harness(StatusCode::OK).await;
    let key = h.add_pod(Some(vec![status(TASK_CONTAINER_NAME, exited(0, "Completed"))]));
    h.reconciler.reconcile(&key).await.unwrap();
    h.reconciler.reconcile(&key).await.unwrap();

    assert_eq!(h.received().len(), 1);
    assert_eq!(h.cluster.jobs.count(Op::Delete), 1);
}

#[tokio::test]
async fn vanished_pod_is_a_no_op() {
    let h = harness(StatusCode::OK).await;
    h.reconciler.reconcile(&ObjectKey::new("ns", "gone")).await.unwrap();
    assert!(h.received().is_empty());
}
