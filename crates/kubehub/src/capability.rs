//! Narrow per-kind client capabilities.
//!
//! Each component takes only the traits it needs, so a reader can tell from
//! a constructor which API calls a component can make.

use async_trait::async_trait;
use capstan_core::{CapstanResult, Selector};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod, Secret};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;

#[async_trait]
pub trait StatefulSetClient: Send + Sync {
    async fn create(&self, namespace: &str, statefulset: &StatefulSet) -> CapstanResult<StatefulSet>;
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<StatefulSet>;
    /// `namespace = None` lists across all namespaces.
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<StatefulSet>>;
    async fn update(&self, namespace: &str, statefulset: &StatefulSet) -> CapstanResult<StatefulSet>;
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()>;
}

#[async_trait]
pub trait JobClient: Send + Sync {
    async fn create(&self, namespace: &str, job: &Job) -> CapstanResult<Job>;
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<Job>>;
    /// Background propagation so the job's pods go with it.
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()>;
}

#[async_trait]
pub trait SecretClient: Send + Sync {
    async fn create(&self, namespace: &str, secret: &Secret) -> CapstanResult<Secret>;
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()>;
}

#[async_trait]
pub trait PodDisruptionBudgetClient: Send + Sync {
    async fn create(&self, namespace: &str, pdb: &PodDisruptionBudget) -> CapstanResult<PodDisruptionBudget>;
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()>;
}

#[async_trait]
pub trait PodClient: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<Pod>;
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<Pod>>;
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()>;
}

#[async_trait]
pub trait EventClient: Send + Sync {
    async fn list(&self, namespace: &str, filter: &EventFilter) -> CapstanResult<Vec<Event>>;
    async fn create(&self, namespace: &str, event: &Event) -> CapstanResult<Event>;
    async fn update(&self, namespace: &str, event: &Event) -> CapstanResult<Event>;
}

/// Read access to one of our custom resources.
#[async_trait]
pub trait CustomResourceClient<K>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<K>;
}

/// Events about one involved object, optionally narrowed by event labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub involved_kind: String,
    pub involved_name: String,
    pub labels: Selector,
}

impl EventFilter {
    pub fn involving(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self { involved_kind: kind.into(), involved_name: name.into(), labels: Selector::new() }
    }

    pub fn with_labels(mut self, labels: Selector) -> Self {
        self.labels = labels;
        self
    }

    pub fn field_selector(&self, namespace: &str) -> String {
        format!(
            "involvedObject.kind={},involvedObject.name={},involvedObject.namespace={namespace}",
            self.involved_kind, self.involved_name
        )
    }

    pub fn matches(&self, namespace: &str, event: &Event) -> bool {
        let obj = &event.involved_object;
        obj.kind.as_deref() == Some(self.involved_kind.as_str())
            && obj.name.as_deref() == Some(self.involved_name.as_str())
            && obj.namespace.as_deref() == Some(namespace)
            && self.labels.matches(event.metadata.labels.as_ref())
    }
}
