//! kube-rs implementation of every capability trait.

use std::fmt::Debug;

use async_trait::async_trait;
use capstan_core::{CapstanError, CapstanResult, Selector};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod, Secret};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::capability::*;
use crate::classify;
use crate::crd::{LrpResource, TaskResource};

/// Namespaced, statically typed API object.
pub trait KubeObject:
    Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> KubeObject for K where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self { Self { client } }

    pub fn client(&self) -> Client { self.client.clone() }

    /// Namespaced api, or cluster-wide when `namespace` is `None`.
    pub fn api<K: KubeObject>(&self, namespace: Option<&str>) -> Api<K> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    async fn create_object<K: KubeObject>(&self, namespace: &str, obj: &K) -> CapstanResult<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        debug!(kind = %K::kind(&()), %namespace, %name, "create");
        self.api::<K>(Some(namespace))
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, format!("failed to create {} {namespace}/{name}", K::kind(&()))))
    }

    async fn get_object<K: KubeObject>(&self, namespace: &str, name: &str) -> CapstanResult<K> {
        self.api::<K>(Some(namespace))
            .get(name)
            .await
            .map_err(|e| classify(e, format!("failed to get {} {namespace}/{name}", K::kind(&()))))
    }

    async fn list_objects<K: KubeObject>(&self, namespace: Option<&str>, lp: ListParams) -> CapstanResult<Vec<K>> {
        self.api::<K>(namespace)
            .list(&lp)
            .await
            .map(|list| list.items)
            .map_err(|e| classify(e, format!("failed to list {}", K::plural(&()))))
    }

    async fn replace_object<K: KubeObject>(&self, namespace: &str, obj: &K) -> CapstanResult<K> {
        let name = obj.meta().name.clone().ok_or_else(|| {
            CapstanError::validation(format!("cannot update a {} without a name", K::kind(&())))
        })?;
        self.api::<K>(Some(namespace))
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| classify(e, format!("failed to update {} {namespace}/{name}", K::kind(&()))))
    }

    async fn delete_object<K: KubeObject>(&self, namespace: &str, name: &str) -> CapstanResult<()> {
        debug!(kind = %K::kind(&()), %namespace, %name, "delete");
        self.api::<K>(Some(namespace))
            .delete(name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, format!("failed to delete {} {namespace}/{name}", K::kind(&()))))
    }
}

fn by_labels(selector: &Selector) -> ListParams { ListParams::default().labels(&selector.to_query()) }

#[async_trait]
impl StatefulSetClient for KubeClient {
    async fn create(&self, namespace: &str, statefulset: &StatefulSet) -> CapstanResult<StatefulSet> {
        KubeClient::create_object(self, namespace, statefulset).await
    }
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<StatefulSet> {
        KubeClient::get_object(self, namespace, name).await
    }
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<StatefulSet>> {
        KubeClient::list_objects(self, namespace, by_labels(selector)).await
    }
    async fn update(&self, namespace: &str, statefulset: &StatefulSet) -> CapstanResult<StatefulSet> {
        KubeClient::replace_object(self, namespace, statefulset).await
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> {
        KubeClient::delete_object::<StatefulSet>(self, namespace, name).await
    }
}

#[async_trait]
impl JobClient for KubeClient {
    async fn create(&self, namespace: &str, job: &Job) -> CapstanResult<Job> {
        KubeClient::create_object(self, namespace, job).await
    }
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<Job>> {
        KubeClient::list_objects(self, namespace, by_labels(selector)).await
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> {
        KubeClient::delete_object::<Job>(self, namespace, name).await
    }
}

#[async_trait]
impl SecretClient for KubeClient {
    async fn create(&self, namespace: &str, secret: &Secret) -> CapstanResult<Secret> {
        KubeClient::create_object(self, namespace, secret).await
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> {
        KubeClient::delete_object::<Secret>(self, namespace, name).await
    }
}

#[async_trait]
impl PodDisruptionBudgetClient for KubeClient {
    async fn create(&self, namespace: &str, pdb: &PodDisruptionBudget) -> CapstanResult<PodDisruptionBudget> {
        KubeClient::create_object(self, namespace, pdb).await
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> {
        KubeClient::delete_object::<PodDisruptionBudget>(self, namespace, name).await
    }
}

#[async_trait]
impl PodClient for KubeClient {
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<Pod> {
        KubeClient::get_object(self, namespace, name).await
    }
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<Pod>> {
        KubeClient::list_objects(self, namespace, by_labels(selector)).await
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> {
        KubeClient::delete_object::<Pod>(self, namespace, name).await
    }
}

#[async_trait]
impl EventClient for KubeClient {
    async fn list(&self, namespace: &str, filter: &EventFilter) -> CapstanResult<Vec<Event>> {
        let mut lp = ListParams::default().fields(&filter.field_selector(namespace));
        if !filter.labels.as_map().is_empty() {
            lp = lp.labels(&filter.labels.to_query());
        }
        KubeClient::list_objects(self, Some(namespace), lp).await
    }
    async fn create(&self, namespace: &str, event: &Event) -> CapstanResult<Event> {
        KubeClient::create_object(self, namespace, event).await
    }
    async fn update(&self, namespace: &str, event: &Event) -> CapstanResult<Event> {
        KubeClient::replace_object(self, namespace, event).await
    }
}

#[async_trait]
impl CustomResourceClient<LrpResource> for KubeClient {
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<LrpResource> {
        KubeClient::get_object(self, namespace, name).await
    }
}

#[async_trait]
impl CustomResourceClient<TaskResource> for KubeClient {
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<TaskResource> {
        KubeClient::get_object(self, namespace, name).await
    }
}
