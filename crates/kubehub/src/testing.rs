//! In-memory fakes of every capability trait.
//!
//! A [`FakeStore`] keeps objects keyed by `(namespace, name)`, records every
//! call and lets a test queue failures per operation.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use capstan_core::{CapstanError, CapstanResult, Selector};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod, Secret};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::Resource;

use crate::capability::*;
use crate::crd::{LrpResource, TaskResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Get,
    List,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub namespace: Option<String>,
    pub name: String,
}

struct Inner<K> {
    objects: BTreeMap<(String, String), K>,
    calls: Vec<Call>,
    failures: HashMap<Op, VecDeque<CapstanError>>,
    serial: u64,
}

pub struct FakeStore<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for FakeStore<K> {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner { objects: BTreeMap::new(), calls: Vec::new(), failures: HashMap::new(), serial: 0 }) }
    }
}

impl<K> FakeStore<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> { self.inner.lock().expect("fake store lock poisoned") }

    /// Seed an object without recording a call. Objects without a namespace
    /// land in `default`.
    pub fn insert(&self, mut obj: K) -> K {
        let ns = obj.meta().namespace.clone().unwrap_or_else(|| "default".to_string());
        obj.meta_mut().namespace = Some(ns.clone());
        let name = obj.meta().name.clone().unwrap_or_default();
        self.lock().objects.insert((ns, name), obj.clone());
        obj
    }

    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock().objects.remove(&(namespace.to_string(), name.to_string()))
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock().objects.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn objects(&self) -> Vec<K> { self.lock().objects.values().cloned().collect() }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Make the next call of `op` fail with `err`. Queued failures are used in order.
    pub fn fail_next(&self, op: Op, err: CapstanError) { self.lock().failures.entry(op).or_default().push_back(err); }

    pub fn calls(&self) -> Vec<Call> { self.lock().calls.clone() }

    pub fn count(&self, op: Op) -> usize { self.lock().calls.iter().filter(|c| c.op == op).count() }

    pub fn names(&self, op: Op) -> Vec<String> {
        self.lock().calls.iter().filter(|c| c.op == op).map(|c| c.name.clone()).collect()
    }

    fn record(&self, op: Op, namespace: Option<&str>, name: &str) -> CapstanResult<()> {
        let mut inner = self.lock();
        inner.calls.push(Call { op, namespace: namespace.map(str::to_string), name: name.to_string() });
        match inner.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn describe(namespace: &str, name: &str) -> String { format!("{} {namespace}/{name}", K::kind(&())) }

    pub fn create_object(&self, namespace: &str, obj: &K) -> CapstanResult<K> {
        let mut obj = obj.clone();
        let mut inner = self.lock();
        inner.serial += 1;
        let serial = inner.serial;
        let meta = obj.meta_mut();
        if meta.name.is_none() {
            if let Some(prefix) = &meta.generate_name {
                meta.name = Some(format!("{prefix}{serial:05}"));
            }
        }
        let name = meta.name.clone().unwrap_or_default();
        meta.namespace = Some(namespace.to_string());
        meta.uid = Some(format!("uid-{serial}"));
        meta.resource_version = Some("1".to_string());
        drop(inner);

        self.record(Op::Create, Some(namespace), &name)?;
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.clone());
        if inner.objects.contains_key(&key) {
            return Err(CapstanError::AlreadyExists(format!("{} already exists", Self::describe(namespace, &name))));
        }
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    pub fn get_object(&self, namespace: &str, name: &str) -> CapstanResult<K> {
        self.record(Op::Get, Some(namespace), name)?;
        self.object(namespace, name)
            .ok_or_else(|| CapstanError::not_found(format!("{} not found", Self::describe(namespace, name))))
    }

    pub fn list_objects(&self, namespace: Option<&str>, keep: impl Fn(&str, &K) -> bool) -> CapstanResult<Vec<K>> {
        self.record(Op::List, namespace, "")?;
        Ok(self
            .lock()
            .objects
            .iter()
            .filter(|((ns, _), obj)| namespace.map_or(true, |want| want == ns) && keep(ns, obj))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    pub fn update_object(&self, namespace: &str, obj: &K) -> CapstanResult<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.record(Op::Update, Some(namespace), &name)?;
        let mut inner = self.lock();
        let key = (namespace.to_string(), name.clone());
        let Some(current) = inner.objects.get(&key) else {
            return Err(CapstanError::not_found(format!("{} not found", Self::describe(namespace, &name))));
        };
        let version: u64 = current.meta().resource_version.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
        let mut obj = obj.clone();
        obj.meta_mut().namespace = Some(namespace.to_string());
        obj.meta_mut().resource_version = Some((version + 1).to_string());
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    pub fn delete_object(&self, namespace: &str, name: &str) -> CapstanResult<()> {
        self.record(Op::Delete, Some(namespace), name)?;
        self.remove(namespace, name)
            .map(|_| ())
            .ok_or_else(|| CapstanError::not_found(format!("{} not found", Self::describe(namespace, name))))
    }

    fn list_selected(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<K>> {
        self.list_objects(namespace, |_, obj| selector.matches(obj.meta().labels.as_ref()))
    }
}

#[async_trait]
impl StatefulSetClient for FakeStore<StatefulSet> {
    async fn create(&self, namespace: &str, statefulset: &StatefulSet) -> CapstanResult<StatefulSet> {
        self.create_object(namespace, statefulset)
    }
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<StatefulSet> { self.get_object(namespace, name) }
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<StatefulSet>> {
        self.list_selected(namespace, selector)
    }
    async fn update(&self, namespace: &str, statefulset: &StatefulSet) -> CapstanResult<StatefulSet> {
        self.update_object(namespace, statefulset)
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> { self.delete_object(namespace, name) }
}

#[async_trait]
impl JobClient for FakeStore<Job> {
    async fn create(&self, namespace: &str, job: &Job) -> CapstanResult<Job> { self.create_object(namespace, job) }
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<Job>> {
        self.list_selected(namespace, selector)
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> { self.delete_object(namespace, name) }
}

#[async_trait]
impl SecretClient for FakeStore<Secret> {
    async fn create(&self, namespace: &str, secret: &Secret) -> CapstanResult<Secret> {
        self.create_object(namespace, secret)
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> { self.delete_object(namespace, name) }
}

#[async_trait]
impl PodDisruptionBudgetClient for FakeStore<PodDisruptionBudget> {
    async fn create(&self, namespace: &str, pdb: &PodDisruptionBudget) -> CapstanResult<PodDisruptionBudget> {
        self.create_object(namespace, pdb)
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> { self.delete_object(namespace, name) }
}

#[async_trait]
impl PodClient for FakeStore<Pod> {
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<Pod> { self.get_object(namespace, name) }
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> CapstanResult<Vec<Pod>> {
        self.list_selected(namespace, selector)
    }
    async fn delete(&self, namespace: &str, name: &str) -> CapstanResult<()> { self.delete_object(namespace, name) }
}

#[async_trait]
impl EventClient for FakeStore<Event> {
    async fn list(&self, namespace: &str, filter: &EventFilter) -> CapstanResult<Vec<Event>> {
        self.list_objects(Some(namespace), |ns, ev| filter.matches(ns, ev))
    }
    async fn create(&self, namespace: &str, event: &Event) -> CapstanResult<Event> { self.create_object(namespace, event) }
    async fn update(&self, namespace: &str, event: &Event) -> CapstanResult<Event> { self.update_object(namespace, event) }
}

#[async_trait]
impl CustomResourceClient<LrpResource> for FakeStore<LrpResource> {
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<LrpResource> { self.get_object(namespace, name) }
}

#[async_trait]
impl CustomResourceClient<TaskResource> for FakeStore<TaskResource> {
    async fn get(&self, namespace: &str, name: &str) -> CapstanResult<TaskResource> { self.get_object(namespace, name) }
}

/// One fake store per kind.
#[derive(Clone)]
pub struct FakeCluster {
    pub statefulsets: Arc<FakeStore<StatefulSet>>,
    pub jobs: Arc<FakeStore<Job>>,
    pub secrets: Arc<FakeStore<Secret>>,
    pub pdbs: Arc<FakeStore<PodDisruptionBudget>>,
    pub pods: Arc<FakeStore<Pod>>,
    pub events: Arc<FakeStore<Event>>,
    pub lrps: Arc<FakeStore<LrpResource>>,
    pub tasks: Arc<FakeStore<TaskResource>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self {
            statefulsets: FakeStore::new(),
            jobs: FakeStore::new(),
            secrets: FakeStore::new(),
            pdbs: FakeStore::new(),
            pods: FakeStore::new(),
            events: FakeStore::new(),
            lrps: FakeStore::new(),
            tasks: FakeStore::new(),
        }
    }
}

impl FakeCluster {
    pub fn new() -> Self { Self::default() }
}
