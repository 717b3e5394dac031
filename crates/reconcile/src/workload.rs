//! Custom resource reconcilers: converge an LRP or Task resource onto the
//! stateful set or job it owns.

use std::sync::Arc;

use async_trait::async_trait;
use capstan_core::CapstanResult;
use capstan_kubehub::{CustomResourceClient, LrpResource, TaskResource};
use capstan_workloads::jobs::TaskDesirer;
use capstan_workloads::stset::{LrpDesirer, LrpUpdater};
use capstan_workloads::with_owner_reference;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use tracing::{debug, info};

use crate::queue::Reconciler;
use crate::ObjectKey;

pub struct LrpReconciler {
    lrps: Arc<dyn CustomResourceClient<LrpResource>>,
    desirer: Arc<LrpDesirer>,
    updater: Arc<LrpUpdater>,
}

impl LrpReconciler {
    pub fn new(
        lrps: Arc<dyn CustomResourceClient<LrpResource>>,
        desirer: Arc<LrpDesirer>,
        updater: Arc<LrpUpdater>,
    ) -> Self {
        Self { lrps, desirer, updater }
    }
}

#[async_trait]
impl Reconciler<ObjectKey> for LrpReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> CapstanResult<()> {
        let resource = match self.lrps.get(&key.namespace, &key.name).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                debug!(%key, "lrp no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.context(format!("failed to get lrp {key}"))),
        };
        let lrp = resource.to_lrp();

        match self.updater.update(&lrp).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                let owner = with_owner_reference::<StatefulSet>(resource.owner_reference()?);
                self.desirer
                    .desire(&key.namespace, &lrp, &[&owner])
                    .await
                    .map_err(|e| e.context(format!("failed to desire lrp {key}")))?;
                info!(%key, guid = %lrp.identity.guid, version = %lrp.identity.version, "lrp desired");
                Ok(())
            }
            Err(e) => Err(e.context(format!("failed to update lrp {key}"))),
        }
    }
}

pub struct TaskReconciler {
    tasks: Arc<dyn CustomResourceClient<TaskResource>>,
    desirer: Arc<TaskDesirer>,
}

impl TaskReconciler {
    pub fn new(tasks: Arc<dyn CustomResourceClient<TaskResource>>, desirer: Arc<TaskDesirer>) -> Self {
        Self { tasks, desirer }
    }
}

#[async_trait]
impl Reconciler<ObjectKey> for TaskReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> CapstanResult<()> {
        let resource = match self.tasks.get(&key.namespace, &key.name).await {
            Ok(resource) => resource,
            Err(e) if e.is_not_found() => {
                debug!(%key, "task no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.context(format!("failed to get task {key}"))),
        };
        let task = resource.to_task();
        let owner = with_owner_reference::<Job>(resource.owner_reference()?);
        self.desirer
            .desire(&key.namespace, &task, &[&owner])
            .await
            .map_err(|e| e.context(format!("failed to desire task {key}")))
    }
}
