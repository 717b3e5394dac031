use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use capstan_core::{Instance, Lrp, WorkloadIdentity};
use capstan_workloads::stset::{LrpDesirer, LrpGetter, LrpStopper, LrpUpdater};
use tracing::info;

use crate::{ApiResult, LrpApi};

/// In-process implementation backed by the stateful set workloads.
pub struct LrpService {
    desirer: Arc<LrpDesirer>,
    getter: Arc<LrpGetter>,
    updater: Arc<LrpUpdater>,
    stopper: Arc<LrpStopper>,
}

impl LrpService {
    pub fn new(
        desirer: Arc<LrpDesirer>,
        getter: Arc<LrpGetter>,
        updater: Arc<LrpUpdater>,
        stopper: Arc<LrpStopper>,
    ) -> Self {
        Self { desirer, getter, updater, stopper }
    }
}

#[async_trait]
impl LrpApi for LrpService {
    async fn desire(&self, namespace: &str, lrp: &Lrp) -> ApiResult<()> {
        let t0 = Instant::now();
        self.desirer.desire(namespace, lrp, &[]).await?;
        info!(guid = %lrp.identity.guid, version = %lrp.identity.version, %namespace, took_ms = %t0.elapsed().as_millis(), "api: lrp desire ok");
        Ok(())
    }

    async fn get(&self, id: &WorkloadIdentity) -> ApiResult<Lrp> { Ok(self.getter.get(id).await?) }

    async fn get_instances(&self, id: &WorkloadIdentity) -> ApiResult<Vec<Instance>> {
        Ok(self.getter.get_instances(id).await?)
    }

    async fn list(&self) -> ApiResult<Vec<Lrp>> {
        let t0 = Instant::now();
        let lrps = self.getter.list().await?;
        info!(count = lrps.len(), took_ms = %t0.elapsed().as_millis(), "api: lrp list ok");
        Ok(lrps)
    }

    async fn update(&self, lrp: &Lrp) -> ApiResult<()> {
        self.updater.update(lrp).await?;
        info!(guid = %lrp.identity.guid, version = %lrp.identity.version, instances = lrp.target_instances, "api: lrp update ok");
        Ok(())
    }

    async fn stop(&self, id: &WorkloadIdentity) -> ApiResult<()> {
        self.stopper.stop(id).await?;
        info!(guid = %id.guid, version = %id.version, "api: lrp stop ok");
        Ok(())
    }

    async fn stop_instance(&self, id: &WorkloadIdentity, index: u32) -> ApiResult<()> {
        self.stopper.stop_instance(id, index).await?;
        info!(guid = %id.guid, version = %id.version, index, "api: lrp stop instance ok");
        Ok(())
    }
}
