use std::sync::Arc;

use capstan_core::{CapstanResult, Lrp, WorkloadDescriptor};
use capstan_kubehub::{PodDisruptionBudgetClient, StatefulSetClient};
use kube::ResourceExt;
use tracing::info;

use super::find_statefulset;
use super::pdb::{create_pdb, delete_pdb};
use crate::APP_CONTAINER_NAME;

/// Converges an existing stateful set on a re-desired LRP.
pub struct LrpUpdater {
    namespace: Option<String>,
    statefulsets: Arc<dyn StatefulSetClient>,
    pdbs: Arc<dyn PodDisruptionBudgetClient>,
}

impl LrpUpdater {
    pub fn new(
        namespace: Option<String>,
        statefulsets: Arc<dyn StatefulSetClient>,
        pdbs: Arc<dyn PodDisruptionBudgetClient>,
    ) -> Self {
        Self { namespace, statefulsets, pdbs }
    }

    /// Replicas, image, registered routes and last-updated follow `lrp`. The
    /// disruption budget is rebuilt when the instance count changed and is
    /// created if missing otherwise.
    /// `NotFound` when no stateful set exists yet.
    pub async fn update(&self, lrp: &Lrp) -> CapstanResult<()> {
        let id = &lrp.identity;
        let mut sts = find_statefulset(self.statefulsets.as_ref(), self.namespace.as_deref(), id).await?;
        let namespace = sts.namespace().unwrap_or_default();
        let name = sts.name_any();

        let mut desc = WorkloadDescriptor::from_metadata(sts.metadata.labels.as_ref(), sts.metadata.annotations.as_ref())?;
        desc.registered_routes = lrp.routes.clone();
        desc.last_updated = lrp.last_updated.clone();
        sts.metadata.annotations.get_or_insert_with(Default::default).extend(desc.annotations()?);

        let container_name = if desc.container_name.is_empty() { APP_CONTAINER_NAME } else { desc.container_name.as_str() };
        let mut previous_replicas = None;
        if let Some(spec) = sts.spec.as_mut() {
            previous_replicas = spec.replicas;
            spec.replicas = Some(lrp.target_instances);
            let containers = spec.template.spec.iter_mut().flat_map(|p| p.containers.iter_mut());
            for container in containers.filter(|c| c.name == container_name) {
                container.image = Some(lrp.image.clone());
            }
        }

        self.statefulsets
            .update(&namespace, &sts)
            .await
            .map_err(|e| e.context("failed to update statefulset"))?;
        info!(guid = %id.guid, version = %id.version, %namespace, replicas = lrp.target_instances, "statefulset updated");

        if previous_replicas != Some(lrp.target_instances) || lrp.target_instances < 2 {
            delete_pdb(self.pdbs.as_ref(), &namespace, &name).await?;
        }
        create_pdb(self.pdbs.as_ref(), &namespace, &name, lrp).await
    }
}
