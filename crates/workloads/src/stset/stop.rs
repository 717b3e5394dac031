use std::sync::Arc;

use capstan_core::naming::registry_credentials_secret_name;
use capstan_core::{CapstanError, CapstanResult, WorkloadIdentity};
use capstan_kubehub::{is_owned, PodClient, PodDisruptionBudgetClient, SecretClient, StatefulSetClient};
use kube::ResourceExt;
use tracing::{debug, info};

use super::find_statefulset;
use super::pdb::delete_pdb;

pub struct LrpStopper {
    namespace: Option<String>,
    statefulsets: Arc<dyn StatefulSetClient>,
    pdbs: Arc<dyn PodDisruptionBudgetClient>,
    secrets: Arc<dyn SecretClient>,
    pods: Arc<dyn PodClient>,
}

impl LrpStopper {
    pub fn new(
        namespace: Option<String>,
        statefulsets: Arc<dyn StatefulSetClient>,
        pdbs: Arc<dyn PodDisruptionBudgetClient>,
        secrets: Arc<dyn SecretClient>,
        pods: Arc<dyn PodClient>,
    ) -> Self {
        Self { namespace, statefulsets, pdbs, secrets, pods }
    }

    /// Remove the auxiliary objects, then the stateful set unless a custom
    /// resource owns it.
    pub async fn stop(&self, id: &WorkloadIdentity) -> CapstanResult<()> {
        let sts = find_statefulset(self.statefulsets.as_ref(), self.namespace.as_deref(), id).await?;
        let namespace = sts.namespace().unwrap_or_default();
        let name = sts.name_any();

        delete_pdb(self.pdbs.as_ref(), &namespace, &name).await?;
        match self.secrets.delete(&namespace, &registry_credentials_secret_name(&name)).await {
            Err(e) if !e.is_not_found() => return Err(e.context("failed to delete registry credentials secret")),
            _ => {}
        }

        if is_owned(&sts.metadata) {
            debug!(guid = %id.guid, version = %id.version, "statefulset is owned, leaving it to garbage collection");
            return Ok(());
        }
        match self.statefulsets.delete(&namespace, &name).await {
            Err(e) if !e.is_not_found() => Err(e.context("failed to delete statefulset")),
            _ => {
                info!(guid = %id.guid, version = %id.version, %namespace, %name, "statefulset deleted");
                Ok(())
            }
        }
    }

    /// Delete the pod backing instance `index`; the stateful set recreates it.
    pub async fn stop_instance(&self, id: &WorkloadIdentity, index: u32) -> CapstanResult<()> {
        let sts = find_statefulset(self.statefulsets.as_ref(), self.namespace.as_deref(), id).await?;
        let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        if i64::from(index) >= i64::from(replicas) {
            return Err(CapstanError::validation(format!("no instance {index} for lrp {id} ({replicas} instances)")));
        }
        let namespace = sts.namespace().unwrap_or_default();
        let pod = format!("{}-{index}", sts.name_any());
        match self.pods.delete(&namespace, &pod).await {
            Err(e) if !e.is_not_found() => Err(e.context(format!("failed to delete pod {pod}"))),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stset::{LrpDesirer, StatefulSetMapper};
    use crate::with_owner_reference;
    use capstan_core::naming::statefulset_name;
    use capstan_core::{Lrp, PrivateRegistry};
    use capstan_kubehub::testing::{FakeCluster, Op};
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn lrp() -> Lrp {
        Lrp {
            identity: WorkloadIdentity::new("guid", "v1"),
            app_name: "app".into(),
            space_name: "space".into(),
            target_instances: 2,
            private_registry: Some(PrivateRegistry { server: "h".into(), username: "u".into(), password: "p".into() }),
            ..Default::default()
        }
    }

    async fn desired(cluster: &FakeCluster, owned: bool) {
        let d = LrpDesirer::new(
            cluster.secrets.clone(),
            cluster.statefulsets.clone(),
            cluster.pdbs.clone(),
            Arc::new(StatefulSetMapper::default()),
        );
        let owner = OwnerReference { kind: "LRP".into(), name: "l".into(), uid: "u".into(), ..Default::default() };
        let own = with_owner_reference::<StatefulSet>(owner);
        if owned {
            d.desire("ns", &lrp(), &[&own]).await.unwrap();
        } else {
            d.desire("ns", &lrp(), &[]).await.unwrap();
        }
    }

    fn stopper(cluster: &FakeCluster) -> LrpStopper {
        LrpStopper::new(
            None,
            cluster.statefulsets.clone(),
            cluster.pdbs.clone(),
            cluster.secrets.clone(),
            cluster.pods.clone(),
        )
    }

    #[tokio::test]
    async fn stop_removes_everything_when_unowned() {
        let cluster = FakeCluster::new();
        desired(&cluster, false).await;
        stopper(&cluster).stop(&lrp().identity).await.unwrap();
        assert!(cluster.statefulsets.is_empty());
        assert!(cluster.pdbs.is_empty());
        assert!(cluster.secrets.is_empty());
    }

    #[tokio::test]
    async fn stop_leaves_owned_statefulset_to_gc() {
        let cluster = FakeCluster::new();
        desired(&cluster, true).await;
        stopper(&cluster).stop(&lrp().identity).await.unwrap();
        assert_eq!(cluster.statefulsets.len(), 1);
        assert_eq!(cluster.statefulsets.count(Op::Delete), 0);
        assert!(cluster.pdbs.is_empty());
    }

    #[tokio::test]
    async fn stop_instance_checks_the_index() {
        let cluster = FakeCluster::new();
        desired(&cluster, false).await;
        let s = stopper(&cluster);
        assert!(matches!(s.stop_instance(&lrp().identity, 2).await, Err(CapstanError::Validation(_))));

        s.stop_instance(&lrp().identity, 1).await.unwrap();
        let expected = format!("{}-1", statefulset_name(&lrp()).unwrap());
        assert_eq!(cluster.pods.names(Op::Delete), vec![expected]);
    }
}
