use std::sync::Arc;

use capstan_core::naming::{registry_credentials_secret_name, statefulset_name};
use capstan_core::{CapstanResult, Lrp, WorkloadDescriptor};
use capstan_kubehub::{PodDisruptionBudgetClient, SecretClient, StatefulSetClient};
use k8s_openapi::api::apps::v1::StatefulSet;
use metrics::counter;
use tracing::{debug, error, info};

use super::mapping::LrpToStatefulSet;
use super::pdb::create_pdb;
use crate::options::{apply_options, DesireOption};
use crate::registry::pull_secret;
use crate::APP_CONTAINER_NAME;

pub struct LrpDesirer {
    secrets: Arc<dyn SecretClient>,
    statefulsets: Arc<dyn StatefulSetClient>,
    pdbs: Arc<dyn PodDisruptionBudgetClient>,
    mapper: Arc<dyn LrpToStatefulSet>,
}

impl LrpDesirer {
    pub fn new(
        secrets: Arc<dyn SecretClient>,
        statefulsets: Arc<dyn StatefulSetClient>,
        pdbs: Arc<dyn PodDisruptionBudgetClient>,
        mapper: Arc<dyn LrpToStatefulSet>,
    ) -> Self {
        Self { secrets, statefulsets, pdbs, mapper }
    }

    /// Create the stateful set for `lrp` with its pull secret and disruption
    /// budget. An existing stateful set makes this a no-op.
    pub async fn desire(
        &self,
        namespace: &str,
        lrp: &Lrp,
        opts: &[&dyn DesireOption<StatefulSet>],
    ) -> CapstanResult<()> {
        let result = self.desire_inner(namespace, lrp, opts).await;
        let outcome = match &result {
            Ok(()) => "ok",
            Err(e) => e.kind(),
        };
        counter!("desire_total", 1u64, "kind" => "lrp", "result" => outcome);
        result
    }

    async fn desire_inner(
        &self,
        namespace: &str,
        lrp: &Lrp,
        opts: &[&dyn DesireOption<StatefulSet>],
    ) -> CapstanResult<()> {
        let name = statefulset_name(lrp)?;
        let id = &lrp.identity;

        if let Some(registry) = &lrp.private_registry {
            let labels = WorkloadDescriptor::for_lrp(lrp, APP_CONTAINER_NAME).labels();
            let secret = pull_secret(&registry_credentials_secret_name(&name), labels, registry)?;
            match self.secrets.create(namespace, &secret).await {
                Ok(_) => {}
                Err(e) if e.is_already_exists() => debug!(guid = %id.guid, "registry credentials secret already exists"),
                Err(e) => return Err(e.context("failed to create private registry secret for statefulset")),
            }
        }

        let mut sts = self.mapper.to_statefulset(&name, lrp)?;
        sts.metadata.namespace = Some(namespace.to_string());
        apply_options(&mut sts, opts)?;

        match self.statefulsets.create(namespace, &sts).await {
            Ok(_) => info!(guid = %id.guid, version = %id.version, %namespace, %name, "statefulset created"),
            Err(e) if e.is_already_exists() => {
                debug!(guid = %id.guid, version = %id.version, %namespace, "statefulset already exists");
                return Ok(());
            }
            Err(e) => return Err(e.context("failed to create statefulset")),
        }

        if let Err(e) = create_pdb(self.pdbs.as_ref(), namespace, &name, lrp).await {
            error!(guid = %id.guid, version = %id.version, error = %e, "failed to create pod disruption budget");
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stset::StatefulSetMapper;
    use crate::with_owner_reference;
    use capstan_core::{CapstanError, PrivateRegistry, WorkloadIdentity};
    use capstan_kubehub::testing::{FakeCluster, Op};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn desirer(cluster: &FakeCluster) -> LrpDesirer {
        LrpDesirer::new(
            cluster.secrets.clone(),
            cluster.statefulsets.clone(),
            cluster.pdbs.clone(),
            Arc::new(StatefulSetMapper::default()),
        )
    }

    fn lrp(instances: i32) -> Lrp {
        Lrp {
            identity: WorkloadIdentity::new("guid_1234", "version_1234"),
            app_name: "Baldur".into(),
            space_name: "space-foo".into(),
            target_instances: instances,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn desire_twice_creates_one_statefulset() {
        let cluster = FakeCluster::new();
        let d = desirer(&cluster);
        d.desire("ns", &lrp(3), &[]).await.unwrap();
        d.desire("ns", &lrp(3), &[]).await.unwrap();

        assert_eq!(cluster.statefulsets.len(), 1);
        assert!(cluster.statefulsets.object("ns", "baldur-space-foo-34f869d015").is_some());
        assert_eq!(cluster.pdbs.count(Op::Create), 1);
    }

    #[tokio::test]
    async fn single_instance_gets_no_budget() {
        let cluster = FakeCluster::new();
        desirer(&cluster).desire("ns", &lrp(1), &[]).await.unwrap();
        assert!(cluster.pdbs.is_empty());
        assert!(cluster.secrets.is_empty());
    }

    #[tokio::test]
    async fn private_registry_gets_a_credentials_secret() {
        let cluster = FakeCluster::new();
        let mut l = lrp(1);
        l.private_registry = Some(PrivateRegistry { server: "host".into(), username: "user".into(), password: "password".into() });
        desirer(&cluster).desire("ns", &l, &[]).await.unwrap();

        let secret = cluster.secrets.object("ns", "baldur-space-foo-34f869d015-registry-credentials").unwrap();
        let data = secret.string_data.unwrap();
        assert!(data[".dockerconfigjson"].contains("dXNlcjpwYXNzd29yZA=="));

        desirer(&cluster).desire("ns", &l, &[]).await.unwrap();
        assert_eq!(cluster.secrets.len(), 1);
    }

    #[tokio::test]
    async fn budget_failure_is_surfaced_after_statefulset_exists() {
        let cluster = FakeCluster::new();
        cluster.pdbs.fail_next(Op::Create, CapstanError::transient("boom"));
        let err = desirer(&cluster).desire("ns", &lrp(2), &[]).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("pod disruption budget"));
        assert_eq!(cluster.statefulsets.len(), 1);
    }

    #[tokio::test]
    async fn options_run_before_submission() {
        let cluster = FakeCluster::new();
        let owner = OwnerReference { kind: "LRP".into(), name: "my-lrp".into(), uid: "u".into(), ..Default::default() };
        let own = with_owner_reference::<StatefulSet>(owner);
        desirer(&cluster).desire("ns", &lrp(1), &[&own]).await.unwrap();

        let sts = cluster.statefulsets.objects().pop().unwrap();
        assert_eq!(sts.metadata.owner_references.unwrap()[0].name, "my-lrp");
        assert_eq!(sts.metadata.namespace.as_deref(), Some("ns"));
    }

    #[tokio::test]
    async fn invalid_identity_creates_nothing() {
        let cluster = FakeCluster::new();
        let mut l = lrp(3);
        l.identity.version.clear();
        assert!(matches!(desirer(&cluster).desire("ns", &l, &[]).await, Err(CapstanError::Validation(_))));
        assert!(cluster.statefulsets.calls().is_empty());
    }
}
