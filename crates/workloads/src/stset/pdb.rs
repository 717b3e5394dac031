use capstan_core::{CapstanResult, Lrp, WorkloadDescriptor};
use capstan_kubehub::PodDisruptionBudgetClient;
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use crate::APP_CONTAINER_NAME;

/// Budget keeping all but one instance up, named after the stateful set.
/// `None` below two instances.
pub fn pod_disruption_budget(name: &str, lrp: &Lrp) -> CapstanResult<Option<PodDisruptionBudget>> {
    if lrp.target_instances < 2 {
        return Ok(None);
    }
    let desc = WorkloadDescriptor::for_lrp(lrp, APP_CONTAINER_NAME);
    Ok(Some(PodDisruptionBudget {
        metadata: ObjectMeta { name: Some(name.to_string()), labels: Some(desc.labels()), ..Default::default() },
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(lrp.target_instances - 1)),
            selector: Some(LabelSelector { match_labels: Some(desc.selector()?.into_map()), ..Default::default() }),
            ..Default::default()
        }),
        status: None,
    }))
}

pub(crate) async fn create_pdb(
    client: &dyn PodDisruptionBudgetClient,
    namespace: &str,
    name: &str,
    lrp: &Lrp,
) -> CapstanResult<()> {
    let Some(pdb) = pod_disruption_budget(name, lrp)? else {
        return Ok(());
    };
    match client.create(namespace, &pdb).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_already_exists() => {
            debug!(%namespace, %name, "pod disruption budget already exists");
            Ok(())
        }
        Err(e) => Err(e.context("failed to create pod disruption budget")),
    }
}

pub(crate) async fn delete_pdb(client: &dyn PodDisruptionBudgetClient, namespace: &str, name: &str) -> CapstanResult<()> {
    match client.delete(namespace, name).await {
        Err(e) if !e.is_not_found() => Err(e.context("failed to delete pod disruption budget")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::WorkloadIdentity;

    fn lrp(instances: i32) -> Lrp {
        Lrp { identity: WorkloadIdentity::new("g", "v"), target_instances: instances, ..Default::default() }
    }

    #[test]
    fn budget_only_from_two_instances() {
        assert!(pod_disruption_budget("n", &lrp(0)).unwrap().is_none());
        assert!(pod_disruption_budget("n", &lrp(1)).unwrap().is_none());

        let pdb = pod_disruption_budget("n", &lrp(5)).unwrap().unwrap();
        let spec = pdb.spec.unwrap();
        assert_eq!(spec.min_available, Some(IntOrString::Int(4)));
        assert_eq!(spec.selector.unwrap().match_labels.unwrap().len(), 3);
    }
}
