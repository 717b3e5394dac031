//! LRPs as stateful sets.

use capstan_core::{CapstanError, CapstanResult, Selector, SourceType, WorkloadIdentity};
use capstan_kubehub::StatefulSetClient;
use k8s_openapi::api::apps::v1::StatefulSet;

mod desire;
mod get;
mod mapping;
mod pdb;
mod pod_state;
mod stop;
mod update;

pub use desire::LrpDesirer;
pub use get::LrpGetter;
pub use mapping::{statefulset_to_lrp, LrpToStatefulSet, StatefulSetMapper};
pub use pdb::pod_disruption_budget;
pub use pod_state::pod_state;
pub use stop::LrpStopper;
pub use update::LrpUpdater;

/// The single stateful set labelled with `id`. Zero is `NotFound`, more than
/// one is a `Consistency` error.
pub(crate) async fn find_statefulset(
    client: &dyn StatefulSetClient,
    namespace: Option<&str>,
    id: &WorkloadIdentity,
) -> CapstanResult<StatefulSet> {
    let selector = Selector::for_identity(id, SourceType::App);
    let mut found = client
        .list(namespace, &selector)
        .await
        .map_err(|e| e.context("failed to list statefulsets"))?;
    match found.len() {
        0 => Err(CapstanError::not_found(format!("no statefulset for lrp {id}"))),
        1 => Ok(found.remove(0)),
        n => Err(CapstanError::consistency(format!("multiple statefulsets ({n}) found for lrp {id}"))),
    }
}
