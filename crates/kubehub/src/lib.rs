//! Capstan kubehub: the only crate that talks to the Kubernetes API.
//!
//! Callers never see a full `kube::Client`; they get one narrow capability
//! trait per resource kind ([`capability`]) with a kube-rs backed
//! implementation in [`KubeClient`] and in-memory fakes in `testing`.

#![forbid(unsafe_code)]

use std::fmt::Display;

use anyhow::Result;
use capstan_core::CapstanError;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use tracing::info;

pub mod capability;
pub mod client;
pub mod crd;
pub mod watch;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use capability::{
    CustomResourceClient, EventClient, EventFilter, JobClient, PodClient, PodDisruptionBudgetClient, SecretClient,
    StatefulSetClient,
};
pub use client::{KubeClient, KubeObject};
pub use crd::{LrpResource, LrpSpec, TaskResource, TaskSpec};
pub use watch::{watch, WatchEvent};

/// Map a kube-rs error onto the capstan taxonomy. This is the single place
/// where API status codes are interpreted.
pub fn classify(err: kube::Error, ctx: impl Display) -> CapstanError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => CapstanError::NotFound(format!("{ctx}: {}", resp.message)),
        kube::Error::Api(resp) if resp.reason == "AlreadyExists" => {
            CapstanError::AlreadyExists(format!("{ctx}: {}", resp.message))
        }
        _ => CapstanError::Transient(format!("{ctx}: {err}")),
    }
}

/// Cascade-managed objects carry an owner reference and are removed by
/// garbage collection, never deleted directly.
pub fn is_owned(meta: &ObjectMeta) -> bool {
    meta.owner_references.as_ref().is_some_and(|refs| !refs.is_empty())
}

/// Client from the ambient kubeconfig or in-cluster service account.
pub async fn get_kube_client() -> Result<Client> {
    let client = Client::try_default().await?;
    info!(default_namespace = %client.default_namespace(), "kube client ready");
    Ok(client)
}
