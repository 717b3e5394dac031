//! Route registration messages for LRP instances.

use async_trait::async_trait;
use capstan_core::{CapstanError, CapstanResult, Route};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteMessage {
    pub name: String,
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    pub registered_routes: Vec<String>,
    pub unregistered_routes: Vec<String>,
}

#[async_trait]
pub trait RouteEmitter: Send + Sync {
    async fn emit(&self, message: RouteMessage) -> CapstanResult<()>;
}

/// Hands messages to whoever holds the receiving end.
#[derive(Debug, Clone)]
pub struct ChannelRouteEmitter {
    tx: mpsc::Sender<RouteMessage>,
}

impl ChannelRouteEmitter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<RouteMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RouteEmitter for ChannelRouteEmitter {
    async fn emit(&self, message: RouteMessage) -> CapstanResult<()> {
        self.tx.send(message).await.map_err(|_| CapstanError::transient("route message channel closed"))
    }
}

pub(crate) fn is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

/// One message per route for `pod`. Pods without an IP yield nothing.
pub(crate) fn route_messages(pod: &Pod, name: &str, routes: &[Route], unregister: bool) -> Vec<RouteMessage> {
    let Some(address) = pod.status.as_ref().and_then(|s| s.pod_ip.clone()).filter(|ip| !ip.is_empty()) else {
        if !routes.is_empty() {
            warn!(pod = %pod.name_any(), routes = routes.len(), "pod has no ip, skipping its routes");
        }
        return Vec::new();
    };
    routes
        .iter()
        .map(|route| {
            let hostnames = vec![route.hostname.clone()];
            let (registered_routes, unregistered_routes) =
                if unregister { (Vec::new(), hostnames) } else { (hostnames, Vec::new()) };
            RouteMessage {
                name: name.to_string(),
                instance_id: pod.name_any(),
                address: address.clone(),
                port: route.port,
                registered_routes,
                unregistered_routes,
            }
        })
        .collect()
}
