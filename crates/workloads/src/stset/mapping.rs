use std::collections::BTreeMap;

use capstan_core::labels::user_annotations;
use capstan_core::naming::registry_credentials_secret_name;
use capstan_core::{CapstanResult, Lrp, VolumeMount, WorkloadDescriptor};
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, SecurityContext,
    TCPSocketAction, Volume, VolumeMount as ContainerVolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::{env_map, env_vars, resources, resources_back, MappingConfig, APP_CONTAINER_NAME};

/// Turns an LRP into the stateful set to submit under `name`.
pub trait LrpToStatefulSet: Send + Sync {
    fn to_statefulset(&self, name: &str, lrp: &Lrp) -> CapstanResult<StatefulSet>;
}

impl<F> LrpToStatefulSet for F
where
    F: Fn(&str, &Lrp) -> CapstanResult<StatefulSet> + Send + Sync,
{
    fn to_statefulset(&self, name: &str, lrp: &Lrp) -> CapstanResult<StatefulSet> { self(name, lrp) }
}

#[derive(Debug, Clone, Default)]
pub struct StatefulSetMapper {
    config: MappingConfig,
}

impl StatefulSetMapper {
    pub fn new(config: MappingConfig) -> Self { Self { config } }
}

impl LrpToStatefulSet for StatefulSetMapper {
    fn to_statefulset(&self, name: &str, lrp: &Lrp) -> CapstanResult<StatefulSet> {
        let desc = WorkloadDescriptor::for_lrp(lrp, APP_CONTAINER_NAME);
        let labels = desc.labels();
        let annotations = desc.annotations()?;
        let selector = desc.selector()?.into_map();

        let mut pod_annotations = lrp.user_annotations.clone();
        pod_annotations.extend(annotations.clone());

        let private_secret = lrp.private_registry.as_ref().map(|_| registry_credentials_secret_name(name));

        let container = Container {
            name: APP_CONTAINER_NAME.to_string(),
            image: Some(lrp.image.clone()),
            command: (!lrp.command.is_empty()).then(|| lrp.command.clone()),
            env: env_vars(&lrp.env),
            ports: (!lrp.ports.is_empty()).then(|| {
                lrp.ports.iter().map(|p| ContainerPort { container_port: *p, ..Default::default() }).collect()
            }),
            readiness_probe: lrp.ports.first().map(|port| Probe {
                tcp_socket: Some(TCPSocketAction { port: IntOrString::Int(*port), ..Default::default() }),
                ..Default::default()
            }),
            resources: Some(resources(lrp.memory_mb, lrp.disk_mb, lrp.cpu_weight)),
            volume_mounts: (!lrp.volume_mounts.is_empty()).then(|| {
                lrp.volume_mounts
                    .iter()
                    .map(|m| ContainerVolumeMount {
                        name: m.claim_name.clone(),
                        mount_path: m.mount_path.clone(),
                        ..Default::default()
                    })
                    .collect()
            }),
            security_context: Some(SecurityContext { run_as_non_root: Some(true), ..Default::default() }),
            ..Default::default()
        };

        let volumes = (!lrp.volume_mounts.is_empty()).then(|| {
            lrp.volume_mounts
                .iter()
                .map(|m| Volume {
                    name: m.claim_name.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: m.claim_name.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect()
        });

        Ok(StatefulSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(lrp.target_instances),
                pod_management_policy: Some("Parallel".to_string()),
                selector: LabelSelector { match_labels: Some(selector), ..Default::default() },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(pod_annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes,
                        image_pull_secrets: self.config.pull_secrets(private_secret),
                        service_account_name: self.config.service_account(),
                        automount_service_account_token: Some(self.config.allow_automount_service_account_token),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        })
    }
}

/// Reverse of [`StatefulSetMapper`] for everything the stateful set carries.
/// Registry credentials live in a secret and are not read back.
pub fn statefulset_to_lrp(sts: &StatefulSet) -> CapstanResult<Lrp> {
    let desc = WorkloadDescriptor::from_metadata(sts.metadata.labels.as_ref(), sts.metadata.annotations.as_ref())?;
    let spec = sts.spec.as_ref();
    let template = spec.map(|s| &s.template);
    let pod_spec = template.and_then(|t| t.spec.as_ref());
    let container_name = if desc.container_name.is_empty() { APP_CONTAINER_NAME } else { desc.container_name.as_str() };
    let container = pod_spec.and_then(|p| p.containers.iter().find(|c| c.name == container_name));

    let claims: BTreeMap<&str, &str> = pod_spec
        .and_then(|p| p.volumes.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|v| v.persistent_volume_claim.as_ref().map(|pvc| (v.name.as_str(), pvc.claim_name.as_str())))
        .collect();
    let volume_mounts = container
        .and_then(|c| c.volume_mounts.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|m| {
            claims.get(m.name.as_str()).map(|claim| VolumeMount {
                claim_name: (*claim).to_string(),
                mount_path: m.mount_path.clone(),
            })
        })
        .collect();

    let (memory_mb, disk_mb, cpu_weight) = resources_back(container.and_then(|c| c.resources.as_ref()));

    Ok(Lrp {
        identity: desc.identity,
        process_type: desc.process_type,
        app_guid: desc.app_guid,
        app_name: desc.app_name,
        space_guid: desc.space_guid,
        space_name: desc.space_name,
        org_guid: desc.org_guid,
        org_name: desc.org_name,
        image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
        command: container.and_then(|c| c.command.clone()).unwrap_or_default(),
        env: container.map(env_map).unwrap_or_default(),
        target_instances: spec.and_then(|s| s.replicas).unwrap_or(0),
        running_instances: sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0),
        memory_mb,
        disk_mb,
        cpu_weight,
        ports: container
            .and_then(|c| c.ports.as_ref())
            .map(|ports| ports.iter().map(|p| p.container_port).collect())
            .unwrap_or_default(),
        routes: desc.registered_routes,
        volume_mounts,
        private_registry: None,
        last_updated: desc.last_updated,
        original_request: desc.original_request,
        user_annotations: user_annotations(template.and_then(|t| t.metadata.as_ref()).and_then(|m| m.annotations.as_ref())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_core::labels::{LABEL_GUID, LABEL_SOURCE_TYPE, LABEL_VERSION};
    use capstan_core::{PrivateRegistry, Route, WorkloadIdentity};
    use k8s_openapi::api::apps::v1::StatefulSetStatus;

    fn lrp() -> Lrp {
        Lrp {
            identity: WorkloadIdentity::new("guid_1234", "version_1234"),
            process_type: "web".into(),
            app_guid: "app-guid".into(),
            app_name: "Baldur".into(),
            space_guid: "space-guid".into(),
            space_name: "space-foo".into(),
            org_guid: "org-guid".into(),
            org_name: "org".into(),
            image: "busybox".into(),
            command: vec!["/bin/sh".into(), "-c".into(), "sleep 1".into()],
            env: BTreeMap::from([("PORT".into(), "8080".into())]),
            target_instances: 3,
            memory_mb: 1024,
            disk_mb: 2048,
            cpu_weight: 2,
            ports: vec![8080, 7777],
            routes: vec![Route { hostname: "foo.example.com".into(), port: 8080 }],
            volume_mounts: vec![VolumeMount { claim_name: "claim".into(), mount_path: "/data".into() }],
            last_updated: "123.4".into(),
            original_request: r#"{"a":1}"#.into(),
            user_annotations: BTreeMap::from([("prometheus.io/scrape".into(), "true".into())]),
            ..Default::default()
        }
    }

    fn mapper() -> StatefulSetMapper {
        StatefulSetMapper::new(MappingConfig {
            application_service_account: "eirini".into(),
            registry_secret_name: "registry-secret".into(),
            allow_automount_service_account_token: false,
        })
    }

    #[test]
    fn maps_pod_template_and_selector() {
        let mut with_registry = lrp();
        with_registry.private_registry =
            Some(PrivateRegistry { server: "host".into(), username: "u".into(), password: "p".into() });
        let sts = mapper().to_statefulset("baldur-space-foo-34f869d015", &with_registry).unwrap();
        let spec = sts.spec.unwrap();

        assert_eq!(spec.replicas, Some(3));
        let selector = spec.selector.match_labels.unwrap();
        assert_eq!(selector.len(), 3);
        assert_eq!(selector[LABEL_GUID], "guid_1234");
        assert_eq!(selector[LABEL_VERSION], "version_1234");
        assert_eq!(selector[LABEL_SOURCE_TYPE], "APP");

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("eirini"));
        assert_eq!(pod.automount_service_account_token, Some(false));
        let secrets: Vec<_> = pod.image_pull_secrets.unwrap().into_iter().filter_map(|s| s.name).collect();
        assert_eq!(secrets, vec!["registry-secret", "baldur-space-foo-34f869d015-registry-credentials"]);

        let container = &pod.containers[0];
        assert_eq!(container.name, APP_CONTAINER_NAME);
        let probe_port = container.readiness_probe.as_ref().unwrap().tcp_socket.as_ref().unwrap().port.clone();
        assert_eq!(probe_port, IntOrString::Int(8080));

        let template_annotations = spec.template.metadata.unwrap().annotations.unwrap();
        assert_eq!(template_annotations["prometheus.io/scrape"], "true");
    }

    #[test]
    fn statefulset_maps_back_to_the_same_lrp() {
        let original = lrp();
        let mut sts = mapper().to_statefulset("name", &original).unwrap();
        sts.status = Some(StatefulSetStatus { ready_replicas: Some(2), ..Default::default() });

        let back = statefulset_to_lrp(&sts).unwrap();
        assert_eq!(back.running_instances, 2);
        assert_eq!(Lrp { running_instances: 0, ..back }, original);
    }

    #[test]
    fn foreign_statefulset_does_not_map() {
        assert!(statefulset_to_lrp(&StatefulSet::default()).is_err());
    }
}
