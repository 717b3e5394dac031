//! Image pull secrets for private registries.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use capstan_core::{CapstanResult, PrivateRegistry};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;

pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
pub const DOCKER_CONFIG_TYPE: &str = "kubernetes.io/dockerconfigjson";

#[derive(Serialize)]
struct DockerConfig<'a> {
    auths: BTreeMap<&'a str, DockerAuth<'a>>,
}

#[derive(Serialize)]
struct DockerAuth<'a> {
    username: &'a str,
    password: &'a str,
    auth: String,
}

/// `{"auths":{server:{username,password,auth}}}` where `auth` is base64 of `user:password`.
pub fn docker_config_json(registry: &PrivateRegistry) -> CapstanResult<String> {
    let auth = STANDARD.encode(format!("{}:{}", registry.username, registry.password));
    let config = DockerConfig {
        auths: BTreeMap::from([(
            registry.server.as_str(),
            DockerAuth { username: &registry.username, password: &registry.password, auth },
        )]),
    };
    Ok(serde_json::to_string(&config)?)
}

pub fn pull_secret(name: &str, labels: BTreeMap<String, String>, registry: &PrivateRegistry) -> CapstanResult<Secret> {
    Ok(Secret {
        metadata: ObjectMeta { name: Some(name.to_string()), labels: Some(labels), ..Default::default() },
        type_: Some(DOCKER_CONFIG_TYPE.to_string()),
        string_data: Some(BTreeMap::from([(DOCKER_CONFIG_KEY.to_string(), docker_config_json(registry)?)])),
        ..Default::default()
    })
}
