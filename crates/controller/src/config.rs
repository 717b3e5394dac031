use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use capstan_reconcile::Backoff;
use capstan_workloads::MappingConfig;
use serde::{Deserialize, Serialize};

/// Controller settings, read from YAML. Every field has a default so an empty
/// file (or no file) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Only manage workloads here; `None` watches every namespace.
    pub workloads_namespace: Option<String>,
    pub application_service_account: String,
    /// Pull secret added to every workload pod.
    pub registry_secret_name: String,
    pub allow_automount_service_account_token: bool,
    pub workers_per_controller: usize,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_secs: u64,
    /// Base URL of the platform's internal API for crash reports.
    pub cc_internal_api: Option<String>,
    pub callback_timeout_secs: u64,
    pub route_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workloads_namespace: None,
            application_service_account: String::new(),
            registry_secret_name: String::new(),
            allow_automount_service_account_token: false,
            workers_per_controller: 2,
            retry_base_delay_ms: 5,
            retry_max_delay_secs: 300,
            cc_internal_api: None,
            callback_timeout_secs: 30,
            route_queue_capacity: 256,
        }
    }
}

impl Config {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.retry_base_delay_ms.max(1)),
            max: Duration::from_secs(self.retry_max_delay_secs.max(1)),
        }
    }

    pub fn callback_timeout(&self) -> Duration { Duration::from_secs(self.callback_timeout_secs.max(1)) }

    pub fn mapping(&self) -> MappingConfig {
        MappingConfig {
            application_service_account: self.application_service_account.clone(),
            registry_secret_name: self.registry_secret_name.clone(),
            allow_automount_service_account_token: self.allow_automount_service_account_token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_all_defaults() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
        assert_eq!(Config::from_yaml("{}").unwrap(), Config::default());
    }

    #[test]
    fn partial_config_keeps_other_defaults() {
        let cfg = Config::from_yaml(
            "workloads_namespace: apps\nregistry_secret_name: registry-creds\ncc_internal_api: https://cc.internal:9023\n",
        )
        .unwrap();
        assert_eq!(cfg.workloads_namespace.as_deref(), Some("apps"));
        assert_eq!(cfg.mapping().registry_secret_name, "registry-creds");
        assert_eq!(cfg.cc_internal_api.as_deref(), Some("https://cc.internal:9023"));
        assert_eq!(cfg.workers_per_controller, 2);
        assert_eq!(cfg.callback_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn backoff_follows_retry_settings() {
        let cfg = Config::from_yaml("retry_base_delay_ms: 100\nretry_max_delay_secs: 10\n").unwrap();
        assert_eq!(cfg.backoff(), Backoff { base: Duration::from_millis(100), max: Duration::from_secs(10) });
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(Config::from_yaml("workers_per_controller: many\n").is_err());
    }

    #[test]
    fn missing_file_is_an_error_with_the_path() {
        let err = Config::load(Some(Path::new("/nonexistent/capstan.yaml"))).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/capstan.yaml"));
    }
}
