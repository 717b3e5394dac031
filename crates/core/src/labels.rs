//! Typed label/annotation codec.
//!
//! Correlation between a workload and the objects created for it travels
//! through labels (selectable) and annotations (opaque). Nothing outside this
//! module reads those maps by key; callers go through [`WorkloadDescriptor`]
//! and [`Selector`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CapstanError, CapstanResult, Lrp, Route, Task, WorkloadIdentity};

pub const PREFIX: &str = "workloads.capstan.dev/";

pub const LABEL_GUID: &str = "workloads.capstan.dev/guid";
pub const LABEL_VERSION: &str = "workloads.capstan.dev/version";
pub const LABEL_SOURCE_TYPE: &str = "workloads.capstan.dev/source-type";
pub const LABEL_APP_GUID: &str = "workloads.capstan.dev/app-guid";
pub const LABEL_PROCESS_TYPE: &str = "workloads.capstan.dev/process-type";
pub const LABEL_INSTANCE_INDEX: &str = "workloads.capstan.dev/instance-index";

pub const ANNOTATION_PROCESS_GUID: &str = "workloads.capstan.dev/process-guid";
pub const ANNOTATION_APP_NAME: &str = "workloads.capstan.dev/app-name";
pub const ANNOTATION_SPACE_NAME: &str = "workloads.capstan.dev/space-name";
pub const ANNOTATION_SPACE_GUID: &str = "workloads.capstan.dev/space-guid";
pub const ANNOTATION_ORG_NAME: &str = "workloads.capstan.dev/org-name";
pub const ANNOTATION_ORG_GUID: &str = "workloads.capstan.dev/org-guid";
pub const ANNOTATION_REGISTERED_ROUTES: &str = "workloads.capstan.dev/registered-routes";
pub const ANNOTATION_COMPLETION_CALLBACK: &str = "workloads.capstan.dev/completion-callback";
pub const ANNOTATION_TASK_NAME: &str = "workloads.capstan.dev/task-name";
pub const ANNOTATION_CONTAINER_NAME: &str = "workloads.capstan.dev/container-name";
pub const ANNOTATION_LAST_UPDATED: &str = "workloads.capstan.dev/last-updated";
pub const ANNOTATION_ORIGINAL_REQUEST: &str = "workloads.capstan.dev/original-request";
pub const ANNOTATION_CRASH_FINGERPRINT: &str = "workloads.capstan.dev/crash-fingerprint";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    #[serde(rename = "APP")]
    App,
    #[serde(rename = "TASK")]
    Task,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::App => "APP",
            Self::Task => "TASK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "APP" => Some(Self::App),
            "TASK" => Some(Self::Task),
            _ => None,
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Equality label selector. Serializes to the `k=v,k2=v2` query form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector(BTreeMap<String, String>);

impl Selector {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn source_type(source: SourceType) -> Self { Self::new().with(LABEL_SOURCE_TYPE, source.as_str()) }

    /// Objects of `source` carrying `id`. An empty version is left out so
    /// version-less task identities select on guid alone.
    pub fn for_identity(id: &WorkloadIdentity, source: SourceType) -> Self {
        let sel = Self::source_type(source).with(LABEL_GUID, &id.guid);
        if id.version.is_empty() { sel } else { sel.with(LABEL_VERSION, &id.version) }
    }

    pub fn to_query(&self) -> String {
        self.0.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
    }

    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.0.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> { &self.0 }

    pub fn into_map(self) -> BTreeMap<String, String> { self.0 }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.to_query()) }
}

/// Everything a workload leaves on its stateful set, job or pods.
///
/// `labels()` + `annotations()` followed by `from_metadata()` yields the same
/// descriptor; empty strings are simply not written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    pub identity: WorkloadIdentity,
    pub source_type: Option<SourceType>,
    pub app_guid: String,
    pub process_type: String,
    pub app_name: String,
    pub space_name: String,
    pub space_guid: String,
    pub org_name: String,
    pub org_guid: String,
    pub registered_routes: Vec<Route>,
    pub task_name: String,
    pub completion_callback: String,
    pub container_name: String,
    pub last_updated: String,
    pub original_request: String,
}

impl WorkloadDescriptor {
    pub fn for_lrp(lrp: &Lrp, container_name: &str) -> Self {
        Self {
            identity: lrp.identity.clone(),
            source_type: Some(SourceType::App),
            app_guid: lrp.app_guid.clone(),
            process_type: lrp.process_type.clone(),
            app_name: lrp.app_name.clone(),
            space_name: lrp.space_name.clone(),
            space_guid: lrp.space_guid.clone(),
            org_name: lrp.org_name.clone(),
            org_guid: lrp.org_guid.clone(),
            registered_routes: lrp.routes.clone(),
            task_name: String::new(),
            completion_callback: String::new(),
            container_name: container_name.to_string(),
            last_updated: lrp.last_updated.clone(),
            original_request: lrp.original_request.clone(),
        }
    }

    pub fn for_task(task: &Task, container_name: &str) -> Self {
        Self {
            identity: task.identity.clone(),
            source_type: Some(SourceType::Task),
            app_guid: task.app_guid.clone(),
            process_type: String::new(),
            app_name: task.app_name.clone(),
            space_name: task.space_name.clone(),
            space_guid: task.space_guid.clone(),
            org_name: task.org_name.clone(),
            org_guid: task.org_guid.clone(),
            registered_routes: Vec::new(),
            task_name: task.name.clone(),
            completion_callback: task.completion_callback.clone(),
            container_name: container_name.to_string(),
            last_updated: String::new(),
            original_request: String::new(),
        }
    }

    pub fn selector(&self) -> CapstanResult<Selector> {
        let source = self
            .source_type
            .ok_or_else(|| CapstanError::validation(format!("workload {} has no source type", self.identity)))?;
        Ok(Selector::for_identity(&self.identity, source))
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        put(&mut out, LABEL_GUID, &self.identity.guid);
        put(&mut out, LABEL_VERSION, &self.identity.version);
        if let Some(source) = self.source_type {
            put(&mut out, LABEL_SOURCE_TYPE, source.as_str());
        }
        put(&mut out, LABEL_APP_GUID, &self.app_guid);
        put(&mut out, LABEL_PROCESS_TYPE, &self.process_type);
        out
    }

    pub fn annotations(&self) -> CapstanResult<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        if !self.identity.version.is_empty() {
            put(&mut out, ANNOTATION_PROCESS_GUID, &self.identity.process_guid());
        }
        put(&mut out, ANNOTATION_APP_NAME, &self.app_name);
        put(&mut out, ANNOTATION_SPACE_NAME, &self.space_name);
        put(&mut out, ANNOTATION_SPACE_GUID, &self.space_guid);
        put(&mut out, ANNOTATION_ORG_NAME, &self.org_name);
        put(&mut out, ANNOTATION_ORG_GUID, &self.org_guid);
        if self.source_type == Some(SourceType::App) {
            out.insert(ANNOTATION_REGISTERED_ROUTES.to_string(), encode_routes(&self.registered_routes)?);
        }
        put(&mut out, ANNOTATION_TASK_NAME, &self.task_name);
        put(&mut out, ANNOTATION_COMPLETION_CALLBACK, &self.completion_callback);
        put(&mut out, ANNOTATION_CONTAINER_NAME, &self.container_name);
        put(&mut out, ANNOTATION_LAST_UPDATED, &self.last_updated);
        put(&mut out, ANNOTATION_ORIGINAL_REQUEST, &self.original_request);
        Ok(out)
    }

    /// Decode from object metadata. A missing guid label means the object was
    /// not created by us and is a validation error.
    pub fn from_metadata(
        labels: Option<&BTreeMap<String, String>>,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> CapstanResult<Self> {
        let label = |k: &str| labels.and_then(|m| m.get(k)).cloned().unwrap_or_default();
        let annotation = |k: &str| annotations.and_then(|m| m.get(k)).cloned().unwrap_or_default();

        let guid = label(LABEL_GUID);
        if guid.is_empty() {
            return Err(CapstanError::validation("object carries no workload guid label"));
        }
        let registered_routes = match annotations.and_then(|m| m.get(ANNOTATION_REGISTERED_ROUTES)) {
            Some(raw) if !raw.is_empty() => decode_routes(raw)?,
            _ => Vec::new(),
        };

        Ok(Self {
            identity: WorkloadIdentity::new(guid, label(LABEL_VERSION)),
            source_type: SourceType::parse(&label(LABEL_SOURCE_TYPE)),
            app_guid: label(LABEL_APP_GUID),
            process_type: label(LABEL_PROCESS_TYPE),
            app_name: annotation(ANNOTATION_APP_NAME),
            space_name: annotation(ANNOTATION_SPACE_NAME),
            space_guid: annotation(ANNOTATION_SPACE_GUID),
            org_name: annotation(ANNOTATION_ORG_NAME),
            org_guid: annotation(ANNOTATION_ORG_GUID),
            registered_routes,
            task_name: annotation(ANNOTATION_TASK_NAME),
            completion_callback: annotation(ANNOTATION_COMPLETION_CALLBACK),
            container_name: annotation(ANNOTATION_CONTAINER_NAME),
            last_updated: annotation(ANNOTATION_LAST_UPDATED),
            original_request: annotation(ANNOTATION_ORIGINAL_REQUEST),
        })
    }
}

fn put(map: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if !value.is_empty() {
        map.insert(key.to_string(), value.to_string());
    }
}

pub fn decode_routes(raw: &str) -> CapstanResult<Vec<Route>> {
    serde_json::from_str(raw).map_err(|e| CapstanError::validation(format!("registered routes annotation: {e}")))
}

pub fn encode_routes(routes: &[Route]) -> CapstanResult<String> { Ok(serde_json::to_string(routes)?) }

/// Annotations a user put on a workload, i.e. everything outside our prefix.
pub fn user_annotations(all: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    all.map(|m| m.iter().filter(|(k, _)| !k.starts_with(PREFIX)).map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

pub fn instance_index_label(index: u32) -> (String, String) { (LABEL_INSTANCE_INDEX.to_string(), index.to_string()) }

/// `true` when `labels` mark an object as one of our workloads of `source`.
pub fn is_source(labels: Option<&BTreeMap<String, String>>, source: SourceType) -> bool {
    Selector::source_type(source).matches(labels)
}
