//! Capstan control loops.
//!
//! Watch notifications become [`ObjectKey`]s or [`PodTransition`]s on a
//! [`WorkQueue`]; workers hand them to one [`Reconciler`] per kind.

#![forbid(unsafe_code)]

use std::fmt;

use kube::ResourceExt;

pub mod callback;
pub mod completion;
pub mod crash;
pub mod pod_crash;
pub mod queue;
pub mod report;
pub mod routes;
pub mod workload;

pub use callback::CallbackClient;
pub use completion::TaskCompletionReconciler;
pub use crash::{detect_crash, Clock, CrashEvents, CrashOutcome, CrashReport, SystemClock};
pub use pod_crash::{PodCrashReconciler, PodTransition};
pub use queue::{spawn_workers, Backoff, QueueItem, Reconciler, WorkQueue};
pub use report::CcCrashReporter;
pub use routes::{ChannelRouteEmitter, RouteEmitter, RouteMessage};
pub use workload::{LrpReconciler, TaskReconciler};

/// Namespace and name of the object a notification was about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn of<K: ResourceExt>(obj: &K) -> Self { Self::new(obj.namespace().unwrap_or_default(), obj.name_any()) }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}/{}", self.namespace, self.name) }
}

impl QueueItem for ObjectKey {
    type Key = ObjectKey;

    fn key(&self) -> Self::Key { self.clone() }
}
