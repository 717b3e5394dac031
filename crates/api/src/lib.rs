//! Capstan public API façade (in-process).
//!
//! The front door talks to these traits. Errors are reduced to what a caller
//! can act on: not found, rejected input, conflicting state, or anything else.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use capstan_core::{CapstanError, Instance, Lrp, Task, WorkloadIdentity};
use serde::{Deserialize, Serialize};

mod lrp;
mod notifier;
mod task;

pub use lrp::LrpService;
pub use notifier::CancellationNotifier;
pub use task::TaskService;

/// API errors suitable for transport over RPC later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<CapstanError> for ApiError {
    fn from(e: CapstanError) -> Self {
        match e {
            CapstanError::NotFound(m) => Self::NotFound(m),
            CapstanError::Validation(m) => Self::Validation(m),
            CapstanError::AlreadyExists(m) | CapstanError::Consistency(m) => Self::Conflict(m),
            CapstanError::Transient(m) | CapstanError::Protocol(m) => Self::Internal(m),
        }
    }
}

#[async_trait]
pub trait LrpApi: Send + Sync {
    async fn desire(&self, namespace: &str, lrp: &Lrp) -> ApiResult<()>;

    /// LRP as currently deployed, with observed running instances.
    async fn get(&self, id: &WorkloadIdentity) -> ApiResult<Lrp>;

    async fn get_instances(&self, id: &WorkloadIdentity) -> ApiResult<Vec<Instance>>;

    async fn list(&self) -> ApiResult<Vec<Lrp>>;

    /// Instance count, image and routes.
    async fn update(&self, lrp: &Lrp) -> ApiResult<()>;

    async fn stop(&self, id: &WorkloadIdentity) -> ApiResult<()>;

    async fn stop_instance(&self, id: &WorkloadIdentity, index: u32) -> ApiResult<()>;
}

#[async_trait]
pub trait TaskApi: Send + Sync {
    /// Start running `task`.
    async fn transfer(&self, namespace: &str, task: &Task) -> ApiResult<()>;

    async fn get(&self, guid: &str) -> ApiResult<Task>;

    async fn list(&self) -> ApiResult<Vec<Task>>;

    /// Stop the task and tell its callback it was cancelled. Notification
    /// happens in the background and never fails the call.
    async fn cancel(&self, guid: &str) -> ApiResult<()>;
}
