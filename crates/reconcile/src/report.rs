use capstan_core::CapstanResult;
use serde::Serialize;

use crate::callback::CallbackClient;
use crate::crash::CrashReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct CrashedRequest<'a> {
    instance: &'a str,
    index: u32,
    reason: &'a str,
    exit_status: i32,
    exit_description: &'a str,
    crash_count: i32,
    crash_timestamp: i64,
}

/// Forwards app crashes to the platform's internal API.
#[derive(Debug, Clone)]
pub struct CcCrashReporter {
    base_url: String,
    client: CallbackClient,
}

impl CcCrashReporter {
    pub fn new(base_url: impl Into<String>, client: CallbackClient) -> Self {
        Self { base_url: base_url.into().trim_end_matches('/').to_string(), client }
    }

    pub fn url(&self, process_guid: &str) -> String {
        format!("{}/internal/v4/apps/{process_guid}/crashed", self.base_url)
    }

    pub async fn report(&self, process_guid: &str, instance: &str, crash: &CrashReport) -> CapstanResult<()> {
        let body = CrashedRequest {
            instance,
            index: crash.index,
            reason: &crash.reason,
            exit_status: crash.exit_code,
            exit_description: &crash.exit_description,
            crash_count: crash.restart_count,
            crash_timestamp: crash.crash_timestamp,
        };
        self.client.post_json(&self.url(process_guid), &body).await
    }
}
