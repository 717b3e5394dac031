use std::time::Duration;

use capstan_core::{CapstanError, CapstanResult};
use serde::Serialize;
use tracing::debug;

/// JSON-over-HTTP client for completion callbacks and crash reports.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    http: reqwest::Client,
}

impl CallbackClient {
    pub fn new(timeout: Duration) -> CapstanResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CapstanError::validation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    /// POST `body` to `url`. Transport failures are transient; a non-2xx
    /// answer is a protocol error carrying status and body.
    pub async fn post_json<B: Serialize + ?Sized + Sync>(&self, url: &str, body: &B) -> CapstanResult<()> {
        let resp = self
            .http
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| CapstanError::transient(format!("failed to send request to {url}: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            debug!(%url, status = status.as_u16(), "callback delivered");
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(CapstanError::Protocol(format!("request not successful: status={} {text}", status.as_u16())))
    }
}
