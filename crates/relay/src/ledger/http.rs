//! HTTP transport adapter for a signing gateway.
//!
//! No endpoint path is assumed: both paths come from [`LedgerHttpConfig`].
//! The status path must contain the `{handle}` token.

use super::{
    LedgerSubmitter, Submission, SubmissionError, SubmitRequest, TxHandle, WatchEvent, WatchStream,
};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerHttpConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub endpoints: LedgerEndpoints,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

/// Endpoint paths, not full URLs (e.g. `"/tx"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEndpoints {
    pub submit: String,
    /// Supports `{handle}`.
    pub status: String,
}

impl LedgerHttpConfig {
    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.base_url.trim().is_empty() {
            return Err(SubmissionError::Protocol("ledger.base_url is empty".into()));
        }
        if self.endpoints.submit.trim().is_empty() {
            return Err(SubmissionError::Protocol(
                "missing ledger.endpoints.submit".into(),
            ));
        }
        if !self.endpoints.status.contains("{handle}") {
            return Err(SubmissionError::Protocol(
                "ledger.endpoints.status must contain {handle}".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpLedgerSubmitter {
    cfg: LedgerHttpConfig,
    client: Client,
}

impl HttpLedgerSubmitter {
    pub fn new(cfg: LedgerHttpConfig) -> Result<Self, SubmissionError> {
        cfg.validate()?;
        let timeout = Duration::from_millis(cfg.timeout_ms.unwrap_or(10_000));
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SubmissionError::Protocol(format!("failed to build http client: {e}")))?;
        Ok(Self { cfg, client })
    }

    fn join_url(&self, path: &str) -> String {
        let base = self.cfg.base_url.trim_end_matches('/');
        let path = path.trim_start_matches('/');
        format!("{base}/{path}")
    }

    fn status_url(&self, handle: &TxHandle) -> String {
        self.join_url(&self.cfg.endpoints.status.replace("{handle}", handle.as_str()))
    }

    fn auth(&self, req: RequestBuilder) -> RequestBuilder {
        with_api_key(req, self.cfg.api_key.as_deref())
    }
}

fn with_api_key(req: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key.map(str::trim).filter(|s| !s.is_empty()) {
        Some(key) => req.header("Authorization", key),
        None => req,
    }
}

async fn fetch_status(
    client: &Client,
    url: &str,
    api_key: Option<&str>,
) -> Result<WatchEvent, SubmissionError> {
    let resp = with_api_key(client.get(url), api_key)
        .send()
        .await
        .map_err(|e| SubmissionError::Network(e.to_string()))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| SubmissionError::Network(e.to_string()))?;
    classify_status(status, &body)
}

/// Maps a submit response onto a submission or the error it represents.
///
/// `422` is the gateway refusing the transaction, `5xx` is retryable and any
/// other non-success status is a protocol error.
fn classify_submit(status: StatusCode, body: &str) -> Result<Submission, SubmissionError> {
    if status == StatusCode::UNPROCESSABLE_ENTITY {
        return Err(SubmissionError::Rejected(body.trim().to_string()));
    }
    if status.is_server_error() {
        return Err(SubmissionError::Network(format!("http status {status}")));
    }
    if !status.is_success() {
        return Err(SubmissionError::Protocol(format!("http status {status}")));
    }
    serde_json::from_str(body).map_err(|e| SubmissionError::Protocol(e.to_string()))
}

fn classify_status(status: StatusCode, body: &str) -> Result<WatchEvent, SubmissionError> {
    if status.is_server_error() {
        return Err(SubmissionError::Network(format!("http status {status}")));
    }
    if !status.is_success() {
        return Err(SubmissionError::Protocol(format!("http status {status}")));
    }
    serde_json::from_str(body).map_err(|e| SubmissionError::Protocol(e.to_string()))
}

/// Polls `fetch` every `poll` until it yields a final event or an error.
fn poll_until_final<F, Fut>(poll: Duration, fetch: F) -> WatchStream
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<WatchEvent, SubmissionError>> + Send + 'static,
{
    stream::unfold((fetch, false, true), move |(fetch, done, first)| async move {
        if done {
            return None;
        }
        if !first {
            tokio::time::sleep(poll).await;
        }
        match fetch().await {
            Ok(event) => {
                let finished = event.is_final();
                Some((Ok(event), (fetch, finished, false)))
            }
            Err(err) => Some((Err(err), (fetch, true, false))),
        }
    })
    .boxed()
}

#[async_trait]
impl LedgerSubmitter for HttpLedgerSubmitter {
    async fn submit(&self, request: &SubmitRequest) -> Result<Submission, SubmissionError> {
        let url = self.join_url(&self.cfg.endpoints.submit);
        let resp = self
            .auth(self.client.post(url).json(request))
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .send()
            .await
            .map_err(|e| SubmissionError::Network(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| SubmissionError::Network(e.to_string()))?;
        classify_submit(status, &body)
    }

    fn watch(&self, handle: &TxHandle) -> WatchStream {
        let client = self.client.clone();
        let url = self.status_url(handle);
        let api_key = self.cfg.api_key.clone();
        let poll = Duration::from_millis(self.cfg.poll_interval_ms.max(1));

        poll_until_final(poll, move || {
            let client = client.clone();
            let url = url.clone();
            let api_key = api_key.clone();
            async move { fetch_status(&client, &url, api_key.as_deref()).await }
        })
    }
}
