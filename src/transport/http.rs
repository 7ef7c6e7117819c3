use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{decode_sse, BoxEventStream};
use crate::engine::{ResumeInput, RunInput};
use crate::error::AgentError;
use crate::interrupts::Resumer;

/// Consumer side of the HTTP transport. Posts run requests to an agent
/// endpoint and decodes the SSE response into events.
///
/// Runs go to `{base_url}`, resumes to `{base_url}/resume`.
#[derive(Clone)]
pub struct HttpAgentClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpAgentClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub async fn run(&self, input: &RunInput) -> Result<BoxEventStream, AgentError> {
        self.post(&self.base_url, input).await
    }

    pub async fn resume(&self, input: &ResumeInput) -> Result<BoxEventStream, AgentError> {
        self.post(&format!("{}/resume", self.base_url), input).await
    }

    async fn post(&self, url: &str, body: &impl Serialize) -> Result<BoxEventStream, AgentError> {
        debug!(url, "posting agent request");
        let mut req = self
            .client
            .post(url)
            .header("accept", "text/event-stream");
        if let Some(ref key) = self.api_key {
            req = req.header("authorization", format!("Bearer {key}"));
        }

        let resp = req
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(AgentError::Transport(format!("{status}: {text}")));
        }
        Ok(decode_sse(resp.bytes_stream()))
    }
}

#[async_trait]
impl Resumer for HttpAgentClient {
    async fn resume(&self, input: ResumeInput) -> Result<BoxEventStream, AgentError> {
        HttpAgentClient::resume(self, &input).await
    }
}
