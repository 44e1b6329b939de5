//! Agent backend client
//!
//! Stateless HTTP client for the external agent execution service. It only
//! moves bytes: classification of the response into success or failure is the
//! execution proxy's job, so a non-2xx status is still `Ok` here.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

// ============================================================================
// AgentBackend trait
// ============================================================================

/// One call to the agent backend.
#[derive(Debug, Clone)]
pub struct BackendCall {
    pub base_url: String,
    pub api_key: String,
    pub agent_id: String,
    pub input: String,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub session_id: Option<String>,
}

/// Raw outcome of a call that reached the backend.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn execute(&self, call: &BackendCall) -> Result<BackendResponse, AgentClientError>;
}

#[derive(Error, Debug)]
pub enum AgentClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
}

// ============================================================================
// Request shaping
// ============================================================================

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    input: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<&'a serde_json::Map<String, serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
}

/// Build the execute endpoint for `agent_id` from a configured base URL.
///
/// A URL that already names an agent (`.../agents/...`) only gets `/execute`
/// appended. A URL that already carries an API version (`.../api/vN`) gets
/// `/agents/{id}/execute`. Anything else is treated as a bare host.
pub fn build_execute_url(base_url: &str, agent_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.contains("/agents/") {
        if base.ends_with("/execute") {
            base.to_string()
        } else {
            format!("{}/execute", base)
        }
    } else if base.contains("/api/v") {
        format!("{}/agents/{}/execute", base, agent_id)
    } else {
        format!("{}/api/v1/agents/{}/execute", base, agent_id)
    }
}

// ============================================================================
// HttpAgentClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: Client,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration) -> Result<Self, AgentClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AgentBackend for HttpAgentClient {
    async fn execute(&self, call: &BackendCall) -> Result<BackendResponse, AgentClientError> {
        if call.base_url.trim().is_empty() {
            return Err(AgentClientError::InvalidUrl(call.base_url.clone()));
        }
        let url = build_execute_url(&call.base_url, &call.agent_id);
        let body = ExecuteRequest {
            input: &call.input,
            parameters: (!call.parameters.is_empty()).then_some(&call.parameters),
            session_id: call.session_id.as_deref().filter(|s| !s.is_empty()),
        };

        tracing::debug!(agent_id = %call.agent_id, url = %url, "Calling agent backend");

        let started = Instant::now();
        let response = self
            .client
            .post(&url)
            .bearer_auth(&call.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let elapsed = started.elapsed();

        tracing::debug!(
            agent_id = %call.agent_id,
            status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Agent backend responded"
        );

        Ok(BackendResponse {
            status,
            body: text,
            elapsed,
        })
    }
}
