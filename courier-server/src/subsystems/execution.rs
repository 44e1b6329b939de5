//! Execution proxy: forwards a user message to an agent's backend
//!
//! - Resolves the backend URL (session override, else process default)
//! - Requires a per-session API key
//! - Merges default parameters with caller overrides (override wins per key)
//! - Classifies the outcome and always persists an `ExecutionRecord`
//!
//! A failed classification is returned as `CourierError::ExecutionFailed`
//! carrying the persisted record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use courier_core::agent_client::{AgentBackend, AgentClientError, BackendCall, BackendResponse};
use courier_core::config::AgentBackendConfig;
use courier_core::models::{ExecutionRecord, ExecutionStatus};
use courier_core::store::{ExecutionStore, SessionStore};
use courier_core::CourierError;
use uuid::Uuid;

pub type Parameters = serde_json::Map<String, serde_json::Value>;

pub struct ExecutionProxy {
    sessions: Arc<dyn SessionStore>,
    executions: Arc<dyn ExecutionStore>,
    backend: Arc<dyn AgentBackend>,
    config: AgentBackendConfig,
}

/// Outcome of one backend call, before persistence.
struct Classified {
    status: ExecutionStatus,
    body: Option<String>,
    error: Option<String>,
    elapsed: Duration,
}

impl ExecutionProxy {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        executions: Arc<dyn ExecutionStore>,
        backend: Arc<dyn AgentBackend>,
        config: AgentBackendConfig,
    ) -> Self {
        Self {
            sessions,
            executions,
            backend,
            config,
        }
    }

    /// Run `user_message` through the agent's backend and record the result.
    pub async fn execute(
        &self,
        agent_id: &str,
        user_message: &str,
        sender_hint: Option<&str>,
        overrides: Option<&Parameters>,
    ) -> Result<ExecutionRecord, CourierError> {
        let session = self
            .sessions
            .get_by_agent(agent_id)
            .await?
            .ok_or_else(|| CourierError::NotFound(agent_id.to_string()))?;

        let base_url = session
            .backend_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| self.config.base_url.clone().filter(|u| !u.trim().is_empty()))
            .ok_or_else(|| {
                CourierError::Config(format!("no agent backend URL configured for {}", agent_id))
            })?;

        let api_key = session
            .backend_api_key
            .clone()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                CourierError::Config(format!("no agent backend API key set for {}", agent_id))
            })?;

        let call = BackendCall {
            base_url,
            api_key,
            agent_id: agent_id.to_string(),
            input: user_message.to_string(),
            parameters: merge_parameters(&self.config.default_parameters, overrides),
            session_id: sender_hint.map(str::to_string),
        };

        let timeout = self.config.timeout();
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.backend.execute(&call)).await;
        let classified = classify(outcome, started.elapsed(), timeout);

        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            session_id: session.id,
            agent_id: agent_id.to_string(),
            user_message: Some(user_message.to_string()).filter(|m| !m.is_empty()),
            response_body: classified.body,
            execution_time_ms: classified.elapsed.as_millis() as i64,
            status: classified.status,
            error_message: classified.error,
            created_at: Utc::now(),
        };

        self.executions.create(&record).await?;

        if record.is_success() {
            tracing::info!(
                agent_id,
                execution_id = %record.id,
                elapsed_ms = record.execution_time_ms,
                "Agent execution succeeded"
            );
            return Ok(record);
        }

        let message = record
            .error_message
            .clone()
            .unwrap_or_else(|| "agent execution failed".to_string());
        tracing::warn!(
            agent_id,
            execution_id = %record.id,
            error = %message,
            "Agent execution failed"
        );
        Err(CourierError::ExecutionFailed {
            message,
            record: Box::new(record),
        })
    }
}

/// Defaults overlaid by `overrides`; override wins per key.
pub fn merge_parameters(defaults: &Parameters, overrides: Option<&Parameters>) -> Parameters {
    let mut merged = defaults.clone();
    if let Some(overrides) = overrides {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Reply text of a successful execution, if it has one.
pub fn extract_reply(record: &ExecutionRecord) -> Option<String> {
    record.reply()
}

fn classify(
    outcome: Result<Result<BackendResponse, AgentClientError>, tokio::time::error::Elapsed>,
    measured: Duration,
    timeout: Duration,
) -> Classified {
    match outcome {
        Err(_) => Classified {
            status: ExecutionStatus::Failed,
            body: None,
            error: Some(format!("agent backend timed out after {}s", timeout.as_secs())),
            elapsed: measured,
        },
        Ok(Err(e)) => Classified {
            status: ExecutionStatus::Failed,
            body: None,
            error: Some(e.to_string()),
            elapsed: measured,
        },
        Ok(Ok(resp)) if resp.status >= 300 => Classified {
            status: ExecutionStatus::Failed,
            error: Some(format!(
                "agent backend returned status {}: {}",
                resp.status, resp.body
            )),
            body: Some(resp.body),
            elapsed: resp.elapsed,
        },
        Ok(Ok(resp)) => Classified {
            status: ExecutionStatus::Success,
            body: Some(resp.body),
            error: None,
            elapsed: resp.elapsed,
        },
    }
}
