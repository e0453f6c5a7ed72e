//! `reqwest`-based client for the backend's internal API.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, Instrument};

use super::Backend;
use crate::config::BackendConfig;
use crate::models::agent::{AgentState, AgentStatus};
use crate::models::execution::ExecutionStatus;
use crate::models::heartbeat::{AgentInitConfig, AgentRunConfig};
use crate::{AppError, Result};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AgentStatusUpdate<'a> {
    container_id: &'a str,
    state: AgentState,
    time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionStatusUpdate<'a> {
    execution_id: &'a str,
    status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AddAgents<'a> {
    execution_id: &'a str,
    container_ids: &'a [String],
}

/// Backend client speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    /// Build a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be constructed.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
        })
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url> {
        let raw = format!("{}{path}", self.base_url);
        let parsed = if params.is_empty() {
            Url::parse(&raw)
        } else {
            Url::parse_with_params(&raw, params)
        };
        parsed.map_err(|err| AppError::Backend(format!("invalid backend url for {path}: {err}")))
    }

    async fn get_optional<T: DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        let response = self.client.get(url).send().await?;
        if matches!(
            response.status(),
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND
        ) {
            return Ok(None);
        }
        let response = check_status(response).await?;
        Ok(Some(response.json::<T>().await?))
    }

    async fn post_json<B: Serialize + ?Sized>(&self, url: Url, body: &B) -> Result<()> {
        let response = self.client.post(url).json(body).send().await?;
        check_status(response).await?;
        Ok(())
    }
}

/// Map non-success responses to `AppError::Backend`, keeping the body text.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().path().to_owned();
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Backend(format!(
        "{url} returned {status}: {}",
        body.trim()
    )))
}

impl Backend for HttpBackend {
    fn get_init_config(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AgentInitConfig>>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(
            async move {
                let url = self.url(
                    "/internal/agents/get-init-config",
                    &[("containerId", agent_id.as_str())],
                )?;
                self.get_optional(url).await
            }
            .instrument(tracing::debug_span!("backend.get_init_config")),
        )
    }

    fn get_next_run_config(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Option<AgentRunConfig>>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(
            async move {
                let url = self.url(
                    "/internal/agents/get-next-run-config",
                    &[("containerId", agent_id.as_str())],
                )?;
                self.get_optional(url).await
            }
            .instrument(tracing::debug_span!("backend.get_next_run_config")),
        )
    }

    fn update_agent_status(
        &self,
        agent_id: &str,
        state: AgentState,
        time: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(async move {
            let url = self.url("/internal/agents/update-status", &[])?;
            let body = AgentStatusUpdate {
                container_id: &agent_id,
                state,
                time,
            };
            self.post_json(url, &body).await?;
            debug!(agent_id, ?state, "agent status persisted");
            Ok(())
        })
    }

    fn check_saved_data(
        &self,
        agent_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + '_>> {
        let agent_id = agent_id.to_owned();
        Box::pin(async move {
            let url = self.url(
                "/internal/test-executions/are-results-saved",
                &[("containerId", agent_id.as_str())],
            )?;
            let response = check_status(self.client.get(url).send().await?).await?;
            Ok(response.json::<bool>().await?)
        })
    }

    fn mark_test_executions_as_failed(
        &self,
        agent_ids: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let agent_ids = agent_ids.to_vec();
        Box::pin(async move {
            let url = self.url("/internal/test-executions/mark-as-failed", &[])?;
            self.post_json(url, &agent_ids).await
        })
    }

    fn get_agent_statuses_for_execution(
        &self,
        execution_id: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<AgentStatus>>> + Send + '_>> {
        let execution_id = execution_id.to_owned();
        Box::pin(async move {
            let url = self.url(
                "/internal/agents/statuses",
                &[("executionId", execution_id.as_str())],
            )?;
            let response = check_status(self.client.get(url).send().await?).await?;
            Ok(response.json::<Vec<AgentStatus>>().await?)
        })
    }

    fn update_execution_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        reason: Option<String>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let execution_id = execution_id.to_owned();
        Box::pin(async move {
            let url = self.url("/internal/executions/update-status", &[])?;
            let body = ExecutionStatusUpdate {
                execution_id: &execution_id,
                status,
                reason,
            };
            self.post_json(url, &body).await
        })
    }

    fn add_agents(
        &self,
        execution_id: &str,
        container_ids: &[String],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let execution_id = execution_id.to_owned();
        let container_ids = container_ids.to_vec();
        Box::pin(async move {
            let url = self.url("/internal/agents/insert", &[])?;
            let body = AddAgents {
                execution_id: &execution_id,
                container_ids: &container_ids,
            };
            self.post_json(url, &body).await
        })
    }
}
