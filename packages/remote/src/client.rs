// ABOUTME: HTTP client for the registered-agent routes of a Hatchery server
// ABOUTME: Authenticates with the target's bearer secret and unwraps the response envelope

use crate::config::WorkerConfig;
use crate::error::{ClientError, Result};
use hatchery_core::{InspectOutcome, InspectRequest, Task, TaskStatus};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAck {
    pub target_id: String,
    pub heartbeat_interval_secs: i64,
}

/// Partial task update; unset fields are left alone by the server
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_version: Option<u64>,
}

/// Client for one registered target
#[derive(Clone)]
pub struct AgentClient {
    http_client: Client,
    base_url: String,
    target_id: String,
    agent_token: String,
}

impl AgentClient {
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            target_id: config.target_id.clone(),
            agent_token: config.agent_token.clone(),
        })
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/servers/{}{}", self.base_url, self.target_id, path);
        self.http_client
            .request(method, url)
            .bearer_auth(&self.agent_token)
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            let envelope: Envelope<T> = response
                .json()
                .await
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
            if !envelope.success {
                return Err(ClientError::InvalidResponse(
                    "Response marked unsuccessful".to_string(),
                ));
            }
            return envelope.data.ok_or_else(|| {
                ClientError::InvalidResponse("Response contained no data".to_string())
            });
        }

        let text = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&text) {
            Ok(body) => (body.error.code, body.error.message),
            Err(_) => (status.to_string(), text),
        };
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Unauthorized(message),
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            StatusCode::CONFLICT => ClientError::Conflict { code, message },
            _ => ClientError::Api {
                status: status.as_u16(),
                code,
                message,
            },
        })
    }

    /// Report liveness and host stats
    pub async fn heartbeat(&self, stats: &impl Serialize) -> Result<HeartbeatAck> {
        self.send(self.request(Method::POST, "/heartbeat").json(stats))
            .await
    }

    /// Tasks queued for this target; listing does not claim them
    pub async fn pending_tasks(&self) -> Result<Vec<Task>> {
        self.send(self.request(Method::GET, "/tasks")).await
    }

    pub async fn patch_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task> {
        self.send(
            self.request(Method::PATCH, &format!("/tasks/{}", task_id))
                .json(patch),
        )
        .await
    }

    pub async fn pending_inspect_requests(&self) -> Result<Vec<InspectRequest>> {
        self.send(self.request(Method::GET, "/inspect-requests"))
            .await
    }

    pub async fn resolve_inspect_request(
        &self,
        request_id: &str,
        outcome: &InspectOutcome,
    ) -> Result<InspectRequest> {
        self.send(
            self.request(Method::PATCH, &format!("/inspect-requests/{}", request_id))
                .json(outcome),
        )
        .await
    }
}
