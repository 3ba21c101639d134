use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nickel_config::Config;
use nickel_contracts::{ErrorResponse, ToolId};
use reqwest::Client;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::confirmation::ConfirmedAction;

const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("action {0} is not implemented")]
    NotImplemented(ToolId),
    #[error("tool {0} must be confirmed before it runs")]
    ConfirmationRequired(ToolId),
    /// A handler's own failure. Status and code reach the client unchanged.
    #[error("{message}")]
    Handler {
        status: u16,
        code: String,
        message: String,
    },
}

impl ToolError {
    pub fn code(&self) -> String {
        match self {
            ToolError::NotImplemented(_) => "action_not_implemented".to_string(),
            ToolError::ConfirmationRequired(_) => "confirmation_required".to_string(),
            ToolError::Handler { code, .. } => code.clone(),
        }
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, payload: &Map<String, Value>) -> Result<Value, ToolError>;
}

/// Forwards the payload to an HTTP service that owns the integration.
pub struct HttpToolHandler {
    tool: ToolId,
    endpoint: String,
    client: Client,
}

impl HttpToolHandler {
    pub fn new(tool: ToolId, endpoint: &str, client: Client) -> Self {
        Self {
            tool,
            endpoint: endpoint.to_string(),
            client,
        }
    }
}

#[async_trait]
impl ToolHandler for HttpToolHandler {
    async fn handle(&self, payload: &Map<String, Value>) -> Result<Value, ToolError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                warn!(tool = %self.tool, "tool endpoint unreachable: {e}");
                ToolError::Handler {
                    status: 502,
                    code: "tool_unreachable".to_string(),
                    message: format!("Tool {} is unreachable.", self.tool),
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => ToolError::Handler {
                    status: status.as_u16(),
                    code: err.error.code,
                    message: err.error.message,
                },
                Err(_) => ToolError::Handler {
                    status: status.as_u16(),
                    code: "tool_failed".to_string(),
                    message: format!("Tool {} failed with HTTP {}.", self.tool, status.as_u16()),
                },
            });
        }

        response.json::<Value>().await.map_err(|_| ToolError::Handler {
            status: 502,
            code: "tool_bad_response".to_string(),
            message: format!("Tool {} returned an unreadable result.", self.tool),
        })
    }
}

struct NotImplementedHandler(ToolId);

#[async_trait]
impl ToolHandler for NotImplementedHandler {
    async fn handle(&self, _payload: &Map<String, Value>) -> Result<Value, ToolError> {
        Err(ToolError::NotImplemented(self.0))
    }
}

pub struct DispatchTable {
    handlers: HashMap<ToolId, Arc<dyn ToolHandler>>,
}

impl Default for DispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchTable {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Wires every `tools.<id>.endpoint` entry to an [`HttpToolHandler`].
    pub fn from_config(cfg: &Config) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(TOOL_TIMEOUT)
            .build()
            .map_err(|e| e.to_string())?;
        let mut table = Self::new();
        for (key, tool_cfg) in &cfg.tools {
            let tool = ToolId::parse(key).ok_or_else(|| format!("unknown tool {key}"))?;
            debug!(%tool, endpoint = %tool_cfg.endpoint, "registered http tool handler");
            table = table.with_handler(
                tool,
                Arc::new(HttpToolHandler::new(tool, &tool_cfg.endpoint, client.clone())),
            );
        }
        Ok(table)
    }

    pub fn with_handler(mut self, tool: ToolId, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers.insert(tool, handler);
        self
    }

    pub fn requires_confirmation(&self, tool: ToolId) -> bool {
        tool.requires_confirmation()
    }

    /// Runs a tool that needs no confirmation.
    pub async fn execute_immediate(
        &self,
        tool: ToolId,
        payload: &Map<String, Value>,
    ) -> Result<Value, ToolError> {
        if self.requires_confirmation(tool) {
            return Err(ToolError::ConfirmationRequired(tool));
        }
        self.handler(tool).handle(payload).await
    }

    pub async fn execute_confirmed(&self, action: &ConfirmedAction) -> Result<Value, ToolError> {
        self.handler(action.tool()).handle(action.payload()).await
    }

    fn handler(&self, tool: ToolId) -> Arc<dyn ToolHandler> {
        match self.handlers.get(&tool) {
            Some(handler) => handler.clone(),
            None => Arc::new(NotImplementedHandler(tool)),
        }
    }
}
