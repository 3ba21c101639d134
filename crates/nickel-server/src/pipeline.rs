use std::sync::Arc;
use std::time::{Duration, Instant};

use nickel_config::Llm;
use nickel_contracts::{ConversationTurn, ModelReply, ToolId};
use nickel_kernel::{
    build_messages, decode_message, function_tools, json_object_format, reply_json_schema,
    tool_choice, DecodeError, PromptStyle, DEFAULT_SYSTEM_PROMPT,
};
use reqwest::Client;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::telemetry::{TelemetryLog, TelemetryRecord};

const ERROR_SUMMARY_MAX_CHARS: usize = 180;

/// Function calling with a strict reply schema first; the prompt-embedded JSON
/// object form is the fallback for endpoints that reject either.
const STRATEGIES: [PromptStyle; 2] = [PromptStyle::FunctionCalling, PromptStyle::PromptJson];

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("llm {0} is not configured")]
    Configuration(&'static str),
    #[error("llm request failed: {0}")]
    Upstream(String),
    #[error("llm reply could not be decoded: {0}")]
    Decode(#[from] DecodeError),
}

/// Why one HTTP exchange with the model failed.
#[derive(Debug)]
struct UpstreamFailure {
    status: Option<u16>,
    message: String,
}

impl UpstreamFailure {
    fn from_status(status: u16) -> Self {
        Self {
            status: Some(status),
            message: format!("upstream returned HTTP {status}"),
        }
    }

    fn network(err: &reqwest::Error) -> Self {
        let message = if err.is_timeout() {
            "upstream request timed out".to_string()
        } else {
            format!("upstream unreachable: {err}")
        };
        Self {
            status: None,
            message,
        }
    }

    fn bad_body(err: &reqwest::Error) -> Self {
        Self {
            status: None,
            message: format!("upstream body was not JSON: {err}"),
        }
    }

    /// Rate limits and server-side outages are worth another attempt.
    fn is_retryable(&self) -> bool {
        matches!(self.status, Some(429) | Some(500..=599))
    }
}

pub struct ModelPipeline {
    base_url: Option<String>,
    api_key: Option<String>,
    model: Option<String>,
    temperature: f64,
    max_retries: u32,
    retry_backoff: Duration,
    history_window: usize,
    system_prompt: String,
    client: Client,
    telemetry: Arc<TelemetryLog>,
}

impl ModelPipeline {
    pub fn new(cfg: &Llm, telemetry: Arc<TelemetryLog>) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let system_prompt = match cfg.system_prompt_path.as_deref() {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| format!("read system prompt {path} failed: {e}"))?
                .trim()
                .to_string(),
            None => DEFAULT_SYSTEM_PROMPT.to_string(),
        };
        Ok(Self {
            base_url: non_blank(cfg.base_url.as_deref()),
            api_key: cfg.resolved_api_key(),
            model: non_blank(cfg.model.as_deref()),
            temperature: cfg.temperature,
            max_retries: cfg.max_retries,
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            history_window: cfg.history_window,
            system_prompt,
            client,
            telemetry,
        })
    }

    /// One logical model call. Exactly one `llm.chat.completions` record is
    /// written per call, whatever the outcome.
    pub async fn generate(
        &self,
        message: &str,
        forced_tool: Option<ToolId>,
        history: &[ConversationTurn],
        correlation_id: Option<&str>,
    ) -> Result<ModelReply, PipelineError> {
        let started = Instant::now();
        let model_label = self.model.clone().unwrap_or_default();

        let outcome = match self.settings() {
            Ok((base_url, api_key, model)) => {
                let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
                self.call_with_retries(&url, api_key, model, message, forced_tool, history)
                    .await
                    .map_err(|failure| PipelineError::Upstream(failure.message))
                    .and_then(|body| decode_completion(&body).map_err(PipelineError::from))
            }
            Err(err) => Err(err),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (status, error_summary) = match &outcome {
            Ok(_) => ("ok", None),
            Err(err) => ("error", Some(summarize(&err.to_string()))),
        };
        match &outcome {
            Ok(_) => info!(model = %model_label, duration_ms, "llm call succeeded"),
            Err(err) => warn!(model = %model_label, duration_ms, "llm call failed: {err}"),
        }
        self.telemetry.record(
            TelemetryRecord::new("llm.chat.completions", status)
                .with_correlation(correlation_id)
                .with_payload(json!({
                    "model": model_label,
                    "duration_ms": duration_ms,
                    "status": status,
                    "error_summary": error_summary,
                })),
        );
        outcome
    }

    fn settings(&self) -> Result<(&str, &str, &str), PipelineError> {
        let base_url = self
            .base_url
            .as_deref()
            .ok_or(PipelineError::Configuration("base_url"))?;
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(PipelineError::Configuration("api_key"))?;
        let model = self
            .model
            .as_deref()
            .ok_or(PipelineError::Configuration("model"))?;
        Ok((base_url, api_key, model))
    }

    async fn call_with_retries(
        &self,
        url: &str,
        api_key: &str,
        model: &str,
        message: &str,
        forced_tool: Option<ToolId>,
        history: &[ConversationTurn],
    ) -> Result<Value, UpstreamFailure> {
        let mut attempt: u32 = 0;
        loop {
            match self
                .attempt(url, api_key, model, message, forced_tool, history)
                .await
            {
                Ok(body) => return Ok(body),
                Err(failure) if failure.is_retryable() && attempt < self.max_retries => {
                    let delay = backoff_for(self.retry_backoff, attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying llm call: {}",
                        failure.message
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => return Err(failure),
            }
        }
    }

    /// Tries each transport strategy once; the last failure classifies the attempt.
    async fn attempt(
        &self,
        url: &str,
        api_key: &str,
        model: &str,
        message: &str,
        forced_tool: Option<ToolId>,
        history: &[ConversationTurn],
    ) -> Result<Value, UpstreamFailure> {
        let mut last_failure = UpstreamFailure {
            status: None,
            message: "no transport strategy was tried".to_string(),
        };
        for style in STRATEGIES {
            let body = self.request_body(style, model, message, forced_tool, history);
            match self.send(url, api_key, &body).await {
                Ok(v) => return Ok(v),
                Err(failure) => {
                    debug!(?style, "llm strategy failed: {}", failure.message);
                    last_failure = failure;
                }
            }
        }
        Err(last_failure)
    }

    fn request_body(
        &self,
        style: PromptStyle,
        model: &str,
        message: &str,
        forced_tool: Option<ToolId>,
        history: &[ConversationTurn],
    ) -> Value {
        let messages = build_messages(
            &self.system_prompt,
            message,
            forced_tool,
            history,
            self.history_window,
            style,
        );
        match style {
            PromptStyle::FunctionCalling => json!({
                "model": model,
                "messages": messages,
                "temperature": self.temperature,
                "tools": function_tools(),
                "tool_choice": tool_choice(forced_tool),
                "response_format": reply_json_schema(),
            }),
            PromptStyle::PromptJson => json!({
                "model": model,
                "messages": messages,
                "temperature": self.temperature,
                "response_format": json_object_format(),
            }),
        }
    }

    async fn send(&self, url: &str, api_key: &str, body: &Value) -> Result<Value, UpstreamFailure> {
        let response = self
            .client
            .post(url)
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamFailure::network(&e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamFailure::from_status(status.as_u16()));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| UpstreamFailure::bad_body(&e))
    }
}

fn decode_completion(body: &Value) -> Result<ModelReply, DecodeError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or(DecodeError::NoObject)?;
    decode_message(message)
}

/// Delay before retry number `attempt + 1`: the base, doubled per attempt.
fn backoff_for(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

fn summarize(text: &str) -> String {
    text.chars().take(ERROR_SUMMARY_MAX_CHARS).collect()
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
}
