pub mod confirmation;
pub mod dispatch;
pub mod error;
pub mod pipeline;
pub mod telemetry;

pub use telemetry::{verify_audit_chain, verify_audit_chain_with_mirror};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use nickel_config::Config;
use nickel_contracts::{
    CancelResponse, ChatRequest, ChatResponse, ConfirmRequest, ConfirmResponse,
    PendingActionSummary, PendingStatus, ToolId, API_VERSION, CLARIFICATION_PROMPT,
    FALLBACK_TOOL_MISMATCH, TOOL_CATALOG,
};
use nickel_kernel::{
    classify, is_high_confidence, jcs_sha256_hex, reconcile, sanitize_history, sha256_hex,
    Reconciliation,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::confirmation::ConfirmationStore;
use crate::dispatch::{DispatchTable, ToolError, ToolHandler};
use crate::error::ApiError;
use crate::pipeline::ModelPipeline;
use crate::telemetry::{TelemetryLog, TelemetryRecord};

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg).await?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    info!(%addr, "nickel listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub async fn build_app(cfg: Config) -> Result<Router, String> {
    build_app_with_handlers(cfg, Vec::new()).await
}

/// Like [`build_app`], with in-process handlers taking precedence over the
/// configured HTTP endpoints.
pub async fn build_app_with_handlers(
    cfg: Config,
    handlers: Vec<(ToolId, Arc<dyn ToolHandler>)>,
) -> Result<Router, String> {
    let state = AppState::new(cfg, handlers).await?;
    Ok(Router::new()
        .route("/v1/healthz", get(healthz))
        .route("/v1/tools", get(tools))
        .route("/v1/chat", post(chat))
        .route("/v1/confirm", post(confirm))
        .route("/v1/cancel", post(cancel))
        .route("/v1/pending-actions", get(pending_actions))
        .route("/v1/audit-events", get(audit_events))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    pipeline: Arc<ModelPipeline>,
    store: Arc<ConfirmationStore>,
    dispatch: Arc<DispatchTable>,
    telemetry: Arc<TelemetryLog>,
}

impl AppState {
    async fn new(cfg: Config, handlers: Vec<(ToolId, Arc<dyn ToolHandler>)>) -> Result<Self, String> {
        nickel_config::validate_runtime_support(&cfg).map_err(|e| e.to_string())?;

        let store = if cfg.store.kind == "sqlite" {
            let sqlite_path = cfg
                .store
                .sqlite_path
                .clone()
                .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
            ConfirmationStore::sqlite(&sqlite_path).map_err(|e| e.to_string())?
        } else {
            ConfirmationStore::in_memory()
        };

        let telemetry = Arc::new(
            TelemetryLog::new(
                &cfg.audit.jsonl_path,
                cfg.audit.immutable_mirror_path.as_deref(),
            )
            .await?,
        );

        let mut dispatch = DispatchTable::from_config(&cfg)?;
        for (tool, handler) in handlers {
            dispatch = dispatch.with_handler(tool, handler);
        }

        Ok(Self {
            pipeline: Arc::new(ModelPipeline::new(&cfg.llm, telemetry.clone())?),
            store: Arc::new(store),
            dispatch: Arc::new(dispatch),
            telemetry,
        })
    }

    async fn process_chat(&self, req: ChatRequest) -> Result<ChatResponse, ApiError> {
        let message = req
            .message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(ApiError::MissingMessage)?;
        let history = sanitize_history(req.history.as_ref());
        let correlation_id = format!("chat_{}", uuid::Uuid::new_v4().as_simple());

        let decision = classify(message);
        let forced_tool = decision.tool.filter(|_| is_high_confidence(&decision));
        info!(
            correlation_id = %correlation_id,
            reason = %decision.reason,
            confidence = decision.confidence,
            forced = forced_tool.map(|t| t.as_str()).unwrap_or("none"),
            "classified chat message"
        );

        let reply = self
            .pipeline
            .generate(message, forced_tool, &history, Some(&correlation_id))
            .await?;

        match reconcile(&decision, &reply) {
            Reconciliation::Respond { response } => Ok(ChatResponse::Ok {
                response,
                tool_result: None,
            }),
            Reconciliation::Clarify {
                decision,
                forced_tool,
                llm_tool,
            } => {
                warn!(
                    correlation_id = %correlation_id,
                    expected = %forced_tool,
                    llm_tool = %llm_tool,
                    "model tool disagrees with classifier"
                );
                self.telemetry.record(
                    TelemetryRecord::new("orchestrator.mismatch", "fallback")
                        .with_correlation(Some(&correlation_id))
                        .with_payload(json!({
                            "decision_tool": decision.tool,
                            "decision_reason": decision.reason,
                            "decision_confidence": decision.confidence,
                            "forced_tool": forced_tool,
                            "llm_tool": llm_tool,
                            "message_sha256": sha256_hex(message.as_bytes()),
                        })),
                );
                Ok(ChatResponse::RequiresClarification {
                    response: CLARIFICATION_PROMPT.to_string(),
                    fallback: FALLBACK_TOOL_MISMATCH.to_string(),
                    decision,
                    llm_tool,
                })
            }
            Reconciliation::Execute {
                response,
                tool,
                payload,
                unopposed,
            } => {
                if unopposed {
                    self.telemetry.record(
                        TelemetryRecord::new("orchestrator.low_confidence_action", "observed")
                            .with_correlation(Some(&correlation_id))
                            .with_payload(json!({
                                "decision_reason": decision.reason,
                                "decision_confidence": decision.confidence,
                                "llm_tool": tool,
                                "message_sha256": sha256_hex(message.as_bytes()),
                            })),
                    );
                }
                let tool = ToolId::parse(&tool).ok_or(ApiError::UnsupportedTool(tool))?;
                if self.dispatch.requires_confirmation(tool) {
                    let pending = self.store.require_confirmation(tool, payload.clone()).await?;
                    info!(action_id = %pending.action_id, %tool, "pending action created");
                    self.telemetry.record(
                        TelemetryRecord::new("pending_action.created", pending.status.as_str())
                            .with_correlation(Some(&correlation_id))
                            .with_action(&pending.action_id)
                            .with_payload(action_fingerprint(tool, &payload)),
                    );
                    Ok(ChatResponse::PendingConfirmation {
                        response,
                        action_id: pending.action_id,
                        tool,
                        created_at: pending.created_at,
                    })
                } else {
                    let outcome = self.dispatch.execute_immediate(tool, &payload).await;
                    self.record_execution(tool, None, Some(&correlation_id), &outcome);
                    Ok(ChatResponse::Ok {
                        response,
                        tool_result: Some(outcome?),
                    })
                }
            }
        }
    }

    async fn process_confirm(&self, req: ConfirmRequest) -> Result<ConfirmResponse, ApiError> {
        let action_id = req
            .action_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(ApiError::MissingActionId)?;
        let confirmed = self.store.confirm(action_id, req.is_confirmed()).await?;
        info!(action_id, tool = %confirmed.tool(), "pending action confirmed");
        self.telemetry.record(
            TelemetryRecord::new("pending_action.confirmed", PendingStatus::Confirmed.as_str())
                .with_action(confirmed.action_id())
                .with_payload(action_fingerprint(confirmed.tool(), confirmed.payload())),
        );

        let outcome = self.dispatch.execute_confirmed(&confirmed).await;
        self.record_execution(confirmed.tool(), Some(confirmed.action_id()), None, &outcome);
        Ok(ConfirmResponse {
            status: PendingStatus::Confirmed,
            action_id: confirmed.action_id().to_string(),
            tool: confirmed.tool(),
            confirmed_at: confirmed.confirmed_at().to_string(),
            result: outcome?,
        })
    }

    async fn process_cancel(&self, req: ConfirmRequest) -> Result<CancelResponse, ApiError> {
        let action_id = req
            .action_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or(ApiError::MissingActionId)?;
        let cancelled = self.store.cancel(action_id, req.is_confirmed()).await?;
        info!(action_id, tool = %cancelled.tool, "pending action cancelled");
        self.telemetry.record(
            TelemetryRecord::new("pending_action.cancelled", cancelled.status.as_str())
                .with_action(&cancelled.action_id)
                .with_payload(json!({"tool": cancelled.tool})),
        );
        Ok(cancelled)
    }

    fn record_execution(
        &self,
        tool: ToolId,
        action_id: Option<&str>,
        correlation_id: Option<&str>,
        outcome: &Result<Value, ToolError>,
    ) {
        let (status, error) = match outcome {
            Ok(_) => ("ok", None),
            Err(err) => {
                warn!(%tool, "tool execution failed: {err}");
                ("error", Some(err.code()))
            }
        };
        let mut rec = TelemetryRecord::new("tool.execute", status)
            .with_correlation(correlation_id)
            .with_payload(json!({"tool": tool, "error_code": error}));
        if let Some(action_id) = action_id {
            rec = rec.with_action(action_id);
        }
        self.telemetry.record(rec);
    }
}

/// Tool plus a canonical digest of the payload; payload contents never reach the log.
fn action_fingerprint(tool: ToolId, payload: &Map<String, Value>) -> Value {
    let digest = jcs_sha256_hex(&Value::Object(payload.clone())).ok();
    json!({"tool": tool, "payload_sha256": digest})
}

async fn healthz() -> Json<Value> {
    Json(json!({"status": "ok", "version": API_VERSION}))
}

async fn tools() -> Json<Value> {
    Json(json!({"tools": TOOL_CATALOG}))
}

async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(req) = body.map_err(|rejection| body_error(rejection, ApiError::MissingMessage))?;
    detached(async move { state.process_chat(req).await })
        .await
        .map(Json)
}

async fn confirm(
    State(state): State<AppState>,
    body: Result<Json<ConfirmRequest>, JsonRejection>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let Json(req) = body.map_err(|rejection| body_error(rejection, ApiError::MissingActionId))?;
    detached(async move { state.process_confirm(req).await })
        .await
        .map(Json)
}

async fn cancel(
    State(state): State<AppState>,
    body: Result<Json<ConfirmRequest>, JsonRejection>,
) -> Result<Json<CancelResponse>, ApiError> {
    let Json(req) = body.map_err(|rejection| body_error(rejection, ApiError::MissingActionId))?;
    detached(async move { state.process_cancel(req).await })
        .await
        .map(Json)
}

/// Runs request work on its own task. A client that hangs up cannot stop a
/// model call, a store transition or the telemetry that follows it halfway.
async fn detached<T, F>(work: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, ApiError>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| ApiError::Interrupted(e.to_string()))?
}

/// A well-formed body whose required field has the wrong type is reported as
/// that field missing; anything else is an invalid request.
fn body_error(rejection: JsonRejection, field_error: ApiError) -> ApiError {
    debug!("request body rejected: {rejection}");
    match rejection {
        JsonRejection::JsonDataError(_) => field_error,
        other => ApiError::InvalidRequest(other.body_text()),
    }
}

async fn pending_actions(
    State(state): State<AppState>,
) -> Result<Json<Vec<PendingActionSummary>>, ApiError> {
    Ok(Json(state.store.list().await?))
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    kind: Option<String>,
    limit: Option<usize>,
}

async fn audit_events(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<Value>, ApiError> {
    let records = state
        .telemetry
        .list(query.kind.as_deref(), Some(query.limit.unwrap_or(100)))
        .await
        .map_err(ApiError::Audit)?;
    Ok(Json(json!({"events": records})))
}
