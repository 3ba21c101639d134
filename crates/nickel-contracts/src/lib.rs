use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const API_VERSION: &str = "1.0.0";

pub const CLARIFICATION_PROMPT: &str =
    "Encontrei um conflito na interpretação do pedido. Pode confirmar a ação desejada?";

pub const FALLBACK_TOOL_MISMATCH: &str = "tool_mismatch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ToolId {
    #[serde(rename = "email.search", alias = "email_search")]
    EmailSearch,
    #[serde(rename = "email.read", alias = "email_read")]
    EmailRead,
    #[serde(rename = "email.draft", alias = "email_draft")]
    EmailDraft,
    #[serde(rename = "email.send", alias = "email_send")]
    EmailSend,
    #[serde(rename = "calendar.list_events", alias = "calendar_list_events")]
    CalendarListEvents,
    #[serde(rename = "calendar.create_event", alias = "calendar_create_event")]
    CalendarCreateEvent,
    #[serde(rename = "calendar.modify_event", alias = "calendar_modify_event")]
    CalendarModifyEvent,
    #[serde(rename = "notes.create", alias = "notes_create")]
    NotesCreate,
    #[serde(rename = "tasks.create", alias = "tasks_create")]
    TasksCreate,
    #[serde(rename = "tasks.list", alias = "tasks_list")]
    TasksList,
    #[serde(rename = "spotify.play", alias = "spotify_play")]
    SpotifyPlay,
    #[serde(rename = "spotify.pause", alias = "spotify_pause")]
    SpotifyPause,
    #[serde(rename = "spotify.skip", alias = "spotify_skip")]
    SpotifySkip,
}

impl ToolId {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolId::EmailSearch => "email.search",
            ToolId::EmailRead => "email.read",
            ToolId::EmailDraft => "email.draft",
            ToolId::EmailSend => "email.send",
            ToolId::CalendarListEvents => "calendar.list_events",
            ToolId::CalendarCreateEvent => "calendar.create_event",
            ToolId::CalendarModifyEvent => "calendar.modify_event",
            ToolId::NotesCreate => "notes.create",
            ToolId::TasksCreate => "tasks.create",
            ToolId::TasksList => "tasks.list",
            ToolId::SpotifyPlay => "spotify.play",
            ToolId::SpotifyPause => "spotify.pause",
            ToolId::SpotifySkip => "spotify.skip",
        }
    }

    /// Accepts both the dotted id and the underscored function-calling name.
    pub fn parse(raw: &str) -> Option<ToolId> {
        let raw = raw.trim();
        TOOL_CATALOG
            .iter()
            .map(|spec| spec.id)
            .find(|id| id.as_str() == raw || id.function_name() == raw)
    }

    /// Name used in function-calling schemas, which reject dots.
    pub fn function_name(self) -> String {
        self.as_str().replace('.', "_")
    }

    pub fn spec(self) -> Option<&'static ToolSpec> {
        TOOL_CATALOG.iter().find(|spec| spec.id == self)
    }

    /// A tool missing from the catalog is treated as a write that needs confirmation.
    pub fn requires_confirmation(self) -> bool {
        self.spec().map(|s| s.requires_confirmation).unwrap_or(true)
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolAccess {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "tool")]
    pub id: ToolId,
    pub access: ToolAccess,
    pub requires_confirmation: bool,
    pub payload: &'static str,
}

/// Static tool table shared by the prompt builder and the dispatch table.
pub const TOOL_CATALOG: &[ToolSpec] = &[
    ToolSpec {
        id: ToolId::EmailSearch,
        access: ToolAccess::Read,
        requires_confirmation: false,
        payload: "{query, max_results, user_id}",
    },
    ToolSpec {
        id: ToolId::EmailRead,
        access: ToolAccess::Read,
        requires_confirmation: false,
        payload: "{message_id, user_id}",
    },
    ToolSpec {
        id: ToolId::EmailDraft,
        access: ToolAccess::Write,
        requires_confirmation: false,
        payload: "{raw_base64, user_id}",
    },
    ToolSpec {
        id: ToolId::EmailSend,
        access: ToolAccess::Write,
        requires_confirmation: true,
        payload: "{raw_base64, user_id}",
    },
    ToolSpec {
        id: ToolId::CalendarListEvents,
        access: ToolAccess::Read,
        requires_confirmation: false,
        payload: "{calendar_id, max_results, time_min, time_max}",
    },
    ToolSpec {
        id: ToolId::CalendarCreateEvent,
        access: ToolAccess::Write,
        requires_confirmation: true,
        payload: "{calendar_id, event}",
    },
    ToolSpec {
        id: ToolId::CalendarModifyEvent,
        access: ToolAccess::Write,
        requires_confirmation: true,
        payload: "{calendar_id, event_id, event}",
    },
    ToolSpec {
        id: ToolId::NotesCreate,
        access: ToolAccess::Write,
        requires_confirmation: true,
        payload: "{title, body}",
    },
    ToolSpec {
        id: ToolId::TasksCreate,
        access: ToolAccess::Write,
        requires_confirmation: true,
        payload: "{title, notes}",
    },
    ToolSpec {
        id: ToolId::TasksList,
        access: ToolAccess::Read,
        requires_confirmation: false,
        payload: "{}",
    },
    ToolSpec {
        id: ToolId::SpotifyPlay,
        access: ToolAccess::Write,
        requires_confirmation: false,
        payload: "{context_uri, uris, offset, position_ms}",
    },
    ToolSpec {
        id: ToolId::SpotifyPause,
        access: ToolAccess::Write,
        requires_confirmation: false,
        payload: "{}",
    },
    ToolSpec {
        id: ToolId::SpotifySkip,
        access: ToolAccess::Write,
        requires_confirmation: false,
        payload: "{}",
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentDecision {
    pub tool: Option<ToolId>,
    pub reason: String,
    pub confidence: f64,
}

/// Model proposal. The tool stays a raw string here so that an unknown tool
/// can be reported as unsupported instead of as malformed output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelAction {
    pub tool: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    #[serde(default)]
    pub response: String,
    #[serde(default)]
    pub action: Option<ModelAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    PendingConfirmation,
    Confirmed,
    Cancelled,
}

impl PendingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PendingStatus::PendingConfirmation => "pending_confirmation",
            PendingStatus::Confirmed => "confirmed",
            PendingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub action_id: String,
    pub tool: ToolId,
    pub payload: Map<String, Value>,
    pub created_at: String,
    pub status: PendingStatus,
}

impl PendingAction {
    pub fn summary(&self) -> PendingActionSummary {
        PendingActionSummary {
            status: self.status,
            action_id: self.action_id.clone(),
            tool: self.tool,
            created_at: self.created_at.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingActionSummary {
    pub status: PendingStatus,
    pub action_id: String,
    pub tool: ToolId,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub history: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChatResponse {
    Ok {
        response: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_result: Option<Value>,
    },
    PendingConfirmation {
        response: String,
        action_id: String,
        tool: ToolId,
        created_at: String,
    },
    RequiresClarification {
        response: String,
        fallback: String,
        decision: IntentDecision,
        llm_tool: String,
    },
}

/// `confirmed` is kept untyped so that only the JSON literal `true` passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmRequest {
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub confirmed: Option<Value>,
}

impl ConfirmRequest {
    pub fn is_confirmed(&self) -> bool {
        matches!(self.confirmed, Some(Value::Bool(true)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmResponse {
    pub status: PendingStatus,
    pub action_id: String,
    pub tool: ToolId,
    pub confirmed_at: String,
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub status: PendingStatus,
    pub action_id: String,
    pub tool: ToolId,
    pub cancelled_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
