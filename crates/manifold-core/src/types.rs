// ABOUTME: Core types for manifold - UnifiedMessage, execution requests and results
// ABOUTME: Every backend's output is normalized into these shapes before anything else sees it

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Which agent CLI a request should run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Claude,
    Cursor,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Cursor => "cursor",
        }
    }

    /// All known backend types, in registration order.
    pub fn all() -> &'static [BackendType] {
        &[Self::Claude, Self::Cursor]
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(Self::Claude),
            "cursor" => Ok(Self::Cursor),
            other => Err(format!("unknown backend type '{other}'")),
        }
    }
}

/// Who a message is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    /// Normalize the role vocabularies different CLIs use onto one set.
    /// Idempotent: feeding a canonical name back in yields the same value.
    /// Unknown vocabularies default to assistant, where nearly all backend
    /// output originates.
    pub fn normalize(raw: &str) -> Role {
        match raw.to_ascii_lowercase().as_str() {
            "user" | "human" => Role::User,
            "system" => Role::System,
            "tool" => Role::Tool,
            "assistant" | "model" | "ai" | "bot" => Role::Assistant,
            _ => Role::Assistant,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

/// What kind of event a message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Chat,
    ToolUse,
    ToolResult,
    System,
    Error,
    Result,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Chat => "chat",
            MessageType::ToolUse => "tool_use",
            MessageType::ToolResult => "tool_result",
            MessageType::System => "system",
            MessageType::Error => "error",
            MessageType::Result => "result",
        }
    }

    pub fn parse(raw: &str) -> Option<MessageType> {
        match raw {
            "chat" => Some(MessageType::Chat),
            "tool_use" => Some(MessageType::ToolUse),
            "tool_result" => Some(MessageType::ToolResult),
            "system" => Some(MessageType::System),
            "error" => Some(MessageType::Error),
            "result" => Some(MessageType::Result),
            _ => None,
        }
    }
}

/// One normalized event from a backend. Immutable once created; persisted
/// exactly once and never retroactively edited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedMessage {
    pub id: String,
    pub project_id: String,
    pub conversation_id: String,
    /// The caller's chat-session row id (not the backend-native session).
    pub session_id: Option<String>,
    pub role: Role,
    pub message_type: MessageType,
    /// Always a real string; structured payloads are flattened to text.
    pub content: String,
    /// Open map: the original backend-native event, tool name/input/id, and
    /// the `hidden_from_ui` bookkeeping flag all live here.
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl UnifiedMessage {
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Mark this message as internal bookkeeping, persisted but not shown.
    pub fn hidden(mut self) -> Self {
        self.metadata
            .insert("hidden_from_ui".to_string(), Value::Bool(true));
        self
    }

    pub fn is_hidden(&self) -> bool {
        self.metadata
            .get("hidden_from_ui")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Whether this message explicitly asserts that changes were made.
    pub fn marks_changes(&self) -> bool {
        self.metadata.contains_key("changes_made")
    }
}

/// Execution modes control the tool set handed to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Read-only tools, no file modification.
    Chat,
    /// Read-only tools plus task planning.
    Plan,
    /// Full tool access.
    #[default]
    Act,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chat" => Ok(Self::Chat),
            "plan" => Ok(Self::Plan),
            "act" => Ok(Self::Act),
            other => Err(format!("unknown execution mode '{other}'")),
        }
    }
}

/// An image handed in with the instruction, base64-encoded by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub name: String,
    pub base64_data: String,
    pub mime_type: String,
}

/// A text document folded into the instruction as context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentAttachment {
    pub name: String,
    pub content: String,
    pub mime_type: String,
}

/// A caller-facing execution request, before instruction enrichment.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub project_id: String,
    pub conversation_id: String,
    /// The caller's chat-session row id, recorded on every message.
    pub session_id: String,
    pub instruction: String,
    pub working_dir: PathBuf,
    /// Caller-supplied resume hint; the session registry takes precedence.
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
    pub images: Vec<ImageAttachment>,
    pub documents: Vec<DocumentAttachment>,
    pub is_initial_prompt: bool,
    pub mode: ExecutionMode,
    pub backend: BackendType,
}

/// What an adapter sees: the enriched instruction plus run context.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub project_id: String,
    pub conversation_id: String,
    pub session_id: Option<String>,
    pub instruction: String,
    pub working_dir: PathBuf,
    pub resume_session_id: Option<String>,
    pub model: Option<String>,
    pub is_initial_prompt: bool,
    pub mode: ExecutionMode,
}

impl StreamRequest {
    /// Construct a message carrying this run's project/conversation/session.
    pub fn message(
        &self,
        role: Role,
        message_type: MessageType,
        content: impl Into<String>,
    ) -> UnifiedMessage {
        UnifiedMessage {
            id: Uuid::new_v4().to_string(),
            project_id: self.project_id.clone(),
            conversation_id: self.conversation_id.clone(),
            session_id: self.session_id.clone(),
            role,
            message_type,
            content: content.into(),
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one execution. Computed once per run, returned to the caller,
/// never persisted as an entity.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub backend_used: BackendType,
    pub has_changes: bool,
    pub message_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failed(backend: BackendType, error: impl Into<String>) -> Self {
        Self {
            success: false,
            backend_used: backend,
            has_changes: false,
            message_count: 0,
            error: Some(error.into()),
        }
    }
}

/// Whether a backend is installed and ready. Absence is a normal negative
/// result, never an error.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Availability {
    pub available: bool,
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub default_models: Vec<String>,
}

impl Availability {
    pub fn ready(models: Vec<String>, default_models: Vec<String>) -> Self {
        Self {
            available: true,
            configured: true,
            error: None,
            models,
            default_models,
        }
    }

    pub fn missing(error: impl Into<String>) -> Self {
        Self {
            available: false,
            configured: false,
            error: Some(error.into()),
            models: Vec::new(),
            default_models: Vec::new(),
        }
    }
}
