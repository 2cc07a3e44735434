// ABOUTME: Cursor agent CLI backend - spawns cursor-agent with --output-format stream-json
// ABOUTME: Parses NDJSON from stdout, coalesces assistant deltas, self-terminates on the result event

use super::{probe_binary, Backend};
use crate::model;
use crate::session::SessionStore;
use crate::tools::ToolCatalog;
use crate::types::{
    Availability, BackendType, MessageType, Role, StreamRequest, UnifiedMessage,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;

const INSTALL_HINT: &str = "To install:\n1. Install Cursor: curl https://cursor.com/install -fsS | bash\n2. Login: cursor-agent login\n3. Check installation: cursor-agent -h";

/// Field names different builds of the agent have used for the session id,
/// in priority order. The first candidate differing from the id already in
/// use wins.
const SESSION_KEYS: &[&str] = &[
    "sessionId",
    "chatId",
    "session_id",
    "chat_id",
    "threadId",
    "thread_id",
];

const NESTED_SESSION_KEYS: &[&str] = &["sessionId", "chatId", "session_id", "chat_id"];

/// Configuration for the Cursor CLI backend
#[derive(Debug, Clone)]
pub struct CursorCliConfig {
    /// Path to the cursor-agent binary (defaults to "cursor-agent")
    pub binary: String,
    /// Model used when the request does not name one
    pub default_model: Option<String>,
}

impl Default for CursorCliConfig {
    fn default() -> Self {
        Self {
            binary: "cursor-agent".to_string(),
            default_model: None,
        }
    }
}

pub struct CursorCliBackend {
    config: CursorCliConfig,
    sessions: Arc<dyn SessionStore>,
}

impl CursorCliBackend {
    pub fn new(config: CursorCliConfig, sessions: Arc<dyn SessionStore>) -> Self {
        Self { config, sessions }
    }
}

#[async_trait]
impl Backend for CursorCliBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Cursor
    }

    async fn check_availability(&self) -> Availability {
        let mut status = probe_binary(&self.config.binary, "cursor-agent", INSTALL_HINT).await;
        if status.available {
            status.models = model::supported_models(BackendType::Cursor);
            status.default_models = model::default_models(BackendType::Cursor);
        }
        status
    }

    async fn stream_execute(
        &self,
        request: StreamRequest,
    ) -> Result<BoxStream<'static, UnifiedMessage>> {
        // The registry's stored session wins over any caller-supplied hint.
        let stored = self
            .sessions
            .get(&request.project_id, BackendType::Cursor)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read stored session id");
                None
            });
        let active_session = stored.or_else(|| request.resume_session_id.clone());
        if let Some(ref sid) = active_session {
            tracing::info!(session_id = %sid, "Resuming Cursor session");
        }

        let resolved_model = model::resolve_opt(BackendType::Cursor, request.model.as_deref())
            .or_else(|| self.config.default_model.clone());

        let mut child = spawn_cursor_process(
            &self.config,
            &request,
            active_session.as_deref(),
            resolved_model.as_deref(),
        )?;

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        let sessions = self.sessions.clone();
        let project_id = request.project_id.clone();
        let mut normalizer = CursorNormalizer::new(request, active_session);

        let (tx, rx) = mpsc::channel::<UnifiedMessage>(100);

        tokio::spawn(async move {
            let orphan_detected = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let orphan_detected_stderr = orphan_detected.clone();

            let stderr_handle = tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();

                while let Ok(Some(line)) = lines.next_line().await {
                    if line.is_empty() {
                        continue;
                    }
                    if line.contains("No conversation found")
                        || line.contains("session not found")
                        || line.contains("Session not found")
                    {
                        tracing::warn!("Detected orphaned session - will clear stored session ID");
                        orphan_detected_stderr.store(true, std::sync::atomic::Ordering::SeqCst);
                    } else {
                        tracing::debug!(stderr = %line, "Cursor CLI stderr");
                    }
                }
            });

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            let mut should_kill = false;

            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }

                let out = normalizer.on_line(&line);

                if let Some(ref sid) = out.session_id {
                    tracing::info!(session_id = %sid, "Updating stored Cursor session id");
                    if let Err(e) = sessions.set(&project_id, BackendType::Cursor, sid).await {
                        tracing::warn!(error = %e, "Failed to store session id");
                    }
                }

                let mut receiver_closed = false;
                for message in out.messages {
                    if tx.send(message).await.is_err() {
                        tracing::debug!("Message receiver closed, stopping stream");
                        receiver_closed = true;
                        break;
                    }
                }

                if out.terminate || receiver_closed {
                    // The result event is the authoritative completion signal;
                    // the process may keep running, so stop it rather than
                    // waiting for the stream to close naturally.
                    should_kill = true;
                    break;
                }
            }

            if let Some(message) = normalizer.flush() {
                let _ = tx.send(message).await;
            }

            if should_kill {
                if let Err(e) = child.start_kill() {
                    tracing::warn!(error = %e, "Failed to terminate Cursor CLI process");
                }
            }

            if let Err(e) = stderr_handle.await {
                tracing::warn!(error = %e, "stderr reader task failed to complete");
            }

            let orphaned = orphan_detected.load(std::sync::atomic::Ordering::SeqCst);
            if orphaned {
                if let Err(e) = sessions.clear(&project_id, BackendType::Cursor).await {
                    tracing::warn!(error = %e, "Failed to clear orphaned session id");
                }
                let _ = tx.send(normalizer.orphaned_message()).await;
            }

            // Always reap the child, whichever path got us here.
            match child.wait().await {
                Ok(status) => {
                    if !status.success() && !normalizer.result_seen && !orphaned {
                        let _ = tx
                            .send(normalizer.exit_error_message(status.code()))
                            .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for Cursor CLI process");
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn session_id(&self, project_id: &str) -> Result<Option<String>> {
        self.sessions.get(project_id, BackendType::Cursor).await
    }

    async fn set_session_id(&self, project_id: &str, session_id: &str) -> Result<()> {
        self.sessions
            .set(project_id, BackendType::Cursor, session_id)
            .await
    }
}

/// Spawn the cursor-agent process in streaming JSON mode.
fn spawn_cursor_process(
    config: &CursorCliConfig,
    request: &StreamRequest,
    active_session: Option<&str>,
    model: Option<&str>,
) -> Result<Child> {
    let mut cmd = ProcessCommand::new(&config.binary);
    cmd.arg("--force")
        .arg("-p")
        .arg(&request.instruction)
        .arg("--output-format")
        .arg("stream-json");

    if let Some(session_id) = active_session {
        cmd.arg("--resume").arg(session_id);
    }

    if let Ok(api_key) = std::env::var("CURSOR_API_KEY") {
        if !api_key.is_empty() {
            cmd.arg("--api-key").arg(api_key);
        }
    }

    if let Some(model) = model {
        cmd.arg("-m").arg(model);
    }

    tracing::debug!(binary = %config.binary, cwd = %request.working_dir.display(), "Spawning Cursor CLI");

    cmd.current_dir(&request.working_dir)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .context("Failed to spawn Cursor CLI")
}

/// Per-line NDJSON normalization with the cross-line state one run needs:
/// an assistant-delta buffer and the result-seen flag.
struct CursorNormalizer {
    request: StreamRequest,
    catalog: ToolCatalog,
    buffer: String,
    pending: HashMap<String, String>,
    active_session: Option<String>,
    captured_session: Option<String>,
    result_seen: bool,
}

#[derive(Default)]
struct CursorOutput {
    messages: Vec<UnifiedMessage>,
    session_id: Option<String>,
    terminate: bool,
}

impl CursorNormalizer {
    fn new(request: StreamRequest, active_session: Option<String>) -> Self {
        Self {
            request,
            catalog: ToolCatalog::new(),
            buffer: String::new(),
            pending: HashMap::new(),
            active_session,
            captured_session: None,
            result_seen: false,
        }
    }

    /// Each line parses independently: a malformed line becomes a raw chat
    /// message tagged with the parse error, never a stream abort.
    fn on_line(&mut self, line: &str) -> CursorOutput {
        let event: Value = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse Cursor CLI output line as JSON");
                let message = self
                    .request
                    .message(Role::Assistant, MessageType::Chat, line)
                    .with_metadata("backend", json!("cursor"))
                    .with_metadata("raw_output", json!(line))
                    .with_metadata("parse_error", json!(e.to_string()));
                return CursorOutput {
                    messages: vec![message],
                    ..Default::default()
                };
            }
        };

        let event_type = event.get("type").and_then(|t| t.as_str()).unwrap_or("");
        let mut out = CursorOutput::default();

        if self.captured_session.is_none() {
            if let Some(sid) = extract_session_candidate(&event, self.active_session.as_deref()) {
                self.captured_session = Some(sid.clone());
                out.session_id = Some(sid);
            }
        }

        // A non-assistant event interrupts the delta run: flush first so the
        // coalesced text lands ahead of whatever comes next.
        if event_type != "assistant" {
            if let Some(flushed) = self.flush() {
                out.messages.push(flushed);
            }
        }

        match event_type {
            "system" => {
                let model_label = event
                    .get("model")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown");
                let message = self
                    .request
                    .message(
                        Role::System,
                        MessageType::System,
                        format!("Cursor agent initialized (model: {model_label})"),
                    )
                    .with_metadata("backend", json!("cursor"))
                    .with_metadata("event_type", json!("system"))
                    .with_metadata("original_event", event)
                    .hidden();
                out.messages.push(message);
            }
            "user" => {
                // The agent echoes the prompt back; re-emitting would
                // duplicate the user message the caller already recorded.
            }
            "assistant" => {
                if let Some(parts) = event
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array())
                {
                    for part in parts {
                        if part.get("type").and_then(|t| t.as_str()) == Some("text") {
                            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                self.buffer.push_str(text);
                            }
                        }
                    }
                }
            }
            "tool_call" => {
                if let Some(message) = self.on_tool_call(&event) {
                    out.messages.push(message);
                }
            }
            "result" => {
                self.result_seen = true;
                out.terminate = true;

                let duration = event
                    .get("duration_ms")
                    .and_then(|d| d.as_u64())
                    .unwrap_or(0);
                let content = match event.get("result").and_then(|r| r.as_str()) {
                    Some(result_text) if !result_text.is_empty() => format!(
                        "Execution completed in {duration}ms. Final result: {result_text}"
                    ),
                    _ => format!("Execution completed in {duration}ms"),
                };
                let message = self
                    .request
                    .message(Role::System, MessageType::Result, content)
                    .with_metadata("backend", json!("cursor"))
                    .with_metadata("event_type", json!("result"))
                    .with_metadata("duration_ms", json!(duration))
                    .with_metadata("original_event", event)
                    .hidden();
                out.messages.push(message);
            }
            unknown => {
                tracing::debug!(event_type = %unknown, "Unhandled Cursor CLI event type");
            }
        }

        out
    }

    fn on_tool_call(&mut self, event: &Value) -> Option<UnifiedMessage> {
        let subtype = event.get("subtype").and_then(|s| s.as_str())?;
        let tool_call = event.get("tool_call").and_then(|t| t.as_object())?;
        let (raw_key, payload) = tool_call.iter().next()?;

        // "lsToolCall" -> "ls"
        let tool_name = raw_key.strip_suffix("ToolCall").unwrap_or(raw_key);

        match subtype {
            "started" => {
                let args = payload.get("args").cloned().unwrap_or(Value::Null);
                let summary = self.catalog.summary(tool_name, &args);
                tracing::info!(tool = %self.catalog.clean_display(tool_name, &args), "Tool use");
                self.pending.insert(tool_name.to_string(), summary.clone());

                Some(
                    self.request
                        .message(Role::Assistant, MessageType::ToolUse, summary)
                        .with_metadata("backend", json!("cursor"))
                        .with_metadata("event_type", json!("tool_call_started"))
                        .with_metadata("tool_name", json!(self.catalog.canonical(tool_name)))
                        .with_metadata("tool_input", args)
                        .with_metadata("original_event", event.clone()),
                )
            }
            "completed" => {
                let result = payload.get("result");
                let content = result
                    .and_then(|r| r.get("success").or_else(|| r.get("error")))
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| {
                        format!("{} completed", self.catalog.canonical(tool_name))
                    });

                if self.pending.remove(tool_name).is_none() {
                    tracing::debug!(tool = %tool_name, "Tool completion for unknown invocation");
                }

                Some(
                    self.request
                        .message(Role::System, MessageType::ToolResult, content)
                        .with_metadata("backend", json!("cursor"))
                        .with_metadata("tool_name", json!(self.catalog.canonical(tool_name)))
                        .with_metadata("original_event", event.clone())
                        .hidden(),
                )
            }
            other => {
                tracing::debug!(subtype = %other, "Unhandled tool_call subtype");
                None
            }
        }
    }

    /// Coalesce buffered assistant deltas into one chat message.
    fn flush(&mut self) -> Option<UnifiedMessage> {
        if self.buffer.trim().is_empty() {
            self.buffer.clear();
            return None;
        }
        let text = std::mem::take(&mut self.buffer);
        Some(
            self.request
                .message(Role::Assistant, MessageType::Chat, text)
                .with_metadata("backend", json!("cursor"))
                .with_metadata("event_type", json!("assistant_aggregated")),
        )
    }

    fn orphaned_message(&self) -> UnifiedMessage {
        self.request
            .message(
                Role::System,
                MessageType::System,
                "Backend session not found; cleared stored session",
            )
            .with_metadata("backend", json!("cursor"))
            .with_metadata("session_orphaned", json!(true))
            .hidden()
    }

    fn exit_error_message(&self, code: Option<i32>) -> UnifiedMessage {
        self.request
            .message(
                Role::Assistant,
                MessageType::Error,
                format!("Cursor agent exited with status: {code:?}"),
            )
            .with_metadata("backend", json!("cursor"))
            .with_metadata("error", json!("execution_failed"))
    }
}

/// Scan the prioritized candidate fields for a session-like identifier,
/// top level first, then nested under `message`. A candidate equal to the id
/// already in use is not an update.
fn extract_session_candidate(event: &Value, active: Option<&str>) -> Option<String> {
    let top_level = SESSION_KEYS
        .iter()
        .find_map(|key| event.get(*key).and_then(|v| v.as_str()));

    let candidate = top_level.or_else(|| {
        event.get("message").and_then(|m| {
            NESTED_SESSION_KEYS
                .iter()
                .find_map(|key| m.get(*key).and_then(|v| v.as_str()))
        })
    })?;

    if Some(candidate) == active {
        return None;
    }
    Some(candidate.to_string())
}
