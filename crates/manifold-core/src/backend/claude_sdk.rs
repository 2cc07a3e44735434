// ABOUTME: Claude SDK-stream adapter - consumes typed agent events with structured content blocks
// ABOUTME: Production transport drives `claude --output-format stream-json`; tests inject scripted streams

use super::{probe_binary, Backend};
use crate::model;
use crate::session::SessionStore;
use crate::tools::ToolCatalog;
use crate::types::{
    Availability, BackendType, ExecutionMode, MessageType, Role, StreamRequest, UnifiedMessage,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tokio::sync::mpsc;

const INSTALL_HINT: &str = "To install:\n1. Install Claude Code: npm install -g @anthropic-ai/claude-code\n2. Login: claude login\n3. Check installation: claude -h";

/// Configuration for the Claude SDK-stream backend
#[derive(Debug, Clone)]
pub struct ClaudeSdkConfig {
    /// Path to the claude binary (defaults to "claude")
    pub binary: String,
    /// Extra system prompt appended to the agent's own
    pub system_prompt: Option<String>,
}

impl Default for ClaudeSdkConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            system_prompt: None,
        }
    }
}

/// One typed event from the agent stream. Unknown event types land in
/// `Other` so new wire vocabulary never breaks the stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SdkEvent {
    System(SystemEvent),
    Assistant {
        #[serde(default)]
        message: AssistantPayload,
    },
    User {
        #[serde(default)]
        message: Value,
    },
    Result(ResultEvent),
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantPayload {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Structured content blocks inside an assistant event.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub duration_api_ms: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

/// What the transport yields: typed events plus two out-of-band signals.
#[derive(Debug)]
pub enum TransportItem {
    Event(SdkEvent),
    /// The backend rejected the stored session id; it should be cleared.
    SessionNotFound,
    /// The transport itself failed (spawn error surfaced mid-stream, or the
    /// process exited non-zero without a result event).
    Fatal(String),
}

/// Source of the typed event stream. The production implementation spawns the
/// claude binary; tests script the items directly.
#[async_trait]
pub trait SdkTransport: Send + Sync {
    async fn start(
        &self,
        request: &StreamRequest,
        model: Option<String>,
        resume: Option<String>,
    ) -> Result<BoxStream<'static, TransportItem>>;
}

/// Tool permissions per execution mode. The first turn of a project must not
/// produce planning artifacts before any code exists, so act-mode initial
/// prompts exclude TodoWrite.
fn tool_permissions(
    mode: ExecutionMode,
    is_initial_prompt: bool,
) -> (Vec<&'static str>, Vec<&'static str>) {
    const READ_ONLY: &[&str] = &["Read", "Glob", "Grep", "LS", "WebFetch", "WebSearch"];
    const FULL: &[&str] = &[
        "Read", "Write", "Edit", "MultiEdit", "Bash", "Glob", "Grep", "LS", "WebFetch", "WebSearch",
    ];

    match mode {
        ExecutionMode::Chat => (
            READ_ONLY.to_vec(),
            vec!["Write", "Edit", "MultiEdit", "Bash", "TodoWrite"],
        ),
        ExecutionMode::Plan => {
            let mut allowed = READ_ONLY.to_vec();
            allowed.push("TodoWrite");
            (allowed, vec!["Write", "Edit", "MultiEdit", "Bash"])
        }
        ExecutionMode::Act => {
            if is_initial_prompt {
                (FULL.to_vec(), vec!["TodoWrite"])
            } else {
                let mut allowed = FULL.to_vec();
                allowed.push("TodoWrite");
                (allowed, Vec::new())
            }
        }
    }
}

/// Production transport: spawns the claude binary in streaming JSON mode and
/// deserializes each stdout line straight into a typed event.
pub struct CliTransport {
    binary: String,
    system_prompt: Option<String>,
}

impl CliTransport {
    pub fn new(binary: String, system_prompt: Option<String>) -> Self {
        Self {
            binary,
            system_prompt,
        }
    }
}

#[async_trait]
impl SdkTransport for CliTransport {
    async fn start(
        &self,
        request: &StreamRequest,
        model: Option<String>,
        resume: Option<String>,
    ) -> Result<BoxStream<'static, TransportItem>> {
        let mut args = vec![
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];

        if let Some(model) = model {
            args.push("--model".to_string());
            args.push(model);
        }

        if let Some(resume) = resume {
            args.push("--resume".to_string());
            args.push(resume);
        }

        if let Some(ref prompt) = self.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }

        let (allowed, disallowed) = tool_permissions(request.mode, request.is_initial_prompt);
        args.push("--allowedTools".to_string());
        args.push(allowed.join(","));
        if !disallowed.is_empty() {
            args.push("--disallowedTools".to_string());
            args.push(disallowed.join(","));
        }

        args.push(request.instruction.clone());

        tracing::debug!(args = ?args, cwd = %request.working_dir.display(), "Spawning Claude CLI");

        let mut child = ProcessCommand::new(&self.binary)
            .args(&args)
            .current_dir(&request.working_dir)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .context("Failed to spawn Claude CLI")?;

        let stdout = child.stdout.take().context("Failed to capture stdout")?;
        let stderr = child.stderr.take().context("Failed to capture stderr")?;

        let (tx, rx) = mpsc::channel::<TransportItem>(100);

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
                    if line.contains("No conversation found with session ID") {
                        tracing::warn!("Detected orphaned session - will clear stored session ID");
                        orphan_detected_stderr.store(true, std::sync::atomic::Ordering::SeqCst);
                    } else {
                        tracing::debug!(stderr = %line, "Claude CLI stderr");
                    }
                }
            });

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();
            let mut receiver_closed = false;

            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }

                match serde_json::from_str::<SdkEvent>(&line) {
                    Ok(event) => {
                        if tx.send(TransportItem::Event(event)).await.is_err() {
                            tracing::debug!("Event receiver closed, draining process");
                            receiver_closed = true;
                            break;
                        }
                    }
                    Err(e) => {
                        let display_line = if line.chars().count() > 200 {
                            let truncated: String = line.chars().take(200).collect();
                            format!("{}...[truncated]", truncated)
                        } else {
                            line.clone()
                        };
                        tracing::warn!(
                            error = %e,
                            line = %display_line,
                            "Failed to parse Claude CLI output line"
                        );
                    }
                }
            }

            if let Err(e) = stderr_handle.await {
                tracing::warn!(error = %e, "stderr reader task failed to complete");
            }

            let orphaned = orphan_detected.load(std::sync::atomic::Ordering::SeqCst);
            if orphaned && !receiver_closed {
                let _ = tx.send(TransportItem::SessionNotFound).await;
            }

            // The child is reaped on every path, even when the consumer
            // stopped listening.
            match child.wait().await {
                Ok(status) => {
                    if !status.success() && !orphaned && !receiver_closed {
                        let _ = tx
                            .send(TransportItem::Fatal(format!(
                                "Claude CLI exited with status: {:?}",
                                status.code()
                            )))
                            .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to wait for Claude CLI process");
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

/// Turns typed events into unified messages.
///
/// Text blocks accumulate into one buffer per assistant event; tool_use
/// blocks emit immediately; tool_result blocks only settle the pending
/// invocation table. The init and result events become hidden bookkeeping
/// messages.
struct Normalizer {
    request: StreamRequest,
    catalog: ToolCatalog,
    buffer: String,
    pending: HashMap<String, String>,
}

#[derive(Default)]
struct Normalized {
    messages: Vec<UnifiedMessage>,
    session_id: Option<String>,
    clear_session: bool,
    done: bool,
}

impl Normalizer {
    fn new(request: StreamRequest) -> Self {
        Self {
            request,
            catalog: ToolCatalog::new(),
            buffer: String::new(),
            pending: HashMap::new(),
        }
    }

    fn on_item(&mut self, item: TransportItem) -> Normalized {
        match item {
            TransportItem::Event(event) => self.on_event(event),
            TransportItem::SessionNotFound => {
                let message = self
                    .request
                    .message(
                        Role::System,
                        MessageType::System,
                        "Backend session not found; cleared stored session",
                    )
                    .with_metadata("backend", json!("claude"))
                    .with_metadata("session_orphaned", json!(true))
                    .hidden();
                Normalized {
                    messages: vec![message],
                    clear_session: true,
                    ..Default::default()
                }
            }
            TransportItem::Fatal(reason) => {
                let message = self
                    .request
                    .message(
                        Role::Assistant,
                        MessageType::Error,
                        format!("Claude agent execution failed: {reason}"),
                    )
                    .with_metadata("backend", json!("claude"))
                    .with_metadata("error", json!("stream_failed"));
                Normalized {
                    messages: vec![message],
                    ..Default::default()
                }
            }
        }
    }

    fn on_event(&mut self, event: SdkEvent) -> Normalized {
        match event {
            SdkEvent::System(ev) => self.on_system(ev),
            SdkEvent::Assistant { message } => self.on_assistant(message),
            SdkEvent::User { message } => self.on_user(&message),
            SdkEvent::Result(ev) => self.on_result(ev),
            SdkEvent::Other => {
                tracing::debug!("Unhandled agent event type");
                Normalized::default()
            }
        }
    }

    fn on_system(&mut self, ev: SystemEvent) -> Normalized {
        let session_id = ev.session_id.clone();
        let model_label = ev.model.clone().unwrap_or_else(|| "default".to_string());
        let message = self
            .request
            .message(
                Role::System,
                MessageType::System,
                format!("Claude agent initialized (model: {model_label})"),
            )
            .with_metadata("backend", json!("claude"))
            .with_metadata("subtype", json!(ev.subtype))
            .with_metadata("model", json!(ev.model))
            .with_metadata("session_id", json!(ev.session_id))
            .hidden();

        Normalized {
            messages: vec![message],
            session_id,
            ..Default::default()
        }
    }

    fn on_assistant(&mut self, payload: AssistantPayload) -> Normalized {
        let mut messages = Vec::new();

        for block in payload.content {
            match block {
                ContentBlock::Text { text } => {
                    self.buffer.push_str(&text);
                }
                ContentBlock::ToolUse { id, name, input } => {
                    let summary = self.catalog.summary(&name, &input);
                    tracing::info!(tool = %self.catalog.clean_display(&name, &input), "Tool use");
                    let message = self
                        .request
                        .message(Role::Assistant, MessageType::ToolUse, summary.clone())
                        .with_metadata("backend", json!("claude"))
                        .with_metadata("tool_name", json!(self.catalog.canonical(&name)))
                        .with_metadata("tool_input", input)
                        .with_metadata("tool_id", json!(id));
                    messages.push(message);
                    self.pending.insert(id, summary);
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content: _,
                    is_error: _,
                } => {
                    // These backends only report results back to the model,
                    // not the user; the pending entry is settled and dropped.
                    if self.pending.remove(&tool_use_id).is_none() {
                        tracing::debug!(tool_use_id = %tool_use_id, "Tool result for unknown invocation");
                    }
                }
                ContentBlock::Thinking { .. } | ContentBlock::Other => {}
            }
        }

        let text = self.buffer.trim();
        if !text.is_empty() {
            messages.push(self.request.message(Role::Assistant, MessageType::Chat, text));
        }
        self.buffer.clear();

        Normalized {
            messages,
            ..Default::default()
        }
    }

    /// User events carry tool results back to the model. They settle pending
    /// invocations and are never emitted (the caller already recorded the
    /// real user message).
    fn on_user(&mut self, message: &Value) -> Normalized {
        if let Some(blocks) = message.get("content").and_then(|c| c.as_array()) {
            for block in blocks {
                if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                    if let Some(id) = block.get("tool_use_id").and_then(|i| i.as_str()) {
                        if self.pending.remove(id).is_none() {
                            tracing::debug!(tool_use_id = %id, "Tool result for unknown invocation");
                        }
                    }
                }
            }
        }
        Normalized::default()
    }

    fn on_result(&mut self, ev: ResultEvent) -> Normalized {
        let session_id = ev.session_id.clone();
        let message = self
            .request
            .message(
                Role::System,
                MessageType::Result,
                format!("Session completed in {}ms", ev.duration_ms),
            )
            .with_metadata("backend", json!("claude"))
            .with_metadata("duration_ms", json!(ev.duration_ms))
            .with_metadata("duration_api_ms", json!(ev.duration_api_ms))
            .with_metadata("total_cost_usd", json!(ev.total_cost_usd))
            .with_metadata("num_turns", json!(ev.num_turns))
            .with_metadata("is_error", json!(ev.is_error))
            .with_metadata("subtype", json!(ev.subtype))
            .with_metadata("session_id", json!(ev.session_id))
            .hidden();

        Normalized {
            messages: vec![message],
            session_id,
            done: true,
            ..Default::default()
        }
    }

    /// Flush any text the stream left behind (result event never arrived).
    fn finish(&mut self) -> Option<UnifiedMessage> {
        if !self.pending.is_empty() {
            tracing::debug!(unmatched = self.pending.len(), "Discarding unmatched tool invocations");
            self.pending.clear();
        }
        let text = self.buffer.trim();
        if text.is_empty() {
            return None;
        }
        let message = self.request.message(Role::Assistant, MessageType::Chat, text);
        self.buffer.clear();
        Some(message)
    }
}

/// SDK-stream adapter for the Claude agent CLI.
pub struct ClaudeSdkBackend {
    config: ClaudeSdkConfig,
    transport: Arc<dyn SdkTransport>,
    sessions: Arc<dyn SessionStore>,
}

impl ClaudeSdkBackend {
    pub fn new(config: ClaudeSdkConfig, sessions: Arc<dyn SessionStore>) -> Self {
        let transport = Arc::new(CliTransport::new(
            config.binary.clone(),
            config.system_prompt.clone(),
        ));
        Self {
            config,
            transport,
            sessions,
        }
    }

    /// Swap the transport; used by tests to script typed event streams.
    pub fn with_transport(
        config: ClaudeSdkConfig,
        transport: Arc<dyn SdkTransport>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            transport,
            sessions,
        }
    }
}

#[async_trait]
impl Backend for ClaudeSdkBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Claude
    }

    async fn check_availability(&self) -> Availability {
        let mut status = probe_binary(&self.config.binary, "claude", INSTALL_HINT).await;
        if status.available {
            status.models = model::supported_models(BackendType::Claude);
            status.default_models = model::default_models(BackendType::Claude);
        }
        status
    }

    async fn stream_execute(
        &self,
        request: StreamRequest,
    ) -> Result<BoxStream<'static, UnifiedMessage>> {
        let resolved_model = model::resolve_opt(BackendType::Claude, request.model.as_deref());

        // The registry's stored session wins over any caller-supplied hint.
        let stored = self
            .sessions
            .get(&request.project_id, BackendType::Claude)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read stored session id");
                None
            });
        let resume = stored.or_else(|| request.resume_session_id.clone());
        if let Some(ref sid) = resume {
            tracing::info!(session_id = %sid, "Resuming Claude session");
        }

        let mut transport_stream = self.transport.start(&request, resolved_model, resume).await?;

        let sessions = self.sessions.clone();
        let project_id = request.project_id.clone();
        let mut normalizer = Normalizer::new(request);

        let (tx, rx) = mpsc::channel::<UnifiedMessage>(100);

        tokio::spawn(async move {
            use futures::StreamExt;

            while let Some(item) = transport_stream.next().await {
                let out = normalizer.on_item(item);

                if let Some(ref sid) = out.session_id {
                    if let Err(e) = sessions.set(&project_id, BackendType::Claude, sid).await {
                        tracing::warn!(error = %e, "Failed to store session id");
                    }
                }
                if out.clear_session {
                    if let Err(e) = sessions.clear(&project_id, BackendType::Claude).await {
                        tracing::warn!(error = %e, "Failed to clear orphaned session id");
                    }
                }

                for message in out.messages {
                    if tx.send(message).await.is_err() {
                        tracing::debug!("Message receiver closed, stopping stream");
                        return;
                    }
                }

                if out.done {
                    break;
                }
            }

            if let Some(message) = normalizer.finish() {
                let _ = tx.send(message).await;
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }

    async fn session_id(&self, project_id: &str) -> Result<Option<String>> {
        self.sessions.get(project_id, BackendType::Claude).await
    }

    async fn set_session_id(&self, project_id: &str, session_id: &str) -> Result<()> {
        self.sessions
            .set(project_id, BackendType::Claude, session_id)
            .await
    }
}
