// ABOUTME: The manifold orchestrator - drives one execution end to end
// ABOUTME: Availability gate, persist-then-publish loop, run-level success determination

use crate::backend::{Backend, ClaudeSdkBackend, CursorCliBackend};
use crate::config::Config;
use crate::model;
use crate::session::SessionStore;
use crate::sink::{Envelope, MessageSink};
use crate::types::{
    Availability, BackendType, ExecutionRequest, ExecutionResult, ImageAttachment, MessageType,
    Role, StreamRequest, UnifiedMessage,
};
use anyhow::{Context, Result};
use base64::Engine as _;
use futures::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use thiserror::Error;

/// Why a run failed before or while streaming. Reported inside
/// `ExecutionResult.error`; adapter faults never escape the engine.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("backend {0} is not registered")]
    UnknownBackend(BackendType),
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable {
        backend: BackendType,
        reason: String,
    },
    #[error("stream failed: {0}")]
    StreamFailed(String),
}

/// Availability plus model validation, for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    #[serde(flatten)]
    pub availability: Availability,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_warning: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub suggested_models: Vec<String>,
}

/// The unified execution engine: one adapter per backend type, one message
/// sink, one session registry.
///
/// Each `execute` call is a single independent task. Messages are persisted
/// before they are published, in stream order, inside the consuming task.
pub struct Manifold {
    adapters: HashMap<BackendType, Arc<dyn Backend>>,
    sink: Arc<dyn MessageSink>,
    sessions: Arc<dyn SessionStore>,
}

impl Manifold {
    pub fn new(sink: Arc<dyn MessageSink>, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            adapters: HashMap::new(),
            sink,
            sessions,
        }
    }

    /// Register an adapter, replacing any previous one for its backend type.
    pub fn register(mut self, backend: Arc<dyn Backend>) -> Self {
        self.adapters.insert(backend.backend_type(), backend);
        self
    }

    /// Construct an engine with both stock adapters wired from config.
    pub fn with_default_backends(
        config: &Config,
        sink: Arc<dyn MessageSink>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        let claude = Arc::new(ClaudeSdkBackend::new(
            config.claude_backend(),
            sessions.clone(),
        ));
        let cursor = Arc::new(CursorCliBackend::new(
            config.cursor_backend(),
            sessions.clone(),
        ));
        Self::new(sink, sessions).register(claude).register(cursor)
    }

    /// Drive one execution: gate on availability, stream the adapter's
    /// messages through the sink, and judge run-level success.
    ///
    /// Success precedence is deterministic: an explicit terminal result
    /// signal, when one was observed, wins over the any-error heuristic.
    /// No timeout is enforced at this layer; a hung backend hangs the run.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let backend_type = request.backend;
        let Some(backend) = self.adapters.get(&backend_type).cloned() else {
            return ExecutionResult::failed(
                backend_type,
                ExecuteError::UnknownBackend(backend_type).to_string(),
            );
        };

        let status = backend.check_availability().await;
        if !(status.available && status.configured) {
            let reason = status
                .error
                .unwrap_or_else(|| "backend not available".to_string());
            tracing::error!(backend = %backend_type, reason = %reason, "Backend unavailable");
            return ExecutionResult::failed(
                backend_type,
                ExecuteError::BackendUnavailable {
                    backend: backend_type,
                    reason,
                }
                .to_string(),
            );
        }

        // Staged attachment files must outlive the stream.
        let (instruction, _staged) = prepare_instruction(&request);

        let stream_request = StreamRequest {
            project_id: request.project_id.clone(),
            conversation_id: request.conversation_id.clone(),
            session_id: Some(request.session_id.clone()),
            instruction,
            working_dir: request.working_dir.clone(),
            resume_session_id: request.resume_session_id.clone(),
            model: request.model.clone(),
            is_initial_prompt: request.is_initial_prompt,
            mode: request.mode,
        };

        tracing::info!(backend = %backend_type, project = %request.project_id, "Starting execution");

        let mut tracker = RunTracker::new(backend_type);

        let mut stream = match backend.stream_execute(stream_request.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                // Record a terminal error message so the failure is legible
                // in the same conversation, then report the failed run.
                let failure = ExecuteError::StreamFailed(e.to_string());
                tracing::error!(backend = %backend_type, error = %e, "Failed to start stream");
                let message = stream_request
                    .message(
                        Role::Assistant,
                        MessageType::Error,
                        format!("{backend_type} execution failed: {e}"),
                    )
                    .with_metadata("backend", json!(backend_type.as_str()))
                    .with_metadata("error", json!("stream_failed"));
                self.deliver(&request.project_id, message, &mut tracker).await;
                let mut result = tracker.finish();
                result.error = Some(failure.to_string());
                return result;
            }
        };

        while let Some(message) = stream.next().await {
            self.deliver(&request.project_id, message, &mut tracker).await;
        }

        let result = tracker.finish();
        if result.success {
            tracing::info!(
                backend = %backend_type,
                messages = result.message_count,
                "Execution completed successfully"
            );
        } else {
            tracing::error!(
                backend = %backend_type,
                messages = result.message_count,
                error = result.error.as_deref().unwrap_or(""),
                "Execution completed with errors"
            );
        }
        result
    }

    /// Persist, then publish unless hidden. A message is durably recorded
    /// before any observer can see it; a persist failure therefore also
    /// suppresses the publish. Publish is best-effort and never aborts the
    /// run.
    async fn deliver(
        &self,
        project_id: &str,
        message: UnifiedMessage,
        tracker: &mut RunTracker,
    ) {
        tracker.observe(&message);

        if let Err(e) = self.sink.persist(&message).await {
            tracing::warn!(error = %e, message_id = %message.id, "Failed to persist message; suppressing publish");
            return;
        }

        if message.is_hidden() {
            return;
        }

        let envelope = Envelope::message(&message);
        if let Err(e) = self.sink.publish(project_id, &envelope).await {
            tracing::warn!(error = %e, "Failed to publish message");
        }
    }

    /// Availability for one backend, with optional model validation.
    pub async fn check_status(
        &self,
        backend: BackendType,
        selected_model: Option<&str>,
    ) -> BackendStatus {
        let Some(adapter) = self.adapters.get(&backend) else {
            return BackendStatus {
                availability: Availability::missing(
                    ExecuteError::UnknownBackend(backend).to_string(),
                ),
                selected_model: None,
                model_warning: None,
                suggested_models: Vec::new(),
            };
        };

        let availability = adapter.check_availability().await;
        let mut status = BackendStatus {
            suggested_models: Vec::new(),
            selected_model: None,
            model_warning: None,
            availability,
        };

        if let Some(model_name) = selected_model {
            if status.availability.available {
                if model::is_supported(backend, model_name) {
                    status.selected_model = Some(model_name.to_string());
                } else {
                    status.model_warning = Some(format!(
                        "Model '{model_name}' may not be supported by {backend}"
                    ));
                    status.suggested_models = status.availability.default_models.clone();
                }
            }
        }

        status
    }

    /// All stored backend sessions for a project.
    pub async fn sessions_for(&self, project_id: &str) -> Result<Vec<(BackendType, String)>> {
        self.sessions.all_for_project(project_id).await
    }

    /// Explicitly reset one backend's stored session for a project.
    pub async fn clear_session(&self, project_id: &str, backend: BackendType) -> Result<()> {
        self.sessions.clear(project_id, backend).await
    }

    /// Explicitly reset every backend's stored session for a project.
    pub async fn clear_all_sessions(&self, project_id: &str) -> Result<()> {
        for backend in BackendType::all() {
            self.sessions.clear(project_id, *backend).await?;
        }
        Ok(())
    }
}

/// Run-level bookkeeping over the message stream.
struct RunTracker {
    backend: BackendType,
    message_count: usize,
    any_error: bool,
    first_error: Option<String>,
    terminal: Option<bool>,
    has_changes: bool,
}

impl RunTracker {
    fn new(backend: BackendType) -> Self {
        Self {
            backend,
            message_count: 0,
            any_error: false,
            first_error: None,
            terminal: None,
            has_changes: false,
        }
    }

    fn observe(&mut self, message: &UnifiedMessage) {
        self.message_count += 1;

        if message.message_type == MessageType::Error {
            self.any_error = true;
            if self.first_error.is_none() {
                self.first_error = Some(clip(&message.content, 200));
            }
            tracing::error!(content = %clip(&message.content, 100), "Error message in stream");
        }

        if let Some(success) = terminal_signal(message) {
            self.terminal = Some(success);
        }

        if message.marks_changes() {
            self.has_changes = true;
        }
    }

    fn finish(self) -> ExecutionResult {
        let success = self.terminal.unwrap_or(!self.any_error);
        ExecutionResult {
            success,
            backend_used: self.backend,
            has_changes: self.has_changes,
            message_count: self.message_count,
            error: if success {
                None
            } else {
                Some(
                    self.first_error
                        .unwrap_or_else(|| "execution failed".to_string()),
                )
            },
        }
    }
}

/// Extract the explicit terminal verdict from a result message, if this is
/// one. Claude result messages carry is_error/subtype directly; cursor nests
/// them in the original event.
fn terminal_signal(message: &UnifiedMessage) -> Option<bool> {
    if message.message_type != MessageType::Result {
        return None;
    }

    let meta = &message.metadata;
    let original = meta.get("original_event");

    let is_error = meta
        .get("is_error")
        .and_then(|v| v.as_bool())
        .or_else(|| {
            original
                .and_then(|o| o.get("is_error"))
                .and_then(|v| v.as_bool())
        })
        .unwrap_or(false);

    let subtype = meta
        .get("subtype")
        .and_then(|v| v.as_str())
        .or_else(|| {
            original
                .and_then(|o| o.get("subtype"))
                .and_then(|v| v.as_str())
        });

    Some(!(is_error || subtype == Some("error")))
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

/// Fold document context and staged image files into one instruction.
/// Returns the temp dir holding decoded images so it outlives the stream.
fn prepare_instruction(request: &ExecutionRequest) -> (String, Option<TempDir>) {
    let mut instruction = request.instruction.clone();

    if !request.documents.is_empty() {
        let sections: Vec<String> = request
            .documents
            .iter()
            .filter(|d| !d.content.trim().is_empty())
            .map(|d| format!("=== Document: {} ===\n{}", d.name, d.content))
            .collect();
        if !sections.is_empty() {
            tracing::info!(count = sections.len(), "Folding document context into instruction");
            instruction = format!(
                "[DOCUMENT CONTEXT]\n{}\n\n[USER INSTRUCTION]\n{}",
                sections.join("\n\n"),
                instruction
            );
        }
    }

    if request.images.is_empty() {
        return (instruction, None);
    }

    match stage_images(&request.images) {
        Ok((dir, files)) if !files.is_empty() => {
            let refs: Vec<String> = files
                .iter()
                .map(|(name, mime, path)| format!("  - {} ({}): {}", name, mime, path.display()))
                .collect();
            instruction = format!("{}\n\nAttached files:\n{}", instruction, refs.join("\n"));
            (instruction, Some(dir))
        }
        Ok(_) => (instruction, None),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to stage image attachments");
            (instruction, None)
        }
    }
}

type StagedImages = (TempDir, Vec<(String, String, PathBuf)>);

fn stage_images(images: &[ImageAttachment]) -> Result<StagedImages> {
    let dir = tempfile::tempdir().context("Failed to create attachment directory")?;
    let mut files = Vec::new();

    for (idx, image) in images.iter().enumerate() {
        let bytes = match base64::engine::general_purpose::STANDARD.decode(&image.base64_data) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(name = %image.name, error = %e, "Skipping undecodable image attachment");
                continue;
            }
        };

        let path = dir.path().join(format!("{idx:02}-{}", sanitize_file_name(&image.name)));
        if let Err(e) = std::fs::write(&path, bytes) {
            tracing::warn!(name = %image.name, error = %e, "Failed to write image attachment");
            continue;
        }
        files.push((image.name.clone(), image.mime_type.clone(), path));
    }

    Ok((dir, files))
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "attachment".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use crate::sink::MemorySink;
    use crate::types::{DocumentAttachment, ExecutionMode};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use tokio::sync::Mutex;

    fn request_for(backend: BackendType) -> ExecutionRequest {
        ExecutionRequest {
            project_id: "proj".to_string(),
            conversation_id: "conv".to_string(),
            session_id: "chat-session".to_string(),
            instruction: "build it".to_string(),
            working_dir: PathBuf::from("."),
            resume_session_id: None,
            model: None,
            images: Vec::new(),
            documents: Vec::new(),
            is_initial_prompt: false,
            mode: ExecutionMode::Act,
            backend,
        }
    }

    /// Test double: yields a scripted message sequence and records the
    /// requests it was handed.
    struct ScriptedBackend {
        backend: BackendType,
        available: bool,
        scripts: Mutex<Vec<Vec<UnifiedMessage>>>,
        requests: Mutex<Vec<StreamRequest>>,
        fail_stream: bool,
    }

    impl ScriptedBackend {
        fn new(backend: BackendType, script: Vec<UnifiedMessage>) -> Self {
            Self {
                backend,
                available: true,
                scripts: Mutex::new(vec![script]),
                requests: Mutex::new(Vec::new()),
                fail_stream: false,
            }
        }

        fn unavailable(backend: BackendType) -> Self {
            Self {
                available: false,
                ..Self::new(backend, Vec::new())
            }
        }

        fn failing(backend: BackendType) -> Self {
            Self {
                fail_stream: true,
                ..Self::new(backend, Vec::new())
            }
        }

        async fn push_script(&self, script: Vec<UnifiedMessage>) {
            self.scripts.lock().await.push(script);
        }

        async fn recorded_requests(&self) -> Vec<StreamRequest> {
            self.requests.lock().await.clone()
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn backend_type(&self) -> BackendType {
            self.backend
        }

        async fn check_availability(&self) -> Availability {
            if self.available {
                Availability::ready(Vec::new(), Vec::new())
            } else {
                Availability::missing("not installed (scripted)")
            }
        }

        async fn stream_execute(
            &self,
            request: StreamRequest,
        ) -> anyhow::Result<BoxStream<'static, UnifiedMessage>> {
            self.requests.lock().await.push(request);
            if self.fail_stream {
                anyhow::bail!("spawn exploded");
            }
            let mut scripts = self.scripts.lock().await;
            let script = if scripts.is_empty() {
                Vec::new()
            } else {
                scripts.remove(0)
            };
            Ok(Box::pin(futures::stream::iter(script)))
        }

        async fn session_id(&self, _project_id: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        async fn set_session_id(&self, _project_id: &str, _session_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn stream_request() -> StreamRequest {
        StreamRequest {
            project_id: "proj".to_string(),
            conversation_id: "conv".to_string(),
            session_id: Some("chat-session".to_string()),
            instruction: "build it".to_string(),
            working_dir: PathBuf::from("."),
            resume_session_id: None,
            model: None,
            is_initial_prompt: false,
            mode: ExecutionMode::Act,
        }
    }

    fn engine_with(
        backend: Arc<ScriptedBackend>,
        sink: Arc<MemorySink>,
    ) -> Manifold {
        Manifold::new(sink, Arc::new(MemorySessionStore::new())).register(backend)
    }

    #[tokio::test]
    async fn scenario_a_full_run_persists_everything_publishes_visible() {
        let req = stream_request();
        let script = vec![
            req.message(Role::System, MessageType::System, "init").hidden(),
            req.message(Role::Assistant, MessageType::ToolUse, "**Write** `x`")
                .with_metadata("tool_name", json!("Write")),
            req.message(Role::System, MessageType::ToolResult, "ok").hidden(),
            req.message(Role::Assistant, MessageType::Chat, "done"),
        ];
        let backend = Arc::new(ScriptedBackend::new(BackendType::Claude, script));
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(backend, sink.clone());

        let result = engine.execute(request_for(BackendType::Claude)).await;

        assert!(result.success);
        assert!(!result.has_changes);
        assert_eq!(result.message_count, 4);
        assert_eq!(result.error, None);

        // All four persisted, only the two visible ones published.
        assert_eq!(sink.persisted().await.len(), 4);
        let published = sink.published().await;
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|(project, _)| project == "proj"));
    }

    #[tokio::test]
    async fn error_message_fails_the_run_without_terminal_signal() {
        let req = stream_request();
        let script = vec![
            req.message(Role::Assistant, MessageType::Chat, "working..."),
            req.message(Role::Assistant, MessageType::Error, "it broke"),
        ];
        let backend = Arc::new(ScriptedBackend::new(BackendType::Claude, script));
        let engine = engine_with(backend, Arc::new(MemorySink::new()));

        let result = engine.execute(request_for(BackendType::Claude)).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("it broke"));
    }

    #[tokio::test]
    async fn explicit_terminal_success_outranks_error_heuristic() {
        let req = stream_request();
        let script = vec![
            req.message(Role::Assistant, MessageType::Error, "transient hiccup"),
            req.message(Role::System, MessageType::Result, "Session completed in 10ms")
                .with_metadata("is_error", json!(false))
                .with_metadata("subtype", json!("success"))
                .hidden(),
        ];
        let backend = Arc::new(ScriptedBackend::new(BackendType::Cursor, script));
        let engine = engine_with(backend, Arc::new(MemorySink::new()));

        let result = engine.execute(request_for(BackendType::Cursor)).await;
        assert!(result.success, "explicit terminal signal must win");
    }

    #[tokio::test]
    async fn explicit_terminal_failure_fails_a_clean_looking_run() {
        let req = stream_request();
        let script = vec![
            req.message(Role::Assistant, MessageType::Chat, "all fine so far"),
            req.message(Role::System, MessageType::Result, "Execution completed in 10ms")
                .with_metadata(
                    "original_event",
                    json!({"type": "result", "is_error": true, "subtype": "error"}),
                )
                .hidden(),
        ];
        let backend = Arc::new(ScriptedBackend::new(BackendType::Cursor, script));
        let engine = engine_with(backend, Arc::new(MemorySink::new()));

        let result = engine.execute(request_for(BackendType::Cursor)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn changes_made_metadata_sets_has_changes() {
        let req = stream_request();
        let script = vec![req
            .message(Role::Assistant, MessageType::Chat, "edited the files")
            .with_metadata("changes_made", json!(true))];
        let backend = Arc::new(ScriptedBackend::new(BackendType::Claude, script));
        let engine = engine_with(backend, Arc::new(MemorySink::new()));

        let result = engine.execute(request_for(BackendType::Claude)).await;
        assert!(result.has_changes);
    }

    #[tokio::test]
    async fn unavailable_backend_fails_immediately_without_streaming() {
        let backend = Arc::new(ScriptedBackend::unavailable(BackendType::Cursor));
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(backend.clone(), sink.clone());

        let result = engine.execute(request_for(BackendType::Cursor)).await;

        assert!(!result.success);
        assert_eq!(result.message_count, 0);
        assert!(result.error.unwrap().contains("not installed"));
        assert!(sink.persisted().await.is_empty());
        assert!(backend.recorded_requests().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_backend_is_a_failed_result() {
        let engine = Manifold::new(
            Arc::new(MemorySink::new()),
            Arc::new(MemorySessionStore::new()),
        );
        let result = engine.execute(request_for(BackendType::Claude)).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("not registered"));
    }

    #[tokio::test]
    async fn stream_start_failure_records_a_terminal_error_message() {
        let backend = Arc::new(ScriptedBackend::failing(BackendType::Claude));
        let sink = Arc::new(MemorySink::new());
        let engine = engine_with(backend, sink.clone());

        let result = engine.execute(request_for(BackendType::Claude)).await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("spawn exploded"));
        // The failure is legible in the conversation: one persisted and
        // published error message.
        let persisted = sink.persisted().await;
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].message_type, MessageType::Error);
        assert_eq!(sink.published().await.len(), 1);
    }

    struct FailingPublishSink {
        inner: MemorySink,
    }

    #[async_trait]
    impl MessageSink for FailingPublishSink {
        async fn persist(&self, message: &UnifiedMessage) -> anyhow::Result<()> {
            self.inner.persist(message).await
        }

        async fn publish(&self, _project_id: &str, _envelope: &Envelope) -> anyhow::Result<()> {
            anyhow::bail!("socket went away")
        }
    }

    #[tokio::test]
    async fn publish_failures_are_swallowed() {
        let req = stream_request();
        let script = vec![req.message(Role::Assistant, MessageType::Chat, "hello")];
        let backend = Arc::new(ScriptedBackend::new(BackendType::Claude, script));
        let sink = Arc::new(FailingPublishSink {
            inner: MemorySink::new(),
        });
        let engine = Manifold::new(sink.clone(), Arc::new(MemorySessionStore::new()))
            .register(backend);

        let result = engine.execute(request_for(BackendType::Claude)).await;

        assert!(result.success, "publish is best-effort, never fatal");
        assert_eq!(sink.inner.persisted().await.len(), 1);
    }

    #[tokio::test]
    async fn second_run_does_not_inherit_the_first_runs_model() {
        let backend = Arc::new(ScriptedBackend::new(BackendType::Claude, Vec::new()));
        backend.push_script(Vec::new()).await;
        let engine = engine_with(backend.clone(), Arc::new(MemorySink::new()));

        let mut first = request_for(BackendType::Claude);
        first.model = Some("opus-4.1".to_string());
        engine.execute(first).await;

        let second = request_for(BackendType::Claude);
        engine.execute(second).await;

        let requests = backend.recorded_requests().await;
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].model.as_deref(), Some("opus-4.1"));
        assert_eq!(requests[1].model, None, "model state must not leak between runs");
    }

    #[tokio::test]
    async fn check_status_warns_on_unsupported_model() {
        let backend = Arc::new(ScriptedBackend::new(BackendType::Cursor, Vec::new()));
        let engine = engine_with(backend, Arc::new(MemorySink::new()));

        let status = engine
            .check_status(BackendType::Cursor, Some("made-up-model"))
            .await;
        assert!(status.availability.available);
        assert!(status.model_warning.unwrap().contains("made-up-model"));

        let ok = engine.check_status(BackendType::Cursor, Some("gpt-5")).await;
        assert_eq!(ok.selected_model.as_deref(), Some("gpt-5"));
        assert!(ok.model_warning.is_none());
    }

    #[tokio::test]
    async fn check_status_for_unregistered_backend() {
        let engine = Manifold::new(
            Arc::new(MemorySink::new()),
            Arc::new(MemorySessionStore::new()),
        );
        let status = engine.check_status(BackendType::Cursor, None).await;
        assert!(!status.availability.available);
    }

    #[tokio::test]
    async fn session_operations_round_trip() {
        let sessions = Arc::new(MemorySessionStore::new());
        let engine = Manifold::new(Arc::new(MemorySink::new()), sessions.clone());

        sessions.set("proj", BackendType::Claude, "a").await.unwrap();
        sessions.set("proj", BackendType::Cursor, "b").await.unwrap();

        assert_eq!(engine.sessions_for("proj").await.unwrap().len(), 2);

        engine.clear_session("proj", BackendType::Claude).await.unwrap();
        assert_eq!(engine.sessions_for("proj").await.unwrap().len(), 1);

        engine.clear_all_sessions("proj").await.unwrap();
        assert!(engine.sessions_for("proj").await.unwrap().is_empty());
    }

    // ── Instruction preparation ──────────────────────────────────────────

    #[test]
    fn documents_fold_into_a_context_section() {
        let mut request = request_for(BackendType::Claude);
        request.documents.push(DocumentAttachment {
            name: "notes.md".to_string(),
            content: "remember the edge cases".to_string(),
            mime_type: "text/markdown".to_string(),
        });

        let (instruction, staged) = prepare_instruction(&request);
        assert!(staged.is_none());
        assert!(instruction.starts_with("[DOCUMENT CONTEXT]"));
        assert!(instruction.contains("=== Document: notes.md ==="));
        assert!(instruction.contains("[USER INSTRUCTION]\nbuild it"));
    }

    #[test]
    fn empty_documents_are_skipped() {
        let mut request = request_for(BackendType::Claude);
        request.documents.push(DocumentAttachment {
            name: "blank.txt".to_string(),
            content: "   ".to_string(),
            mime_type: "text/plain".to_string(),
        });

        let (instruction, _) = prepare_instruction(&request);
        assert_eq!(instruction, "build it");
    }

    #[test]
    fn images_are_staged_and_referenced() {
        let mut request = request_for(BackendType::Claude);
        request.images.push(ImageAttachment {
            name: "screenshot.png".to_string(),
            base64_data: "aGVsbG8=".to_string(), // "hello"
            mime_type: "image/png".to_string(),
        });

        let (instruction, staged) = prepare_instruction(&request);
        let staged = staged.expect("images should stage a temp dir");
        assert!(instruction.contains("Attached files:"));
        assert!(instruction.contains("screenshot.png (image/png):"));

        let file = staged.path().join("00-screenshot.png");
        assert_eq!(std::fs::read(file).unwrap(), b"hello");
    }

    #[test]
    fn undecodable_images_are_skipped_not_fatal() {
        let mut request = request_for(BackendType::Claude);
        request.images.push(ImageAttachment {
            name: "junk.png".to_string(),
            base64_data: "!!!not base64!!!".to_string(),
            mime_type: "image/png".to_string(),
        });

        let (instruction, staged) = prepare_instruction(&request);
        assert!(staged.is_none());
        assert_eq!(instruction, "build it");
    }

    #[test]
    fn sanitize_file_name_strips_path_tricks() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name(""), "attachment");
        assert_eq!(sanitize_file_name("ok-name_1.png"), "ok-name_1.png");
    }

    // ── Terminal signal extraction ───────────────────────────────────────

    #[test]
    fn terminal_signal_ignores_non_result_messages() {
        let req = stream_request();
        let msg = req.message(Role::Assistant, MessageType::Chat, "hi");
        assert_eq!(terminal_signal(&msg), None);
    }

    #[test]
    fn terminal_signal_reads_direct_metadata() {
        let req = stream_request();
        let ok = req
            .message(Role::System, MessageType::Result, "done")
            .with_metadata("is_error", json!(false));
        assert_eq!(terminal_signal(&ok), Some(true));

        let bad = req
            .message(Role::System, MessageType::Result, "done")
            .with_metadata("is_error", json!(true));
        assert_eq!(terminal_signal(&bad), Some(false));
    }

    #[test]
    fn terminal_signal_reads_nested_original_event() {
        let req = stream_request();
        let msg = req
            .message(Role::System, MessageType::Result, "done")
            .with_metadata("original_event", json!({"subtype": "error"}));
        assert_eq!(terminal_signal(&msg), Some(false));
    }

    #[test]
    fn result_without_error_indicators_counts_as_success() {
        let req = stream_request();
        let msg = req.message(Role::System, MessageType::Result, "done");
        assert_eq!(terminal_signal(&msg), Some(true));
    }
}
