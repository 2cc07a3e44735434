// ABOUTME: Message sink - durable persistence plus best-effort pub/sub fan-out
// ABOUTME: persist() must succeed before anything is published; publish is a side channel

use crate::types::UnifiedMessage;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

/// The outward wire shape pushed to observers for each visible message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn message(message: &UnifiedMessage) -> Self {
        Self {
            kind: "message".to_string(),
            data: serde_json::to_value(message).unwrap_or(Value::Null),
            timestamp: message.created_at,
        }
    }
}

/// Where normalized messages go: a durable store plus a pub/sub fan-out.
///
/// The engine always persists before publishing, and treats publish failures
/// as non-fatal. Implementations should never block a run on slow observers.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn persist(&self, message: &UnifiedMessage) -> Result<()>;
    async fn publish(&self, project_id: &str, envelope: &Envelope) -> Result<()>;
}

/// In-memory sink for tests and embedding without a database.
#[derive(Default)]
pub struct MemorySink {
    persisted: Mutex<Vec<UnifiedMessage>>,
    published: Mutex<Vec<(String, Envelope)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn persisted(&self) -> Vec<UnifiedMessage> {
        self.persisted.lock().await.clone()
    }

    pub async fn published(&self) -> Vec<(String, Envelope)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn persist(&self, message: &UnifiedMessage) -> Result<()> {
        self.persisted.lock().await.push(message.clone());
        Ok(())
    }

    async fn publish(&self, project_id: &str, envelope: &Envelope) -> Result<()> {
        self.published
            .lock()
            .await
            .push((project_id.to_string(), envelope.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionMode, MessageType, Role, StreamRequest};
    use std::path::PathBuf;

    fn sample_message() -> UnifiedMessage {
        let req = StreamRequest {
            project_id: "p1".to_string(),
            conversation_id: "c1".to_string(),
            session_id: None,
            instruction: String::new(),
            working_dir: PathBuf::from("."),
            resume_session_id: None,
            model: None,
            is_initial_prompt: false,
            mode: ExecutionMode::Act,
        };
        req.message(Role::Assistant, MessageType::Chat, "hello")
    }

    #[test]
    fn envelope_wraps_message_payload() {
        let msg = sample_message();
        let envelope = Envelope::message(&msg);
        assert_eq!(envelope.kind, "message");
        assert_eq!(envelope.data.get("content").and_then(|v| v.as_str()), Some("hello"));
        assert_eq!(envelope.timestamp, msg.created_at);
    }

    #[tokio::test]
    async fn memory_sink_records_both_channels() {
        let sink = MemorySink::new();
        let msg = sample_message();
        sink.persist(&msg).await.unwrap();
        sink.publish("p1", &Envelope::message(&msg)).await.unwrap();

        assert_eq!(sink.persisted().await.len(), 1);
        let published = sink.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "p1");
    }
}
