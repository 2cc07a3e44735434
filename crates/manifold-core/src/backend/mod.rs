// ABOUTME: Backend trait defining how manifold drives AI coding-agent CLIs
// ABOUTME: Implementations: ClaudeSdkBackend (typed event stream), CursorCliBackend (NDJSON subprocess)

mod claude_sdk;
mod cursor_cli;

pub use claude_sdk::{
    AssistantPayload, ClaudeSdkBackend, ClaudeSdkConfig, CliTransport, ContentBlock, ResultEvent,
    SdkEvent, SdkTransport, SystemEvent, TransportItem,
};
pub use cursor_cli::{CursorCliBackend, CursorCliConfig};

use crate::types::{Availability, BackendType, StreamRequest, UnifiedMessage};
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::process::Command;

/// A backend is one agent CLI adapter behind the unified execution contract.
///
/// The trait is deliberately flat: one implementation per backend, registered
/// in a map keyed by `BackendType`. Streams terminate when the backend signals
/// completion or its process exits; restarting means issuing a new call.
#[async_trait]
pub trait Backend: Send + Sync {
    fn backend_type(&self) -> BackendType;

    /// Probe whether the backend binary is installed and responsive.
    /// Never errors: a missing binary is a negative result, not a failure.
    async fn check_availability(&self) -> Availability;

    /// Execute one instruction, yielding normalized messages as they arrive.
    async fn stream_execute(
        &self,
        request: StreamRequest,
    ) -> Result<BoxStream<'static, UnifiedMessage>>;

    /// Read the stored backend-native session id for a project.
    async fn session_id(&self, project_id: &str) -> Result<Option<String>>;

    /// Overwrite the stored backend-native session id for a project.
    async fn set_session_id(&self, project_id: &str, session_id: &str) -> Result<()>;
}

/// Run `<binary> -h` and sanity-check the help output.
///
/// Shared by adapters' availability probes. Spawn failures and unexpected
/// help text both fold into a negative `Availability` carrying install hints.
pub(crate) async fn probe_binary(binary: &str, expect: &str, install_hint: &str) -> Availability {
    let output = Command::new(binary).arg("-h").output().await;

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            return Availability::missing(format!(
                "{binary} not installed or not working: {e}\n\n{install_hint}"
            ));
        }
    };

    if !output.status.success() {
        return Availability::missing(format!(
            "{binary} not installed or not working.\n\n{install_hint}"
        ));
    }

    let help_text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !help_text.to_lowercase().contains(expect) {
        return Availability::missing(format!(
            "{binary} not responding correctly.\n\n{install_hint}"
        ));
    }

    Availability::ready(Vec::new(), Vec::new())
}
