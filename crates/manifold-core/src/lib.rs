// ABOUTME: Core library for manifold - unified message schema, backend adapters, orchestrator
// ABOUTME: Shared between manifold-cli and embedding services

pub mod backend;
pub mod config;
pub mod engine;
pub mod model;
pub mod session;
pub mod sink;
pub mod tools;
pub mod types;

pub use backend::Backend;
pub use config::Config;
pub use engine::{BackendStatus, ExecuteError, Manifold};
pub use session::{CachedSessionStore, MemorySessionStore, SessionStore};
pub use sink::{Envelope, MemorySink, MessageSink};
pub use tools::ToolCatalog;
pub use types::{
    Availability, BackendType, ExecutionMode, ExecutionRequest, ExecutionResult, MessageType, Role,
    StreamRequest, UnifiedMessage,
};
