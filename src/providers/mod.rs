//! Per-category provider contracts. Every trait here composes with
//! [`crate::capability::Provider`] (lifecycle + health) and adds the
//! category-specific operations stage handlers actually call.
//!
//! Fallible operations return `Result<T, Box<dyn Error + Send + Sync>>`, a
//! boxed, thread-safe error any provider implementation can produce without
//! wrapping it in a crate-specific type first.

pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;

use crate::capability::Provider;

pub type ProviderResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// One chunk of an AI completion stream: incremental text, a tool
/// invocation the model made along the way, or a final marker carrying
/// the accumulated token usage.
#[derive(Debug, Clone)]
pub enum AiEvent {
    Token(String),
    Tool(String),
    Done { prompt_tokens: u32, completion_tokens: u32 },
}

/// A chat-style message fed to an AI provider's completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system".to_string(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user".to_string(), content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: "assistant".to_string(), content: content.into() }
    }
}

/// The `ai` capability: drives the underlying LLM for every stage prompt
/// and the chat-refinement loop. `complete` returns a fully materialized
/// string — stage handlers need the complete document, not a token stream;
/// streaming is exposed separately for the chat SSE surface via
/// `complete_streaming`.
#[async_trait]
pub trait AiProvider: Provider {
    /// Non-streaming completion: used by every stage handler. `cancel`
    /// MUST be observed while the request is in flight — a cancelled
    /// token should make the call return `Err` promptly rather than run
    /// to completion.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        cancel: &tokio_util::sync::CancellationToken,
    ) -> ProviderResult<String>;

    /// Streaming completion: used by the chat-refinement surface so
    /// partial tokens can be published to the SSE bus as they arrive.
    /// Borrows the sink rather than boxing it `'static` so callers can
    /// close over short-lived context (an executor's per-task state).
    /// Same cancellation contract as `complete`.
    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        on_event: &mut (dyn FnMut(AiEvent) + Send),
        cancel: &tokio_util::sync::CancellationToken,
    ) -> ProviderResult<String>;
}

/// Current CI run status for a commit/branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiState {
    Pending,
    Running,
    Success,
    Failure,
    Unknown,
}

/// One CI check result, used to assemble the verifying-stage summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiStatus {
    pub state: CiState,
    pub summary: String,
    pub url: Option<String>,
}

/// The `ci` capability: reports build/test status for a branch.
#[async_trait]
pub trait CiProvider: Provider {
    async fn status_for_branch(&self, repo_url: &str, branch: &str) -> ProviderResult<CiStatus>;
}

/// Current remote PR state as reported by the `scm` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestInfo {
    pub number: u64,
    pub url: String,
    pub merged: bool,
    pub closed: bool,
}

/// One inline review comment fetched for the verifying stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub path: String,
    pub line: Option<u32>,
    pub body: String,
}

/// The `scm` capability: the source-control host's PR lifecycle, layered
/// on top of the plain `git` subprocess calls in
/// [`crate::workspace::git`] (which handle the clone/branch/push
/// mechanics every provider needs regardless of host).
#[async_trait]
pub trait ScmProvider: Provider {
    async fn open_pull_request(
        &self,
        repo_url: &str,
        branch: &str,
        title: &str,
        body: &str,
    ) -> ProviderResult<PullRequestInfo>;

    async fn pull_request_status(
        &self,
        repo_url: &str,
        number: u64,
    ) -> ProviderResult<PullRequestInfo>;

    async fn review_comments(
        &self,
        repo_url: &str,
        number: u64,
    ) -> ProviderResult<Vec<ReviewComment>>;

    async fn close_pull_request(&self, repo_url: &str, number: u64) -> ProviderResult<()>;
}

/// The `doc` capability: pushes generated documents to an external wiki
/// or knowledge base once a story reaches `Done`. Optional — stage
/// handlers never block on it.
#[async_trait]
pub trait DocProvider: Provider {
    async fn publish(&self, title: &str, content: &str) -> ProviderResult<String>;
}

/// Outcome of a sandboxed command run, used by the coding/verifying
/// stages to execute project build/test/lint commands without touching
/// the orchestrator's own process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRunResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

/// The `sandbox` capability: runs a command against a workspace
/// checkout in isolation — "run this command in that directory with a
/// timeout", independent of how the isolation itself is implemented.
#[async_trait]
pub trait SandboxProvider: Provider {
    async fn run(
        &self,
        work_dir: &std::path::Path,
        command: &str,
        timeout: std::time::Duration,
    ) -> ProviderResult<SandboxRunResult>;

    /// Whether the sandbox backend (e.g. a local Docker daemon) is
    /// reachable right now. Checked ahead of `run` so a coding/verifying
    /// stage can degrade to "skip sandboxed checks" instead of failing.
    async fn is_available(&self) -> bool;
}

/// The `notification` capability: best-effort pings on stage completion
/// and errors. Never gates a transition.
#[async_trait]
pub trait NotificationProvider: Provider {
    async fn notify(&self, subject: &str, body: &str) -> ProviderResult<()>;
}

/// A category-typed handle to a live provider. The registry only knows
/// about the common [`Provider`] lifecycle surface; this enum is how a
/// stage handler recovers the category-specific trait it actually needs
/// without downcasting `Arc<dyn Provider>` by hand.
#[derive(Clone)]
pub enum AnyProvider {
    Ai(std::sync::Arc<dyn AiProvider>),
    Scm(std::sync::Arc<dyn ScmProvider>),
    Ci(std::sync::Arc<dyn CiProvider>),
    Doc(std::sync::Arc<dyn DocProvider>),
    Sandbox(std::sync::Arc<dyn SandboxProvider>),
    Notification(std::sync::Arc<dyn NotificationProvider>),
}

#[async_trait]
impl Provider for AnyProvider {
    async fn initialize(&self) -> ProviderResult<()> {
        match self {
            AnyProvider::Ai(p) => p.initialize().await,
            AnyProvider::Scm(p) => p.initialize().await,
            AnyProvider::Ci(p) => p.initialize().await,
            AnyProvider::Doc(p) => p.initialize().await,
            AnyProvider::Sandbox(p) => p.initialize().await,
            AnyProvider::Notification(p) => p.initialize().await,
        }
    }

    async fn cleanup(&self) -> ProviderResult<()> {
        match self {
            AnyProvider::Ai(p) => p.cleanup().await,
            AnyProvider::Scm(p) => p.cleanup().await,
            AnyProvider::Ci(p) => p.cleanup().await,
            AnyProvider::Doc(p) => p.cleanup().await,
            AnyProvider::Sandbox(p) => p.cleanup().await,
            AnyProvider::Notification(p) => p.cleanup().await,
        }
    }

    async fn health_check(&self) -> crate::capability::HealthStatus {
        match self {
            AnyProvider::Ai(p) => p.health_check().await,
            AnyProvider::Scm(p) => p.health_check().await,
            AnyProvider::Ci(p) => p.health_check().await,
            AnyProvider::Doc(p) => p.health_check().await,
            AnyProvider::Sandbox(p) => p.health_check().await,
            AnyProvider::Notification(p) => p.health_check().await,
        }
    }

    fn config(&self) -> &std::collections::HashMap<String, serde_json::Value> {
        match self {
            AnyProvider::Ai(p) => p.config(),
            AnyProvider::Scm(p) => p.config(),
            AnyProvider::Ci(p) => p.config(),
            AnyProvider::Doc(p) => p.config(),
            AnyProvider::Sandbox(p) => p.config(),
            AnyProvider::Notification(p) => p.config(),
        }
    }

    fn provider_name(&self) -> &'static str {
        match self {
            AnyProvider::Ai(p) => p.provider_name(),
            AnyProvider::Scm(p) => p.provider_name(),
            AnyProvider::Ci(p) => p.provider_name(),
            AnyProvider::Doc(p) => p.provider_name(),
            AnyProvider::Sandbox(p) => p.provider_name(),
            AnyProvider::Notification(p) => p.provider_name(),
        }
    }
}

impl AnyProvider {
    pub fn as_ai(&self) -> Option<std::sync::Arc<dyn AiProvider>> {
        match self {
            AnyProvider::Ai(p) => Some(p.clone()),
            _ => None,
        }
    }
    pub fn as_scm(&self) -> Option<std::sync::Arc<dyn ScmProvider>> {
        match self {
            AnyProvider::Scm(p) => Some(p.clone()),
            _ => None,
        }
    }
    pub fn as_ci(&self) -> Option<std::sync::Arc<dyn CiProvider>> {
        match self {
            AnyProvider::Ci(p) => Some(p.clone()),
            _ => None,
        }
    }
    pub fn as_doc(&self) -> Option<std::sync::Arc<dyn DocProvider>> {
        match self {
            AnyProvider::Doc(p) => Some(p.clone()),
            _ => None,
        }
    }
    pub fn as_sandbox(&self) -> Option<std::sync::Arc<dyn SandboxProvider>> {
        match self {
            AnyProvider::Sandbox(p) => Some(p.clone()),
            _ => None,
        }
    }
    pub fn as_notification(&self) -> Option<std::sync::Arc<dyn NotificationProvider>> {
        match self {
            AnyProvider::Notification(p) => Some(p.clone()),
            _ => None,
        }
    }
}
