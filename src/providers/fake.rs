//! Deterministic fake providers for scenario tests — no network calls, no
//! sleeping, output derived purely from input so assertions are exact.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::capability::{HealthStatus, Provider};
use crate::providers::{
    AiEvent, AiProvider, ChatMessage, CiProvider, CiState, CiStatus, NotificationProvider,
    ProviderResult, PullRequestInfo, ReviewComment, SandboxProvider, SandboxRunResult, ScmProvider,
};

/// Echoes a fixed, deterministic "document" containing the prompt's last
/// user message — enough for stage handlers to persist as output and for
/// tests to assert against without depending on prompt wording.
pub struct FakeAiProvider {
    config: HashMap<String, serde_json::Value>,
    responses: Mutex<Vec<String>>,
}

impl FakeAiProvider {
    pub fn new() -> Self {
        FakeAiProvider { config: HashMap::new(), responses: Mutex::new(Vec::new()) }
    }

    /// Queue canned responses returned in order by successive `complete`
    /// calls; once exhausted, falls back to echoing the last message.
    pub fn with_responses(responses: Vec<String>) -> Self {
        FakeAiProvider { config: HashMap::new(), responses: Mutex::new(responses) }
    }
}

impl Default for FakeAiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FakeAiProvider {
    async fn initialize(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn cleanup(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy("fake ai always healthy", 0)
    }
    fn config(&self) -> &HashMap<String, serde_json::Value> {
        &self.config
    }
    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

#[async_trait]
impl AiProvider for FakeAiProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        cancel: &tokio_util::sync::CancellationToken,
    ) -> ProviderResult<String> {
        if cancel.is_cancelled() {
            return Err("cancelled".into());
        }
        let mut queued = self.responses.lock().await;
        if !queued.is_empty() {
            return Ok(queued.remove(0));
        }
        let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
        Ok(format!("fake-response-for: {last}"))
    }

    async fn complete_streaming(
        &self,
        messages: &[ChatMessage],
        on_event: &mut (dyn FnMut(AiEvent) + Send),
        cancel: &tokio_util::sync::CancellationToken,
    ) -> ProviderResult<String> {
        let text = self.complete(messages, cancel).await?;
        for word in text.split_whitespace() {
            if cancel.is_cancelled() {
                return Err("cancelled".into());
            }
            on_event(AiEvent::Token(format!("{word} ")));
        }
        on_event(AiEvent::Done { prompt_tokens: messages.len() as u32, completion_tokens: text.split_whitespace().count() as u32 });
        Ok(text)
    }
}

/// In-memory PR tracker keyed by an incrementing counter, good enough to
/// exercise the open → status → comments → close lifecycle in tests.
pub struct FakeScmProvider {
    config: HashMap<String, serde_json::Value>,
    next_number: AtomicU64,
    prs: Mutex<HashMap<u64, PullRequestInfo>>,
}

impl FakeScmProvider {
    pub fn new() -> Self {
        FakeScmProvider { config: HashMap::new(), next_number: AtomicU64::new(1), prs: Mutex::new(HashMap::new()) }
    }
}

impl Default for FakeScmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FakeScmProvider {
    async fn initialize(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn cleanup(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy("fake scm always healthy", 0)
    }
    fn config(&self) -> &HashMap<String, serde_json::Value> {
        &self.config
    }
    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

#[async_trait]
impl ScmProvider for FakeScmProvider {
    async fn open_pull_request(
        &self,
        _repo_url: &str,
        branch: &str,
        _title: &str,
        _body: &str,
    ) -> ProviderResult<PullRequestInfo> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let info = PullRequestInfo {
            number,
            url: format!("https://fake.scm/pr/{number}"),
            merged: false,
            closed: false,
        };
        self.prs.lock().await.insert(number, info.clone());
        log::info!("fake scm opened PR #{number} for branch {branch}");
        Ok(info)
    }

    async fn pull_request_status(&self, _repo_url: &str, number: u64) -> ProviderResult<PullRequestInfo> {
        self.prs
            .lock()
            .await
            .get(&number)
            .cloned()
            .ok_or_else(|| format!("no such PR #{number}").into())
    }

    async fn review_comments(&self, _repo_url: &str, _number: u64) -> ProviderResult<Vec<ReviewComment>> {
        Ok(Vec::new())
    }

    async fn close_pull_request(&self, _repo_url: &str, number: u64) -> ProviderResult<()> {
        if let Some(pr) = self.prs.lock().await.get_mut(&number) {
            pr.closed = true;
        }
        Ok(())
    }
}

/// Always reports success — used where tests need the verifying stage to
/// proceed without exercising CI-specific edge cases.
pub struct FakeCiProvider {
    config: HashMap<String, serde_json::Value>,
    state: CiState,
}

impl FakeCiProvider {
    pub fn new(state: CiState) -> Self {
        FakeCiProvider { config: HashMap::new(), state }
    }
}

#[async_trait]
impl Provider for FakeCiProvider {
    async fn initialize(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn cleanup(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy("fake ci always healthy", 0)
    }
    fn config(&self) -> &HashMap<String, serde_json::Value> {
        &self.config
    }
    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

#[async_trait]
impl CiProvider for FakeCiProvider {
    async fn status_for_branch(&self, _repo_url: &str, branch: &str) -> ProviderResult<CiStatus> {
        Ok(CiStatus {
            state: self.state,
            summary: format!("fake ci result for {branch}"),
            url: None,
        })
    }
}

/// Runs nothing; returns a canned success result. Good enough for tests
/// that only assert the sandbox was invoked with the right command.
pub struct FakeSandboxProvider {
    config: HashMap<String, serde_json::Value>,
}

impl FakeSandboxProvider {
    pub fn new() -> Self {
        FakeSandboxProvider { config: HashMap::new() }
    }
}

impl Default for FakeSandboxProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FakeSandboxProvider {
    async fn initialize(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn cleanup(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy("fake sandbox always healthy", 0)
    }
    fn config(&self) -> &HashMap<String, serde_json::Value> {
        &self.config
    }
    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

#[async_trait]
impl SandboxProvider for FakeSandboxProvider {
    async fn run(
        &self,
        _work_dir: &std::path::Path,
        command: &str,
        _timeout: std::time::Duration,
    ) -> ProviderResult<SandboxRunResult> {
        Ok(SandboxRunResult {
            exit_code: 0,
            stdout: format!("ran: {command}"),
            stderr: String::new(),
            timed_out: false,
        })
    }

    async fn is_available(&self) -> bool {
        true
    }
}

/// Records notifications in memory instead of sending them anywhere.
pub struct FakeNotificationProvider {
    config: HashMap<String, serde_json::Value>,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl FakeNotificationProvider {
    pub fn new() -> Self {
        FakeNotificationProvider { config: HashMap::new(), sent: Mutex::new(Vec::new()) }
    }
}

impl Default for FakeNotificationProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for FakeNotificationProvider {
    async fn initialize(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn cleanup(&self) -> ProviderResult<()> {
        Ok(())
    }
    async fn health_check(&self) -> HealthStatus {
        HealthStatus::healthy("fake notification always healthy", 0)
    }
    fn config(&self) -> &HashMap<String, serde_json::Value> {
        &self.config
    }
    fn provider_name(&self) -> &'static str {
        "fake"
    }
}

#[async_trait]
impl NotificationProvider for FakeNotificationProvider {
    async fn notify(&self, subject: &str, body: &str) -> ProviderResult<()> {
        self.sent.lock().await.push((subject.to_string(), body.to_string()));
        Ok(())
    }
}

/// Convenience: wrap each fake in the [`crate::providers::AnyProvider`]
/// variant the registry expects.
pub fn fake_ai() -> Arc<dyn AiProvider> {
    Arc::new(FakeAiProvider::new())
}
pub fn fake_scm() -> Arc<dyn ScmProvider> {
    Arc::new(FakeScmProvider::new())
}
pub fn fake_ci(state: CiState) -> Arc<dyn CiProvider> {
    Arc::new(FakeCiProvider::new(state))
}
pub fn fake_sandbox() -> Arc<dyn SandboxProvider> {
    Arc::new(FakeSandboxProvider::new())
}
pub fn fake_notification() -> Arc<dyn NotificationProvider> {
    Arc::new(FakeNotificationProvider::new())
}
