//! Stage handlers: one per [`StoryStatus`] that owns an AI invocation.
//! Each implements [`Stage`], with separate `preconditions`/`execute`/
//! `validate_output` steps.
//!
//! Handlers are pure with respect to persistence: they receive an already
//! resolved [`StageContext`] (capabilities + prompt inputs) and return a
//! [`StageOutput`] describing what to write. The executor (not the
//! handler) is responsible for persisting outputs, updating hashes, and
//! publishing SSE events, keeping the publish-first-write-last ordering
//! discipline in one place.

pub mod clarifying;
pub mod coding;
pub mod designing;
pub mod parsing;
pub mod planning;
pub mod preparing;
pub mod verifying;

use async_trait::async_trait;
use std::sync::Arc;

use crate::capability::CapabilityRegistry;
use crate::error::OpdError;
use crate::model::{Clarification, PullRequest, StoryDoc, StoryStatus};
use crate::prompt::PromptSnapshot;
use crate::providers::AiEvent;

/// Every input a stage handler needs, gathered by the executor's load
/// context step. Borrows rather than owns where the caller already has
/// the data loaded.
pub struct StageContext<'a> {
    pub snapshot: PromptSnapshot<'a>,
    pub stage_input: &'a str,
    pub capabilities: &'a CapabilityRegistry,
    /// Set for the coding stage: the round's branch name, used to open a
    /// pull request and to render the coding report/test guide.
    pub branch_name: Option<&'a str>,
    /// Pull requests already opened for the active round, consulted by
    /// the verifying stage.
    pub pull_requests: &'a [PullRequest],
}

/// What a stage produced. `docs` are (field, content) pairs the executor
/// persists under the canonical filename and stores on the Story;
/// `new_clarifications` is populated only by the clarifying stage;
/// `next_status` is the auto-advance target, or `None` if the stage waits
/// for user confirmation.
#[derive(Default)]
pub struct StageOutput {
    pub docs: Vec<(StoryDoc, String)>,
    pub new_clarifications: Vec<Clarification>,
    pub next_status: Option<StoryStatus>,
    /// Pull requests opened during this invocation, persisted by the
    /// executor so later stages (verifying) can read them back via
    /// `StageContext::pull_requests`.
    pub new_pull_requests: Vec<PullRequest>,
}

/// A callback invoked once per AI chunk, so the executor can fan each
/// token out to the SSE bus and the message log as it arrives
/// (publish-first-write-last).
pub type TokenSink<'a> = dyn FnMut(AiEvent) + Send + 'a;

#[async_trait]
pub trait Stage: Send + Sync {
    fn status(&self) -> StoryStatus;

    /// Capabilities without which the stage cannot run at all.
    fn required_capabilities(&self) -> &'static [&'static str];

    /// Capabilities the stage uses if present but degrades gracefully
    /// without.
    fn optional_capabilities(&self) -> &'static [&'static str] {
        &[]
    }

    /// Cheap validation against in-memory state, run before scheduling
    /// the background task at all.
    fn preconditions(&self, ctx: &StageContext) -> Result<(), OpdError>;

    /// The AI invocation and output extraction. `cancel` MUST be passed
    /// through to every provider call so a stop request can abort an
    /// in-flight completion rather than only being checked between
    /// `await` points.
    async fn execute(
        &self,
        ctx: &StageContext,
        on_token: &mut TokenSink,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<StageOutput, OpdError>;

    /// Post-execution assertion on the handler's own output, run by the
    /// executor immediately after `execute` returns `Ok`.
    fn validate_output(&self, _output: &StageOutput) -> Result<(), OpdError> {
        Ok(())
    }
}

/// The fixed stage→handler table consulted when a story enters a new
/// status.
pub fn build_stage_table() -> std::collections::HashMap<StoryStatus, Arc<dyn Stage>> {
    let mut table: std::collections::HashMap<StoryStatus, Arc<dyn Stage>> = std::collections::HashMap::new();
    table.insert(StoryStatus::Preparing, Arc::new(preparing::PreparingStage));
    table.insert(StoryStatus::Clarifying, Arc::new(clarifying::ClarifyingStage));
    table.insert(StoryStatus::Planning, Arc::new(planning::PlanningStage));
    table.insert(StoryStatus::Designing, Arc::new(designing::DesigningStage));
    table.insert(StoryStatus::Coding, Arc::new(coding::CodingStage));
    table.insert(StoryStatus::Verifying, Arc::new(verifying::VerifyingStage));
    table
}
