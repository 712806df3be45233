//! Public façade: one method per operation. Creates entities, validates
//! preconditions, mutates state, and schedules the background task that
//! actually talks to an AI provider.
//!
//! The task body itself (brief delay / load context / publish-first,
//! write-last / deregister) lives in `run_stage_task`/`run_chat_task`
//! below, dispatched through [`crate::executor::Executor`].

use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::capability::{CapabilityRegistry, HealthStatus};
use crate::config::OpdConfig;
use crate::error::{OpdError, OpdResult};
use crate::executor::{Executor, TaskKey};
use crate::hashing::{resolve_stage_input, should_skip_ai};
use crate::model::{
    AiMessage, CapabilityConfig, Clarification, MessageRole, PrStatus, Project, ProjectCapabilityOverride,
    PullRequest, Round, RoundStatus, RoundType, Story, StoryDoc, StoryStatus, WorkspaceStatus,
};
use crate::persistence::PersistenceGateway;
use crate::prompt::{self, PromptSnapshot, TaskItem};
use crate::providers::AiEvent;
use crate::sse::{replay_events, Event, ReplayMode, SseBus};
use crate::stages::{build_stage_table, Stage, StageContext};
use crate::state_machine::{RolloutAction, StateMachine};
use crate::workspace::WorkspaceLayout;

/// One answer submitted via `AnswerClarifications`, matched by id when
/// present, else by question text against an unanswered row.
pub struct ClarificationAnswer {
    pub id: Option<Uuid>,
    pub question: String,
    pub answer: String,
}

/// Fields accepted by `UpdateProject`; `None` leaves the existing value
/// in place. Mirrors the HTTP surface's `PUT /api/projects/{id}` body.
#[derive(Default)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub repo_url: Option<String>,
    pub description: Option<String>,
    pub tech_stack: Option<String>,
    pub architecture: Option<String>,
}

/// The read model behind `GET /api/stories/{id}`: the story row plus
/// everything resolved for display — its active round, clarifications,
/// document contents (inline or read back off disk via
/// [`WorkspaceLayout::resolve_field`]), and whether a background task is
/// currently running against it.
pub struct StoryDetail {
    pub story: Story,
    pub round: Round,
    pub clarifications: Vec<Clarification>,
    pub docs: HashMap<&'static str, Option<String>>,
    pub ai_running: bool,
}

#[derive(Clone)]
pub struct Orchestrator {
    stages: Arc<HashMap<StoryStatus, Arc<dyn Stage>>>,
    state_machine: StateMachine,
    capabilities: Arc<CapabilityRegistry>,
    executor: Executor,
    sse: SseBus,
    gateway: Arc<dyn PersistenceGateway>,
    config: Arc<OpdConfig>,
}

impl Orchestrator {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, capabilities: Arc<CapabilityRegistry>, config: Arc<OpdConfig>) -> Self {
        Orchestrator {
            stages: Arc::new(build_stage_table()),
            state_machine: StateMachine::new(),
            capabilities,
            executor: Executor::new(),
            sse: SseBus::new(),
            gateway,
            config,
        }
    }

    pub fn sse(&self) -> &SseBus {
        &self.sse
    }

    // -- CreateProject / InitWorkspace ------------------------------------

    pub async fn create_project(&self, name: String, repo_url: String) -> OpdResult<Project> {
        let existing = self.gateway.list_projects().await?;
        if existing.iter().any(|p| p.name == name) {
            return Err(OpdError::validation(format!("project name '{name}' already in use")));
        }
        let project = self.gateway.create_project(Project::new(name, repo_url)).await?;
        self.schedule_clone(project.id);
        Ok(project)
    }

    pub async fn init_workspace(&self, project_id: Uuid) -> OpdResult<()> {
        self.gateway.get_project(project_id).await?;
        self.schedule_clone(project_id);
        Ok(())
    }

    /// Fire-and-forget clone/pull, untracked by the `Executor` since it has
    /// no per-story cancellation surface of its own.
    fn schedule_clone(&self, project_id: Uuid) {
        let gateway = self.gateway.clone();
        let root = self.config.default_workspace_root.clone();
        tokio::spawn(async move {
            let Ok(mut project) = gateway.get_project(project_id).await else { return };
            let layout = WorkspaceLayout::for_project(&root, &project);
            project.workspace_status = crate::model::WorkspaceStatus::Cloning;
            let _ = gateway.update_project(project.clone()).await;

            let repo_url = project.repo_url.clone();
            let result = layout
                .clone_workspace(&repo_url, None, |progress| async move {
                    log::debug!("workspace clone progress: {progress}");
                })
                .await;
            match result {
                Ok(()) => {
                    project.workspace_dir = Some(layout.root().display().to_string());
                    project.workspace_status = crate::model::WorkspaceStatus::Ready;
                    project.workspace_error = None;
                }
                Err(e) => {
                    project.workspace_status = crate::model::WorkspaceStatus::Error;
                    project.workspace_error = Some(e.to_string());
                }
            }
            let _ = gateway.update_project(project).await;
        });
    }

    // -- CreateStory --------------------------------------------------------

    pub async fn create_story(
        &self,
        project_id: Uuid,
        title: String,
        raw_input: String,
        feature_tag: Option<String>,
    ) -> OpdResult<Story> {
        self.gateway.get_project(project_id).await?;
        let mut new_story = Story::new(project_id, title, raw_input);
        new_story.feature_tag = feature_tag;
        let story = self.gateway.create_story(new_story).await?;
        self.gateway.create_round(Round::initial(story.id)).await?;
        self.schedule_stage(story.id).await;
        Ok(story)
    }

    // -- ConfirmStage / RejectStage -----------------------------------------

    const CONFIRMABLE: &'static [StoryStatus] = &[
        StoryStatus::Preparing,
        StoryStatus::Clarifying,
        StoryStatus::Planning,
        StoryStatus::Designing,
        StoryStatus::Verifying,
    ];

    pub async fn confirm_stage(&self, story_id: Uuid) -> OpdResult<Story> {
        let mut story = self.gateway.get_story(story_id).await?;
        if !Self::CONFIRMABLE.contains(&story.status) {
            return Err(OpdError::InvalidTransition {
                from: story.status.as_str().to_string(),
                to: "confirm".to_string(),
            });
        }
        // From every confirmable status but `Verifying` there is exactly
        // one forward successor; `Verifying`'s three successors are
        // disambiguated by which operation is called (`ConfirmStage` always
        // means "done", `Iterate`/`Restart` are separate operations below).
        let next = if story.status == StoryStatus::Verifying {
            StoryStatus::Done
        } else {
            *self
                .state_machine
                .available_transitions(story.status)
                .first()
                .ok_or_else(|| OpdError::InvalidTransition {
                    from: story.status.as_str().to_string(),
                    to: "next".to_string(),
                })?
        };
        self.state_machine.transition(story.status, next)?;

        if story.status == StoryStatus::Clarifying && story.confirmed_prd.is_none() {
            story.confirmed_prd = story.prd.clone();
        }
        story.status = next;
        let story = self.gateway.update_story(story).await?;

        if matches!(next, StoryStatus::Clarifying | StoryStatus::Planning | StoryStatus::Designing | StoryStatus::Coding) {
            self.schedule_stage(story.id).await;
        }
        Ok(story)
    }

    pub async fn reject_stage(&self, story_id: Uuid) -> OpdResult<()> {
        self.gateway.get_story(story_id).await?;
        self.schedule_stage(story_id).await;
        Ok(())
    }

    // -- Rollback ------------------------------------------------------------

    pub async fn rollback(&self, story_id: Uuid, target: StoryStatus) -> OpdResult<Story> {
        let mut story = self.gateway.get_story(story_id).await?;
        if !target.is_document_stage() || target.order_index() >= story.status.order_index() {
            return Err(OpdError::validation(format!(
                "rollback target {target:?} must be an earlier document stage than {:?}",
                story.status
            )));
        }

        self.executor.stop(TaskKey::stage(story_id)).await;
        self.executor.stop(TaskKey::chat(story_id)).await;

        let layout = self.layout_for_story(&story).await?;
        for doc in crate::model::StoryDoc::fields_after(target) {
            let _ = layout.delete_doc(&story, doc.filename());
        }
        story.clear_docs_after(target);

        if target == StoryStatus::Preparing {
            for mut clarification in self.gateway.list_clarifications(story_id).await? {
                clarification.answer = None;
                self.gateway.update_clarification(clarification).await?;
            }
        }

        let round = self.gateway.active_round_for_story(story_id).await?;
        self.sse.close(round.id).await;

        story.status = target;
        let story = self.gateway.update_story(story).await?;
        self.schedule_stage(story.id).await;
        Ok(story)
    }

    // -- Chat / AnswerClarifications -----------------------------------------

    const CHAT_ELIGIBLE: &'static [StoryStatus] =
        &[StoryStatus::Preparing, StoryStatus::Clarifying, StoryStatus::Planning, StoryStatus::Designing];

    pub async fn chat(&self, story_id: Uuid, message: String) -> OpdResult<()> {
        let story = self.gateway.get_story(story_id).await?;
        if !Self::CHAT_ELIGIBLE.contains(&story.status) {
            return Err(OpdError::validation(format!("chat is not available in stage {:?}", story.status)));
        }
        let round = self.gateway.active_round_for_story(story_id).await?;
        self.gateway
            .append_ai_message(AiMessage {
                id: Uuid::new_v4(),
                round_id: round.id,
                role: MessageRole::User,
                content: message,
                created_at: chrono::Utc::now(),
            })
            .await?;
        self.schedule_chat(story_id).await;
        Ok(())
    }

    pub async fn answer_clarifications(&self, story_id: Uuid, answers: Vec<ClarificationAnswer>) -> OpdResult<()> {
        self.gateway.get_story(story_id).await?;
        let existing = self.gateway.list_clarifications(story_id).await?;
        for answer in answers {
            let matched = answer
                .id
                .and_then(|id| existing.iter().find(|c| c.id == id))
                .or_else(|| existing.iter().find(|c| c.question == answer.question && c.answer.is_none()));
            if let Some(found) = matched {
                let mut updated = found.clone();
                updated.answer = Some(answer.answer);
                self.gateway.update_clarification(updated).await?;
            }
        }
        self.schedule_chat(story_id).await;
        Ok(())
    }

    // -- Iterate / Restart ----------------------------------------------------

    pub async fn iterate(&self, story_id: Uuid) -> OpdResult<Story> {
        let mut story = self.gateway.get_story(story_id).await?;
        if story.status != StoryStatus::Verifying {
            return Err(OpdError::validation("iterate is only valid from verifying"));
        }
        let action = self.state_machine.transition(StoryStatus::Verifying, StoryStatus::Coding)?;
        debug_assert_eq!(action, RolloutAction::Iterate);
        story.status = StoryStatus::Coding;
        let story = self.gateway.update_story(story).await?;
        self.schedule_stage(story.id).await;
        Ok(story)
    }

    pub async fn restart(&self, story_id: Uuid) -> OpdResult<Story> {
        let mut story = self.gateway.get_story(story_id).await?;
        if story.status != StoryStatus::Verifying {
            return Err(OpdError::validation("restart is only valid from verifying"));
        }
        let action = self.state_machine.transition(StoryStatus::Verifying, StoryStatus::Designing)?;
        debug_assert_eq!(action, RolloutAction::Restart);

        let mut current_round = self.gateway.active_round_for_story(story_id).await?;
        current_round.status = RoundStatus::Closed;
        current_round.close_reason = Some("restart".to_string());
        self.gateway.update_round(current_round.clone()).await?;

        let new_round = Round {
            id: Uuid::new_v4(),
            story_id,
            number: current_round.number + 1,
            round_type: RoundType::Restart,
            status: RoundStatus::Active,
            branch_name: None,
            close_reason: None,
            created_at: chrono::Utc::now(),
        };
        self.gateway.create_round(new_round).await?;

        story.status = StoryStatus::Designing;
        story.current_round += 1;
        let story = self.gateway.update_story(story).await?;
        self.schedule_stage(story.id).await;
        Ok(story)
    }

    // -- Stop ------------------------------------------------------------------

    /// Cancels any running stage/chat task for the story, records a
    /// `[Stopped]` assistant message on the active round, and rewinds the
    /// story to the nearest earlier document stage so it isn't left
    /// parked mid-generation.
    pub async fn stop(&self, story_id: Uuid) -> OpdResult<()> {
        self.executor.stop(TaskKey::stage(story_id)).await;
        self.executor.stop(TaskKey::chat(story_id)).await;

        let mut story = self.gateway.get_story(story_id).await?;
        let round = self.gateway.active_round_for_story(story_id).await?;

        let stopped_message = "[Stopped] 用户手动停止了当前任务".to_string();
        self.gateway
            .append_ai_message(AiMessage {
                id: Uuid::new_v4(),
                round_id: round.id,
                role: MessageRole::Assistant,
                content: stopped_message.clone(),
                created_at: chrono::Utc::now(),
            })
            .await?;
        self.sse.publish(round.id, Event::Assistant { content: stopped_message }).await;
        self.sse.publish(round.id, Event::Done).await;

        if let Some(target) = stop_rewind_target(story.status) {
            story.status = target;
            self.gateway.update_story(story).await?;
        }
        Ok(())
    }

    // -- Scheduling --------------------------------------------------------

    async fn schedule_stage(&self, story_id: Uuid) {
        let key = TaskKey::stage(story_id);
        let orchestrator = self.clone();
        let delay = self.config.stage_task_delay;
        self.executor
            .spawn(key, move |cancel| async move {
                tokio::time::sleep(delay).await;
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = orchestrator.run_stage_task(story_id, &cancel).await {
                    log::error!("stage task for story {story_id} failed: {e}");
                }
            })
            .await;
    }

    async fn schedule_chat(&self, story_id: Uuid) {
        let key = TaskKey::chat(story_id);
        let orchestrator = self.clone();
        let delay = self.config.chat_task_delay;
        self.executor
            .spawn(key, move |cancel| async move {
                tokio::time::sleep(delay).await;
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = orchestrator.run_chat_task(story_id, &cancel).await {
                    log::error!("chat task for story {story_id} failed: {e}");
                }
            })
            .await;
    }

    async fn layout_for_story(&self, story: &Story) -> OpdResult<WorkspaceLayout> {
        let project = self.gateway.get_project(story.project_id).await?;
        Ok(WorkspaceLayout::for_project(&self.config.default_workspace_root, &project))
    }

    // -- Read model: projects -------------------------------------------------

    pub async fn list_projects(&self) -> OpdResult<Vec<Project>> {
        self.gateway.list_projects().await
    }

    pub async fn get_project(&self, project_id: Uuid) -> OpdResult<Project> {
        self.gateway.get_project(project_id).await
    }

    /// `PUT /api/projects/{id}`: applies the given fields and, if
    /// `repo_url` changed, re-clones the workspace from the new remote.
    pub async fn update_project(&self, project_id: Uuid, update: ProjectUpdate) -> OpdResult<Project> {
        let mut project = self.gateway.get_project(project_id).await?;
        let repo_changed = matches!(&update.repo_url, Some(url) if *url != project.repo_url);
        if let Some(name) = update.name {
            project.name = name;
        }
        if let Some(repo_url) = update.repo_url {
            project.repo_url = repo_url;
        }
        if let Some(description) = update.description {
            project.description = description;
        }
        if let Some(tech_stack) = update.tech_stack {
            project.tech_stack = tech_stack;
        }
        if let Some(architecture) = update.architecture {
            project.architecture = architecture;
        }
        let project = self.gateway.update_project(project).await?;
        if repo_changed {
            self.schedule_clone(project.id);
        }
        Ok(project)
    }

    pub async fn workspace_status(&self, project_id: Uuid) -> OpdResult<(WorkspaceStatus, Option<String>)> {
        let project = self.gateway.get_project(project_id).await?;
        Ok((project.workspace_status, project.workspace_error))
    }

    /// `POST /api/projects/verify-repo`: there is no repo-specific
    /// preflight call on `ScmProvider`, so this reuses the active `scm`
    /// capability's own health check as the closest available signal.
    pub async fn verify_repo(&self, _repo_url: &str) -> HealthStatus {
        match self.capabilities.get("scm").await {
            Some(cap) => cap.provider.health_check().await,
            None => HealthStatus::unhealthy("scm capability not configured"),
        }
    }

    // -- Read model / write: capability settings ------------------------------

    /// Password-typed fields are masked to [`crate::secret::MASK_SENTINEL`]
    /// before the configs reach the caller — plaintext secrets never
    /// round-trip through this read path.
    pub async fn list_capability_configs(&self) -> OpdResult<Vec<CapabilityConfig>> {
        let mut configs = self.gateway.list_capability_configs().await?;
        for config in &mut configs {
            for field in self.capabilities.password_field_names(&config.category, &config.provider) {
                if let Some(value) = config.config.get_mut(field) {
                    if value.as_str().map(|s| !s.is_empty()).unwrap_or(false) {
                        *value = serde_json::Value::String(crate::secret::MASK_SENTINEL.to_string());
                    }
                }
            }
        }
        Ok(configs)
    }

    /// Resolves any password field submitted as the mask sentinel back to
    /// its previously stored value, applies the result to the live
    /// registry, then persists the resolved (never-sentinel) config.
    pub async fn upsert_capability_config(&self, mut config: CapabilityConfig) -> OpdResult<()> {
        let resolved = self
            .capabilities
            .update_provider_config(&config.category, &config.provider, config.config)
            .await?;
        config.config = resolved;
        self.gateway.upsert_capability_config(config).await
    }

    pub async fn list_project_overrides(&self, project_id: Uuid) -> OpdResult<Vec<ProjectCapabilityOverride>> {
        self.gateway.list_project_overrides(project_id).await
    }

    pub async fn upsert_project_override(&self, ov: ProjectCapabilityOverride) -> OpdResult<()> {
        self.gateway.upsert_project_override(ov).await
    }

    /// `POST /api/settings/capabilities/{cap}/test`: builds a throwaway
    /// provider instance from the candidate config and health-checks it
    /// without touching the live registry.
    pub async fn test_capability(
        &self,
        category: &str,
        provider: &str,
        config: HashMap<String, serde_json::Value>,
    ) -> HealthStatus {
        match self.capabilities.create_temp(category, provider, config) {
            Some(candidate) => candidate.health_check().await,
            None => HealthStatus::unhealthy(format!("no provider [{provider}] registered for [{category}]")),
        }
    }

    // -- Read model: stories ---------------------------------------------------

    pub async fn list_stories(&self, project_id: Uuid) -> OpdResult<Vec<Story>> {
        self.gateway.get_project(project_id).await?;
        self.gateway.list_stories_for_project(project_id).await
    }

    pub async fn story_detail(&self, story_id: Uuid) -> OpdResult<StoryDetail> {
        let aggregate = self.gateway.load_story_aggregate(story_id).await?;
        let layout = WorkspaceLayout::for_project(&self.config.default_workspace_root, &aggregate.project);

        let mut docs = HashMap::new();
        for doc in [
            StoryDoc::Prd,
            StoryDoc::ConfirmedPrd,
            StoryDoc::TechnicalDesign,
            StoryDoc::DetailedDesign,
            StoryDoc::CodingReport,
            StoryDoc::TestGuide,
        ] {
            let resolved = layout.resolve_field(doc.get(&aggregate.story))?;
            docs.insert(doc.filename(), resolved);
        }

        let ai_running = self.executor.is_running(TaskKey::stage(story_id)).await
            || self.executor.is_running(TaskKey::chat(story_id)).await;

        Ok(StoryDetail { story: aggregate.story, round: aggregate.round, clarifications: aggregate.clarifications, docs, ai_running })
    }

    /// `PUT /api/stories/{id}/docs/{filename}`: a manual edit of a
    /// document field, bypassing AI generation. `filename` must match the
    /// canonical name of one of the story's document fields.
    pub async fn update_doc(&self, story_id: Uuid, filename: &str, content: String) -> OpdResult<()> {
        let mut story = self.gateway.get_story(story_id).await?;
        let doc = [
            StoryDoc::Prd,
            StoryDoc::ConfirmedPrd,
            StoryDoc::TechnicalDesign,
            StoryDoc::DetailedDesign,
            StoryDoc::CodingReport,
            StoryDoc::TestGuide,
        ]
        .into_iter()
        .find(|d| d.filename() == filename)
        .ok_or_else(|| OpdError::validation(format!("unknown document filename '{filename}'")))?;

        let layout = self.layout_for_story(&story).await?;
        let relpath = layout.write_doc(&story, filename, &content)?;
        doc.set(&mut story, Some(relpath));
        self.gateway.update_story(story).await?;

        let round = self.gateway.active_round_for_story(story_id).await?;
        self.sse.publish(round.id, Event::DocUpdated { filename: filename.to_string(), content }).await;
        Ok(())
    }

    /// `GET /api/stories/{id}/stream`: subscribes before replaying so no
    /// event published between the two calls is lost, then returns the
    /// persisted backlog to send first.
    pub async fn subscribe_stream(&self, story_id: Uuid, mode: ReplayMode) -> OpdResult<(Vec<Event>, tokio::sync::mpsc::Receiver<Event>)> {
        let round = self.gateway.active_round_for_story(story_id).await?;
        let rx = self.sse.subscribe(round.id).await;
        let history = self.gateway.list_ai_messages(round.id).await?;
        Ok((replay_events(&history, mode), rx))
    }

    // -- Webhooks --------------------------------------------------------------

    pub fn webhook_secret(&self) -> Option<&str> {
        self.config.webhook_secret.as_deref()
    }

    /// Best-effort lookup across every project's active rounds — the
    /// gateway has no PR-number index, so a webhook handler scans. Fine
    /// at the scale this engine targets (one org's in-flight stories);
    /// a real deployment would add a `find_pull_request_by_number` query.
    async fn find_round_and_pr_by_number(&self, number: u64) -> OpdResult<(Round, PullRequest)> {
        for project in self.gateway.list_projects().await? {
            for story in self.gateway.list_stories_for_project(project.id).await? {
                let Ok(round) = self.gateway.active_round_for_story(story.id).await else { continue };
                for pr in self.gateway.list_pull_requests(round.id).await? {
                    if pr.number == number {
                        return Ok((round, pr));
                    }
                }
            }
        }
        Err(OpdError::not_found(format!("pull request #{number}")))
    }

    /// `POST /api/webhooks/github`: signature verification happens at the
    /// HTTP layer before this is called. Handles a merged pull request and
    /// a changes-requested review; everything else is ignored.
    pub async fn handle_github_webhook(&self, event_type: &str, payload: &serde_json::Value) -> OpdResult<()> {
        match event_type {
            "pull_request" => {
                let action = payload["action"].as_str().unwrap_or("");
                let merged = payload["pull_request"]["merged"].as_bool().unwrap_or(false);
                if action == "closed" && merged {
                    if let Some(number) = payload["pull_request"]["number"].as_u64() {
                        if let Ok((mut round, mut pr)) = self.find_round_and_pr_by_number(number).await {
                            pr.status = PrStatus::Merged;
                            self.gateway.update_pull_request(pr).await?;
                            round.status = RoundStatus::Closed;
                            round.close_reason = Some("merged".to_string());
                            self.gateway.update_round(round.clone()).await?;
                            self.sse
                                .publish(round.id, Event::Info { content: format!("pull request #{number} merged") })
                                .await;
                        }
                    }
                }
            }
            "pull_request_review" => {
                let state = payload["review"]["state"].as_str().unwrap_or("");
                if state == "changes_requested" {
                    if let Some(number) = payload["pull_request"]["number"].as_u64() {
                        if let Ok((round, _pr)) = self.find_round_and_pr_by_number(number).await {
                            self.sse
                                .publish(round.id, Event::Info { content: format!("changes requested on pull request #{number}") })
                                .await;
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    // -- Task bodies ---------------------------------------------------------

    async fn run_stage_task(&self, story_id: Uuid, cancel: &tokio_util::sync::CancellationToken) -> OpdResult<()> {
        let aggregate = self.gateway.load_story_aggregate(story_id).await?;
        let stage = self
            .stages
            .get(&aggregate.story.status)
            .ok_or_else(|| OpdError::Infra(format!("no stage handler for {:?}", aggregate.story.status)))?
            .clone();

        let layout = WorkspaceLayout::for_project(&self.config.default_workspace_root, &aggregate.project);

        if should_skip_ai(&layout, &aggregate.story, aggregate.story.status) {
            log::info!("skipping ai invocation for story {story_id}: input unchanged");
            return Ok(());
        }

        let overrides = self.gateway.list_project_overrides(aggregate.project.id).await?;
        let capabilities = self.capabilities.with_project_overrides(&overrides).await?;

        let stage_input = resolve_stage_input(&layout, &aggregate.story, aggregate.story.status)?.unwrap_or_default();
        let history = self.gateway.list_ai_messages(aggregate.round.id).await?;
        let tasks: Vec<TaskItem> = Vec::new();
        let scanned_source = if aggregate.story.status == StoryStatus::Coding {
            Some(layout.scan_source())
        } else {
            None
        };
        let snapshot = PromptSnapshot {
            project: &aggregate.project,
            story: &aggregate.story,
            round: &aggregate.round,
            clarifications: &aggregate.clarifications,
            tasks: &tasks,
            history: &history,
            source_context: scanned_source.as_deref(),
            triggering_message: None,
        };
        let branch_name = aggregate.round.branch_name.clone();
        let ctx = StageContext {
            snapshot,
            stage_input: &stage_input,
            capabilities: &capabilities,
            branch_name: branch_name.as_deref(),
            pull_requests: &aggregate.pull_requests,
        };

        let preflight = capabilities
            .preflight(stage.required_capabilities(), stage.optional_capabilities())
            .await;
        if !preflight.ok() {
            self.sse.publish(aggregate.round.id, Event::Error { message: preflight.errors.join("; ") }).await;
            return Err(OpdError::Preflight(preflight.errors));
        }
        stage.preconditions(&ctx)?;

        if cancel.is_cancelled() {
            return Err(OpdError::Cancellation);
        }

        let round_id = aggregate.round.id;
        let sse = self.sse.clone();
        let mut sink = |event: AiEvent| {
            if let AiEvent::Token(text) = event {
                let sse = sse.clone();
                tokio::spawn(async move {
                    sse.publish(round_id, Event::Assistant { content: text }).await;
                });
            }
        };

        let output = stage.execute(&ctx, &mut sink, cancel).await?;
        stage.validate_output(&output)?;

        let mut story = aggregate.story;
        for (doc, content) in &output.docs {
            let relpath = layout.write_doc(&story, doc.filename(), content)?;
            doc.set(&mut story, Some(relpath));
        }
        if let Some(mapping) = crate::hashing::stage_input_mapping(story.status) {
            (mapping.set_hash)(&mut story, Some(crate::hashing::compute_hash(&stage_input)));
        }
        if let Some(next) = output.next_status {
            self.state_machine.transition(story.status, next)?;
            story.status = next;
        }
        self.gateway.update_story(story).await?;

        for clarification in output.new_clarifications {
            self.gateway.add_clarification(clarification).await?;
        }
        for pr in output.new_pull_requests {
            self.gateway.add_pull_request(pr).await?;
        }

        for (doc, content) in &output.docs {
            self.sse
                .publish(round_id, Event::DocUpdated { filename: doc.filename().to_string(), content: content.clone() })
                .await;
        }
        self.sse.publish(round_id, Event::Done).await;
        Ok(())
    }

    async fn run_chat_task(&self, story_id: Uuid, cancel: &tokio_util::sync::CancellationToken) -> OpdResult<()> {
        let aggregate = self.gateway.load_story_aggregate(story_id).await?;
        let overrides = self.gateway.list_project_overrides(aggregate.project.id).await?;
        let capabilities = self.capabilities.with_project_overrides(&overrides).await?;
        let ai_cap = capabilities
            .get("ai")
            .await
            .ok_or_else(|| OpdError::Preflight(vec!["ai capability not configured".to_string()]))?;
        let ai = ai_cap
            .provider
            .as_ai()
            .ok_or_else(|| OpdError::Infra("ai capability provider is not an AiProvider".to_string()))?;

        let doc = current_stage_doc(aggregate.story.status);
        let layout = WorkspaceLayout::for_project(&self.config.default_workspace_root, &aggregate.project);
        let current_content = layout.read_doc(&aggregate.story, doc.filename())?.unwrap_or_default();

        let history = self.gateway.list_ai_messages(aggregate.round.id).await?;
        let triggering = history.iter().rev().find(|m| m.role == MessageRole::User).map(|m| m.content.as_str());
        let tasks: Vec<TaskItem> = Vec::new();
        let snapshot = PromptSnapshot {
            project: &aggregate.project,
            story: &aggregate.story,
            round: &aggregate.round,
            clarifications: &aggregate.clarifications,
            tasks: &tasks,
            history: &history,
            source_context: None,
            triggering_message: triggering,
        };
        let (system_prompt, user_prompt) = prompt::build_chat_prompt(aggregate.story.status, &current_content, &snapshot);
        let messages = vec![
            crate::providers::ChatMessage::system(system_prompt),
            crate::providers::ChatMessage::user(user_prompt),
        ];

        if cancel.is_cancelled() {
            return Err(OpdError::Cancellation);
        }
        let mut sink = |_event: AiEvent| {};
        let raw = ai
            .complete_streaming(&messages, &mut sink, cancel)
            .await
            .map_err(|e| OpdError::Provider(e.to_string()))?;
        let (discussion, updated_doc) = prompt::parse_refine_response(&raw);

        self.gateway
            .append_ai_message(AiMessage {
                id: Uuid::new_v4(),
                round_id: aggregate.round.id,
                role: MessageRole::Assistant,
                content: discussion,
                created_at: chrono::Utc::now(),
            })
            .await?;

        if let Some(content) = updated_doc {
            let relpath = layout.write_doc(&aggregate.story, doc.filename(), &content)?;
            let mut story = aggregate.story;
            doc.set(&mut story, Some(relpath));
            self.gateway.update_story(story).await?;
            let event = Event::DocUpdated { filename: doc.filename().to_string(), content: content.clone() };
            self.sse.publish(aggregate.round.id, event).await;
            if doc == crate::model::StoryDoc::Prd {
                self.sse
                    .publish(aggregate.round.id, Event::PrdUpdated { filename: doc.filename().to_string(), content })
                    .await;
            }
        }
        self.sse.publish(aggregate.round.id, Event::Done).await;
        Ok(())
    }
}

/// Where a stopped story lands: one document stage back from wherever it
/// was interrupted, so confirming again regenerates from a known-good
/// input rather than resuming a half-finished generation.
fn stop_rewind_target(status: StoryStatus) -> Option<StoryStatus> {
    match status {
        StoryStatus::Preparing => None,
        StoryStatus::Clarifying => Some(StoryStatus::Preparing),
        StoryStatus::Planning => Some(StoryStatus::Clarifying),
        StoryStatus::Designing => Some(StoryStatus::Planning),
        StoryStatus::Coding => Some(StoryStatus::Planning),
        StoryStatus::Verifying => Some(StoryStatus::Coding),
        StoryStatus::Done => None,
    }
}

/// Which document field the current stage's chat turn edits in place.
fn current_stage_doc(status: StoryStatus) -> crate::model::StoryDoc {
    use crate::model::StoryDoc::*;
    match status {
        StoryStatus::Preparing => Prd,
        StoryStatus::Clarifying => ConfirmedPrd,
        StoryStatus::Planning => TechnicalDesign,
        StoryStatus::Designing => DetailedDesign,
        _ => Prd,
    }
}
