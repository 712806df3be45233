//! End-to-end scenarios driving the full `Orchestrator` against the fake
//! providers: a story moving through preparing/clarifying, chat-driven
//! document refinement, rollback, change-detection skip, state-machine
//! rejection, and SSE replay-then-live semantics.

use std::sync::Arc;
use std::time::Duration;

use opd_engine::capability::CapabilityRegistry;
use opd_engine::config::OpdConfig;
use opd_engine::error::OpdError;
use opd_engine::orchestrator::Orchestrator;
use opd_engine::persistence::{InMemoryGateway, PersistenceGateway};
use opd_engine::providers::fake::{fake_ai, FakeAiProvider};
use opd_engine::providers::AnyProvider;
use opd_engine::providers::CiState;
use opd_engine::sse::{Event, ReplayMode};
use opd_engine::state_machine::StateMachine;
use opd_engine::model::{MessageRole, StoryStatus};
use opd_engine::workspace::WorkspaceLayout;

use std::collections::HashMap;

/// A registry with a single `ai` capability backed by `provider`, active
/// immediately — no config schema indirection needed since tests hand
/// over an already-built fake and only ever trigger the factory once.
async fn registry_with_ai(provider: Arc<dyn opd_engine::providers::AiProvider>) -> Arc<CapabilityRegistry> {
    let mut registry = CapabilityRegistry::new();
    registry.register("ai", "fake", vec![], Arc::new(move |_config| AnyProvider::Ai(provider.clone())));
    let mut configs = HashMap::new();
    configs.insert("ai".to_string(), ("fake".to_string(), HashMap::new()));
    registry.initialize_from_config(&configs).await.unwrap();
    Arc::new(registry)
}

fn test_config(root: &std::path::Path) -> Arc<OpdConfig> {
    Arc::new(OpdConfig {
        default_workspace_root: root.to_path_buf(),
        stage_task_delay: Duration::ZERO,
        chat_task_delay: Duration::ZERO,
        ..OpdConfig::default()
    })
}

/// Poll an async predicate until it's true or `timeout` elapses.
async fn wait_until<F, Fut>(mut cond: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// S1 — happy path to verifying (through preparing and clarifying).
#[tokio::test]
async fn s1_happy_path_preparing_then_clarifying() {
    let dir = tempfile::tempdir().unwrap();
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
    let ai = Arc::new(FakeAiProvider::with_responses(vec![
        "# PRD\nImplement POST /login".to_string(),
        "[{\"question\":\"scope?\"}]".to_string(),
    ]));
    let capabilities = registry_with_ai(ai).await;
    let config = test_config(dir.path());
    let orchestrator = Orchestrator::new(gateway.clone(), capabilities, config);

    let project = orchestrator
        .create_project("p1".to_string(), "https://example.test/repo.git".to_string())
        .await
        .unwrap();
    let story = orchestrator
        .create_story(project.id, "add /login".to_string(), "Implement POST /login".to_string(), None)
        .await
        .unwrap();
    assert_eq!(story.status, StoryStatus::Preparing);

    wait_until(
        || {
            let gateway = gateway.clone();
            async move { gateway.get_story(story.id).await.unwrap().prd.is_some() }
        },
        Duration::from_secs(2),
    )
    .await;

    let story = gateway.get_story(story.id).await.unwrap();
    assert_eq!(story.prd.as_deref(), Some("# PRD\nImplement POST /login"));

    let story = orchestrator.confirm_stage(story.id).await.unwrap();
    assert_eq!(story.status, StoryStatus::Clarifying);

    wait_until(
        || {
            let gateway = gateway.clone();
            async move { !gateway.list_clarifications(story.id).await.unwrap().is_empty() }
        },
        Duration::from_secs(2),
    )
    .await;

    let clarifications = gateway.list_clarifications(story.id).await.unwrap();
    assert_eq!(clarifications.len(), 1);
    assert_eq!(clarifications[0].question, "scope?");
    assert!(clarifications[0].answer.is_none());
}

/// S2 — chat updates the PRD atomically and publishes exactly one
/// `doc_updated` event.
#[tokio::test]
async fn s2_chat_updates_doc_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
    let ai = Arc::new(FakeAiProvider::with_responses(vec![
        "seed prd".to_string(),
        "<discussion>ok</discussion><updated_doc># PRD v2</updated_doc>".to_string(),
    ]));
    let capabilities = registry_with_ai(ai).await;
    let config = test_config(dir.path());
    let orchestrator = Orchestrator::new(gateway.clone(), capabilities, config);

    let project = orchestrator.create_project("p2".to_string(), "https://example.test/repo.git".to_string()).await.unwrap();
    let story = orchestrator
        .create_story(project.id, "t".to_string(), "r".to_string(), None)
        .await
        .unwrap();

    wait_until(
        || {
            let gateway = gateway.clone();
            async move { gateway.get_story(story.id).await.unwrap().prd.is_some() }
        },
        Duration::from_secs(2),
    )
    .await;

    let round = gateway.active_round_for_story(story.id).await.unwrap();
    let mut rx = orchestrator.sse().subscribe(round.id).await;

    orchestrator.chat(story.id, "shorter please".to_string()).await.unwrap();

    wait_until(
        || {
            let gateway = gateway.clone();
            async move {
                gateway.get_story(story.id).await.unwrap().prd.as_ref().map(|p| p.starts_with("docs/")).unwrap_or(false)
            }
        },
        Duration::from_secs(2),
    )
    .await;

    let story = gateway.get_story(story.id).await.unwrap();
    let layout = WorkspaceLayout::for_project(dir.path(), &project);
    let content = layout.read_doc(&story, "prd.md").unwrap().unwrap();
    assert_eq!(content.trim(), "# PRD v2");

    let messages = gateway.list_ai_messages(round.id).await.unwrap();
    let assistant_reply = messages.iter().rev().find(|m| m.role == MessageRole::Assistant).unwrap();
    assert_eq!(assistant_reply.content, "ok");

    let mut doc_updated_count = 0;
    while let Ok(event) = rx.try_recv() {
        if let Event::DocUpdated { filename, content } = event {
            assert_eq!(filename, "prd.md");
            assert_eq!(content, "# PRD v2");
            doc_updated_count += 1;
        }
    }
    assert_eq!(doc_updated_count, 1);
}

/// S3 — rollback clears every downstream document and hash field.
#[tokio::test]
async fn s3_rollback_clears_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
    let ai = fake_ai();
    let capabilities = registry_with_ai(ai).await;
    let config = test_config(dir.path());
    let orchestrator = Orchestrator::new(gateway.clone(), capabilities, config);

    let project = orchestrator.create_project("p3".to_string(), "https://example.test/repo.git".to_string()).await.unwrap();
    let mut story = opd_engine::model::Story::new(project.id, "t".to_string(), "r".to_string());
    story.status = StoryStatus::Planning;
    story.prd = Some("prd inline".to_string());
    story.confirmed_prd = Some("confirmed inline".to_string());
    story.technical_design = Some("docs/t-slug/technical_design.md".to_string());
    let story = gateway.create_story(story).await.unwrap();
    gateway.create_round(opd_engine::model::Round::initial(story.id)).await.unwrap();
    gateway
        .add_clarification(opd_engine::model::Clarification {
            id: uuid::Uuid::new_v4(),
            story_id: story.id,
            question: "scope?".to_string(),
            answer: Some("yes".to_string()),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let story = orchestrator.rollback(story.id, StoryStatus::Preparing).await.unwrap();

    assert_eq!(story.status, StoryStatus::Preparing);
    assert!(story.confirmed_prd.is_none());
    assert!(story.technical_design.is_none());
    assert!(story.detailed_design.is_none());

    let clarifications = gateway.list_clarifications(story.id).await.unwrap();
    assert_eq!(clarifications.len(), 1);
    assert!(clarifications[0].answer.is_none());
}

/// S4 — an unchanged hashed input must not re-invoke the AI provider.
#[tokio::test]
async fn s4_skip_on_unchanged_input() {
    let dir = tempfile::tempdir().unwrap();
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
    let ai = Arc::new(FakeAiProvider::with_responses(vec!["should never be used".to_string()]));
    let capabilities = registry_with_ai(ai.clone()).await;
    let config = test_config(dir.path());
    let orchestrator = Orchestrator::new(gateway.clone(), capabilities, config);

    let project = orchestrator.create_project("p4".to_string(), "https://example.test/repo.git".to_string()).await.unwrap();
    let mut story = opd_engine::model::Story::new(project.id, "t".to_string(), "r".to_string());
    story.status = StoryStatus::Planning;
    story.confirmed_prd = Some("confirmed content".to_string());
    story.technical_design = Some("existing technical design".to_string());
    story.planning_input_hash = Some(opd_engine::hashing::compute_hash("confirmed content"));
    let story = gateway.create_story(story).await.unwrap();
    gateway.create_round(opd_engine::model::Round::initial(story.id)).await.unwrap();

    orchestrator.reject_stage(story.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let story = gateway.get_story(story.id).await.unwrap();
    assert_eq!(story.technical_design.as_deref(), Some("existing technical design"));
}

/// S5 — a direct `(preparing, coding)` transition must be rejected by the
/// state machine even though `ConfirmStage` itself succeeds by routing to
/// `clarifying` instead.
#[tokio::test]
async fn s5_state_machine_rejects_skip_ahead() {
    let dir = tempfile::tempdir().unwrap();
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
    let ai = fake_ai();
    let capabilities = registry_with_ai(ai).await;
    let config = test_config(dir.path());
    let orchestrator = Orchestrator::new(gateway.clone(), capabilities, config);

    let project = orchestrator.create_project("p5".to_string(), "https://example.test/repo.git".to_string()).await.unwrap();
    let story = orchestrator
        .create_story(project.id, "t".to_string(), "r".to_string(), None)
        .await
        .unwrap();
    assert_eq!(story.status, StoryStatus::Preparing);

    let story = orchestrator.confirm_stage(story.id).await.unwrap();
    assert_eq!(story.status, StoryStatus::Clarifying);

    let state_machine = StateMachine::new();
    let err = state_machine.transition(StoryStatus::Preparing, StoryStatus::Coding).unwrap_err();
    assert!(matches!(err, OpdError::InvalidTransition { .. }));
}

/// S6 — subscribing replays persisted history, then the stream continues
/// live through `done`.
#[tokio::test]
async fn s6_sse_replay_then_live() {
    let dir = tempfile::tempdir().unwrap();
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(InMemoryGateway::new());
    let ai = fake_ai();
    let capabilities = registry_with_ai(ai).await;
    let config = test_config(dir.path());
    let orchestrator = Orchestrator::new(gateway.clone(), capabilities, config);

    let project = orchestrator.create_project("p6".to_string(), "https://example.test/repo.git".to_string()).await.unwrap();
    let story = opd_engine::model::Story::new(project.id, "t".to_string(), "r".to_string());
    let story = gateway.create_story(story).await.unwrap();
    let round = opd_engine::model::Round::initial(story.id);
    gateway.create_round(round.clone()).await.unwrap();

    for content in ["a", "b"] {
        gateway
            .append_ai_message(opd_engine::model::AiMessage {
                id: uuid::Uuid::new_v4(),
                round_id: round.id,
                role: MessageRole::Assistant,
                content: content.to_string(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    let (backlog, mut rx) = orchestrator.subscribe_stream(story.id, ReplayMode::Default).await.unwrap();
    assert_eq!(backlog.len(), 2);
    assert!(matches!(&backlog[0], Event::Assistant { content } if content == "a"));
    assert!(matches!(&backlog[1], Event::Assistant { content } if content == "b"));

    orchestrator.sse().publish(round.id, Event::Done).await;
    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, Event::Done));
}

/// Sanity check that the fake CI provider round-trips through
/// `AnyProvider` the same way the AI fake does, since the scenarios above
/// only ever wire up `ai`.
#[tokio::test]
async fn ci_fake_reports_configured_state() {
    let fake = opd_engine::providers::fake::fake_ci(CiState::Success);
    let status = fake.status_for_branch("https://example.test/repo.git", "feature/login").await.unwrap();
    assert_eq!(status.state, CiState::Success);
}
