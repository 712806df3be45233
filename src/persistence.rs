//! Storage seam. `PersistenceGateway` is the trait every orchestrator
//! operation goes through; `InMemoryGateway` is the reference
//! implementation used by tests and as the default when no external store
//! is wired up. Uses plain `Arc<RwLock<HashMap<...>>>` tables for shared
//! state rather than reaching for `dashmap`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OpdError, OpdResult};
use crate::model::{
    AiMessage, CapabilityConfig, Clarification, Project, ProjectCapabilityOverride, PullRequest,
    Round, Story, StoryAggregate,
};

/// Everything the orchestrator needs from storage. One trait rather than
/// a repository-per-entity split, since every operation touches more than
/// one entity type in the same transaction.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_project(&self, project: Project) -> OpdResult<Project>;
    async fn get_project(&self, id: Uuid) -> OpdResult<Project>;
    async fn update_project(&self, project: Project) -> OpdResult<Project>;
    async fn list_projects(&self) -> OpdResult<Vec<Project>>;

    async fn create_story(&self, story: Story) -> OpdResult<Story>;
    async fn get_story(&self, id: Uuid) -> OpdResult<Story>;
    async fn update_story(&self, story: Story) -> OpdResult<Story>;
    async fn list_stories_for_project(&self, project_id: Uuid) -> OpdResult<Vec<Story>>;

    async fn create_round(&self, round: Round) -> OpdResult<Round>;
    async fn get_round(&self, id: Uuid) -> OpdResult<Round>;
    async fn update_round(&self, round: Round) -> OpdResult<Round>;
    async fn active_round_for_story(&self, story_id: Uuid) -> OpdResult<Round>;

    async fn add_clarification(&self, clarification: Clarification) -> OpdResult<Clarification>;
    async fn update_clarification(&self, clarification: Clarification) -> OpdResult<Clarification>;
    async fn list_clarifications(&self, story_id: Uuid) -> OpdResult<Vec<Clarification>>;

    async fn append_ai_message(&self, message: AiMessage) -> OpdResult<AiMessage>;
    async fn list_ai_messages(&self, round_id: Uuid) -> OpdResult<Vec<AiMessage>>;

    async fn add_pull_request(&self, pr: PullRequest) -> OpdResult<PullRequest>;
    async fn update_pull_request(&self, pr: PullRequest) -> OpdResult<PullRequest>;
    async fn list_pull_requests(&self, round_id: Uuid) -> OpdResult<Vec<PullRequest>>;

    async fn upsert_capability_config(&self, config: CapabilityConfig) -> OpdResult<()>;
    async fn list_capability_configs(&self) -> OpdResult<Vec<CapabilityConfig>>;
    async fn upsert_project_override(&self, ov: ProjectCapabilityOverride) -> OpdResult<()>;
    async fn list_project_overrides(&self, project_id: Uuid) -> OpdResult<Vec<ProjectCapabilityOverride>>;

    /// Load a story with its project, active round, clarifications, and
    /// pull requests in one call — the "eager-loaded" snapshot every
    /// background task reads once at the top of its run.
    async fn load_story_aggregate(&self, story_id: Uuid) -> OpdResult<StoryAggregate> {
        let story = self.get_story(story_id).await?;
        let project = self.get_project(story.project_id).await?;
        let round = self.active_round_for_story(story_id).await?;
        let clarifications = self.list_clarifications(story_id).await?;
        let pull_requests = self.list_pull_requests(round.id).await?;
        Ok(StoryAggregate { story, project, round, clarifications, pull_requests })
    }
}

#[derive(Default)]
struct Tables {
    projects: HashMap<Uuid, Project>,
    stories: HashMap<Uuid, Story>,
    rounds: HashMap<Uuid, Round>,
    clarifications: HashMap<Uuid, Clarification>,
    ai_messages: HashMap<Uuid, AiMessage>,
    pull_requests: HashMap<Uuid, PullRequest>,
    capability_configs: HashMap<String, CapabilityConfig>,
    project_overrides: HashMap<(Uuid, String), ProjectCapabilityOverride>,
}

/// Reference `PersistenceGateway` backed by in-process hash maps behind a
/// single `RwLock`. Not durable — intended for tests and as a starting
/// point for a real store to be swapped in behind the trait.
pub struct InMemoryGateway {
    tables: Arc<RwLock<Tables>>,
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGateway {
    pub fn new() -> Self {
        InMemoryGateway { tables: Arc::new(RwLock::new(Tables::default())) }
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn create_project(&self, project: Project) -> OpdResult<Project> {
        let mut t = self.tables.write().await;
        t.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> OpdResult<Project> {
        self.tables
            .read()
            .await
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| OpdError::not_found(format!("project {id}")))
    }

    async fn update_project(&self, project: Project) -> OpdResult<Project> {
        let mut t = self.tables.write().await;
        t.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn list_projects(&self) -> OpdResult<Vec<Project>> {
        Ok(self.tables.read().await.projects.values().cloned().collect())
    }

    async fn create_story(&self, story: Story) -> OpdResult<Story> {
        let mut t = self.tables.write().await;
        t.stories.insert(story.id, story.clone());
        Ok(story)
    }

    async fn get_story(&self, id: Uuid) -> OpdResult<Story> {
        self.tables
            .read()
            .await
            .stories
            .get(&id)
            .cloned()
            .ok_or_else(|| OpdError::not_found(format!("story {id}")))
    }

    async fn update_story(&self, story: Story) -> OpdResult<Story> {
        let mut t = self.tables.write().await;
        t.stories.insert(story.id, story.clone());
        Ok(story)
    }

    async fn list_stories_for_project(&self, project_id: Uuid) -> OpdResult<Vec<Story>> {
        Ok(self
            .tables
            .read()
            .await
            .stories
            .values()
            .filter(|s| s.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn create_round(&self, round: Round) -> OpdResult<Round> {
        let mut t = self.tables.write().await;
        t.rounds.insert(round.id, round.clone());
        Ok(round)
    }

    async fn get_round(&self, id: Uuid) -> OpdResult<Round> {
        self.tables
            .read()
            .await
            .rounds
            .get(&id)
            .cloned()
            .ok_or_else(|| OpdError::not_found(format!("round {id}")))
    }

    async fn update_round(&self, round: Round) -> OpdResult<Round> {
        let mut t = self.tables.write().await;
        t.rounds.insert(round.id, round.clone());
        Ok(round)
    }

    async fn active_round_for_story(&self, story_id: Uuid) -> OpdResult<Round> {
        self.tables
            .read()
            .await
            .rounds
            .values()
            .filter(|r| r.story_id == story_id && r.status == crate::model::RoundStatus::Active)
            .max_by_key(|r| r.number)
            .cloned()
            .ok_or_else(|| OpdError::not_found(format!("active round for story {story_id}")))
    }

    async fn add_clarification(&self, clarification: Clarification) -> OpdResult<Clarification> {
        let mut t = self.tables.write().await;
        t.clarifications.insert(clarification.id, clarification.clone());
        Ok(clarification)
    }

    async fn update_clarification(&self, clarification: Clarification) -> OpdResult<Clarification> {
        let mut t = self.tables.write().await;
        t.clarifications.insert(clarification.id, clarification.clone());
        Ok(clarification)
    }

    async fn list_clarifications(&self, story_id: Uuid) -> OpdResult<Vec<Clarification>> {
        let mut items: Vec<Clarification> = self
            .tables
            .read()
            .await
            .clarifications
            .values()
            .filter(|c| c.story_id == story_id)
            .cloned()
            .collect();
        items.sort_by_key(|c| c.created_at);
        Ok(items)
    }

    async fn append_ai_message(&self, message: AiMessage) -> OpdResult<AiMessage> {
        let mut t = self.tables.write().await;
        t.ai_messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn list_ai_messages(&self, round_id: Uuid) -> OpdResult<Vec<AiMessage>> {
        let mut items: Vec<AiMessage> = self
            .tables
            .read()
            .await
            .ai_messages
            .values()
            .filter(|m| m.round_id == round_id)
            .cloned()
            .collect();
        items.sort_by_key(|m| m.created_at);
        Ok(items)
    }

    async fn add_pull_request(&self, pr: PullRequest) -> OpdResult<PullRequest> {
        let mut t = self.tables.write().await;
        t.pull_requests.insert(pr.id, pr.clone());
        Ok(pr)
    }

    async fn update_pull_request(&self, pr: PullRequest) -> OpdResult<PullRequest> {
        let mut t = self.tables.write().await;
        t.pull_requests.insert(pr.id, pr.clone());
        Ok(pr)
    }

    async fn list_pull_requests(&self, round_id: Uuid) -> OpdResult<Vec<PullRequest>> {
        Ok(self
            .tables
            .read()
            .await
            .pull_requests
            .values()
            .filter(|pr| pr.round_id == round_id)
            .cloned()
            .collect())
    }

    async fn upsert_capability_config(&self, config: CapabilityConfig) -> OpdResult<()> {
        self.tables.write().await.capability_configs.insert(config.category.clone(), config);
        Ok(())
    }

    async fn list_capability_configs(&self) -> OpdResult<Vec<CapabilityConfig>> {
        Ok(self.tables.read().await.capability_configs.values().cloned().collect())
    }

    async fn upsert_project_override(&self, ov: ProjectCapabilityOverride) -> OpdResult<()> {
        self.tables
            .write()
            .await
            .project_overrides
            .insert((ov.project_id, ov.category.clone()), ov);
        Ok(())
    }

    async fn list_project_overrides(&self, project_id: Uuid) -> OpdResult<Vec<ProjectCapabilityOverride>> {
        Ok(self
            .tables
            .read()
            .await
            .project_overrides
            .values()
            .filter(|o| o.project_id == project_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_a_project() {
        let gw = InMemoryGateway::new();
        let project = Project::new("Demo", "https://example.test/repo.git");
        gw.create_project(project.clone()).await.unwrap();
        let fetched = gw.get_project(project.id).await.unwrap();
        assert_eq!(fetched.name, "Demo");
    }

    #[tokio::test]
    async fn missing_story_is_not_found() {
        let gw = InMemoryGateway::new();
        let err = gw.get_story(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OpdError::NotFound(_)));
    }

    #[tokio::test]
    async fn loads_full_story_aggregate() {
        let gw = InMemoryGateway::new();
        let project = Project::new("Demo", "https://example.test/repo.git");
        gw.create_project(project.clone()).await.unwrap();
        let story = Story::new(project.id, "t", "raw");
        gw.create_story(story.clone()).await.unwrap();
        let round = Round::initial(story.id);
        gw.create_round(round.clone()).await.unwrap();

        let aggregate = gw.load_story_aggregate(story.id).await.unwrap();
        assert_eq!(aggregate.project.id, project.id);
        assert_eq!(aggregate.round.id, round.id);
        assert!(aggregate.clarifications.is_empty());
    }
}
