//! Domain entities: Project, Story, Round, Clarification, AiMessage,
//! PullRequest, Rule, Skill, and capability configs.
//!
//! These are plain data structs with no persistence behavior attached —
//! the [`PersistenceGateway`](crate::persistence::PersistenceGateway) trait
//! owns reads and writes. Every background task operates on a
//! [`StoryAggregate`], a fully-loaded snapshot, rather than re-entering the
//! gateway mid-flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Workspace clone lifecycle for a [`Project`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Pending,
    Cloning,
    Ready,
    Error,
}

/// One configured code repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub description: String,
    pub tech_stack: String,
    pub architecture: String,
    pub workspace_dir: Option<String>,
    pub workspace_status: WorkspaceStatus,
    pub workspace_error: Option<String>,
    pub rules: Vec<Rule>,
    pub skills: Vec<Skill>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, repo_url: impl Into<String>) -> Self {
        Project {
            id: Uuid::new_v4(),
            name: name.into(),
            repo_url: repo_url.into(),
            description: String::new(),
            tech_stack: String::new(),
            architecture: String::new(),
            workspace_dir: None,
            workspace_status: WorkspaceStatus::Pending,
            workspace_error: None,
            rules: Vec::new(),
            skills: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Rules with `enabled = true`, in declaration order — fed into every
    /// prompt's project block.
    pub fn enabled_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.enabled)
    }
}

/// A named coding/architecture/testing/git/forbidden constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub category: String,
    pub text: String,
    pub enabled: bool,
}

/// When a [`Skill`] is allowed to run automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkillTrigger {
    AutoAfterCoding,
    AutoBeforePr,
    Manual,
}

/// A named command referenced by the coding stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: Uuid,
    pub name: String,
    pub command: String,
    pub trigger: SkillTrigger,
}

/// Story lifecycle status. Ordered left-to-right as the forward pipeline;
/// `Verifying` additionally allows the two controlled back-edges handled
/// by [`crate::state_machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Preparing,
    Clarifying,
    Planning,
    Designing,
    Coding,
    Verifying,
    Done,
}

impl StoryStatus {
    /// 0-based index in the canonical forward order, used by rollback to
    /// check `index(target) < index(current)`.
    pub fn order_index(self) -> u8 {
        match self {
            StoryStatus::Preparing => 0,
            StoryStatus::Clarifying => 1,
            StoryStatus::Planning => 2,
            StoryStatus::Designing => 3,
            StoryStatus::Coding => 4,
            StoryStatus::Verifying => 5,
            StoryStatus::Done => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StoryStatus::Preparing => "preparing",
            StoryStatus::Clarifying => "clarifying",
            StoryStatus::Planning => "planning",
            StoryStatus::Designing => "designing",
            StoryStatus::Coding => "coding",
            StoryStatus::Verifying => "verifying",
            StoryStatus::Done => "done",
        }
    }

    /// The document stages eligible as rollback targets: any status with a
    /// document field, which excludes `Coding`'s successor `Verifying` and
    /// `Done` (neither is ever a rollback target).
    pub fn is_document_stage(self) -> bool {
        matches!(
            self,
            StoryStatus::Preparing
                | StoryStatus::Clarifying
                | StoryStatus::Planning
                | StoryStatus::Designing
        )
    }
}

/// A document field on [`Story`] holds either inline markdown or a
/// `docs/{slug}/{file}` relative path — never both. Stage handlers index
/// through this enum rather than touching field names directly, so a new
/// document type only needs a new match arm here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryDoc {
    Prd,
    ConfirmedPrd,
    TechnicalDesign,
    DetailedDesign,
    CodingReport,
    TestGuide,
}

impl StoryDoc {
    /// Canonical on-disk filename for this document field.
    pub fn filename(self) -> &'static str {
        match self {
            StoryDoc::Prd => "prd.md",
            StoryDoc::ConfirmedPrd => "prd.md",
            StoryDoc::TechnicalDesign => "technical_design.md",
            StoryDoc::DetailedDesign => "detailed_design.md",
            StoryDoc::CodingReport => "coding_report.md",
            StoryDoc::TestGuide => "test_guide.md",
        }
    }

    pub fn get(self, story: &Story) -> &Option<String> {
        match self {
            StoryDoc::Prd => &story.prd,
            StoryDoc::ConfirmedPrd => &story.confirmed_prd,
            StoryDoc::TechnicalDesign => &story.technical_design,
            StoryDoc::DetailedDesign => &story.detailed_design,
            StoryDoc::CodingReport => &story.coding_report,
            StoryDoc::TestGuide => &story.test_guide,
        }
    }

    pub fn set(self, story: &mut Story, value: Option<String>) {
        match self {
            StoryDoc::Prd => story.prd = value,
            StoryDoc::ConfirmedPrd => story.confirmed_prd = value,
            StoryDoc::TechnicalDesign => story.technical_design = value,
            StoryDoc::DetailedDesign => story.detailed_design = value,
            StoryDoc::CodingReport => story.coding_report = value,
            StoryDoc::TestGuide => story.test_guide = value,
        }
    }

    /// All document fields belonging to stages strictly after `status`,
    /// per rollback invariant 5. Hash fields are handled separately by
    /// [`crate::hashing`].
    pub fn fields_after(status: StoryStatus) -> Vec<StoryDoc> {
        let all = [
            (StoryStatus::Preparing, StoryDoc::Prd),
            (StoryStatus::Clarifying, StoryDoc::ConfirmedPrd),
            (StoryStatus::Planning, StoryDoc::TechnicalDesign),
            (StoryStatus::Designing, StoryDoc::DetailedDesign),
            (StoryStatus::Coding, StoryDoc::CodingReport),
            (StoryStatus::Coding, StoryDoc::TestGuide),
        ];
        all.iter()
            .filter(|(owner, _)| owner.order_index() > status.order_index())
            .map(|(_, doc)| *doc)
            .collect()
    }
}

/// One feature request in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub feature_tag: Option<String>,
    pub raw_input: String,
    pub status: StoryStatus,
    pub current_round: u32,

    pub prd: Option<String>,
    pub confirmed_prd: Option<String>,
    pub technical_design: Option<String>,
    pub detailed_design: Option<String>,
    pub coding_report: Option<String>,
    pub test_guide: Option<String>,

    pub planning_input_hash: Option<String>,
    pub designing_input_hash: Option<String>,
    pub coding_input_hash: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Story {
    pub fn new(project_id: Uuid, title: impl Into<String>, raw_input: impl Into<String>) -> Self {
        Story {
            id: Uuid::new_v4(),
            project_id,
            title: title.into(),
            feature_tag: None,
            raw_input: raw_input.into(),
            status: StoryStatus::Preparing,
            current_round: 1,
            prd: None,
            confirmed_prd: None,
            technical_design: None,
            detailed_design: None,
            coding_report: None,
            test_guide: None,
            planning_input_hash: None,
            designing_input_hash: None,
            coding_input_hash: None,
            created_at: Utc::now(),
        }
    }

    /// Clear every document and hash field belonging to stages strictly
    /// after `target`, per rollback invariant 5.
    pub fn clear_docs_after(&mut self, target: StoryStatus) {
        for doc in StoryDoc::fields_after(target) {
            doc.set(self, None);
        }
        if target.order_index() < StoryStatus::Planning.order_index() {
            self.planning_input_hash = None;
        }
        if target.order_index() < StoryStatus::Designing.order_index() {
            self.designing_input_hash = None;
        }
        if target.order_index() < StoryStatus::Coding.order_index() {
            self.coding_input_hash = None;
        }
    }
}

/// Round attempt type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundType {
    Initial,
    Iterate,
    Restart,
}

/// Round lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Active,
    Closed,
}

/// One attempt at driving a story to merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    pub id: Uuid,
    pub story_id: Uuid,
    pub number: u32,
    pub round_type: RoundType,
    pub status: RoundStatus,
    pub branch_name: Option<String>,
    pub close_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Round {
    pub fn initial(story_id: Uuid) -> Self {
        Round {
            id: Uuid::new_v4(),
            story_id,
            number: 1,
            round_type: RoundType::Initial,
            status: RoundStatus::Active,
            branch_name: None,
            close_reason: None,
            created_at: Utc::now(),
        }
    }
}

/// A Q/A pair attached to a Story by the clarifying stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub id: Uuid,
    pub story_id: Uuid,
    pub question: String,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only log entry role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    Assistant,
    Tool,
    User,
}

/// Append-only AI interaction log entry in a Round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiMessage {
    pub id: Uuid,
    pub round_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Tracked remote PR status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Open,
    Closed,
    Merged,
}

/// A tracked remote pull request, owned by a Round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: Uuid,
    pub round_id: Uuid,
    pub number: u64,
    pub url: String,
    pub status: PrStatus,
}

/// One row per capability name, holding the chosen provider and its
/// opaque config map. Password fields within `config` are masked on
/// serialization via [`crate::secret::Secret`] at the registry boundary,
/// not here — this struct is the storage shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityConfig {
    pub category: String,
    pub provider: String,
    pub config: HashMap<String, serde_json::Value>,
}

/// A project-scoped override shadowing a [`CapabilityConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectCapabilityOverride {
    pub project_id: Uuid,
    pub category: String,
    pub enabled: bool,
    pub provider_override: Option<String>,
    pub config_override: HashMap<String, serde_json::Value>,
}

/// A fully-loaded read of everything a background task needs, gathered in
/// one persistence call so handlers never re-enter the gateway mid-flight.
#[derive(Debug, Clone)]
pub struct StoryAggregate {
    pub story: Story,
    pub project: Project,
    pub round: Round,
    pub clarifications: Vec<Clarification>,
    pub pull_requests: Vec<PullRequest>,
}
