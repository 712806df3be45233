//! Content-addressed change detection: skip re-running AI on a stage whose
//! input document hasn't changed since the last time it was produced.

use crate::error::OpdError;
use crate::model::{Story, StoryStatus};
use crate::workspace::WorkspaceLayout;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of `content`.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// One row of the stage→input mapping: which Story field holds the input,
/// the doc filename it's persisted under, the hash field that memoizes
/// it, and the output field the stage produces.
pub struct StageInputMapping {
    pub stage: StoryStatus,
    pub input_filename: &'static str,
    pub get_input: fn(&Story) -> &Option<String>,
    pub get_hash: fn(&Story) -> &Option<String>,
    pub set_hash: fn(&mut Story, Option<String>),
    pub get_output: fn(&Story) -> &Option<String>,
}

/// Stage → (input field, filename, hash field, output field). Only the
/// three stages that can be skipped participate — `preparing` and
/// `verifying` have no hash-memoized input.
pub fn stage_input_mapping(stage: StoryStatus) -> Option<StageInputMapping> {
    match stage {
        StoryStatus::Planning => Some(StageInputMapping {
            stage,
            input_filename: "prd.md",
            get_input: |s| &s.confirmed_prd,
            get_hash: |s| &s.planning_input_hash,
            set_hash: |s, v| s.planning_input_hash = v,
            get_output: |s| &s.technical_design,
        }),
        StoryStatus::Designing => Some(StageInputMapping {
            stage,
            input_filename: "technical_design.md",
            get_input: |s| &s.technical_design,
            get_hash: |s| &s.designing_input_hash,
            set_hash: |s, v| s.designing_input_hash = v,
            get_output: |s| &s.detailed_design,
        }),
        StoryStatus::Coding => Some(StageInputMapping {
            stage,
            input_filename: "detailed_design.md",
            get_input: |s| &s.detailed_design,
            get_hash: |s| &s.coding_input_hash,
            set_hash: |s, v| s.coding_input_hash = v,
            get_output: |s| &s.coding_report,
        }),
        _ => None,
    }
}

/// Read the input content for a stage: the doc file wins over the inline
/// DB field, matching `get_stage_input_content`.
pub fn get_stage_input_content(
    layout: &WorkspaceLayout,
    story: &Story,
    stage: StoryStatus,
) -> Option<String> {
    let mapping = stage_input_mapping(stage)?;
    if let Some(content) = layout.read_doc(story, mapping.input_filename).ok().flatten() {
        return Some(content);
    }
    let field = (mapping.get_input)(story).clone()?;
    if field.starts_with("docs/") {
        return None;
    }
    Some(field)
}

/// Resolve the prompt input text for any stage with a document input:
/// `preparing` reads the story's raw feature request, `clarifying`
/// resolves the (possibly file-backed) draft PRD, and
/// `planning`/`designing`/`coding` delegate to [`get_stage_input_content`].
/// Every other stage has no document input.
pub fn resolve_stage_input(
    layout: &WorkspaceLayout,
    story: &Story,
    stage: StoryStatus,
) -> Result<Option<String>, OpdError> {
    match stage {
        StoryStatus::Preparing => Ok(Some(story.raw_input.clone())),
        StoryStatus::Clarifying => layout.resolve_field(&story.prd),
        _ => Ok(get_stage_input_content(layout, story, stage)),
    }
}

/// Compute the current input hash for a stage, or `None` if there's no
/// input content available yet.
pub fn compute_stage_input_hash(
    layout: &WorkspaceLayout,
    story: &Story,
    stage: StoryStatus,
) -> Option<String> {
    get_stage_input_content(layout, story, stage).map(|c| compute_hash(&c))
}

/// True iff the stage already produced output and the current input hash
/// matches the hash stored when that output was generated.
pub fn should_skip_ai(layout: &WorkspaceLayout, story: &Story, stage: StoryStatus) -> bool {
    let Some(mapping) = stage_input_mapping(stage) else {
        return false;
    };
    if (mapping.get_output)(story).is_none() {
        return false;
    }
    let Some(stored_hash) = (mapping.get_hash)(story).clone() else {
        return false;
    };
    match compute_stage_input_hash(layout, story, stage) {
        Some(current) => current == stored_hash,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Project;
    use tempfile::tempdir;

    fn layout_and_story() -> (WorkspaceLayout, tempfile::TempDir, Story, Project) {
        let dir = tempdir().unwrap();
        let project = Project::new("Test", "https://example.test/repo.git");
        let story = Story::new(project.id, "add /login", "Implement POST /login");
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());
        (layout, dir, story, project)
    }

    #[test]
    fn deterministic_and_sensitive_to_content() {
        assert_eq!(compute_hash("hello"), compute_hash("hello"));
        assert_ne!(compute_hash("hello"), compute_hash("world"));
        assert_eq!(compute_hash("test").len(), 64);
    }

    #[test]
    fn falls_back_to_inline_field_when_no_doc_file() {
        let (layout, _dir, mut story, _project) = layout_and_story();
        story.confirmed_prd = Some("inline PRD content".to_string());
        let content = get_stage_input_content(&layout, &story, StoryStatus::Planning);
        assert_eq!(content.as_deref(), Some("inline PRD content"));
    }

    #[test]
    fn path_marker_without_file_yields_none() {
        let (layout, _dir, mut story, _project) = layout_and_story();
        story.confirmed_prd = Some("docs/x/prd.md".to_string());
        assert_eq!(get_stage_input_content(&layout, &story, StoryStatus::Planning), None);
    }

    #[test]
    fn skip_when_output_exists_and_hash_matches() {
        let (layout, _dir, mut story, _project) = layout_and_story();
        story.confirmed_prd = Some("PRD content".to_string());
        story.technical_design = Some("some design".to_string());
        story.planning_input_hash = Some(compute_hash("PRD content"));
        assert!(should_skip_ai(&layout, &story, StoryStatus::Planning));
    }

    #[test]
    fn no_skip_when_hash_differs() {
        let (layout, _dir, mut story, _project) = layout_and_story();
        story.confirmed_prd = Some("new PRD content".to_string());
        story.technical_design = Some("some design".to_string());
        story.planning_input_hash = Some(compute_hash("old PRD"));
        assert!(!should_skip_ai(&layout, &story, StoryStatus::Planning));
    }

    #[test]
    fn no_skip_when_no_output_yet() {
        let (layout, _dir, mut story, _project) = layout_and_story();
        story.confirmed_prd = Some("PRD content".to_string());
        story.planning_input_hash = Some(compute_hash("PRD content"));
        assert!(!should_skip_ai(&layout, &story, StoryStatus::Planning));
    }

    #[test]
    fn no_skip_for_unmapped_stage() {
        let (layout, _dir, story, _project) = layout_and_story();
        assert!(!should_skip_ai(&layout, &story, StoryStatus::Verifying));
    }
}
