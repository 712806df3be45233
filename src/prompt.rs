//! Prompt assembly and reply parsing: the only parts of the engine that
//! touch raw AI text. Pure functions — no I/O, no provider calls — so
//! stage handlers stay testable against canned strings.

use crate::model::{AiMessage, Clarification, MessageRole, Project, Round, Story, StoryStatus};

/// Literal marker appended to planning/designing completions so truncated
/// AI output can be detected and a continuation requested.
pub const COMPLETION_MARKER: &str = "<!-- DOCUMENT_COMPLETE -->";

/// Chat-discussion truncation bounds. A heuristic, not a contract — see
/// `parse_refine_response`.
pub const CHAT_SUMMARY_MAX_CHARS: usize = 300;
pub const CHAT_SUMMARY_MAX_SENTENCES: usize = 3;

/// One ordered implementation task, surfaced to the coding/verifying
/// prompts from the technical/detailed design documents.
#[derive(Debug, Clone)]
pub struct TaskItem {
    pub description: String,
    pub depends_on: Vec<String>,
}

/// Immutable input to [`build_prompt`]: everything a stage or chat turn
/// might reference, gathered once by the executor's "load context" step.
pub struct PromptSnapshot<'a> {
    pub project: &'a Project,
    pub story: &'a Story,
    pub round: &'a Round,
    pub clarifications: &'a [Clarification],
    pub tasks: &'a [TaskItem],
    pub history: &'a [AiMessage],
    pub source_context: Option<&'a str>,
    /// Present only for chat turns: the message the user just sent.
    pub triggering_message: Option<&'a str>,
}

fn role_preamble(stage: StoryStatus) -> &'static str {
    match stage {
        StoryStatus::Preparing => {
            "You are a product analyst turning a raw feature request into a PRD."
        }
        StoryStatus::Clarifying => {
            "You are a product analyst resolving open questions before a PRD is confirmed."
        }
        StoryStatus::Planning => "You are a software architect writing a technical design.",
        StoryStatus::Designing => "You are a software architect writing a detailed design.",
        StoryStatus::Coding => "You are a senior engineer implementing a detailed design.",
        StoryStatus::Verifying => "You are a senior engineer reviewing CI results and review comments.",
        StoryStatus::Done => "You are a senior engineer summarizing a completed change.",
    }
}

fn project_block(project: &Project) -> String {
    format!(
        "Project: {}\nDescription: {}\nTech stack: {}\nArchitecture: {}",
        project.name, project.description, project.tech_stack, project.architecture
    )
}

fn rules_block(project: &Project) -> String {
    let rules: Vec<String> = project
        .enabled_rules()
        .map(|r| format!("- [{}] {}", r.category, r.text))
        .collect();
    if rules.is_empty() {
        "No project rules configured.".to_string()
    } else {
        format!("Project rules:\n{}", rules.join("\n"))
    }
}

/// Stages whose document output must end with [`COMPLETION_MARKER`] so
/// truncated output can be detected and continued.
fn requires_completion_marker(stage: StoryStatus) -> bool {
    matches!(stage, StoryStatus::Planning | StoryStatus::Designing)
}

fn build_system_prompt(stage: StoryStatus, snapshot: &PromptSnapshot) -> String {
    let mut parts = vec![
        role_preamble(stage).to_string(),
        project_block(snapshot.project),
        rules_block(snapshot.project),
    ];
    if requires_completion_marker(stage) {
        parts.push(format!(
            "After emitting the full document, output `{COMPLETION_MARKER}` on its own line."
        ));
    }
    parts.join("\n\n")
}

fn clarifications_block(clarifications: &[Clarification]) -> Option<String> {
    if clarifications.is_empty() {
        return None;
    }
    let lines: Vec<String> = clarifications
        .iter()
        .map(|c| match &c.answer {
            Some(a) => format!("Q: {}\nA: {}", c.question, a),
            None => format!("Q: {}\nA: (unanswered)", c.question),
        })
        .collect();
    Some(format!("Clarifications:\n{}", lines.join("\n\n")))
}

fn tasks_block(tasks: &[TaskItem]) -> Option<String> {
    if tasks.is_empty() {
        return None;
    }
    let lines: Vec<String> = tasks
        .iter()
        .map(|t| {
            if t.depends_on.is_empty() {
                format!("- {}", t.description)
            } else {
                format!("- {} (depends on: {})", t.description, t.depends_on.join(", "))
            }
        })
        .collect();
    Some(format!("Tasks:\n{}", lines.join("\n")))
}

fn history_block(history: &[AiMessage]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let lines: Vec<String> = history
        .iter()
        .map(|m| {
            let role = match m.role {
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
                MessageRole::User => "user",
            };
            format!("[{role}] {}", m.content)
        })
        .collect();
    Some(format!("Conversation history:\n{}", lines.join("\n")))
}

const CHAT_FORMAT_INSTRUCTION: &str = "Reply with either `<discussion>...</discussion>` alone, or `<discussion>...</discussion><updated_doc>...</updated_doc>` where `<updated_doc>` holds the full (not incremental) replacement document content.";

/// Build `(system_prompt, user_prompt)` for a stage. `stage_input` is the
/// resolved input document content (file content if the field pointed at
/// `docs/...`, inline text otherwise — resolution itself lives in
/// [`crate::hashing::resolve_stage_input`], kept out of this pure
/// function).
pub fn build_prompt(stage: StoryStatus, stage_input: &str, snapshot: &PromptSnapshot) -> (String, String) {
    let system_prompt = build_system_prompt(stage, snapshot);

    let mut user_parts = vec![stage_input.to_string()];
    if let Some(block) = clarifications_block(snapshot.clarifications) {
        user_parts.push(block);
    }
    if let Some(block) = tasks_block(snapshot.tasks) {
        user_parts.push(block);
    }
    if let Some(ctx) = snapshot.source_context {
        user_parts.push(format!("Repository context:\n{ctx}"));
    }
    if let Some(block) = history_block(snapshot.history) {
        user_parts.push(block);
    }
    if let Some(msg) = snapshot.triggering_message {
        user_parts.push(msg.to_string());
    }
    (system_prompt, user_parts.join("\n\n---\n\n"))
}

/// Build the `(system_prompt, user_prompt)` pair for a chat-refinement
/// turn against `stage`'s current document. Identical to `build_prompt`
/// except it appends the structured-envelope instruction the parser below
/// expects back.
pub fn build_chat_prompt(stage: StoryStatus, current_doc: &str, snapshot: &PromptSnapshot) -> (String, String) {
    let (system_prompt, user_prompt) = build_prompt(stage, current_doc, snapshot);
    (format!("{system_prompt}\n\n{CHAT_FORMAT_INSTRUCTION}"), user_prompt)
}

/// Truncate `text` to the first `CHAT_SUMMARY_MAX_SENTENCES` sentences,
/// then to `CHAT_SUMMARY_MAX_CHARS` chars, whichever is shorter.
fn truncate_discussion(text: &str) -> String {
    let mut sentence_end_positions = text.match_indices(['.', '!', '?']).map(|(i, _)| i + 1);
    let cut = sentence_end_positions.nth(CHAT_SUMMARY_MAX_SENTENCES - 1).unwrap_or(text.len());
    let by_sentence = &text[..cut.min(text.len())];
    if by_sentence.chars().count() > CHAT_SUMMARY_MAX_CHARS {
        by_sentence.chars().take(CHAT_SUMMARY_MAX_CHARS).collect()
    } else {
        by_sentence.to_string()
    }
}

fn extract_tag<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

fn strip_tag_blocks(text: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = String::new();
    let mut rest = text;
    loop {
        match rest.find(&open) {
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find(&close) {
                    Some(end_rel) => rest = &rest[start + end_rel + close.len()..],
                    None => {
                        rest = "";
                        break;
                    }
                }
            }
            None => {
                out.push_str(rest);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Parse a chat-refinement reply into `(discussion, updated_doc)`.
///
/// Extracts `<discussion>`; if absent, strips any `<updated_doc>` /
/// legacy `<updated_prd>` blocks and truncates the remainder. Extracts
/// `<updated_doc>`, falling back to the legacy `<updated_prd>` tag. Both
/// results are trimmed.
pub fn parse_refine_response(raw: &str) -> (String, Option<String>) {
    let discussion = match extract_tag(raw, "discussion") {
        Some(d) => d.trim().to_string(),
        None => {
            let stripped = strip_tag_blocks(&strip_tag_blocks(raw, "updated_doc"), "updated_prd");
            truncate_discussion(stripped.trim())
        }
    };
    let updated_doc = extract_tag(raw, "updated_doc")
        .or_else(|| extract_tag(raw, "updated_prd"))
        .map(|d| d.trim().to_string());
    (discussion, updated_doc)
}

/// Strip a trailing completion marker line (and any surrounding
/// whitespace it introduced) so `StripCompletionMarker(output + "\n" +
/// MARKER) == output` holds.
pub fn strip_completion_marker(text: &str) -> String {
    text.strip_suffix(COMPLETION_MARKER)
        .map(|s| s.trim_end_matches('\n').to_string())
        .unwrap_or_else(|| text.to_string())
}

pub fn has_completion_marker(text: &str) -> bool {
    text.trim_end().ends_with(COMPLETION_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_discussion_and_updated_doc() {
        let raw = "<discussion>ok</discussion><updated_doc># PRD v2</updated_doc>";
        let (discussion, doc) = parse_refine_response(raw);
        assert_eq!(discussion, "ok");
        assert_eq!(doc.as_deref(), Some("# PRD v2"));
    }

    #[test]
    fn accepts_legacy_updated_prd_tag() {
        let raw = "<discussion>fixed</discussion><updated_prd>body</updated_prd>";
        let (_, doc) = parse_refine_response(raw);
        assert_eq!(doc.as_deref(), Some("body"));
    }

    #[test]
    fn no_tags_treats_whole_text_as_discussion() {
        let raw = "Sure, I can help with that.";
        let (discussion, doc) = parse_refine_response(raw);
        assert_eq!(discussion, "Sure, I can help with that.");
        assert!(doc.is_none());
    }

    #[test]
    fn untagged_reply_strips_and_truncates() {
        let long_sentence = "word ".repeat(200);
        let raw = format!("{long_sentence}<updated_doc>hidden</updated_doc>");
        let (discussion, doc) = parse_refine_response(&raw);
        assert!(doc.is_none());
        assert!(discussion.chars().count() <= CHAT_SUMMARY_MAX_CHARS);
        assert!(!discussion.contains("hidden"));
    }

    #[test]
    fn completion_marker_round_trips() {
        let body = "the full document body";
        let with_marker = format!("{body}\n{COMPLETION_MARKER}");
        assert_eq!(strip_completion_marker(&with_marker), body);
        assert!(has_completion_marker(&with_marker));
    }

    #[test]
    fn build_prompt_includes_completion_marker_only_for_doc_stages() {
        let project = Project::new("Demo", "https://example.test/repo.git");
        let story = Story::new(project.id, "t", "raw");
        let round = Round::initial(story.id);
        let snapshot = PromptSnapshot {
            project: &project,
            story: &story,
            round: &round,
            clarifications: &[],
            tasks: &[],
            history: &[],
            source_context: None,
            triggering_message: None,
        };
        let (planning_sys, _) = build_prompt(StoryStatus::Planning, "prd body", &snapshot);
        assert!(planning_sys.contains(COMPLETION_MARKER));
        let (coding_sys, _) = build_prompt(StoryStatus::Coding, "design body", &snapshot);
        assert!(!coding_sys.contains(COMPLETION_MARKER));
    }
}
