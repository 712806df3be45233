//! Stage-output parsing helpers: clarification JSON extraction, the
//! completion-marker continuation loop, and the coding-report/test-guide
//! synthesis. All pure functions over already-collected AI text so they
//! are unit-testable without a provider.

use chrono::Utc;

use crate::model::PullRequest;
use crate::prompt::{has_completion_marker, strip_completion_marker};

/// One parsed clarifying-stage question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedQuestion {
    pub question: String,
}

/// Extract the first balanced `[ ... ]` JSON array region from `raw`
/// (tolerating surrounding markdown code fences) and parse it into
/// `{question}` objects. Never fails outward: malformed input yields an
/// empty vector and a logged warning rather than propagating an error.
pub fn parse_clarification_questions(raw: &str) -> Vec<ParsedQuestion> {
    match extract_balanced_array(raw) {
        Some(json) => match serde_json::from_str::<Vec<serde_json::Value>>(&json) {
            Ok(items) => items
                .into_iter()
                .filter_map(|v| v.get("question").and_then(|q| q.as_str()).map(|s| ParsedQuestion { question: s.to_string() }))
                .collect(),
            Err(e) => {
                log::warn!("failed to parse clarification array: {e}");
                Vec::new()
            }
        },
        None => {
            log::warn!("no balanced JSON array found in clarifying response");
            Vec::new()
        }
    }
}

fn extract_balanced_array(raw: &str) -> Option<String> {
    let start = raw.find('[')?;
    let mut depth = 0i32;
    for (offset, ch) in raw[start..].char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(raw[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Maximum continuation requests issued when the completion marker is
/// missing from a planning/designing response.
pub const MAX_CONTINUATIONS: u32 = 3;
/// How much trailing context seeds each continuation request.
pub const CONTINUATION_SEED_CHARS: usize = 500;

/// Build the continuation prompt fed back to the AI when the completion
/// marker wasn't found in the accumulated output.
pub fn continuation_prompt(accumulated: &str) -> String {
    let tail: String = accumulated
        .chars()
        .rev()
        .take(CONTINUATION_SEED_CHARS)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("{tail}\n\ncontinue from the cutoff; do not repeat")
}

/// Drive the "continue until the completion marker appears or we run out
/// of attempts" loop. `complete` is called with the prompt to send next;
/// the first call should be the caller's already-built prompt, subsequent
/// calls receive [`continuation_prompt`] outputs. Returns the
/// marker-stripped, concatenated text regardless of whether the marker
/// was ultimately found: exhausting continuations still succeeds with
/// the text collected so far.
pub async fn collect_with_continuation<F, Fut>(initial_output: String, mut complete: F) -> String
where
    F: FnMut(String) -> Fut,
    Fut: std::future::Future<Output = Result<String, Box<dyn std::error::Error + Send + Sync>>>,
{
    let mut accumulated = initial_output;
    let mut attempts = 0;
    while !has_completion_marker(&accumulated) && !accumulated.is_empty() && attempts < MAX_CONTINUATIONS {
        attempts += 1;
        match complete(continuation_prompt(&accumulated)).await {
            Ok(more) => accumulated.push_str(&more),
            Err(e) => {
                log::warn!("continuation attempt {attempts} failed: {e}");
                break;
            }
        }
    }
    strip_completion_marker(&accumulated)
}

/// One logged tool invocation, truncated for inclusion in the coding
/// report.
pub struct ToolCallLine {
    pub content: String,
}

const TOOL_CALL_TRUNCATE_CHARS: usize = 200;
const TOOL_CALL_REPORT_LIMIT: usize = 20;

/// Render `coding_report.md`: round/branch/PR summary, a recap of the
/// last assistant message, and the last 20 tool-call lines (each
/// truncated to 200 chars). Deterministic given its inputs.
pub fn render_coding_report(
    round_number: u32,
    branch_name: &str,
    pull_requests: &[PullRequest],
    last_assistant_message: &str,
    tool_calls: &[ToolCallLine],
) -> String {
    let mut out = String::new();
    out.push_str("# Coding Report\n\n");
    out.push_str(&format!("- Round: {round_number}\n"));
    out.push_str(&format!("- Branch: `{branch_name}`\n"));
    if pull_requests.is_empty() {
        out.push_str("- Pull requests: none\n");
    } else {
        out.push_str("- Pull requests:\n");
        for pr in pull_requests {
            out.push_str(&format!("  - [#{}]({})\n", pr.number, pr.url));
        }
    }
    out.push_str(&format!("- Generated: {}\n\n", Utc::now().to_rfc3339()));
    out.push_str("## Summary\n\n");
    out.push_str(last_assistant_message.trim());
    out.push_str("\n\n## Tool calls\n\n");
    let recent = tool_calls.iter().rev().take(TOOL_CALL_REPORT_LIMIT).collect::<Vec<_>>();
    if recent.is_empty() {
        out.push_str("(none)\n");
    } else {
        for call in recent.into_iter().rev() {
            let truncated: String = call.content.chars().take(TOOL_CALL_TRUNCATE_CHARS).collect();
            out.push_str(&format!("- {truncated}\n"));
        }
    }
    out
}

/// Render `test_guide.md`: checkout instructions plus the verbatim
/// last-assistant-message changes and a standard verification checklist.
pub fn render_test_guide(branch_name: &str, last_assistant_message: &str) -> String {
    format!(
        "# Test Guide\n\n## Checkout\n\n```\ngit fetch origin {branch_name}\ngit checkout {branch_name}\n```\n\n## Changes\n\n{}\n\n## Verification checklist\n\n- [ ] Build succeeds\n- [ ] Existing tests pass\n- [ ] New behavior covered by a test\n- [ ] No unrelated files changed\n",
        last_assistant_message.trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_clarification_array() {
        let raw = "```json\n[{\"question\":\"scope?\"},{\"question\":\"deadline?\"}]\n```";
        let parsed = parse_clarification_questions(raw);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].question, "scope?");
    }

    #[test]
    fn malformed_json_yields_empty() {
        let parsed = parse_clarification_questions("not json at all");
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn continuation_loop_stops_at_marker() {
        let mut calls = 0;
        let result = collect_with_continuation("partial".to_string(), |_prompt| {
            calls += 1;
            async move { Ok(format!(" rest\n{}", crate::prompt::COMPLETION_MARKER)) }
        })
        .await;
        assert_eq!(calls, 1);
        assert!(!result.contains(crate::prompt::COMPLETION_MARKER));
        assert!(result.contains("partial"));
    }

    #[tokio::test]
    async fn continuation_loop_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result = collect_with_continuation("partial".to_string(), |_prompt| {
            calls += 1;
            async move { Ok(" more".to_string()) }
        })
        .await;
        assert_eq!(calls, MAX_CONTINUATIONS);
        assert!(result.starts_with("partial"));
    }

    #[test]
    fn coding_report_includes_branch_and_prs() {
        let report = render_coding_report(2, "opd/story-x-r2", &[], "did the thing", &[]);
        assert!(report.contains("Round: 2"));
        assert!(report.contains("opd/story-x-r2"));
        assert!(report.contains("did the thing"));
    }
}
