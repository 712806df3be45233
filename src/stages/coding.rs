use async_trait::async_trait;

use crate::error::OpdError;
use crate::model::{StoryDoc, StoryStatus};
use crate::providers::{AiEvent, ChatMessage};

use super::parsing::{render_coding_report, render_test_guide, ToolCallLine};
use super::{Stage, StageContext, StageOutput, TokenSink};

/// Implements the detailed design, opens a pull request via the `scm`
/// capability if configured, and synthesizes `coding_report.md` /
/// `test_guide.md` from the collected message stream.
pub struct CodingStage;

#[async_trait]
impl Stage for CodingStage {
    fn status(&self) -> StoryStatus {
        StoryStatus::Coding
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["ai", "scm"]
    }

    fn optional_capabilities(&self) -> &'static [&'static str] {
        &["ci", "sandbox"]
    }

    fn preconditions(&self, ctx: &StageContext) -> Result<(), OpdError> {
        if ctx.stage_input.trim().is_empty() {
            return Err(OpdError::validation("coding stage requires a detailed design"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        on_token: &mut TokenSink,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<StageOutput, OpdError> {
        let ai_cap = ctx
            .capabilities
            .get("ai")
            .await
            .ok_or_else(|| OpdError::Preflight(vec!["ai capability not configured".to_string()]))?;
        let ai = ai_cap
            .provider
            .as_ai()
            .ok_or_else(|| OpdError::Infra("ai capability provider is not an AiProvider".to_string()))?;

        let (system_prompt, user_prompt) = crate::prompt::build_prompt(self.status(), ctx.stage_input, &ctx.snapshot);
        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)];

        let mut tool_calls: Vec<ToolCallLine> = Vec::new();
        let mut wrapped_sink = |event: AiEvent| {
            if let AiEvent::Tool(content) = &event {
                tool_calls.push(ToolCallLine { content: content.clone() });
            }
            on_token(event);
        };

        let assistant_message = ai
            .complete_streaming(&messages, &mut wrapped_sink, cancel)
            .await
            .map_err(|e| OpdError::Provider(e.to_string()))?;

        let branch_name = ctx.branch_name.unwrap_or("unknown-branch");
        let mut new_pull_requests = Vec::new();
        if let Some(scm_cap) = ctx.capabilities.get("scm").await {
            if let Some(scm) = scm_cap.provider.as_scm() {
                let title = format!("{}: {}", ctx.snapshot.story.feature_tag.as_deref().unwrap_or("story"), ctx.snapshot.story.title);
                match scm
                    .open_pull_request(&ctx.snapshot.project.repo_url, branch_name, &title, &assistant_message)
                    .await
                {
                    Ok(pr) => new_pull_requests.push(crate::model::PullRequest {
                        id: uuid::Uuid::new_v4(),
                        round_id: ctx.snapshot.round.id,
                        number: pr.number,
                        url: pr.url,
                        status: crate::model::PrStatus::Open,
                    }),
                    Err(e) => log::warn!("coding stage failed to open pull request: {e}"),
                }
            }
        }

        let mut all_pull_requests: Vec<_> = ctx.pull_requests.to_vec();
        all_pull_requests.extend(new_pull_requests.iter().cloned());
        let coding_report = render_coding_report(
            ctx.snapshot.round.number,
            branch_name,
            &all_pull_requests,
            &assistant_message,
            &tool_calls,
        );
        let test_guide = render_test_guide(branch_name, &assistant_message);

        Ok(StageOutput {
            docs: vec![(StoryDoc::CodingReport, coding_report), (StoryDoc::TestGuide, test_guide)],
            new_clarifications: Vec::new(),
            next_status: Some(StoryStatus::Verifying),
            new_pull_requests,
        })
    }

    fn validate_output(&self, output: &StageOutput) -> Result<(), OpdError> {
        let has = |doc: StoryDoc| output.docs.iter().any(|(d, c)| *d == doc && !c.trim().is_empty());
        if has(StoryDoc::CodingReport) && has(StoryDoc::TestGuide) {
            Ok(())
        } else {
            Err(OpdError::validation("coding stage must produce both coding_report and test_guide"))
        }
    }
}
