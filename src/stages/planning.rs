use async_trait::async_trait;

use crate::error::OpdError;
use crate::model::{StoryDoc, StoryStatus};
use crate::providers::ChatMessage;

use super::parsing::collect_with_continuation;
use super::{Stage, StageContext, StageOutput, TokenSink};

/// Writes the technical design from the confirmed PRD. Uses the
/// completion-marker continuation loop since technical designs can run
/// long enough to hit a provider's output cap.
pub struct PlanningStage;

#[async_trait]
impl Stage for PlanningStage {
    fn status(&self) -> StoryStatus {
        StoryStatus::Planning
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["ai", "scm"]
    }

    fn preconditions(&self, ctx: &StageContext) -> Result<(), OpdError> {
        if ctx.stage_input.trim().is_empty() {
            return Err(OpdError::validation("planning stage requires a confirmed prd"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        on_token: &mut TokenSink,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<StageOutput, OpdError> {
        let cap = ctx
            .capabilities
            .get("ai")
            .await
            .ok_or_else(|| OpdError::Preflight(vec!["ai capability not configured".to_string()]))?;
        let ai = cap
            .provider
            .as_ai()
            .ok_or_else(|| OpdError::Infra("ai capability provider is not an AiProvider".to_string()))?;

        let (system_prompt, user_prompt) = crate::prompt::build_prompt(self.status(), ctx.stage_input, &ctx.snapshot);
        let messages = vec![ChatMessage::system(system_prompt.clone()), ChatMessage::user(user_prompt)];

        let initial = ai
            .complete_streaming(&messages, on_token, cancel)
            .await
            .map_err(|e| OpdError::Provider(e.to_string()))?;

        let final_text = collect_with_continuation(initial, |continuation_prompt| {
            let ai = ai.clone();
            let system_prompt = system_prompt.clone();
            async move {
                let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(continuation_prompt)];
                ai.complete(&messages, cancel).await
            }
        })
        .await;

        Ok(StageOutput {
            docs: vec![(StoryDoc::TechnicalDesign, final_text)],
            ..Default::default()
        })
    }

    fn validate_output(&self, output: &StageOutput) -> Result<(), OpdError> {
        if output
            .docs
            .iter()
            .any(|(doc, content)| *doc == StoryDoc::TechnicalDesign && !content.trim().is_empty())
        {
            Ok(())
        } else {
            Err(OpdError::validation("planning stage produced an empty technical design"))
        }
    }
}
