use async_trait::async_trait;

use crate::error::OpdError;
use crate::model::{StoryDoc, StoryStatus};
use crate::providers::ChatMessage;

use super::{Stage, StageContext, StageOutput, TokenSink};

/// Drafts the initial PRD from the story's raw input. No completion
/// marker — PRDs are expected to be short enough not to truncate.
pub struct PreparingStage;

#[async_trait]
impl Stage for PreparingStage {
    fn status(&self) -> StoryStatus {
        StoryStatus::Preparing
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["ai"]
    }

    fn optional_capabilities(&self) -> &'static [&'static str] {
        &["doc"]
    }

    fn preconditions(&self, _ctx: &StageContext) -> Result<(), OpdError> {
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
        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)];

        let text = ai
            .complete_streaming(&messages, on_token, cancel)
            .await
            .map_err(|e| OpdError::Provider(e.to_string()))?;

        Ok(StageOutput {
            docs: vec![(StoryDoc::Prd, text)],
            ..Default::default()
        })
    }

    fn validate_output(&self, output: &StageOutput) -> Result<(), OpdError> {
        if output.docs.iter().any(|(doc, content)| *doc == StoryDoc::Prd && !content.trim().is_empty()) {
            Ok(())
        } else {
            Err(OpdError::validation("preparing stage produced an empty PRD"))
        }
    }
}
