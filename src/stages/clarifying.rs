use async_trait::async_trait;
use uuid::Uuid;

use crate::error::OpdError;
use crate::model::{Clarification, StoryStatus};
use crate::providers::ChatMessage;

use super::parsing::parse_clarification_questions;
use super::{Stage, StageContext, StageOutput, TokenSink};

/// Asks the AI for open questions about the confirmed PRD. Produces zero
/// or more [`Clarification`] rows rather than a document field.
pub struct ClarifyingStage;

#[async_trait]
impl Stage for ClarifyingStage {
    fn status(&self) -> StoryStatus {
        StoryStatus::Clarifying
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["ai"]
    }

    fn optional_capabilities(&self) -> &'static [&'static str] {
        &["scm"]
    }

    fn preconditions(&self, ctx: &StageContext) -> Result<(), OpdError> {
        if ctx.stage_input.trim().is_empty() {
            return Err(OpdError::validation("clarifying stage requires a non-empty prd"));
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
        let messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(user_prompt)];

        let text = ai
            .complete_streaming(&messages, on_token, cancel)
            .await
            .map_err(|e| OpdError::Provider(e.to_string()))?;

        let story_id = ctx.snapshot.story.id;
        let new_clarifications = parse_clarification_questions(&text)
            .into_iter()
            .map(|q| Clarification {
                id: Uuid::new_v4(),
                story_id,
                question: q.question,
                answer: None,
                created_at: chrono::Utc::now(),
            })
            .collect();

        Ok(StageOutput { new_clarifications, ..Default::default() })
    }
}
