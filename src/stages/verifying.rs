use async_trait::async_trait;

use crate::error::OpdError;
use crate::model::StoryStatus;
use crate::providers::AiEvent;

use super::{Stage, StageContext, StageOutput, TokenSink};

/// Reports CI status and review comments for the user to read before
/// deciding whether to confirm (`Done`), iterate (`Coding`), or restart
/// (`Designing`). Produces no document field — the decision is the
/// user's, made via `ConfirmStage`/`Iterate`/`Restart`.
pub struct VerifyingStage;

#[async_trait]
impl Stage for VerifyingStage {
    fn status(&self) -> StoryStatus {
        StoryStatus::Verifying
    }

    fn required_capabilities(&self) -> &'static [&'static str] {
        &["scm"]
    }

    fn optional_capabilities(&self) -> &'static [&'static str] {
        &["ci", "sandbox"]
    }

    fn preconditions(&self, _ctx: &StageContext) -> Result<(), OpdError> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        on_token: &mut TokenSink,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<StageOutput, OpdError> {
        let scm_cap = ctx
            .capabilities
            .get("scm")
            .await
            .ok_or_else(|| OpdError::Preflight(vec!["scm capability not configured".to_string()]))?;
        let scm = scm_cap
            .provider
            .as_scm()
            .ok_or_else(|| OpdError::Infra("scm capability provider is not a ScmProvider".to_string()))?;

        let mut summary = String::new();

        if let Some(branch) = ctx.branch_name {
            if let Some(ci_cap) = ctx.capabilities.get("ci").await {
                if let Some(ci) = ci_cap.provider.as_ci() {
                    match ci.status_for_branch(&ctx.snapshot.project.repo_url, branch).await {
                        Ok(status) => summary.push_str(&format!("CI: {:?} - {}\n", status.state, status.summary)),
                        Err(e) => log::warn!("verifying stage failed to read ci status: {e}"),
                    }
                }
            }
        }

        for pr in ctx.pull_requests {
            match scm.review_comments(&ctx.snapshot.project.repo_url, pr.number).await {
                Ok(comments) => {
                    for c in comments {
                        summary.push_str(&format!("Review comment on {}: {}\n", c.path, c.body));
                    }
                }
                Err(e) => log::warn!("verifying stage failed to read review comments for PR #{}: {e}", pr.number),
            }
        }

        if summary.is_empty() {
            summary.push_str("No CI status or review comments available.\n");
        }
        on_token(AiEvent::Token(summary));
        on_token(AiEvent::Done { prompt_tokens: 0, completion_tokens: 0 });

        Ok(StageOutput::default())
    }
}
