//! Process-level configuration.
//!
//! Intentionally minimal: a plain struct constructed however the embedder
//! likes, with an `OpdConfig::from_env` convenience that reads a handful
//! of environment variables. No TOML/YAML parsing dependency is
//! introduced.

use std::path::PathBuf;
use std::time::Duration;

/// Global engine configuration.
pub struct OpdConfig {
    /// Root directory new project workspaces are cloned under when a
    /// project doesn't specify its own `workspace_dir`.
    pub default_workspace_root: PathBuf,

    /// Delay before a stage background task begins its work, letting the
    /// triggering transaction commit first.
    pub stage_task_delay: Duration,
    /// Same, for chat-refinement tasks (shorter — chat is interactive).
    pub chat_task_delay: Duration,

    /// SSE heartbeat interval for idle stream connections.
    pub sse_heartbeat_interval: Duration,

    /// Shared secret used to verify inbound CI/SCM webhook signatures.
    /// `None` disables signature verification (development only).
    pub webhook_secret: Option<String>,

    /// Bind address for the optional HTTP surface (`http-server` feature).
    pub http_bind_addr: String,
}

impl Default for OpdConfig {
    fn default() -> Self {
        OpdConfig {
            default_workspace_root: PathBuf::from("workspaces"),
            stage_task_delay: Duration::from_millis(300),
            chat_task_delay: Duration::from_millis(200),
            sse_heartbeat_interval: Duration::from_secs(crate::sse::HEARTBEAT_INTERVAL_SECS),
            webhook_secret: None,
            http_bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl OpdConfig {
    /// Seed from environment variables, falling back to [`Default`] for
    /// anything unset or unparsable. Variable names:
    /// `OPD_WORKSPACE_ROOT`, `OPD_HTTP_BIND_ADDR`, `GITHUB_WEBHOOK_SECRET`.
    pub fn from_env() -> Self {
        let mut config = OpdConfig::default();
        if let Ok(root) = std::env::var("OPD_WORKSPACE_ROOT") {
            config.default_workspace_root = PathBuf::from(root);
        }
        if let Ok(addr) = std::env::var("OPD_HTTP_BIND_ADDR") {
            config.http_bind_addr = addr;
        }
        if let Ok(secret) = std::env::var("GITHUB_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook_secret = Some(secret);
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_no_webhook_secret() {
        let config = OpdConfig::default();
        assert!(config.webhook_secret.is_none());
    }
}
