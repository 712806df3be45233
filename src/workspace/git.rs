//! Typed `git` façade: explicit timeouts, proxy-env injection only on
//! network-touching subcommands, and stderr captured into the returned
//! error.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::process::Command;

use crate::error::OpdError;

/// Environment variables recognized for HTTPS proxying, checked in this
/// order before falling back to the macOS `networksetup` probe.
const PROXY_VARS: &[&str] = &["https_proxy", "HTTPS_PROXY", "ALL_PROXY", "all_proxy"];

/// Detect a system HTTPS proxy for subprocess env. Checks environment
/// variables first (if already set, the subprocess inherits them and we
/// return an empty override map); falls back to macOS's `networksetup`.
pub async fn detect_proxy_env() -> HashMap<String, String> {
    for var in PROXY_VARS {
        if std::env::var(var).is_ok() {
            return HashMap::new();
        }
    }

    let output = Command::new("networksetup")
        .args(["-getwebproxy", "Wi-Fi"])
        .output();
    match tokio::time::timeout(Duration::from_secs(3), output).await {
        Ok(Ok(out)) if out.status.success() => {
            let text = String::from_utf8_lossy(&out.stdout);
            let mut fields: HashMap<&str, &str> = HashMap::new();
            for line in text.lines() {
                if let Some((k, v)) = line.split_once(':') {
                    fields.insert(k.trim(), v.trim());
                }
            }
            if fields.get("Enabled") == Some(&"Yes") {
                if let (Some(server), Some(port)) = (fields.get("Server"), fields.get("Port")) {
                    if !server.is_empty() && !port.is_empty() {
                        let proxy = format!("http://{server}:{port}");
                        let mut env = HashMap::new();
                        env.insert("https_proxy".to_string(), proxy.clone());
                        env.insert("http_proxy".to_string(), proxy);
                        return env;
                    }
                }
            }
            HashMap::new()
        }
        _ => HashMap::new(),
    }
}

/// Inject `x-access-token` basic-auth credentials into an HTTPS git URL.
pub fn inject_token(repo_url: &str, token: Option<&str>) -> String {
    match token {
        Some(t) if repo_url.starts_with("https://") => {
            repo_url.replacen("https://", &format!("https://x-access-token:{t}@"), 1)
        }
        _ => repo_url.to_string(),
    }
}

/// Run a git subcommand, optionally injecting proxy env (network-touching
/// commands only), with an explicit timeout. Returns stdout on success;
/// stderr is captured into the `Infra` error on failure or timeout.
pub async fn run_git(
    cwd: &Path,
    args: &[&str],
    timeout: Duration,
    network: bool,
) -> Result<String, OpdError> {
    let mut cmd = Command::new("git");
    cmd.arg("-c").arg("http.version=HTTP/1.1");
    cmd.args(args);
    cmd.current_dir(cwd);
    if network {
        for (k, v) in detect_proxy_env().await {
            cmd.env(k, v);
        }
    }

    let child = cmd
        .output();
    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| OpdError::Infra(format!("git {:?} timed out after {:?}", args, timeout)))?
        .map_err(|e| OpdError::Infra(format!("failed to spawn git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(OpdError::Infra(format!("git {:?} failed: {stderr}", args)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Non-fatal variant of [`run_git`] — logs and swallows failures, used for
/// best-effort steps like "pull before checkout" or "delete remote branch".
pub async fn run_git_best_effort(cwd: &Path, args: &[&str], timeout: Duration, network: bool) {
    if let Err(e) = run_git(cwd, args, timeout, network).await {
        log::warn!("non-fatal git {:?} failed: {}", args, e);
    }
}

/// Branch name for a coding round: `opd/story-{id}-r{n}`.
pub fn branch_name(story_id: uuid::Uuid, round_number: u32) -> String {
    format!("opd/story-{story_id}-r{round_number}")
}
