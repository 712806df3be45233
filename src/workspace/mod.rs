//! Per-project workspace directory, per-story document layout, and git
//! branch lifecycle.

pub mod git;

use crate::error::OpdError;
use crate::model::{Project, Story};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use unicode_normalization::UnicodeNormalization;

const CLONE_TIMEOUT: Duration = Duration::from_secs(120);
const PULL_TIMEOUT: Duration = Duration::from_secs(60);

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s-]").unwrap());
static WHITESPACE_OR_UNDERSCORE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\s_]+").unwrap());

/// Sanitize a string for use as a directory name: Unicode-NFKD normalize,
/// lowercase, drop non-alphanumeric (keeping spaces and hyphens), collapse
/// whitespace/underscores to `-`, trim, cap at 80 chars.
pub fn sanitize(name: &str) -> String {
    let normalized: String = name.nfkd().collect();
    let lowered = normalized.to_lowercase();
    let stripped = NON_WORD.replace_all(&lowered, "");
    let collapsed = WHITESPACE_OR_UNDERSCORE.replace_all(&stripped, "-");
    let trimmed = collapsed.trim_matches('-');
    trimmed.chars().take(80).collect()
}

/// `{id}-{sanitized title}`, or just `{id}` if the title sanitizes to
/// nothing.
pub fn story_slug(story: &Story) -> String {
    let title = sanitize(&story.title);
    if title.is_empty() {
        story.id.to_string()
    } else {
        format!("{}-{}", story.id, title)
    }
}

fn validate_filename(filename: &str) -> Result<(), OpdError> {
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return Err(OpdError::validation(format!("invalid filename: {filename}")));
    }
    Ok(())
}

/// Resolves a project's workspace root: `{workspace_dir or default}/{sanitized project name}`.
pub fn resolve_work_dir(default_root: &Path, project: &Project) -> PathBuf {
    let base = project
        .workspace_dir
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| default_root.to_path_buf());
    let name = {
        let s = sanitize(&project.name);
        if s.is_empty() {
            "project".to_string()
        } else {
            s
        }
    };
    base.join(name)
}

/// The resolved document-I/O and git surface for a single project's
/// workspace directory. Constructed once per background task via
/// `resolve_work_dir`, then reused for doc reads/writes and branch ops.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    root: PathBuf,
}

impl WorkspaceLayout {
    pub fn new(root: PathBuf) -> Self {
        WorkspaceLayout { root }
    }

    pub fn for_project(default_root: &Path, project: &Project) -> Self {
        WorkspaceLayout::new(resolve_work_dir(default_root, project))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn docs_dir(&self, story: &Story) -> PathBuf {
        self.root.join("docs").join(story_slug(story))
    }

    /// `docs/{slug}/{filename}` — the value persisted in the Story's doc field.
    pub fn doc_relpath(&self, story: &Story, filename: &str) -> String {
        format!("docs/{}/{}", story_slug(story), filename)
    }

    pub fn write_doc(&self, story: &Story, filename: &str, content: &str) -> Result<String, OpdError> {
        validate_filename(filename)?;
        let dir = self.docs_dir(story);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(filename), content)?;
        log::debug!("wrote doc {filename} for story {}", story.id);
        Ok(self.doc_relpath(story, filename))
    }

    pub fn read_doc(&self, story: &Story, filename: &str) -> Result<Option<String>, OpdError> {
        validate_filename(filename)?;
        let path = self.docs_dir(story).join(filename);
        if path.is_file() {
            Ok(Some(std::fs::read_to_string(path)?))
        } else {
            Ok(None)
        }
    }

    pub fn list_docs(&self, story: &Story) -> Result<Vec<String>, OpdError> {
        let dir = self.docs_dir(story);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn delete_doc(&self, story: &Story, filename: &str) -> Result<(), OpdError> {
        validate_filename(filename)?;
        let path = self.docs_dir(story).join(filename);
        if path.is_file() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Resolve a document field: if it starts with `docs/`, read the
    /// filesystem (the filesystem is authoritative); otherwise treat it as
    /// inline content.
    pub fn resolve_field(&self, field: &Option<String>) -> Result<Option<String>, OpdError> {
        match field {
            Some(v) if v.starts_with("docs/") => {
                let rel = v.strip_prefix("docs/").unwrap_or(v);
                let path = self.root.join("docs").join(rel);
                if path.is_file() {
                    Ok(Some(std::fs::read_to_string(path)?))
                } else {
                    Ok(None)
                }
            }
            Some(v) => Ok(Some(v.clone())),
            None => Ok(None),
        }
    }

    /// Clone (or fast-forward pull) the repo into this workspace,
    /// publishing `workspace` progress events via `publish`.
    pub async fn clone_workspace<F, Fut>(
        &self,
        repo_url: &str,
        token: Option<&str>,
        publish: F,
    ) -> Result<(), OpdError>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        if self.root.join(".git").exists() {
            log::info!("workspace already cloned at {:?}, pulling latest", self.root);
            git::run_git(&self.root, &["pull", "--ff-only"], PULL_TIMEOUT, true).await?;
            publish("Workspace updated (git pull)".to_string()).await;
            return Ok(());
        }

        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        publish(format!("Cloning {repo_url}...")).await;

        let auth_url = git::inject_token(repo_url, token);
        let root_str = self.root.to_string_lossy().to_string();
        git::run_git(
            self.root.parent().unwrap_or(Path::new(".")),
            &["clone", &auth_url, &root_str],
            CLONE_TIMEOUT,
            true,
        )
        .await?;
        publish("Clone complete".to_string()).await;
        Ok(())
    }

    /// Create a coding-round branch: checkout main, best-effort pull,
    /// `checkout -b <name>`, push `-u origin`.
    pub async fn create_coding_branch(&self, branch: &str) -> Result<(), OpdError> {
        git::run_git_best_effort(&self.root, &["checkout", "main"], PULL_TIMEOUT, false).await;
        git::run_git_best_effort(&self.root, &["pull", "--ff-only"], PULL_TIMEOUT, true).await;
        git::run_git(&self.root, &["checkout", "-b", branch], PULL_TIMEOUT, false).await?;
        git::run_git(&self.root, &["push", "-u", "origin", branch], PULL_TIMEOUT, true).await?;
        Ok(())
    }

    /// Discard a coding-round branch: switch to main, delete local and
    /// remote branch (both best-effort).
    pub async fn discard_branch(&self, branch: &str) {
        git::run_git_best_effort(&self.root, &["checkout", "main"], PULL_TIMEOUT, false).await;
        git::run_git_best_effort(&self.root, &["branch", "-D", branch], PULL_TIMEOUT, false).await;
        git::run_git_best_effort(
            &self.root,
            &["push", "origin", "--delete", branch],
            PULL_TIMEOUT,
            true,
        )
        .await;
    }

    /// Bounded directory-tree walk producing a textual project snapshot
    /// for AI context, used by the coding stage's prompt builder.
    pub fn scan_source(&self) -> String {
        scan_source_tree(&self.root)
    }
}

const SKIP_DIRS: &[&str] = &[".git", "node_modules", "__pycache__", "target", ".venv", "venv", "dist", "build"];
const KEY_FILES: &[&str] = &[
    "README.md",
    "pyproject.toml",
    "package.json",
    "go.mod",
    "Cargo.toml",
    "Makefile",
    "Dockerfile",
    "docker-compose.yml",
    "CLAUDE.md",
];
const CODE_EXTS: &[&str] = &["rs", "py", "ts", "tsx", "js", "jsx", "go", "rb", "java"];
const MAX_DEPTH: usize = 3;
const SNIPPET_LINES_KEY: usize = 30;
const SNIPPET_LINES_EXTRA: usize = 15;
const TOTAL_CHAR_CAP: usize = 8_000;

fn snippet(path: &Path, max_lines: usize) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let truncated: String = content.lines().take(max_lines).collect::<Vec<_>>().join("\n");
    Some(truncated)
}

fn scan_source_tree(root: &Path) -> String {
    let mut out = String::new();
    let skip: HashSet<&str> = SKIP_DIRS.iter().copied().collect();

    // Key files anywhere within the depth cap.
    walk(root, root, 0, &skip, &mut out);

    if out.len() > TOTAL_CHAR_CAP {
        out.truncate(TOTAL_CHAR_CAP);
    }
    out
}

fn walk(root: &Path, dir: &Path, depth: usize, skip: &HashSet<&str>, out: &mut String) {
    if depth > MAX_DEPTH || out.len() > TOTAL_CHAR_CAP {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if path.is_dir() {
            if skip.contains(name.as_str()) {
                continue;
            }
            walk(root, &path, depth + 1, skip, out);
        } else if path.is_file() {
            let is_key = KEY_FILES.contains(&name.as_str());
            let is_top_level_code = depth == 0
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| CODE_EXTS.contains(&e))
                    .unwrap_or(false);
            if !is_key && !is_top_level_code {
                continue;
            }
            let max_lines = if is_key { SNIPPET_LINES_KEY } else { SNIPPET_LINES_EXTRA };
            if let Some(text) = snippet(&path, max_lines) {
                let rel = path.strip_prefix(root).unwrap_or(&path).to_string_lossy();
                out.push_str(&format!("--- {rel} ---\n{text}\n\n"));
            }
            if out.len() > TOTAL_CHAR_CAP {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Project;
    use tempfile::tempdir;

    #[test]
    fn sanitize_lowercases_and_hyphenates() {
        assert_eq!(sanitize("My Cool Project!"), "my-cool-project");
        assert_eq!(sanitize("  spaced_out  "), "spaced-out");
    }

    #[test]
    fn sanitize_caps_at_80_chars() {
        let long = "a".repeat(200);
        assert_eq!(sanitize(&long).len(), 80);
    }

    #[test]
    fn write_then_read_doc_round_trips() {
        let dir = tempdir().unwrap();
        let project = Project::new("Test", "https://example.test/repo.git");
        let story = Story::new(project.id, "add /login", "Implement POST /login");
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());

        let relpath = layout.write_doc(&story, "prd.md", "# PRD").unwrap();
        assert!(relpath.starts_with("docs/"));
        assert_eq!(layout.read_doc(&story, "prd.md").unwrap().as_deref(), Some("# PRD"));
    }

    #[test]
    fn read_doc_rejects_path_traversal() {
        let dir = tempdir().unwrap();
        let project = Project::new("Test", "https://example.test/repo.git");
        let story = Story::new(project.id, "t", "r");
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());
        assert!(layout.read_doc(&story, "../etc/passwd").is_err());
        assert!(layout.write_doc(&story, "a/b.md", "x").is_err());
    }

    #[test]
    fn missing_doc_returns_none() {
        let dir = tempdir().unwrap();
        let project = Project::new("Test", "https://example.test/repo.git");
        let story = Story::new(project.id, "t", "r");
        let layout = WorkspaceLayout::new(dir.path().to_path_buf());
        assert_eq!(layout.read_doc(&story, "missing.md").unwrap(), None);
    }
}
