//! Per-iteration context assembly
//!
//! Before every developer run the pipeline reconciles manual edits, gathers
//! the workspace state, and reloads the recent failure lessons. Everything is
//! bounded so prompts cannot grow without limit.

use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

use super::prompts::tail;
use super::Pipeline;
use crate::store::Lesson;
use crate::workspace::Workspace;

/// How many recent lessons are fed back into the developer prompt.
const LESSON_WINDOW: usize = 3;
/// Agent-log tail kept in the prompt, in characters.
const AGENT_LOG_TAIL: usize = 3_000;
/// Source files inlined into the prompt.
const SOURCE_FILE_LIMIT: usize = 15;
/// Per-file inline budget, in characters.
const SOURCE_CHAR_LIMIT: usize = 5_000;

const SOURCE_EXTENSIONS: &[&str] = &["ts", "js", "css", "html"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Patch,
    Rewrite,
}

#[derive(Debug, Clone)]
pub struct IterationContext {
    /// Comma-joined manual-edit paths from this iteration, if any.
    pub manual_note: Option<String>,
    pub agent_log: String,
    pub progress: String,
    pub tree: String,
    /// `(root-relative path, content)`, each truncated to the inline budget.
    pub sources: Vec<(String, String)>,
    pub lessons: Vec<Lesson>,
    pub strategy: Strategy,
}

impl Pipeline {
    pub(super) async fn prepare_context(&mut self) -> Result<IterationContext> {
        self.manual_change_log = None;

        if self.vcs.has_uncommitted_changes()? {
            let paths = self.vcs.commit_manual_changes()?;
            if !paths.is_empty() {
                let joined = paths.join(", ");
                info!(project = %self.project_id, paths = %joined, "Reconciled manual changes");
                self.emit(
                    "update",
                    json!({"message": format!("Manual changes committed: {joined}")}),
                );

                if paths.iter().any(|p| {
                    p == "package.json" || p.ends_with("/package.json")
                }) {
                    spawn_dependency_install(self.workspace.root().to_path_buf());
                }
                self.manual_change_log = Some(joined);
            }
        }

        let agent_log = tail(
            &self.workspace.read_optional("agents.md").await.unwrap_or_default(),
            AGENT_LOG_TAIL,
        );
        let progress = self
            .workspace
            .read_optional("progress.txt")
            .await
            .unwrap_or_default();
        let tree = self.workspace.render_tree();
        let sources = collect_sources(&self.workspace).await;

        let mut lessons = self.store.lessons().await;
        if lessons.len() > LESSON_WINDOW {
            lessons = lessons.split_off(lessons.len() - LESSON_WINDOW);
        }

        let strategy = if self.retry_count > 2 {
            Strategy::Rewrite
        } else {
            Strategy::Patch
        };

        Ok(IterationContext {
            manual_note: self.manual_change_log.clone(),
            agent_log,
            progress,
            tree,
            sources,
            lessons,
            strategy,
        })
    }
}

/// Fire-and-forget dependency install after a manual manifest change. The
/// loop never waits on or inspects the result.
fn spawn_dependency_install(root: PathBuf) {
    info!(root = %root.display(), "package.json changed; spawning npm install");
    match tokio::process::Command::new("npm")
        .arg("install")
        .current_dir(&root)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
    {
        Ok(mut child) => {
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
        }
        Err(e) => warn!(error = %e, "could not spawn npm install"),
    }
}

/// Up to [`SOURCE_FILE_LIMIT`] source files under `src/` (or the project root
/// when there is no `src/`), excluding tests and vendored trees.
async fn collect_sources(ws: &Workspace) -> Vec<(String, String)> {
    let base = if ws.root().join("src").is_dir() {
        Some("src")
    } else {
        None
    };

    let Ok(files) = ws.list_files() else {
        return Vec::new();
    };

    let mut sources = Vec::new();
    for rel in files {
        if sources.len() >= SOURCE_FILE_LIMIT {
            break;
        }
        let Some(rel_str) = rel.to_str() else { continue };
        if let Some(base) = base {
            if !rel.starts_with(base) {
                continue;
            }
        }
        if rel_str.contains("node_modules/")
            || rel_str.contains(".git/")
            || rel_str.contains(".ralph/")
            || rel_str.contains(".test.")
        {
            continue;
        }
        let has_source_ext = rel
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| SOURCE_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if !has_source_ext {
            continue;
        }

        if let Some(content) = ws.read_optional(&rel).await {
            let content = if content.chars().count() > SOURCE_CHAR_LIMIT {
                content.chars().take(SOURCE_CHAR_LIMIT).collect()
            } else {
                content
            };
            sources.push((rel_str.to_string(), content));
        }
    }
    sources
}
