//! VCS gate - git operations over a project workspace
//!
//! The pipeline owns the repository while it runs, but humans may edit
//! tracked files between iterations; those edits are detected and committed
//! under a `[USER_MANUAL_CHANGE]` marker before each run so agent commits
//! stay attributable. Orchestrator bookkeeping (`agents.md`, `progress.txt`,
//! `.ralph/`) is invisible to change detection.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, info, warn};

/// Paths ignored by manual-change detection. `.ralph/` matches the whole
/// bookkeeping subtree.
const EXCLUDED_PATHS: &[&str] = &["agents.md", "progress.txt", ".ralph/"];

#[derive(Debug, Clone)]
pub struct VcsGate {
    root: PathBuf,
}

impl VcsGate {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .with_context(|| format!("failed to run git {}", args.join(" ")))
    }

    fn git_ok(&self, args: &[&str]) -> Result<Output> {
        let output = self.git(args)?;
        if !output.status.success() {
            anyhow::bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }

    /// Initialise the repository. When the workspace already contains files,
    /// they are staged and committed as the baseline so the first rollback
    /// target exists.
    pub fn init(&self) -> Result<()> {
        self.git_ok(&["init"])?;

        // Commits need an identity even on hosts with no global config.
        self.git_ok(&["config", "user.name", "ralphd"])?;
        self.git_ok(&["config", "user.email", "ralphd@localhost"])?;

        if !self.status()?.is_empty() {
            self.git_ok(&["add", "-A"])?;
            self.git_ok(&["commit", "-m", "initial-commit: Project initialized"])?;
            info!(root = %self.root.display(), "Created initial commit");
        }
        Ok(())
    }

    /// Changed paths from `git status --porcelain`, staged or not.
    pub fn status(&self) -> Result<Vec<String>> {
        let output = self.git_ok(&["status", "--porcelain"])?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        Ok(stdout
            .lines()
            .filter_map(|line| {
                if line.len() < 4 {
                    return None;
                }
                let path = line[3..].trim();
                // Renames are reported as `old -> new`; the new path is the
                // one that exists.
                let path = path.rsplit(" -> ").next().unwrap_or(path);
                Some(path.trim_matches('"').to_string())
            })
            .collect())
    }

    fn is_excluded(path: &str) -> bool {
        EXCLUDED_PATHS
            .iter()
            .any(|ex| path == ex.trim_end_matches('/') || path.starts_with(ex))
    }

    /// True iff any changed path is outside the bookkeeping set.
    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(self.status()?.iter().any(|p| !Self::is_excluded(p)))
    }

    /// Stage and commit every non-excluded changed path under the manual
    /// change marker. Returns the committed paths.
    pub fn commit_manual_changes(&self) -> Result<Vec<String>> {
        let changed: Vec<String> = self
            .status()?
            .into_iter()
            .filter(|p| !Self::is_excluded(p))
            .collect();
        if changed.is_empty() {
            return Ok(changed);
        }

        let mut args = vec!["add", "--"];
        args.extend(changed.iter().map(String::as_str));
        self.git_ok(&args)?;

        let message = format!(
            "[USER_MANUAL_CHANGE] Detected changes in: {}",
            changed.join(", ")
        );
        self.git_ok(&["commit", "-m", &message])?;
        info!(paths = %changed.join(", "), "Committed manual changes");
        Ok(changed)
    }

    /// Stage everything and commit with the given message.
    pub fn add_and_commit(&self, message: &str) -> Result<()> {
        self.git_ok(&["add", "-A"])?;
        let output = self.git(&["commit", "-m", message])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // A no-op commit is not an error; the iteration may have only
            // touched excluded files.
            if stderr.contains("nothing to commit")
                || String::from_utf8_lossy(&output.stdout).contains("nothing to commit")
            {
                debug!("Nothing to commit");
                return Ok(());
            }
            anyhow::bail!("git commit failed: {}", stderr.trim());
        }
        Ok(())
    }

    /// Hard reset to HEAD and drop untracked files. Failures are logged and
    /// swallowed so a broken rollback never masks the error that caused it.
    pub fn rollback_to_last_commit(&self) {
        match self.git(&["reset", "--hard", "HEAD"]) {
            Ok(output) if output.status.success() => {}
            Ok(output) => warn!(
                error = %String::from_utf8_lossy(&output.stderr).trim(),
                "git reset failed during rollback"
            ),
            Err(e) => warn!(error = %e, "could not run git reset"),
        }
        match self.git(&["clean", "-fd"]) {
            Ok(output) if output.status.success() => {
                info!(root = %self.root.display(), "Rolled back to last commit");
            }
            Ok(output) => warn!(
                error = %String::from_utf8_lossy(&output.stderr).trim(),
                "git clean failed during rollback"
            ),
            Err(e) => warn!(error = %e, "could not run git clean"),
        }
    }

    /// Latest commit subject, if any commit exists.
    pub fn head_subject(&self) -> Option<String> {
        let output = self.git(&["log", "-1", "--pretty=%s"]).ok()?;
        if !output.status.success() {
            return None;
        }
        let subject = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!subject.is_empty()).then_some(subject)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, VcsGate) {
        let tmp = TempDir::new().unwrap();
        let gate = VcsGate::new(tmp.path());
        (tmp, gate)
    }

    #[test]
    fn init_commits_existing_files() {
        let (tmp, gate) = setup();
        std::fs::write(tmp.path().join("README.md"), "# p").unwrap();
        gate.init().unwrap();

        assert_eq!(
            gate.head_subject().as_deref(),
            Some("initial-commit: Project initialized")
        );
        assert!(gate.status().unwrap().is_empty());
    }

    #[test]
    fn bookkeeping_files_are_invisible_to_change_detection() {
        let (tmp, gate) = setup();
        std::fs::write(tmp.path().join("README.md"), "# p").unwrap();
        gate.init().unwrap();

        std::fs::write(tmp.path().join("agents.md"), "log").unwrap();
        std::fs::write(tmp.path().join("progress.txt"), "busy").unwrap();
        std::fs::create_dir_all(tmp.path().join(".ralph/logs")).unwrap();
        std::fs::write(tmp.path().join(".ralph/logs/x.md"), "raw").unwrap();
        assert!(!gate.has_uncommitted_changes().unwrap());

        std::fs::write(tmp.path().join("src.js"), "let a = 1;").unwrap();
        assert!(gate.has_uncommitted_changes().unwrap());
    }

    #[test]
    fn manual_change_commit_lists_only_real_edits() {
        let (tmp, gate) = setup();
        std::fs::write(tmp.path().join("a.js"), "1").unwrap();
        gate.init().unwrap();

        std::fs::write(tmp.path().join("a.js"), "2").unwrap();
        std::fs::write(tmp.path().join("progress.txt"), "noise").unwrap();

        let committed = gate.commit_manual_changes().unwrap();
        assert_eq!(committed, vec!["a.js".to_string()]);
        assert_eq!(
            gate.head_subject().as_deref(),
            Some("[USER_MANUAL_CHANGE] Detected changes in: a.js")
        );
    }

    #[test]
    fn rollback_restores_head_and_drops_untracked() {
        let (tmp, gate) = setup();
        std::fs::write(tmp.path().join("a.js"), "original").unwrap();
        gate.init().unwrap();

        std::fs::write(tmp.path().join("a.js"), "broken").unwrap();
        std::fs::write(tmp.path().join("junk.js"), "drop me").unwrap();
        gate.rollback_to_last_commit();

        assert_eq!(
            std::fs::read_to_string(tmp.path().join("a.js")).unwrap(),
            "original"
        );
        assert!(!tmp.path().join("junk.js").exists());
    }
}
