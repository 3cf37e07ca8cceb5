//! Workspace I/O - contained file access under a project root
//!
//! Every write path handed to the workspace is resolved relative to the root
//! and refused if normalisation would escape it. The directory tree renderer
//! filters out build artefacts and orchestrator bookkeeping so prompts stay
//! small.

use anyhow::{bail, Context, Result};
use std::path::{Component, Path, PathBuf};
use tokio::fs;

/// Directory and file names omitted from the rendered tree.
const TREE_EXCLUDED: &[&str] = &[
    "node_modules",
    ".git",
    ".DS_Store",
    "dist",
    "build",
    "target",
    ".next",
    "package-lock.json",
    ".ralph",
];

/// Safe file access rooted at a project directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a relative path against the root, refusing any path whose
    /// normalised form escapes it. Absolute paths and `..` walks above the
    /// root are rejected before any IO happens.
    pub fn contained_join(&self, rel: impl AsRef<Path>) -> Result<PathBuf> {
        let rel = rel.as_ref();
        let mut resolved = self.root.clone();
        let mut depth: usize = 0;

        for component in rel.components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if depth == 0 {
                        bail!("path '{}' escapes the project root", rel.display());
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    bail!("absolute path '{}' is not allowed", rel.display());
                }
            }
        }

        Ok(resolved)
    }

    pub async fn create_dir_all(&self, rel: impl AsRef<Path>) -> Result<()> {
        let path = self.contained_join(rel)?;
        fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))
    }

    pub async fn read_to_string(&self, rel: impl AsRef<Path>) -> Result<String> {
        let path = self.contained_join(rel)?;
        fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }

    /// Read a file that may legitimately not exist yet.
    pub async fn read_optional(&self, rel: impl AsRef<Path>) -> Option<String> {
        let path = self.contained_join(rel).ok()?;
        fs::read_to_string(&path).await.ok()
    }

    pub async fn write(&self, rel: impl AsRef<Path>, content: &str) -> Result<()> {
        let path = self.contained_join(rel)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }

    pub async fn append(&self, rel: impl AsRef<Path>, content: &str) -> Result<()> {
        let existing = self.read_optional(&rel).await.unwrap_or_default();
        self.write(rel, &format!("{existing}{content}")).await
    }

    pub async fn remove_dir_all(&self, rel: impl AsRef<Path>) -> Result<()> {
        let path = self.contained_join(rel)?;
        fs::remove_dir_all(&path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))
    }

    /// All regular files under the root, recursively, as root-relative paths.
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        collect_files(&self.root, &self.root, &mut files)?;
        files.sort();
        Ok(files)
    }

    /// Render the filtered directory tree in the familiar
    /// `├──`/`└──` layout, directories printed before their contents.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        render_dir(&self.root, "", &mut out);
        out
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(rel) = path.strip_prefix(root) {
            out.push(rel.to_path_buf());
        }
    }
    Ok(())
}

fn tree_excluded(name: &str) -> bool {
    TREE_EXCLUDED.contains(&name) || name.ends_with(".tsbuildinfo")
}

fn render_dir(dir: &Path, prefix: &str, out: &mut String) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };

    let mut names: Vec<(String, bool)> = entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().to_string();
            if tree_excluded(&name) {
                None
            } else {
                Some((name, e.path().is_dir()))
            }
        })
        .collect();
    names.sort_by(|a, b| a.0.cmp(&b.0));

    let last = names.len().saturating_sub(1);
    for (i, (name, is_dir)) in names.iter().enumerate() {
        let (branch, child_prefix) = if i == last {
            ("└── ", format!("{prefix}    "))
        } else {
            ("├── ", format!("{prefix}│   "))
        };
        out.push_str(prefix);
        out.push_str(branch);
        out.push_str(name);
        out.push('\n');
        if *is_dir {
            render_dir(&dir.join(name), &child_prefix, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ws() -> (TempDir, Workspace) {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        (tmp, ws)
    }

    #[test]
    fn containment_refuses_escapes() {
        let (_tmp, ws) = ws();
        assert!(ws.contained_join("src/index.js").is_ok());
        assert!(ws.contained_join("a/../b.js").is_ok());
        assert!(ws.contained_join("../outside.js").is_err());
        assert!(ws.contained_join("a/../../outside.js").is_err());
        assert!(ws.contained_join("/etc/passwd").is_err());
    }

    #[tokio::test]
    async fn write_creates_parent_directories() {
        let (tmp, ws) = ws();
        ws.write("src/deep/mod.js", "x").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("src/deep/mod.js")).unwrap(),
            "x"
        );
    }

    #[tokio::test]
    async fn tree_omits_excluded_entries() {
        let (_tmp, ws) = ws();
        ws.write("src/app.js", "x").await.unwrap();
        ws.write("node_modules/pkg/index.js", "x").await.unwrap();
        ws.write(".ralph/logs/a.md", "x").await.unwrap();
        ws.write("cache.tsbuildinfo", "x").await.unwrap();

        let tree = ws.render_tree();
        assert!(tree.contains("├── src") || tree.contains("└── src"));
        assert!(tree.contains("app.js"));
        assert!(!tree.contains("node_modules"));
        assert!(!tree.contains(".ralph"));
        assert!(!tree.contains("tsbuildinfo"));
    }

    #[tokio::test]
    async fn recursive_delete_stays_contained() {
        let (tmp, ws) = ws();
        ws.write("scratch/deep/file.js", "x").await.unwrap();
        ws.remove_dir_all("scratch").await.unwrap();
        assert!(!tmp.path().join("scratch").exists());
        assert!(ws.remove_dir_all("../elsewhere").await.is_err());
    }

    #[tokio::test]
    async fn tree_prints_directories_before_their_contents() {
        let (_tmp, ws) = ws();
        ws.write("src/a.js", "x").await.unwrap();
        let tree = ws.render_tree();
        let dir_pos = tree.find("src").unwrap();
        let file_pos = tree.find("a.js").unwrap();
        assert!(dir_pos < file_pos);
        assert!(tree.contains("└── a.js"));
    }
}
