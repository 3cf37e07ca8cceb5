//! Store - durable JSON document for projects, settings, and lessons
//!
//! One pretty-printed document (`data/db.json`) holds everything the process
//! must survive a restart with. All mutations serialise through a single
//! async mutex and persist atomically: the new document is written to a temp
//! file beside the target and renamed over it, so a crash never leaves a
//! half-written database.

use crate::plan::Plan;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Lessons are a process-global FIFO; older entries fall off past this cap.
pub const LESSON_CAP: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Created,
    Initialized,
    Running,
    Paused,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Human-chosen identifier, doubling as the display name.
    pub id: String,
    pub root_path: PathBuf,
    pub plan: Plan,
    pub status: ProjectStatus,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub use_human_review: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(id: impl Into<String>, root_path: impl Into<PathBuf>, plan: Plan) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            root_path: root_path.into(),
            plan,
            status: ProjectStatus::Created,
            iteration: 0,
            use_human_review: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A recorded failure, fed back into later developer prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    pub project: String,
    pub stage: String,
    pub task: String,
    /// Truncated to 500 characters at save time.
    pub error: String,
    pub timestamp: String,
}

/// Global settings. The key set is closed: replacing settings with a document
/// containing unknown keys is rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries_per_task: u32,
    /// Milliseconds; also the unconditional inter-iteration pause.
    #[serde(default = "default_base_sleep")]
    pub base_sleep_time: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_true")]
    pub use_reviewer_agent: bool,
    #[serde(default)]
    pub auto_test: bool,
    #[serde(default = "default_codex_path")]
    pub codex_path: String,
    #[serde(default)]
    pub chat: ChatSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ChatSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub use_human_review: bool,
}

fn default_max_iterations() -> u32 {
    100
}
fn default_max_retries() -> u32 {
    3
}
fn default_base_sleep() -> u64 {
    10_000
}
fn default_backoff() -> f64 {
    2.0
}
fn default_true() -> bool {
    true
}
fn default_codex_path() -> String {
    "codex".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_retries_per_task: default_max_retries(),
            base_sleep_time: default_base_sleep(),
            backoff_multiplier: default_backoff(),
            use_reviewer_agent: true,
            auto_test: false,
            codex_path: default_codex_path(),
            chat: ChatSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    lessons: Vec<Lesson>,
    #[serde(default)]
    settings: Settings,
}

/// Single-writer store over the on-disk document.
pub struct Store {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl Store {
    /// Load (or create) the document. A legacy `codexPath` of
    /// `"npx codex-cli"` is normalised to `"codex"` during load.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut doc = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<Document>(&content)
                .with_context(|| format!("invalid store document at {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        if doc.settings.codex_path == "npx codex-cli" {
            info!("Migrating legacy codexPath setting");
            doc.settings.codex_path = default_codex_path();
        }

        let store = Self {
            path,
            doc: Mutex::new(doc),
        };
        store.persist(&*store.doc.lock().await).await?;
        Ok(store)
    }

    async fn persist(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let content = serde_json::to_string_pretty(doc)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &content)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))
    }

    pub async fn projects(&self) -> Vec<Project> {
        self.doc.lock().await.projects.clone()
    }

    pub async fn project(&self, id: &str) -> Option<Project> {
        self.doc
            .lock()
            .await
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Insert or replace a project by id, preserving `createdAt` and bumping
    /// `updatedAt`.
    pub async fn save_project(&self, mut project: Project) -> Result<()> {
        let mut doc = self.doc.lock().await;
        project.updated_at = Utc::now();
        if let Some(existing) = doc.projects.iter_mut().find(|p| p.id == project.id) {
            project.created_at = existing.created_at;
            *existing = project;
        } else {
            doc.projects.push(project);
        }
        self.persist(&doc).await
    }

    pub async fn update_plan(&self, id: &str, plan: Plan) -> Result<()> {
        self.mutate_project(id, |p| p.plan = plan).await
    }

    pub async fn update_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        self.mutate_project(id, |p| p.status = status).await
    }

    pub async fn update_iteration(&self, id: &str, iteration: u32) -> Result<()> {
        self.mutate_project(id, |p| p.iteration = iteration).await
    }

    pub async fn set_use_human_review(&self, id: &str, value: bool) -> Result<()> {
        self.mutate_project(id, |p| p.use_human_review = value).await
    }

    async fn mutate_project(&self, id: &str, f: impl FnOnce(&mut Project)) -> Result<()> {
        let mut doc = self.doc.lock().await;
        let project = doc
            .projects
            .iter_mut()
            .find(|p| p.id == id)
            .with_context(|| format!("unknown project: {id}"))?;
        f(project);
        project.updated_at = Utc::now();
        self.persist(&doc).await
    }

    pub async fn settings(&self) -> Settings {
        self.doc.lock().await.settings.clone()
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<()> {
        let mut doc = self.doc.lock().await;
        doc.settings = settings;
        self.persist(&doc).await
    }

    pub async fn lessons(&self) -> Vec<Lesson> {
        self.doc.lock().await.lessons.clone()
    }

    /// Append a lesson, truncating its error to 500 characters and evicting
    /// the oldest entries past the FIFO cap.
    pub async fn save_lesson(&self, mut lesson: Lesson) -> Result<()> {
        if lesson.error.chars().count() > 500 {
            lesson.error = lesson.error.chars().take(500).collect();
        }
        let mut doc = self.doc.lock().await;
        doc.lessons.push(lesson);
        while doc.lessons.len() > LESSON_CAP {
            doc.lessons.remove(0);
        }
        self.persist(&doc).await
    }

    pub async fn delete_lesson(&self, timestamp: &str) -> Result<bool> {
        let mut doc = self.doc.lock().await;
        let before = doc.lessons.len();
        doc.lessons.retain(|l| l.timestamp != timestamp);
        let removed = doc.lessons.len() != before;
        if removed {
            self.persist(&doc).await?;
        } else {
            warn!(timestamp, "No lesson with that timestamp");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_in(tmp: &TempDir) -> Store {
        Store::open(tmp.path().join("db.json")).await.unwrap()
    }

    #[tokio::test]
    async fn document_round_trips_across_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let store = open_in(&tmp).await;
            store
                .save_project(Project::new("demo", "/tmp/demo", Plan::default()))
                .await
                .unwrap();
        }
        let store = open_in(&tmp).await;
        let project = store.project("demo").await.unwrap();
        assert_eq!(project.status, ProjectStatus::Created);
        assert_eq!(project.root_path, PathBuf::from("/tmp/demo"));
    }

    #[tokio::test]
    async fn save_project_merges_by_id_and_bumps_updated_at() {
        let tmp = TempDir::new().unwrap();
        let store = open_in(&tmp).await;

        let original = Project::new("demo", "/tmp/demo", Plan::default());
        let created_at = original.created_at;
        store.save_project(original.clone()).await.unwrap();

        let mut changed = original;
        changed.status = ProjectStatus::Initialized;
        store.save_project(changed).await.unwrap();

        let stored = store.project("demo").await.unwrap();
        assert_eq!(stored.status, ProjectStatus::Initialized);
        assert_eq!(stored.created_at, created_at);
        assert!(stored.updated_at >= created_at);
        assert_eq!(store.projects().await.len(), 1);
    }

    #[tokio::test]
    async fn lessons_are_a_bounded_fifo() {
        let tmp = TempDir::new().unwrap();
        let store = open_in(&tmp).await;

        for i in 0..LESSON_CAP + 5 {
            store
                .save_lesson(Lesson {
                    project: "p".to_string(),
                    stage: "s".to_string(),
                    task: format!("t{i}"),
                    error: "e".to_string(),
                    timestamp: format!("ts-{i}"),
                })
                .await
                .unwrap();
        }

        let lessons = store.lessons().await;
        assert_eq!(lessons.len(), LESSON_CAP);
        assert_eq!(lessons[0].task, "t5");
    }

    #[tokio::test]
    async fn lesson_errors_are_truncated_to_500_chars() {
        let tmp = TempDir::new().unwrap();
        let store = open_in(&tmp).await;
        store
            .save_lesson(Lesson {
                project: "p".to_string(),
                stage: "s".to_string(),
                task: "t".to_string(),
                error: "x".repeat(800),
                timestamp: "ts".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(store.lessons().await[0].error.len(), 500);
    }

    #[tokio::test]
    async fn delete_lesson_removes_by_timestamp() {
        let tmp = TempDir::new().unwrap();
        let store = open_in(&tmp).await;
        store
            .save_lesson(Lesson {
                project: "p".to_string(),
                stage: "s".to_string(),
                task: "t".to_string(),
                error: "e".to_string(),
                timestamp: "keep".to_string(),
            })
            .await
            .unwrap();

        assert!(store.delete_lesson("keep").await.unwrap());
        assert!(!store.delete_lesson("missing").await.unwrap());
        assert!(store.lessons().await.is_empty());
    }

    #[tokio::test]
    async fn legacy_codex_path_is_migrated_on_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("db.json");
        std::fs::write(
            &path,
            r#"{"projects":[],"lessons":[],"settings":{"codexPath":"npx codex-cli"}}"#,
        )
        .unwrap();

        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.settings().await.codex_path, "codex");
    }

    #[tokio::test]
    async fn unknown_settings_keys_are_rejected() {
        let parsed: std::result::Result<Settings, _> =
            serde_json::from_str(r#"{"maxIterations":5,"bogusKey":true}"#);
        assert!(parsed.is_err());
    }
}
