//! Pipeline - the per-project execution state machine
//!
//! One pipeline owns one project while it runs. Each iteration picks the
//! first pending story of the first open stage, asks the developer agent to
//! implement it, applies and validates the result, and either commits or
//! retries with exponential backoff. Non-critical stories that exhaust their
//! retries are skipped; a critical story exhausting its budget rolls the
//! workspace back and parks the project in the error state.
//!
//! The stop flag is observed at the top of every iteration and between major
//! steps. In-flight LLM calls are never interrupted; the next checkpoint
//! honours the flag.

pub mod context;
pub mod prompts;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::approval::ApprovalOracle;
use crate::broadcast::Broadcaster;
use crate::gate::SyntaxGate;
use crate::llm::{AgentOutcome, AgentRole, LlmClient};
use crate::plan::{Plan, Priority, Stage, Story};
use crate::store::{Lesson, Project, ProjectStatus, Settings, Store};
use crate::vcs::VcsGate;
use crate::workspace::Workspace;

/// Stories with descriptions longer than this are split into subtasks before
/// execution.
const SPLIT_THRESHOLD: usize = 300;
/// Feedback shorter than this is too vague to be worth a lesson.
const LESSON_MIN_FEEDBACK: usize = 20;

pub const PLAN_FILE: &str = "plans/prd.json";
pub const LOG_DIR: &str = ".ralph/logs";

/// Settings snapshot taken when the pipeline starts. Later settings changes
/// apply from the next start.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub max_iterations: u32,
    pub max_retries_per_task: u32,
    pub base_sleep_ms: u64,
    pub backoff_multiplier: f64,
    pub use_reviewer_agent: bool,
    pub use_human_review: bool,
    pub chat_enabled: bool,
}

impl PipelineParams {
    pub fn snapshot(settings: &Settings, project: &Project) -> Self {
        Self {
            max_iterations: settings.max_iterations,
            max_retries_per_task: settings.max_retries_per_task,
            base_sleep_ms: settings.base_sleep_time,
            backoff_multiplier: settings.backoff_multiplier,
            use_reviewer_agent: settings.use_reviewer_agent,
            use_human_review: project.use_human_review || settings.chat.use_human_review,
            chat_enabled: settings.chat.enabled,
        }
    }
}

/// Wait before retry `n` (1-based): `base × multiplier^(n-1)`.
pub fn backoff_delay(base_ms: u64, multiplier: f64, retry: u32) -> Duration {
    let factor = multiplier.powi(retry.saturating_sub(1) as i32);
    Duration::from_millis((base_ms as f64 * factor) as u64)
}

/// Write one raw prompt+response log with a unique timestamped name.
/// Returns the file name within the log directory.
pub(crate) async fn write_raw_log(
    ws: &Workspace,
    role: &str,
    prompt: &str,
    response: &str,
) -> Result<String> {
    let ts = Utc::now().format("%Y%m%d_%H%M%S%3f");
    let mut name = format!("{ts}_{role}.md");
    let mut n = 1;
    while ws.contained_join(format!("{LOG_DIR}/{name}"))?.exists() {
        name = format!("{ts}_{role}_{n}.md");
        n += 1;
    }
    ws.write(
        format!("{LOG_DIR}/{name}"),
        &format!("# PROMPT\n\n{prompt}\n\n# RESPONSE\n\n{response}\n"),
    )
    .await?;
    Ok(name)
}

pub struct Pipeline {
    project_id: String,
    workspace: Workspace,
    vcs: VcsGate,
    llm: LlmClient,
    gate: Arc<dyn SyntaxGate>,
    oracle: Arc<ApprovalOracle>,
    events: Arc<Broadcaster>,
    store: Arc<Store>,
    params: PipelineParams,
    running: Arc<AtomicBool>,

    iteration: u32,
    retry_count: u32,
    last_error: Option<String>,
    manual_change_log: Option<String>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        project: &Project,
        params: PipelineParams,
        llm: LlmClient,
        gate: Arc<dyn SyntaxGate>,
        oracle: Arc<ApprovalOracle>,
        events: Arc<Broadcaster>,
        store: Arc<Store>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            project_id: project.id.clone(),
            workspace: Workspace::new(&project.root_path),
            vcs: VcsGate::new(&project.root_path),
            llm,
            gate,
            oracle,
            events,
            store,
            params,
            running,
            iteration: project.iteration,
            retry_count: 0,
            last_error: None,
            manual_change_log: None,
        }
    }

    /// Drive the loop to a terminal state. Fatal errors park the project in
    /// `error` and announce it; the task itself never panics the process.
    pub async fn run(mut self) {
        info!(project = %self.project_id, "Pipeline started");
        if let Err(e) = self.run_loop().await {
            error!(project = %self.project_id, error = %e, "Pipeline failed");
            let _ = self
                .store
                .update_status(&self.project_id, ProjectStatus::Error)
                .await;
            self.emit(
                "error",
                json!({
                    "status": "error",
                    "message": format!("Pipeline failed: {e}"),
                }),
            );
        }
        self.running.store(false, Ordering::SeqCst);
        info!(project = %self.project_id, "Pipeline finished");
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.prepare_workspace().await?;

        loop {
            if self.stop_requested() {
                return self.pause("Stopped by request").await;
            }
            if self.iteration >= self.params.max_iterations {
                return self.pause("Iteration budget exhausted").await;
            }

            // pick_task: disk is the source of truth for the active run.
            let mut plan = self.load_plan().await?;

            let Some(stage_idx) = plan.active_stage_index() else {
                return self.complete(plan).await;
            };

            let Some(story_idx) = plan.stages[stage_idx].active_story_index() else {
                if plan.mark_stage_complete_if_done(stage_idx)? {
                    let name = plan.stages[stage_idx].name.clone();
                    self.persist_plan(&plan).await?;
                    info!(project = %self.project_id, stage = %name, "Stage completed");
                    self.emit(
                        "update",
                        json!({
                            "message": format!("Stage completed: {name}"),
                            "prd": serde_json::to_value(&plan)?,
                        }),
                    );
                }
                continue;
            };

            let story = plan.stages[stage_idx].stories[story_idx].clone();

            // Oversized stories are split in place first; the split does not
            // consume an iteration slot. A failed split falls through to
            // executing the original story.
            if story.description.chars().count() > SPLIT_THRESHOLD && !story.is_subtasked {
                match self.split_story(&story).await {
                    Ok(subtasks) => {
                        let count = subtasks.len();
                        plan.replace_story(stage_idx, story_idx, subtasks)?;
                        self.persist_plan(&plan).await?;
                        info!(project = %self.project_id, task = %story.title, count, "Split oversized story");
                        self.emit(
                            "update",
                            json!({
                                "message": format!("Split '{}' into {count} subtasks", story.title),
                                "prd": serde_json::to_value(&plan)?,
                            }),
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!(project = %self.project_id, error = %e, "Subtask split failed; executing original story");
                    }
                }
            }

            self.iteration += 1;
            self.store
                .update_iteration(&self.project_id, self.iteration)
                .await?;

            let stage = plan.stages[stage_idx].clone();
            info!(
                project = %self.project_id,
                iteration = self.iteration,
                stage = %stage.name,
                story = %story.title,
                "Starting iteration"
            );
            self.emit(
                "update",
                json!({
                    "status": "running",
                    "iteration": self.iteration,
                    "currentTask": story.title,
                    "message": format!("Working on: {}", story.title),
                }),
            );
            self.workspace
                .write("progress.txt", &format!("Working on: {}\n", story.title))
                .await?;
            self.workspace
                .write(
                    ".ralph/internal_status.txt",
                    &format!("iteration {}: {} / {}\n", self.iteration, stage.name, story.title),
                )
                .await?;

            if self.stop_requested() {
                return self.pause("Stopped by request").await;
            }

            let ctx = self.prepare_context().await?;

            if self.stop_requested() {
                return self.pause("Stopped by request").await;
            }

            // Developer run, then the syntax gate with a single self-healing
            // re-run. The self-heal is not a retry.
            let dev_prompt = prompts::developer_prompt(&self.project_id, &stage, &story, &ctx);
            let mut dev = self.invoke_developer(&dev_prompt, &stage, &story).await?;

            let report = self.gate.validate(self.workspace.root()).await;
            if !report.valid {
                let file = report.file.unwrap_or_default();
                let gate_error = report.error.unwrap_or_default();
                warn!(project = %self.project_id, file = %file, "Syntax gate failed; self-healing");
                self.emit(
                    "update",
                    json!({"message": format!("Syntax error in {file}; self-healing")}),
                );
                let heal = prompts::self_heal_prompt(&dev_prompt, &file, &gate_error);
                dev = self.invoke_developer(&heal, &stage, &story).await?;
            }

            if self.stop_requested() {
                return self.pause("Stopped by request").await;
            }

            let (mut is_valid, mut feedback) = self.review(&stage, &story, &dev).await?;

            if is_valid && self.params.chat_enabled && self.params.use_human_review {
                if !self.oracle.ask(&stage.name, &story.title).await {
                    is_valid = false;
                    feedback = "USER REJECTED via Telegram Mobile.".to_string();
                }
            }

            if is_valid {
                self.on_success(&mut plan, stage_idx, story_idx, &stage, &story)
                    .await?;
            } else {
                let terminal = self
                    .on_failure(&mut plan, stage_idx, story_idx, &stage, &story, feedback)
                    .await?;
                if terminal {
                    return Ok(());
                }
            }

            // Unconditional inter-iteration pause bounds throughput.
            tokio::time::sleep(Duration::from_millis(self.params.base_sleep_ms)).await;
        }
    }

    fn stop_requested(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, kind: &str, payload: serde_json::Value) {
        self.events.emit(kind, &self.project_id, payload);
    }

    /// Ensure the bookkeeping layout exists and the plan file matches the
    /// stored plan when no file is present yet.
    async fn prepare_workspace(&self) -> Result<()> {
        self.workspace.create_dir_all("plans").await?;
        self.workspace.create_dir_all(LOG_DIR).await?;

        if self.workspace.read_optional(PLAN_FILE).await.is_none() {
            let project = self
                .store
                .project(&self.project_id)
                .await
                .with_context(|| format!("unknown project: {}", self.project_id))?;
            self.write_plan_file(&project.plan).await?;
        }
        Ok(())
    }

    async fn load_plan(&self) -> Result<Plan> {
        let content = self
            .workspace
            .read_to_string(PLAN_FILE)
            .await
            .context("plan file is unreadable")?;
        let plan: Plan = serde_json::from_str(&content).context("plan file is not valid JSON")?;
        plan.verify_invariants()?;
        Ok(plan)
    }

    async fn write_plan_file(&self, plan: &Plan) -> Result<()> {
        self.workspace
            .write(PLAN_FILE, &serde_json::to_string_pretty(plan)?)
            .await
    }

    /// Persist the plan to disk and Store, in that order, so the invariant
    /// "plan on disk equals plan in Store at iteration boundaries" holds.
    async fn persist_plan(&self, plan: &Plan) -> Result<()> {
        self.write_plan_file(plan).await?;
        self.store.update_plan(&self.project_id, plan.clone()).await
    }

    async fn invoke_developer(
        &self,
        prompt: &str,
        stage: &Stage,
        story: &Story,
    ) -> Result<AgentOutcome> {
        let outcome = self.llm.run_agent(AgentRole::Developer, prompt).await;
        let log_name = write_raw_log(&self.workspace, "developer", prompt, &outcome.raw).await?;

        let summary = crate::llm::extract::extract_summary(&outcome.raw);
        self.workspace
            .append(
                "agents.md",
                &format!(
                    "\n## {} developer - {} / {}\n\n{}\n\n(full log: {LOG_DIR}/{log_name})\n",
                    Utc::now().to_rfc3339(),
                    stage.name,
                    story.title,
                    summary,
                ),
            )
            .await?;

        if !outcome.applied_files.is_empty() {
            self.emit(
                "update",
                json!({"message": format!("Applied files: {}", outcome.applied_files.join(", "))}),
            );
        }
        Ok(outcome)
    }

    /// Reviewer verdict when the reviewer agent is enabled, otherwise the
    /// developer's own completion sentinel.
    async fn review(
        &self,
        stage: &Stage,
        story: &Story,
        dev: &AgentOutcome,
    ) -> Result<(bool, String)> {
        if self.params.use_reviewer_agent {
            let tree = prompts::tail(&self.workspace.render_tree(), 1_000);
            let prompt = prompts::reviewer_prompt(&stage.mission, &story.title, &dev.raw, &tree);
            let outcome = self.llm.run_agent(AgentRole::Reviewer, &prompt).await;
            write_raw_log(&self.workspace, "reviewer", &prompt, &outcome.raw).await?;

            if outcome.raw.contains("REVIEW_PASSED") {
                return Ok((true, String::new()));
            }
            return Ok((false, format!("Review failed: {}", outcome.raw.trim())));
        }

        if dev.raw.contains("PROMISE_MET") {
            Ok((true, String::new()))
        } else {
            Ok((
                false,
                "Developer response did not report PROMISE_MET".to_string(),
            ))
        }
    }

    async fn on_success(
        &mut self,
        plan: &mut Plan,
        stage_idx: usize,
        story_idx: usize,
        stage: &Stage,
        story: &Story,
    ) -> Result<()> {
        plan.mark_story_passed(stage_idx, story_idx)?;
        self.retry_count = 0;
        self.last_error = None;

        // Disk, then commit (which captures the plan file), then Store.
        self.write_plan_file(plan).await?;
        let message = format!("Completed: {} - {}", stage.name, story.title);
        self.vcs.add_and_commit(&message)?;
        self.store.update_plan(&self.project_id, plan.clone()).await?;

        info!(project = %self.project_id, story = %story.title, "Story passed");
        self.emit(
            "update",
            json!({
                "iteration": self.iteration,
                "currentTask": story.title,
                "message": message,
                "prd": serde_json::to_value(&plan)?,
            }),
        );
        Ok(())
    }

    /// Returns true when the failure terminates the loop (critical rollback).
    async fn on_failure(
        &mut self,
        plan: &mut Plan,
        stage_idx: usize,
        story_idx: usize,
        stage: &Stage,
        story: &Story,
        feedback: String,
    ) -> Result<bool> {
        self.retry_count += 1;
        self.last_error = Some(feedback.clone());
        warn!(
            project = %self.project_id,
            story = %story.title,
            retry = self.retry_count,
            feedback = %feedback,
            "Task attempt failed"
        );

        if feedback.chars().count() > LESSON_MIN_FEEDBACK {
            self.store
                .save_lesson(Lesson {
                    project: self.project_id.clone(),
                    stage: stage.name.clone(),
                    task: story.title.clone(),
                    error: feedback.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                })
                .await?;
        }

        if self.retry_count >= self.params.max_retries_per_task {
            if story.priority != Priority::Critical {
                plan.mark_story_skipped(stage_idx, story_idx, &feedback)?;
                self.retry_count = 0;
                self.persist_plan(plan).await?;
                info!(project = %self.project_id, story = %story.title, "Skipped non-critical story");
                self.emit(
                    "update",
                    json!({
                        "message": format!("Skipped: {} ({feedback})", story.title),
                        "prd": serde_json::to_value(&plan)?,
                    }),
                );
                return Ok(false);
            }

            // A critical story out of retries poisons the workspace; throw
            // away everything since the last commit and park the project.
            error!(project = %self.project_id, story = %story.title, "Critical story exhausted retries; rolling back");
            self.vcs.rollback_to_last_commit();
            self.store
                .update_status(&self.project_id, ProjectStatus::Error)
                .await?;
            self.emit(
                "error",
                json!({
                    "status": "error",
                    "currentTask": story.title,
                    "message": format!("Critical task failed after {} retries: {feedback}", self.params.max_retries_per_task),
                }),
            );
            return Ok(true);
        }

        let wait = backoff_delay(
            self.params.base_sleep_ms,
            self.params.backoff_multiplier,
            self.retry_count,
        );
        self.emit(
            "update",
            json!({
                "message": format!(
                    "Retry {}/{} in {}ms",
                    self.retry_count, self.params.max_retries_per_task, wait.as_millis()
                ),
            }),
        );
        tokio::time::sleep(wait).await;
        Ok(false)
    }

    async fn split_story(&self, story: &Story) -> Result<Vec<Story>> {
        let prompt = prompts::split_prompt(story);
        let (value, raw) = self.llm.complete_json_with_raw(AgentRole::Json, &prompt).await?;
        write_raw_log(&self.workspace, "json", &prompt, &raw).await?;

        let items = value.as_array().context("split response was not a JSON array")?;
        let subtasks: Vec<Story> = items
            .iter()
            .filter_map(|item| {
                let title = item["title"].as_str()?;
                let mut s = Story::new(title, item["description"].as_str().unwrap_or_default());
                s.priority = story.priority;
                Some(s)
            })
            .collect();

        if subtasks.is_empty() {
            anyhow::bail!("split response contained no usable subtasks");
        }
        Ok(subtasks)
    }

    async fn complete(&mut self, plan: Plan) -> Result<()> {
        self.store.update_plan(&self.project_id, plan).await?;
        self.store
            .update_status(&self.project_id, ProjectStatus::Completed)
            .await?;
        info!(project = %self.project_id, "All stages complete");
        self.emit(
            "update",
            json!({"status": "completed", "message": "All stages complete"}),
        );
        Ok(())
    }

    async fn pause(&mut self, reason: &str) -> Result<()> {
        self.store
            .update_status(&self.project_id, ProjectStatus::Paused)
            .await?;
        info!(project = %self.project_id, reason, "Pipeline paused");
        self.emit(
            "update",
            json!({"status": "paused", "message": reason}),
        );
        Ok(())
    }
}
