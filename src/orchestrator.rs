//! Orchestrator - process-wide project registry and lifecycle commands
//!
//! All external commands (HTTP or chat) land here. The registry guarantees
//! at most one live pipeline per project id; pipelines announce their own
//! progress through the shared broadcaster.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::approval::ApprovalOracle;
use crate::broadcast::Broadcaster;
use crate::chat::ChatBridge;
use crate::gate::SyntaxGate;
use crate::llm::{AgentRole, ChatBackend, LlmClient};
use crate::pipeline::{self, Pipeline, PipelineParams, PLAN_FILE};
use crate::plan::Plan;
use crate::store::{Project, ProjectStatus, Store};
use crate::vcs::VcsGate;
use crate::workspace::Workspace;

/// Contents of the workspace `.gitignore` written by `init`.
const GITIGNORE: &str = "node_modules\n.ralph/\nagents.md\nprogress.txt\n";

pub struct Orchestrator {
    store: Arc<Store>,
    events: Arc<Broadcaster>,
    oracle: Arc<ApprovalOracle>,
    gate: Arc<dyn SyntaxGate>,
    backend: Arc<dyn ChatBackend>,
    /// Default parent directory for new project roots.
    projects_dir: PathBuf,
    /// projectId → running flag of its live pipeline.
    pipelines: Mutex<HashMap<String, Arc<AtomicBool>>>,
    chat: Mutex<Option<Arc<ChatBridge>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        backend: Arc<dyn ChatBackend>,
        gate: Arc<dyn SyntaxGate>,
        projects_dir: PathBuf,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events: Arc::new(Broadcaster::new()),
            oracle: Arc::new(ApprovalOracle::new()),
            gate,
            backend,
            projects_dir,
            pipelines: Mutex::new(HashMap::new()),
            chat: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn events(&self) -> &Arc<Broadcaster> {
        &self.events
    }

    pub fn oracle(&self) -> &Arc<ApprovalOracle> {
        &self.oracle
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.pipelines
            .lock()
            .get(id)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Create a project record. The root directory is created eagerly so a
    /// bad path fails the command, not a later pipeline.
    pub async fn create_project(
        &self,
        name: &str,
        path: Option<PathBuf>,
        plan: Option<Plan>,
    ) -> Result<Project> {
        let name = name.trim();
        if name.is_empty() {
            bail!("project name must not be empty");
        }
        if name.contains('/') || name.contains("..") {
            bail!("project name must not contain path separators");
        }
        if self.store.project(name).await.is_some() {
            bail!("project '{name}' already exists");
        }

        let root = path.unwrap_or_else(|| self.projects_dir.join(name));
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create {}", root.display()))?;

        let project = Project::new(name, root, plan.unwrap_or_default());
        self.store.save_project(project.clone()).await?;
        info!(project = %name, "Project created");
        self.events.emit(
            "update",
            name,
            json!({"status": "created", "message": "Project created"}),
        );
        Ok(project)
    }

    /// Materialise the workspace layout and make the initial commit.
    pub async fn init_project(&self, id: &str) -> Result<()> {
        let project = self.require_project(id).await?;
        let ws = Workspace::new(&project.root_path);

        ws.write(PLAN_FILE, &serde_json::to_string_pretty(&project.plan)?)
            .await?;
        if ws.read_optional("agents.md").await.is_none() {
            ws.write("agents.md", &format!("# Agent log: {id}\n")).await?;
        }
        if ws.read_optional("progress.txt").await.is_none() {
            ws.write("progress.txt", "Project initialized\n").await?;
        }
        ws.create_dir_all(pipeline::LOG_DIR).await?;
        ws.write(".ralph/internal_status.txt", "initialized\n").await?;
        ws.write(".gitignore", GITIGNORE).await?;

        VcsGate::new(&project.root_path).init()?;

        self.store.update_status(id, ProjectStatus::Initialized).await?;
        info!(project = %id, "Workspace initialized");
        self.events.emit(
            "update",
            id,
            json!({"status": "initialized", "message": "Workspace initialized"}),
        );
        Ok(())
    }

    /// Start the project's pipeline. A project that was never initialised is
    /// initialised first; a project that is already running is left alone.
    pub async fn start_project(&self, id: &str) -> Result<()> {
        if self.is_running(id) {
            bail!("project '{id}' is already running");
        }

        let project = self.require_project(id).await?;
        if project.status == ProjectStatus::Created {
            self.init_project(id).await?;
        }

        let project = self.require_project(id).await?;
        let settings = self.store.settings().await;
        let params = PipelineParams::snapshot(&settings, &project);

        let running = Arc::new(AtomicBool::new(true));
        self.pipelines.lock().insert(id.to_string(), running.clone());

        self.store.update_status(id, ProjectStatus::Running).await?;
        self.events.emit(
            "update",
            id,
            json!({"status": "running", "message": "Pipeline starting"}),
        );

        let llm = LlmClient::new(self.backend.clone(), Workspace::new(&project.root_path));
        let pipeline = Pipeline::new(
            &project,
            params,
            llm,
            self.gate.clone(),
            self.oracle.clone(),
            self.events.clone(),
            self.store.clone(),
            running,
        );
        tokio::spawn(pipeline.run());
        Ok(())
    }

    /// Request a stop. The loop honours the flag at its next checkpoint; a
    /// pending human approval is rejected so nothing dangles.
    pub async fn stop_project(&self, id: &str) -> Result<()> {
        let Some(flag) = self.pipelines.lock().get(id).cloned() else {
            bail!("project '{id}' has no running pipeline");
        };
        flag.store(false, Ordering::SeqCst);
        self.oracle.reject_pending();
        info!(project = %id, "Stop requested");
        self.events.emit(
            "update",
            id,
            json!({"message": "Stop requested; pausing at next checkpoint"}),
        );
        Ok(())
    }

    /// Ask the LLM for a staged plan from a prose description, then persist
    /// it to the Store and the workspace plan file.
    pub async fn generate_plan(&self, id: &str, prompt: &str) -> Result<Plan> {
        let project = self.require_project(id).await?;
        let ws = Workspace::new(&project.root_path);
        let llm = LlmClient::new(self.backend.clone(), ws.clone());

        let request = pipeline::prompts::plan_prompt(id, prompt);
        let (value, raw) = llm.complete_json_with_raw(AgentRole::Prd, &request).await?;
        let _ = pipeline::write_raw_log(&ws, "prd", &request, &raw).await;

        let plan: Plan =
            serde_json::from_value(value).context("generated plan had an unexpected shape")?;
        plan.verify_invariants()?;

        self.replace_plan(id, plan.clone()).await?;
        info!(project = %id, stages = plan.stages.len(), "Generated plan");
        Ok(plan)
    }

    /// Replace the plan wholesale, on disk and in the Store. This is the only
    /// path that may clear terminal story flags.
    pub async fn replace_plan(&self, id: &str, plan: Plan) -> Result<()> {
        plan.verify_invariants()?;
        let project = self.require_project(id).await?;
        Workspace::new(&project.root_path)
            .write(PLAN_FILE, &serde_json::to_string_pretty(&plan)?)
            .await?;
        self.store.update_plan(id, plan.clone()).await?;
        self.events.emit(
            "update",
            id,
            json!({"message": "Plan replaced", "prd": serde_json::to_value(&plan)?}),
        );
        Ok(())
    }

    /// The chat-bridge flow: create, initialise, and plan in one step.
    pub async fn create_new_project(&self, name: &str, prompt: &str) -> Result<Project> {
        self.create_project(name, None, None).await?;
        self.init_project(name).await?;
        self.generate_plan(name, prompt).await?;
        self.require_project(name).await
    }

    /// Restart pipelines for projects that were `running` when the process
    /// last exited.
    pub async fn resume_on_start(self: &Arc<Self>) {
        for project in self.store.projects().await {
            if project.status == ProjectStatus::Running {
                info!(project = %project.id, "Resuming pipeline from previous run");
                if let Err(e) = self.start_project(&project.id).await {
                    warn!(project = %project.id, error = %e, "Failed to resume project");
                }
            }
        }
    }

    /// Tear down and rebuild the chat bridge from current settings. Called at
    /// startup and whenever settings are replaced.
    pub async fn reinit_chat(self: &Arc<Self>) {
        let settings = self.store.settings().await;

        if let Some(old) = self.chat.lock().take() {
            old.shutdown();
        }

        if settings.chat.enabled && !settings.chat.token.is_empty() {
            let bridge = ChatBridge::spawn(settings.chat.clone(), Arc::downgrade(self));
            self.oracle.set_notifier(Some(bridge.clone()));
            *self.chat.lock() = Some(bridge);
            info!("Chat bridge initialised");
        } else {
            self.oracle.set_notifier(None);
        }
    }

    /// Flip the stop flags of every live pipeline; used on SIGINT.
    pub fn stop_all(&self) {
        for flag in self.pipelines.lock().values() {
            flag.store(false, Ordering::SeqCst);
        }
        self.oracle.reject_pending();
    }

    async fn require_project(&self, id: &str) -> Result<Project> {
        self.store
            .project(id)
            .await
            .with_context(|| format!("unknown project: {id}"))
    }
}
