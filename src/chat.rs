//! Chat bridge - Telegram command and approval façade
//!
//! A long-polling Telegram client that accepts steering commands from a
//! single pre-authorised chat and renders approval requests with inline
//! approve/reject buttons. Messages from any other chat are ignored.
//!
//! The bridge is an adapter only: every command lands on the orchestrator,
//! and every approval callback lands on the approval oracle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::approval::ApprovalNotifier;
use crate::orchestrator::Orchestrator;
use crate::store::{ChatSettings, ProjectStatus};

const API_BASE: &str = "https://api.telegram.org";

/// Two-step project creation: `/new` asks for a name, then for the prompt.
enum Conversation {
    Idle,
    AwaitingName,
    AwaitingPrompt { name: String },
}

pub struct ChatBridge {
    client: reqwest::Client,
    token: String,
    chat_id: String,
    orchestrator: Weak<Orchestrator>,
    running: Arc<AtomicBool>,
    conversation: Mutex<Conversation>,
}

impl ChatBridge {
    /// Build the bridge and start its polling task.
    pub fn spawn(settings: ChatSettings, orchestrator: Weak<Orchestrator>) -> Arc<Self> {
        let bridge = Arc::new(Self {
            client: reqwest::Client::new(),
            token: settings.token,
            chat_id: settings.chat_id,
            orchestrator,
            running: Arc::new(AtomicBool::new(true)),
            conversation: Mutex::new(Conversation::Idle),
        });

        let poller = bridge.clone();
        tokio::spawn(async move { poller.poll_loop().await });
        bridge
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn method_url(&self, method: &str) -> String {
        format!("{API_BASE}/bot{}/{method}", self.token)
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut offset: i64 = 0;
        info!("Chat bridge polling started");

        while self.running.load(Ordering::SeqCst) {
            let updates = match self.get_updates(offset).await {
                Ok(updates) => updates,
                Err(e) => {
                    warn!(error = %e, "getUpdates failed; backing off");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    continue;
                }
            };

            for update in updates {
                if let Some(id) = update["update_id"].as_i64() {
                    offset = offset.max(id + 1);
                }
                if let Err(e) = self.handle_update(&update).await {
                    warn!(error = %e, "Failed to handle chat update");
                }
            }
        }
        info!("Chat bridge polling stopped");
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Value>> {
        let offset = offset.to_string();
        let response: Value = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&[("timeout", "25"), ("offset", offset.as_str())])
            .send()
            .await
            .context("getUpdates request failed")?
            .json()
            .await
            .context("getUpdates response was not JSON")?;

        Ok(response["result"].as_array().cloned().unwrap_or_default())
    }

    fn authorized(&self, chat: &Value) -> bool {
        chat["id"]
            .as_i64()
            .map(|id| id.to_string() == self.chat_id)
            .unwrap_or(false)
    }

    async fn handle_update(&self, update: &Value) -> Result<()> {
        if let Some(callback) = update.get("callback_query") {
            return self.handle_callback(callback).await;
        }

        let Some(message) = update.get("message") else {
            return Ok(());
        };
        if !self.authorized(&message["chat"]) {
            return Ok(());
        }
        let Some(text) = message["text"].as_str() else {
            return Ok(());
        };

        if text.starts_with('/') {
            self.handle_command(text.trim()).await
        } else {
            self.handle_text(text.trim()).await
        }
    }

    async fn handle_callback(&self, callback: &Value) -> Result<()> {
        if let Some(chat) = callback.pointer("/message/chat") {
            if !self.authorized(chat) {
                return Ok(());
            }
        }

        let approved = callback["data"].as_str() == Some("approve");
        if let Some(id) = callback["id"].as_str() {
            let _ = self
                .client
                .post(self.method_url("answerCallbackQuery"))
                .json(&json!({"callback_query_id": id}))
                .send()
                .await;
        }

        if let Some(orch) = self.orchestrator.upgrade() {
            if orch.oracle().resolve(approved) {
                let verdict = if approved { "approved ✅" } else { "rejected ❌" };
                self.send_markdown(&format!("Task {verdict}")).await?;
            }
        }
        Ok(())
    }

    async fn handle_command(&self, text: &str) -> Result<()> {
        let mut parts = text.splitn(2, ' ');
        let command = parts.next().unwrap_or_default();
        let argument = parts.next().map(str::trim).filter(|a| !a.is_empty());

        match command {
            "/new" => {
                let mut conversation = self.conversation.lock().await;
                match argument {
                    Some(name) => {
                        *conversation = Conversation::AwaitingPrompt {
                            name: name.to_string(),
                        };
                        self.send_markdown(&format!(
                            "Creating *{name}*. Now send the project prompt."
                        ))
                        .await
                    }
                    None => {
                        *conversation = Conversation::AwaitingName;
                        self.send_markdown("What should the project be called?").await
                    }
                }
            }
            "/projects" => self.send_markdown(&self.render_projects().await).await,
            "/status" => self.send_markdown(&self.render_status().await).await,
            "/current" => self.send_markdown(&self.render_current().await).await,
            "/help" => {
                self.send_markdown(
                    "*Commands*\n\
                     /new \\[name] — create a project from a prompt\n\
                     /projects — list projects\n\
                     /status — progress per project\n\
                     /current — what is being worked on right now\n\
                     /help — this message",
                )
                .await
            }
            _ => {
                self.send_markdown("Unknown command. Try /help.").await
            }
        }
    }

    async fn handle_text(&self, text: &str) -> Result<()> {
        let mut conversation = self.conversation.lock().await;
        match std::mem::replace(&mut *conversation, Conversation::Idle) {
            Conversation::AwaitingName => {
                *conversation = Conversation::AwaitingPrompt {
                    name: text.to_string(),
                };
                self.send_markdown(&format!("Got it: *{text}*. Now send the project prompt."))
                    .await
            }
            Conversation::AwaitingPrompt { name } => {
                drop(conversation);
                self.send_markdown(&format!("Creating *{name}* and generating its plan…"))
                    .await?;
                let Some(orch) = self.orchestrator.upgrade() else {
                    return Ok(());
                };
                match orch.create_new_project(&name, text).await {
                    Ok(project) => {
                        self.send_markdown(&format!(
                            "Project *{name}* is ready with {} stages. Start it with the dashboard or `/status` to watch.",
                            project.plan.stages.len()
                        ))
                        .await
                    }
                    Err(e) => {
                        self.send_markdown(&format!("Could not create *{name}*: {e}")).await
                    }
                }
            }
            Conversation::Idle => {
                self.send_markdown("Send /help for the command list.").await
            }
        }
    }

    async fn render_projects(&self) -> String {
        let Some(orch) = self.orchestrator.upgrade() else {
            return "Orchestrator is shutting down.".to_string();
        };
        let projects = orch.store().projects().await;
        if projects.is_empty() {
            return "No projects yet. Use /new to create one.".to_string();
        }
        let lines: Vec<String> = projects
            .iter()
            .map(|p| format!("- *{}* — {}", p.id, status_label(p.status)))
            .collect();
        format!("*Projects*\n{}", lines.join("\n"))
    }

    async fn render_status(&self) -> String {
        let Some(orch) = self.orchestrator.upgrade() else {
            return "Orchestrator is shutting down.".to_string();
        };
        let projects = orch.store().projects().await;
        if projects.is_empty() {
            return "No projects yet.".to_string();
        }

        let mut out = String::from("*Status*\n");
        for p in &projects {
            out.push_str(&format!(
                "\n*{}* — {} ({}/{} stories, iteration {})\n",
                p.id,
                status_label(p.status),
                p.plan.passed_stories(),
                p.plan.total_stories(),
                p.iteration,
            ));
            for stage in &p.plan.stages {
                let mark = if stage.is_completed { "x" } else { " " };
                out.push_str(&format!("- [{mark}] {}\n", stage.name));
            }
        }
        out
    }

    async fn render_current(&self) -> String {
        let Some(orch) = self.orchestrator.upgrade() else {
            return "Orchestrator is shutting down.".to_string();
        };
        let projects = orch.store().projects().await;
        let mut lines = Vec::new();
        for p in &projects {
            if p.status != ProjectStatus::Running {
                continue;
            }
            let current = p
                .plan
                .active_stage_index()
                .and_then(|si| {
                    p.plan.stages[si]
                        .active_story_index()
                        .map(|ti| (si, ti))
                })
                .map(|(si, ti)| {
                    format!(
                        "{} / {}",
                        p.plan.stages[si].name, p.plan.stages[si].stories[ti].title
                    )
                })
                .unwrap_or_else(|| "finishing up".to_string());
            lines.push(format!("- *{}*: {current}", p.id));
        }
        if lines.is_empty() {
            "Nothing is running right now.".to_string()
        } else {
            format!("*Currently working on*\n{}", lines.join("\n"))
        }
    }

    async fn send_markdown(&self, text: &str) -> Result<()> {
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await
            .context("sendMessage request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("sendMessage returned {}", response.status());
        }
        Ok(())
    }
}

fn status_label(status: ProjectStatus) -> &'static str {
    match status {
        ProjectStatus::Created => "created",
        ProjectStatus::Initialized => "initialized",
        ProjectStatus::Running => "running",
        ProjectStatus::Paused => "paused",
        ProjectStatus::Completed => "completed",
        ProjectStatus::Error => "error",
    }
}

#[async_trait]
impl ApprovalNotifier for ChatBridge {
    async fn request_approval(&self, stage: &str, task: &str) -> Result<()> {
        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&json!({
                "chat_id": self.chat_id,
                "text": format!("Approve completed task?\n\nStage: {stage}\nTask: {task}"),
                "reply_markup": {
                    "inline_keyboard": [[
                        {"text": "✅ Approve", "callback_data": "approve"},
                        {"text": "❌ Reject", "callback_data": "reject"},
                    ]],
                },
            }))
            .send()
            .await
            .context("approval request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("approval sendMessage returned {}", response.status());
        }
        Ok(())
    }
}
