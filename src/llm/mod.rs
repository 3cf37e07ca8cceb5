//! LLM client - role-aware prompt enrichment over an OpenAI-style wire
//!
//! The client is stateless and reentrant; each pipeline serialises its own
//! calls. Transport failures never panic the loop: agent-role calls degrade
//! to an error-tagged response string (which fails review downstream), while
//! structured-output calls surface a hard error to their caller.

pub mod extract;

use crate::config::LlmConfig;
use crate::workspace::Workspace;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

/// Invocation mode. Each role appends its own output contract to the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Developer,
    Reviewer,
    Prd,
    Json,
}

impl AgentRole {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Developer => "developer",
            Self::Reviewer => "reviewer",
            Self::Prd => "prd",
            Self::Json => "json",
        }
    }

    /// The instruction block appended after the caller's prompt.
    fn instructions(&self) -> &'static str {
        match self {
            Self::Developer => {
                "## OUTPUT CONTRACT\n\
                 Write every created or modified file as a block with this exact syntax:\n\n\
                 ### FILE: path/relative/to/project/root\n\
                 ```\n\
                 <full file content>\n\
                 ```\n\n\
                 Rules:\n\
                 1. Emit the FULL content of each file. No placeholders, no '// rest unchanged'.\n\
                 2. Paths are relative to the project root. Never use absolute paths or '..'.\n\
                 3. When the task is genuinely done, also write the file block:\n\
                 ### FILE: progress.txt\n\
                 ```\n\
                 PROMISE_MET\n\
                 ```"
            }
            Self::Reviewer => {
                "## OUTPUT CONTRACT\n\
                 If the work satisfies the task, BEGIN your response with the exact token \
                 REVIEW_PASSED.\n\
                 Otherwise respond with specific, actionable feedback on what is wrong. \
                 You may emit `### FILE:` blocks to correct small issues yourself."
            }
            Self::Prd | Self::Json => {
                "## OUTPUT CONTRACT\n\
                 Respond with a single JSON value and nothing else. \
                 No prose, no markdown fences, no explanations."
            }
        }
    }
}

/// Completion transport. The HTTP implementation below is production; tests
/// substitute scripted fakes.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Shared OpenAI-style chat-completions wire used by all three providers.
pub struct HttpBackend {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    provider: String,
}

impl HttpBackend {
    pub fn new(cfg: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: cfg.chat_completions_url(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            provider: cfg.provider.name().to_string(),
        }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.provider
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.1,
        });

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("LLM request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM returned {status}: {}", detail.trim());
        }

        let value: serde_json::Value = response
            .json()
            .await
            .context("LLM response was not JSON")?;

        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .context("LLM response had no message content")
    }
}

/// What an agent invocation produced.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    /// Full raw response text, or an `[LLM_ERROR]`-tagged line on transport
    /// failure.
    pub raw: String,
    /// Root-relative paths of the file blocks that were applied.
    pub applied_files: Vec<String>,
}

impl AgentOutcome {
    pub fn transport_failed(&self) -> bool {
        self.raw.starts_with("[LLM_ERROR]")
    }
}

/// Role-aware client bound to one project workspace. File blocks from every
/// response are applied immediately, under path containment.
pub struct LlmClient {
    backend: Arc<dyn ChatBackend>,
    workspace: Workspace,
}

impl LlmClient {
    pub fn new(backend: Arc<dyn ChatBackend>, workspace: Workspace) -> Self {
        Self { backend, workspace }
    }

    /// Run a Developer or Reviewer call. Transport failures are folded into
    /// the outcome so the pipeline's normal fail/retry path handles them.
    pub async fn run_agent(&self, role: AgentRole, prompt: &str) -> AgentOutcome {
        let full = format!("{prompt}\n\n{}", role.instructions());

        let raw = match self.backend.complete(&full).await {
            Ok(text) => text,
            Err(e) => {
                warn!(role = role.label(), error = %e, "LLM call failed");
                return AgentOutcome {
                    raw: format!("[LLM_ERROR] {e}"),
                    applied_files: Vec::new(),
                };
            }
        };

        let applied_files = self.apply_file_blocks(&raw).await;
        AgentOutcome { raw, applied_files }
    }

    /// Run a Prd or Json call and parse the structured value. Transport and
    /// format errors both surface to the caller.
    pub async fn complete_json(&self, role: AgentRole, prompt: &str) -> Result<serde_json::Value> {
        self.complete_json_with_raw(role, prompt).await.map(|(v, _)| v)
    }

    /// Like [`Self::complete_json`], but also returns the raw response text
    /// so callers can log it.
    pub async fn complete_json_with_raw(
        &self,
        role: AgentRole,
        prompt: &str,
    ) -> Result<(serde_json::Value, String)> {
        let full = format!("{prompt}\n\n{}", role.instructions());
        let raw = self.backend.complete(&full).await?;
        // File blocks are honoured regardless of role; a JSON role emitting
        // one is unusual but legal.
        self.apply_file_blocks(&raw).await;
        let value = extract::extract_json(&raw)?;
        Ok((value, raw))
    }

    /// Apply every file block in the response. A path that escapes the
    /// workspace is skipped and logged; the remaining blocks still apply.
    async fn apply_file_blocks(&self, raw: &str) -> Vec<String> {
        let mut applied = Vec::new();
        for (path, content) in extract::extract_file_blocks(raw) {
            match self.workspace.write(&path, &content).await {
                Ok(()) => {
                    debug!(path = %path, bytes = content.len(), "Applied file block");
                    applied.push(path);
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Refused file block");
                }
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct StaticBackend(String);

    #[async_trait]
    impl ChatBackend for StaticBackend {
        fn name(&self) -> &str {
            "static"
        }
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl ChatBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }
        async fn complete(&self, _prompt: &str) -> Result<String> {
            anyhow::bail!("connection refused")
        }
    }

    fn client_in(tmp: &TempDir, backend: Arc<dyn ChatBackend>) -> LlmClient {
        LlmClient::new(backend, Workspace::new(tmp.path()))
    }

    #[tokio::test]
    async fn file_blocks_are_applied_inside_the_workspace() {
        let tmp = TempDir::new().unwrap();
        let response = "### FILE: src/a.js\n```\nconst a = 1;\n```".to_string();
        let client = client_in(&tmp, Arc::new(StaticBackend(response)));

        let outcome = client.run_agent(AgentRole::Developer, "do it").await;
        assert_eq!(outcome.applied_files, vec!["src/a.js".to_string()]);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("src/a.js")).unwrap(),
            "const a = 1;\n"
        );
    }

    #[tokio::test]
    async fn traversal_blocks_are_skipped_and_the_rest_apply() {
        let tmp = TempDir::new().unwrap();
        let response = "### FILE: ../evil.js\n```\nbad\n```\n### FILE: ok.js\n```\ngood\n```"
            .to_string();
        let client = client_in(&tmp, Arc::new(StaticBackend(response)));

        let outcome = client.run_agent(AgentRole::Developer, "do it").await;
        assert_eq!(outcome.applied_files, vec!["ok.js".to_string()]);
        assert!(!tmp.path().parent().unwrap().join("evil.js").exists());
        assert!(tmp.path().join("ok.js").exists());
    }

    #[tokio::test]
    async fn transport_failure_becomes_a_tagged_outcome() {
        let tmp = TempDir::new().unwrap();
        let client = client_in(&tmp, Arc::new(FailingBackend));

        let outcome = client.run_agent(AgentRole::Developer, "do it").await;
        assert!(outcome.transport_failed());
        assert!(outcome.raw.contains("connection refused"));
        assert!(outcome.applied_files.is_empty());
    }

    #[tokio::test]
    async fn json_roles_propagate_transport_errors() {
        let tmp = TempDir::new().unwrap();
        let client = client_in(&tmp, Arc::new(FailingBackend));
        assert!(client.complete_json(AgentRole::Prd, "plan").await.is_err());
    }

    #[tokio::test]
    async fn json_roles_salvage_noisy_output() {
        let tmp = TempDir::new().unwrap();
        let client = client_in(
            &tmp,
            Arc::new(StaticBackend("Here you go: [1, 2, 3] enjoy".to_string())),
        );
        let value = client.complete_json(AgentRole::Json, "list").await.unwrap();
        assert_eq!(value, serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn role_contracts_name_their_sentinels() {
        assert!(AgentRole::Developer.instructions().contains("PROMISE_MET"));
        assert!(AgentRole::Reviewer.instructions().contains("REVIEW_PASSED"));
        assert!(AgentRole::Prd.instructions().contains("single JSON value"));
    }
}
