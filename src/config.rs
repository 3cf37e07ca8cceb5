//! Environment configuration snapshot
//!
//! All environment-driven configuration is read exactly once at startup and
//! passed into components explicitly; nothing re-reads the environment later.
//!
//! Recognised variables: `CODEX_COMMAND`, `CODEX_PROVIDER` (openai | lmstudio
//! | ollama), `CODEX_MODEL`, `OPENAI_API_KEY`, `LMSTUDIO_API_BASE`,
//! `OLLAMA_API_BASE`.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    LmStudio,
    Ollama,
}

impl LlmProvider {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "lmstudio" => Ok(Self::LmStudio),
            "ollama" => Ok(Self::Ollama),
            other => bail!("unknown LLM provider: {other}"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::LmStudio => "lmstudio",
            Self::Ollama => "ollama",
        }
    }

    fn default_api_base(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::LmStudio => "http://localhost:1234/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }
}

/// LLM wire configuration. All three providers share the OpenAI-style
/// chat-completions endpoint; only the base URL and auth differ.
#[derive(Clone)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: Option<String>,
    pub api_base: String,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<REDACTED>"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl LlmConfig {
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.api_base.trim_end_matches('/'))
    }
}

/// The full startup snapshot.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    /// Overrides the persisted `codexPath` setting when present.
    pub codex_command: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let provider = match std::env::var("CODEX_PROVIDER") {
            Ok(v) => LlmProvider::parse(&v)?,
            Err(_) => LlmProvider::OpenAi,
        };

        let api_base = match provider {
            LlmProvider::OpenAi => None,
            LlmProvider::LmStudio => std::env::var("LMSTUDIO_API_BASE").ok(),
            LlmProvider::Ollama => std::env::var("OLLAMA_API_BASE").ok(),
        }
        .unwrap_or_else(|| provider.default_api_base().to_string());

        let model = std::env::var("CODEX_MODEL").unwrap_or_else(|_| default_model(provider));
        let api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());

        if provider == LlmProvider::OpenAi && api_key.is_none() {
            tracing::warn!("OPENAI_API_KEY is not set; openai requests will be rejected upstream");
        }

        Ok(Self {
            llm: LlmConfig {
                provider,
                model,
                api_key,
                api_base,
            },
            codex_command: std::env::var("CODEX_COMMAND").ok().filter(|c| !c.is_empty()),
        })
    }
}

fn default_model(provider: LlmProvider) -> String {
    match provider {
        LlmProvider::OpenAi => "gpt-4o-mini",
        LlmProvider::LmStudio => "local-model",
        LlmProvider::Ollama => "llama3",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_parse_is_case_insensitive() {
        assert_eq!(LlmProvider::parse("OpenAI").unwrap(), LlmProvider::OpenAi);
        assert_eq!(LlmProvider::parse(" ollama ").unwrap(), LlmProvider::Ollama);
        assert!(LlmProvider::parse("gemini").is_err());
    }

    #[test]
    fn chat_url_joins_without_double_slash() {
        let cfg = LlmConfig {
            provider: LlmProvider::LmStudio,
            model: "m".to_string(),
            api_key: None,
            api_base: "http://localhost:1234/v1/".to_string(),
        };
        assert_eq!(
            cfg.chat_completions_url(),
            "http://localhost:1234/v1/chat/completions"
        );
    }

    #[test]
    fn debug_never_prints_the_key() {
        let cfg = LlmConfig {
            provider: LlmProvider::OpenAi,
            model: "m".to_string(),
            api_key: Some("sk-secret".to_string()),
            api_base: "https://api.openai.com/v1".to_string(),
        };
        let rendered = format!("{cfg:?}");
        assert!(!rendered.contains("sk-secret"));
    }
}
