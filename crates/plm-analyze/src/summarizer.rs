use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use plm_core::settings::{ai_configured, read_ai_settings, AiSettings};
use plm_core::FileAnalysis;

use crate::{engine, parse, prompt};

#[derive(Debug, Error)]
pub enum SummarizeError {
    #[error("summarizer not configured: {0}")]
    NotConfigured(String),

    #[error("LLM backend error: {0}")]
    Backend(String),

    #[error("LLM returned no text")]
    EmptyResponse,

    #[error("could not parse summary: {0}")]
    Parse(String),
}

/// Produces a structured summary of one source file. Calls may fail
/// independently of each other.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn analyze(&self, content: &str, language: &str) -> Result<FileAnalysis, SummarizeError>;
}

/// Summarizer backed by the `llm` crate.
///
/// Built with [`LlmSummarizer::from_global_settings`] it re-reads
/// `~/.plm/settings.json` on every call, so credentials can be configured
/// while the server is running.
#[derive(Debug, Clone, Default)]
pub struct LlmSummarizer {
    settings: Option<AiSettings>,
}

impl LlmSummarizer {
    pub fn new(settings: AiSettings) -> Result<Self, SummarizeError> {
        if !ai_configured(&settings) {
            return Err(SummarizeError::NotConfigured(
                "provider, model and api key are required".to_string(),
            ));
        }
        Ok(Self {
            settings: Some(settings),
        })
    }

    pub fn from_global_settings() -> Self {
        Self { settings: None }
    }

    fn settings(&self) -> Result<AiSettings, SummarizeError> {
        let settings = match &self.settings {
            Some(s) => s.clone(),
            None => read_ai_settings(),
        };
        if ai_configured(&settings) {
            Ok(settings)
        } else {
            Err(SummarizeError::NotConfigured(
                "set provider, model and api key in ~/.plm/settings.json".to_string(),
            ))
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn analyze(&self, content: &str, language: &str) -> Result<FileAnalysis, SummarizeError> {
        let settings = self.settings()?;
        let system = prompt::system_prompt();
        let user_msg = prompt::user_message(content, language);

        debug!("sending {} source to {} ({})", language, settings.provider, settings.model);
        let raw = engine::generate(&settings, &system, &user_msg).await?;
        debug!("received {} bytes from {}", raw.len(), settings.provider);
        parse::parse_analysis(&raw)
    }
}
