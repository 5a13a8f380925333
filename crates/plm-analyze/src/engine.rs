use llm::builder::{LLMBackend, LLMBuilder};
use llm::chat::ChatMessage;

use plm_core::settings::AiSettings;

use crate::summarizer::SummarizeError;

fn map_backend(provider: &str) -> Result<LLMBackend, SummarizeError> {
    match provider {
        "openai" => Ok(LLMBackend::OpenAI),
        "anthropic" => Ok(LLMBackend::Anthropic),
        "google" => Ok(LLMBackend::Google),
        "ollama" => Ok(LLMBackend::Ollama),
        "groq" => Ok(LLMBackend::Groq),
        "mistral" => Ok(LLMBackend::Mistral),
        "deepseek" => Ok(LLMBackend::DeepSeek),
        other => Err(SummarizeError::NotConfigured(format!("unknown provider: {other}"))),
    }
}

/// True if `provider` names a backend this build can talk to.
pub fn supported_provider(provider: &str) -> bool {
    map_backend(provider).is_ok()
}

/// Send one system + user exchange and return the reply text.
pub async fn generate(settings: &AiSettings, system: &str, user_msg: &str) -> Result<String, SummarizeError> {
    let backend = map_backend(&settings.provider)?;

    let mut builder = LLMBuilder::new()
        .backend(backend)
        .model(&settings.model)
        .system(system);

    if !settings.api_key.is_empty() {
        builder = builder.api_key(&settings.api_key);
    }

    let llm = builder
        .build()
        .map_err(|e| SummarizeError::Backend(format!("build LLM: {e}")))?;

    let messages = vec![ChatMessage::user().content(user_msg).build()];

    let response = llm
        .chat(&messages)
        .await
        .map_err(|e| SummarizeError::Backend(format!("chat: {e}")))?;

    match response.text() {
        Some(text) if !text.trim().is_empty() => Ok(text),
        _ => Err(SummarizeError::EmptyResponse),
    }
}
