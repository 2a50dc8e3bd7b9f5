pub mod types;

pub mod anthropic;
pub mod openai;
pub mod registry;

mod error;

pub use error::{looks_like_capability_mismatch, ProviderError};
pub use registry::{capabilities_for, known_models, ModelCapabilities, ProviderKind};
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// Uniform interface over concrete LLM providers. One provider instance is
/// bound to one model id; capability bits travel with it so callers can pick
/// the conversation protocol without knowing the backend.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn capabilities(&self) -> &ModelCapabilities;
    async fn generate(&self, request: &GenerateRequest) -> Result<Generation>;
}

/// Construct the provider for `model_id`, reading the credential from the
/// provider's environment variable. Fails with `ProviderError::Credentials`
/// when the variable is unset or empty.
pub fn create_provider(model_id: &str) -> Result<Box<dyn Provider>> {
    let caps = capabilities_for(model_id);
    let env_var = caps.kind.env_var();
    let api_key = std::env::var(env_var)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| ProviderError::Credentials(format!("{env_var} is not set")))?;

    Ok(match caps.kind {
        ProviderKind::OpenAI => Box::new(openai::OpenAIProvider::new(api_key, None, caps)),
        ProviderKind::Anthropic => Box::new(anthropic::AnthropicProvider::new(api_key, None, caps)),
    })
}

/// Resolve the fallback model id for `model_id`: an explicit configuration
/// override wins, then the capability registry's designated fallback.
pub fn fallback_model_for(model_id: &str, fallback_override: Option<&str>) -> Option<String> {
    fallback_override
        .map(str::to_string)
        .or_else(|| capabilities_for(model_id).fallback_model.map(str::to_string))
}

/// Construct the configured model's provider, attempting the registered
/// fallback once if initialization fails. Returns the provider and, when the
/// fallback was used, the substituted model id.
pub fn create_with_fallback(
    model_id: &str,
    fallback_override: Option<&str>,
) -> Result<(Box<dyn Provider>, Option<String>)> {
    match create_provider(model_id) {
        Ok(provider) => Ok((provider, None)),
        Err(primary_err) => {
            let Some(fallback) = fallback_model_for(model_id, fallback_override) else {
                return Err(primary_err.context(format!(
                    "model {model_id} unavailable and no fallback is registered; \
                     check provider credentials"
                )));
            };
            tracing::warn!(model_id, fallback = %fallback, "primary model unavailable, trying fallback");
            match create_provider(&fallback) {
                Ok(provider) => Ok((provider, Some(fallback))),
                Err(fallback_err) => Err(fallback_err.context(format!(
                    "model {model_id} unavailable ({primary_err:#}) and fallback \
                     {fallback} also failed; check provider credentials"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_override_wins_over_registry() {
        let fb = fallback_model_for("gpt-4.1", Some("claude-sonnet-4-20250514"));
        assert_eq!(fb.as_deref(), Some("claude-sonnet-4-20250514"));
    }

    #[test]
    fn registry_fallback_used_without_override() {
        let fb = fallback_model_for("gpt-4.1", None);
        assert_eq!(fb.as_deref(), Some("gpt-4.1-mini"));
    }

    #[test]
    fn unknown_model_has_no_fallback() {
        assert_eq!(fallback_model_for("mystery-model", None), None);
    }
}
