/// Which wire protocol a model speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
}

impl ProviderKind {
    pub fn env_var(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "OPENAI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAI => write!(f, "openai"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
        }
    }
}

/// Immutable per-model capability record. The agent loop consults
/// `supports_tool_calls` to pick the conversation protocol; the adapters
/// consult the remaining bits to refuse parameters the model rejects.
#[derive(Debug, Clone)]
pub struct ModelCapabilities {
    pub model_id: String,
    pub kind: ProviderKind,
    pub supports_tool_calls: bool,
    pub supports_stop: bool,
    pub max_tokens: u32,
    pub context_window: u32,
    pub fallback_model: Option<&'static str>,
}

struct RegistryEntry {
    id: &'static str,
    kind: ProviderKind,
    supports_tool_calls: bool,
    supports_stop: bool,
    max_tokens: u32,
    context_window: u32,
    fallback_model: Option<&'static str>,
}

static REGISTRY: &[RegistryEntry] = &[
    RegistryEntry {
        id: "gpt-4.1",
        kind: ProviderKind::OpenAI,
        supports_tool_calls: true,
        supports_stop: true,
        max_tokens: 32_768,
        context_window: 1_047_576,
        fallback_model: Some("gpt-4.1-mini"),
    },
    RegistryEntry {
        id: "gpt-4.1-mini",
        kind: ProviderKind::OpenAI,
        supports_tool_calls: true,
        supports_stop: true,
        max_tokens: 32_768,
        context_window: 1_047_576,
        fallback_model: Some("gpt-4o-mini"),
    },
    RegistryEntry {
        id: "gpt-4o",
        kind: ProviderKind::OpenAI,
        supports_tool_calls: true,
        supports_stop: true,
        max_tokens: 16_384,
        context_window: 128_000,
        fallback_model: Some("gpt-4o-mini"),
    },
    RegistryEntry {
        id: "gpt-4o-mini",
        kind: ProviderKind::OpenAI,
        supports_tool_calls: true,
        supports_stop: true,
        max_tokens: 16_384,
        context_window: 128_000,
        fallback_model: None,
    },
    // Reasoning models reject sampling controls; the adapter drops them.
    RegistryEntry {
        id: "o3-mini",
        kind: ProviderKind::OpenAI,
        supports_tool_calls: true,
        supports_stop: false,
        max_tokens: 65_536,
        context_window: 200_000,
        fallback_model: Some("gpt-4.1-mini"),
    },
    RegistryEntry {
        id: "claude-sonnet-4-20250514",
        kind: ProviderKind::Anthropic,
        supports_tool_calls: true,
        supports_stop: true,
        max_tokens: 16_384,
        context_window: 200_000,
        fallback_model: Some("claude-haiku-3-5-20241022"),
    },
    RegistryEntry {
        id: "claude-opus-4-20250514",
        kind: ProviderKind::Anthropic,
        supports_tool_calls: true,
        supports_stop: true,
        max_tokens: 32_768,
        context_window: 200_000,
        fallback_model: Some("claude-sonnet-4-20250514"),
    },
    RegistryEntry {
        id: "claude-haiku-3-5-20241022",
        kind: ProviderKind::Anthropic,
        supports_tool_calls: true,
        supports_stop: true,
        max_tokens: 8_192,
        context_window: 200_000,
        fallback_model: None,
    },
];

/// Look up a model's capabilities. Unknown identifiers get a conservative
/// record: provider inferred from the id prefix, no tool-call support (the
/// loop then uses the textual protocol), no designated fallback.
pub fn capabilities_for(model_id: &str) -> ModelCapabilities {
    if let Some(entry) = REGISTRY.iter().find(|e| e.id == model_id) {
        return ModelCapabilities {
            model_id: entry.id.to_string(),
            kind: entry.kind,
            supports_tool_calls: entry.supports_tool_calls,
            supports_stop: entry.supports_stop,
            max_tokens: entry.max_tokens,
            context_window: entry.context_window,
            fallback_model: entry.fallback_model,
        };
    }

    let kind = if model_id.starts_with("claude") {
        ProviderKind::Anthropic
    } else {
        ProviderKind::OpenAI
    };
    tracing::debug!(model_id, "model not in capability registry, using conservative defaults");
    ModelCapabilities {
        model_id: model_id.to_string(),
        kind,
        supports_tool_calls: false,
        supports_stop: true,
        max_tokens: 4_096,
        context_window: 128_000,
        fallback_model: None,
    }
}

pub fn known_models() -> Vec<&'static str> {
    REGISTRY.iter().map(|e| e.id).collect()
}
